use crate::debugger::breakpoint::{first_hit, Breakpoint};
use crate::debugger::console::VirtualConsole;
use crate::debugger::flow::is_return;
use crate::debugger::processor::{Processor, StepIo};
use crate::debugger::register::Register;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// How far a run goes before it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StepMode {
    /// Run until a breakpoint fires. Breakpoints are checked after every instruction,
    /// but never before the first one, so the breakpoint execution is resumed from
    /// doesn't fire again.
    Continue,
    /// Execute exactly one instruction.
    SingleInstruction,
    /// Run until control is back in the starting frame or in one of its callers.
    StepOver,
    /// Run until a return instruction is about to execute in the starting frame
    /// (or in one of its callers).
    StepOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Single instruction executed.
    Step,
    /// Breakpoint fired, contains its state after the hit.
    Breakpoint(Breakpoint),
    /// Frame base is back at or above the starting one.
    FrameReturned,
    /// Return instruction is next.
    ReturnReached,
    Halted,
    Cancelled,
}

impl Display for StopReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Step => f.write_str("step"),
            StopReason::Breakpoint(brkpt) => write!(f, "breakpoint {brkpt}"),
            StopReason::FrameReturned => f.write_str("frame returned"),
            StopReason::ReturnReached => f.write_str("return reached"),
            StopReason::Halted => f.write_str("halted"),
            StopReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Cooperative cancellation flag, cleared at the start of every run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. An instruction already executing is finished,
    /// the next one isn't started.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear a previous request, token is reused by the next run.
    pub(super) fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Everything a run needs to know before it starts.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: StepMode,
    /// Snapshot of the breakpoint set, only evaluated in [`StepMode::Continue`].
    pub breakpoints: Vec<Breakpoint>,
    /// Stop at the observer rendezvous after every instruction.
    pub observe: bool,
    pub echo_output: bool,
    pub silent: bool,
}

impl RunRequest {
    pub fn new(mode: StepMode) -> Self {
        Self {
            mode,
            breakpoints: vec![],
            observe: false,
            echo_output: false,
            silent: false,
        }
    }

    pub fn with_breakpoints(self, breakpoints: Vec<Breakpoint>) -> Self {
        Self {
            breakpoints,
            ..self
        }
    }

    pub fn with_observer(self, observe: bool) -> Self {
        Self { observe, ..self }
    }

    pub fn with_io_options(self, echo_output: bool, silent: bool) -> Self {
        Self {
            echo_output,
            silent,
            ..self
        }
    }
}

/// Result of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub mode: StepMode,
    /// Last known halt status of the program.
    pub halted: bool,
    pub cancelled: bool,
    pub reason: StopReason,
    /// Breakpoint snapshot with watch values re-armed during the run.
    pub breakpoints: Vec<Breakpoint>,
}

pub(super) fn lock_processor(
    processor: &Mutex<Box<dyn Processor>>,
) -> anyhow::Result<MutexGuard<'_, Box<dyn Processor>>> {
    processor
        .lock()
        .map_err(|_| anyhow::anyhow!("processor state is poisoned by a panic in another thread"))
}

/// Drive the processor until the stop condition of `request.mode` holds.
///
/// `observe` is called without the processor lock after every instruction if the request
/// asks for it, and must return `false` if nobody listens anymore (the run is cancelled then).
/// Any processor error is returned as is.
pub(super) fn execute(
    processor: &Mutex<Box<dyn Processor>>,
    console: &VirtualConsole,
    request: &mut RunRequest,
    cancel: &CancelToken,
    mut observe: impl FnMut() -> bool,
) -> anyhow::Result<(bool, StopReason)> {
    let start_rsb = lock_processor(processor)?.register(Register::Rsb);
    let mut output = console.clone();
    let mut input = console.clone();
    let mut halted = false;

    loop {
        if cancel.is_cancelled() {
            return Ok((halted, StopReason::Cancelled));
        }

        halted = lock_processor(processor)?.step(StepIo {
            output: &mut output,
            input: &mut input,
            echo_output: request.echo_output,
            silent: request.silent,
        })?;

        if request.observe && !observe() {
            return Ok((halted, StopReason::Cancelled));
        }
        if halted {
            return Ok((true, StopReason::Halted));
        }

        let cpu = lock_processor(processor)?;
        let stop = match request.mode {
            StepMode::Continue => first_hit(&mut request.breakpoints, cpu.registers(), cpu.memory())
                .map(|idx| StopReason::Breakpoint(request.breakpoints[idx])),
            StepMode::SingleInstruction => Some(StopReason::Step),
            StepMode::StepOver => {
                (cpu.register(Register::Rsb) >= start_rsb).then_some(StopReason::FrameReturned)
            }
            StepMode::StepOut => {
                let returns_next = usize::try_from(cpu.register(Register::Rpo))
                    .ok()
                    .and_then(|pc| cpu.memory().get(pc))
                    .is_some_and(|opcode| is_return(*opcode));
                (cpu.register(Register::Rsb) >= start_rsb && returns_next)
                    .then_some(StopReason::ReturnReached)
            }
        };

        if let Some(reason) = stop {
            return Ok((false, reason));
        }
    }
}
