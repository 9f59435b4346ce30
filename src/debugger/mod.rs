pub mod breakpoint;
pub mod config;
pub mod console;
pub mod disasm;
pub mod edit;
pub mod error;
pub mod flow;
pub mod label;
pub mod memory;
pub mod patch;
pub mod processor;
pub mod register;
pub mod runner;
pub mod step;
pub mod unwind;

pub use breakpoint::{Breakpoint, BreakpointSet, WatchSize};
pub use config::Config;
pub use console::VirtualConsole;
pub use disasm::{InstructionLine, InstructionMap, Span};
pub use edit::PersistentEdits;
pub use error::Error;
pub use label::{Labels, Symbol, ENTRY_LABEL};
pub use patch::PatchFit;
pub use processor::{Assembled, Assembler, Decoded, Disassembler, Processor, StepIo};
pub use register::{Register, RegisterMap, StatusFlags};
pub use step::{CancelToken, RunOutcome, StepMode, StopReason};
pub use unwind::{Backtrace, FrameInfo, SlotKind, StackSlot};

use crate::debugger::flow::Branch;
use crate::debugger::memory::{HeapStats, MemoryRegion};
use crate::debugger::runner::{RunEvent, Runner};
use crate::debugger::step::RunRequest;
use crate::{vms_info, vms_warn, weak_error};
use std::ops::Range;
use std::sync::MutexGuard;

/// Debug session state, as it's shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum RunningState {
    /// Program halted or session is torn down after an error, program must be reloaded.
    Stopped,
    Paused,
    Running,
    /// Program stopped because it tried to read from the empty console.
    AwaitingInput,
}

/// Session events for a front-end. All methods are called at the thread that dispatches
/// session events.
pub trait EventHook {
    /// Called after every executed instruction while the run is observed.
    fn on_instruction(&self, registers: &RegisterMap);

    /// Called when a run stops without halting the program.
    fn on_break(&self, pc: u64, reason: &StopReason) -> anyhow::Result<()>;

    /// Called when the program halts.
    fn on_halt(&self, pc: u64);

    /// Called on processor fault or on a state that can't be resumed from.
    fn on_fault(&self, error: &Error);
}

pub struct NopHook {}

impl EventHook for NopHook {
    fn on_instruction(&self, _: &RegisterMap) {}

    fn on_break(&self, _: u64, _: &StopReason) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_halt(&self, _: u64) {}

    fn on_fault(&self, _: &Error) {}
}

/// How a run ended.
#[derive(Debug)]
pub enum Completion {
    Finished(RunOutcome),
    /// Run ended with an error, session is stopped.
    Fault(Error),
}

pub struct SessionBuilder<H: EventHook + 'static = NopHook> {
    hooks: H,
    config: Option<Config>,
    console: Option<VirtualConsole>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            hooks: NopHook {},
            config: None,
            console: None,
        }
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: EventHook + 'static> SessionBuilder<H> {
    pub fn with_hooks<H2: EventHook + 'static>(self, hooks: H2) -> SessionBuilder<H2> {
        SessionBuilder {
            hooks,
            config: self.config,
            console: self.console,
        }
    }

    pub fn with_config(self, config: Config) -> Self {
        Self {
            config: Some(config),
            ..self
        }
    }

    pub fn with_console(self, console: VirtualConsole) -> Self {
        Self {
            console: Some(console),
            ..self
        }
    }

    /// Create a session for a loaded program. Current `rpo` of the processor is
    /// considered to be the program entry point.
    pub fn build(
        self,
        processor: Box<dyn Processor>,
        disassembler: Box<dyn Disassembler>,
    ) -> Session {
        let config = self.config.unwrap_or_default();
        let entry_point = processor.register(Register::Rpo);

        let mut map = InstructionMap::new(disassembler);
        if config.disassembly.decode_on_load {
            map.full_reset(processor.memory());
        }
        weak_error!(
            map.extend_from(processor.memory(), entry_point),
            "entry point disassembly:"
        );

        let mut labels = Labels::new();
        labels.insert(ENTRY_LABEL, entry_point);

        Session {
            runner: Runner::new(processor, self.console.unwrap_or_default()),
            map,
            breakpoints: BreakpointSet::new(),
            labels,
            edits: PersistentEdits::new(),
            config,
            hooks: Box::new(self.hooks),
            state: RunningState::Paused,
        }
    }
}

/// Debug session of one loaded program.
///
/// Runs are executed at a background thread, their events are delivered by
/// [`Session::dispatch_events`] or [`Session::wait`] at the caller thread. While a run
/// is in flight the processor, breakpoints, labels and persistent edits are read-only
/// for the caller and any attempt to change them returns [`Error::Busy`].
pub struct Session {
    runner: Runner,
    map: InstructionMap,
    breakpoints: BreakpointSet,
    labels: Labels,
    edits: PersistentEdits,
    config: Config,
    hooks: Box<dyn EventHook>,
    state: RunningState,
}

impl Session {
    pub fn state(&self) -> RunningState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_busy()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn console(&self) -> &VirtualConsole {
        self.runner.console()
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        if self.runner.is_busy() {
            return Err(Error::Busy);
        }
        Ok(())
    }

    // --------------------------------- execution ---------------------------------------------

    /// Start a run in background. Returns [`Error::Busy`] if a run is already in flight.
    pub fn start(&mut self, mode: StepMode) -> Result<(), Error> {
        self.ensure_idle()?;
        if self.state == RunningState::Stopped {
            return Err(Error::SessionTerminated);
        }

        let observe = !self.edits.is_empty() || self.config.execution.observe_every_instruction;
        let breakpoints = match mode {
            StepMode::Continue => self.breakpoints.snapshot(),
            _ => vec![],
        };
        let request = RunRequest::new(mode)
            .with_breakpoints(breakpoints)
            .with_observer(observe)
            .with_io_options(
                self.config.execution.echo_output,
                self.config.execution.silent,
            );

        self.runner.start(request)?;
        self.state = RunningState::Running;
        Ok(())
    }

    /// Run until a breakpoint fires or the program halts.
    pub fn continue_execution(&mut self) -> Result<(), Error> {
        self.start(StepMode::Continue)
    }

    pub fn step_instruction(&mut self) -> Result<(), Error> {
        self.start(StepMode::SingleInstruction)
    }

    pub fn step_over(&mut self) -> Result<(), Error> {
        self.start(StepMode::StepOver)
    }

    pub fn step_out(&mut self) -> Result<(), Error> {
        self.start(StepMode::StepOut)
    }

    /// Request cancellation of the current run. Completion is still delivered.
    pub fn cancel(&self) {
        self.runner.cancel()
    }

    /// Token to cancel the current run from another thread. The same token serves every
    /// run of the session, so it may be taken once before any run starts.
    pub fn cancel_token(&self) -> CancelToken {
        self.runner.cancel_token()
    }

    /// Handle pending run events without blocking.
    /// Returns a completion if the run is over.
    pub fn dispatch_events(&mut self) -> Option<Completion> {
        while let Some(event) = self.runner.try_next_event() {
            if let Some(completion) = self.handle_event(event) {
                return Some(completion);
            }
        }
        None
    }

    /// Handle run events until the run is over. Returns `None` if nothing is running.
    pub fn wait(&mut self) -> Option<Completion> {
        while let Some(event) = self.runner.next_event() {
            if let Some(completion) = self.handle_event(event) {
                return Some(completion);
            }
        }
        None
    }

    fn handle_event(&mut self, event: RunEvent) -> Option<Completion> {
        match event {
            RunEvent::Stepped => {
                {
                    let mut cpu = self.runner.processor_unchecked();
                    self.edits.apply(&mut **cpu);
                    self.hooks.on_instruction(&cpu.register_map());
                }
                self.runner.resume();
                None
            }
            RunEvent::Finished(outcome) => Some(self.complete(outcome)),
            RunEvent::Fault(fault) => Some(self.fail(Error::ProcessorFault(fault))),
            RunEvent::Disconnected => Some(self.fail(Error::RunnerDisconnected)),
        }
    }

    fn fail(&mut self, error: Error) -> Completion {
        vms_warn!(target: "debugger", "session stopped: {error:#}");
        self.state = RunningState::Stopped;
        self.hooks.on_fault(&error);
        Completion::Fault(error)
    }

    fn complete(&mut self, outcome: RunOutcome) -> Completion {
        self.breakpoints.absorb(&outcome.breakpoints);

        let (pc, frame_base, memory_len) = {
            let cpu = self.runner.processor_unchecked();
            (
                cpu.register(Register::Rpo),
                cpu.register(Register::Rsb),
                cpu.memory_len(),
            )
        };

        if pc >= memory_len {
            return self.fail(Error::InvalidFrameRegister {
                register: Register::Rpo,
                value: pc,
            });
        }
        if frame_base > memory_len {
            return self.fail(Error::InvalidFrameRegister {
                register: Register::Rsb,
                value: frame_base,
            });
        }

        {
            let cpu = self.runner.processor_unchecked();
            weak_error!(self.map.extend_from(cpu.memory(), pc), "disassembly:");
        }

        let awaiting_input = self.console().take_empty_read();
        if outcome.halted {
            vms_info!(target: "debugger", "program halted at {pc:#X}");
            self.state = RunningState::Stopped;
            self.hooks.on_halt(pc);
        } else {
            self.state = if awaiting_input {
                RunningState::AwaitingInput
            } else {
                RunningState::Paused
            };
            weak_error!(self.hooks.on_break(pc, &outcome.reason), "break hook:");
        }

        Completion::Finished(outcome)
    }

    // --------------------------------- processor state ---------------------------------------

    /// Lock processor for inspection or modification.
    pub fn processor(&self) -> Result<MutexGuard<'_, Box<dyn Processor>>, Error> {
        self.runner.processor()
    }

    pub fn registers(&self) -> Result<RegisterMap, Error> {
        Ok(self.processor()?.register_map())
    }

    pub fn set_register(&mut self, register: Register, value: u64) -> Result<(), Error> {
        self.processor()?.set_register(register, value);
        Ok(())
    }

    /// Write `size` bytes of `value` (little-endian) at `address`.
    pub fn write_memory(&mut self, address: u64, size: WatchSize, value: u64) -> Result<(), Error> {
        let mut cpu = self.processor()?;
        let memory_len = cpu.memory_len();
        if !processor::write_le(cpu.memory_mut(), address, size.bytes(), value) {
            return Err(Error::OutOfRange {
                address,
                width: size.bytes(),
                memory_len,
            });
        }
        Ok(())
    }

    pub fn read_memory(&self, address: u64, size: WatchSize) -> Result<u64, Error> {
        let cpu = self.processor()?;
        processor::read_le(cpu.memory(), address, size.bytes()).ok_or(Error::OutOfRange {
            address,
            width: size.bytes(),
            memory_len: cpu.memory_len(),
        })
    }

    // --------------------------------- breakpoints -------------------------------------------

    /// Add a breakpoint. Returns `false` if the same condition is already set.
    /// Returns [`Error::OutOfRange`] if it watches memory outside the processor memory.
    pub fn add_breakpoint(&mut self, brkpt: Breakpoint) -> Result<bool, Error> {
        self.ensure_idle()?;
        let memory_len = self.processor()?.memory_len();
        brkpt.ensure_fits(memory_len)?;
        Ok(self.breakpoints.add(brkpt))
    }

    pub fn remove_breakpoint(&mut self, brkpt: &Breakpoint) -> Result<Option<Breakpoint>, Error> {
        self.ensure_idle()?;
        Ok(self.breakpoints.remove(brkpt))
    }

    /// Set or unset a program counter breakpoint. Returns `true` if it's set after the call.
    pub fn toggle_breakpoint_at(&mut self, address: u64) -> Result<bool, Error> {
        self.ensure_idle()?;
        Ok(self.breakpoints.toggle_at(address))
    }

    /// Break when `size` bytes at `address` are equal to `target`.
    pub fn break_on_memory(
        &mut self,
        address: u64,
        size: WatchSize,
        target: u64,
    ) -> Result<bool, Error> {
        let memory_len = self.processor()?.memory_len();
        let brkpt = Breakpoint::memory_equals(address, size, target, memory_len)?;
        self.add_breakpoint(brkpt)
    }

    /// Watch a register for changes of its current value.
    pub fn watch_register(&mut self, register: Register) -> Result<bool, Error> {
        let current = self.processor()?.register(register);
        self.add_breakpoint(Breakpoint::register_changed(register, current))
    }

    /// Watch memory for changes of its current value.
    pub fn watch_memory(&mut self, address: u64, size: WatchSize) -> Result<bool, Error> {
        let brkpt = {
            let cpu = self.processor()?;
            let current =
                processor::read_le(cpu.memory(), address, size.bytes()).unwrap_or_default();
            Breakpoint::memory_changed(address, size, current, cpu.memory_len())?
        };
        self.add_breakpoint(brkpt)
    }

    pub fn breakpoints(&self) -> &BreakpointSet {
        &self.breakpoints
    }

    // --------------------------------- labels ------------------------------------------------

    pub fn add_label(&mut self, name: impl Into<String>, address: u64) -> Result<Option<u64>, Error> {
        self.ensure_idle()?;
        Ok(self.labels.insert(name, address))
    }

    pub fn remove_label(&mut self, name: &str) -> Result<Option<u64>, Error> {
        self.ensure_idle()?;
        Ok(self.labels.remove(name))
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    // --------------------------------- persistent edits --------------------------------------

    /// Pin a register value, it's written back after every executed instruction.
    pub fn pin_register(&mut self, register: Register, value: u64) -> Result<(), Error> {
        self.processor()?.set_register(register, value);
        self.edits.set_register(register, value);
        Ok(())
    }

    /// Pin memory value, it's written back after every executed instruction.
    pub fn pin_memory(&mut self, address: u64, size: WatchSize, value: u64) -> Result<(), Error> {
        let mut cpu = self.runner.processor()?;
        self.edits
            .set_memory(address, size, value, cpu.memory_len())?;
        self.edits.apply_memory(cpu.memory_mut());
        Ok(())
    }

    pub fn unpin_register(&mut self, register: Register) -> Result<Option<u64>, Error> {
        self.ensure_idle()?;
        Ok(self.edits.remove_register(register))
    }

    pub fn unpin_memory(&mut self, address: u64) -> Result<Option<u8>, Error> {
        self.ensure_idle()?;
        Ok(self.edits.remove_memory(address))
    }

    pub fn persistent_edits(&self) -> &PersistentEdits {
        &self.edits
    }

    // --------------------------------- program map -------------------------------------------

    pub fn instruction_map(&self) -> &InstructionMap {
        &self.map
    }

    /// Disassemble from `address`. Without `force` nothing happens if `address` is
    /// already a known instruction start.
    pub fn disassemble_from(&mut self, address: u64, force: bool) -> Result<(), Error> {
        let cpu = self.runner.processor()?;
        if force {
            self.map.force_resync(cpu.memory(), address)
        } else {
            self.map.extend_from(cpu.memory(), address)
        }
    }

    /// Throw away the instruction map and disassemble the whole memory.
    pub fn reload_disassembly(&mut self) -> Result<(), Error> {
        let cpu = self.runner.processor()?;
        self.map.full_reset(cpu.memory());
        Ok(())
    }

    /// Rebuild the instruction map from instruction addresses known from outside
    /// (for example assembler debug information).
    pub fn rebuild_disassembly(
        &mut self,
        addresses: impl IntoIterator<Item = u64>,
    ) -> Result<(), Error> {
        let cpu = self.runner.processor()?;
        self.map.rebuild_from(cpu.memory(), addresses);
        Ok(())
    }

    /// Instruction text at `address` with label annotations.
    pub fn render_line(&self, address: u64) -> Option<String> {
        self.map
            .line(address)
            .map(|line| line.render(&self.labels))
    }

    // --------------------------------- patching ----------------------------------------------

    /// Overwrite the instruction at `address` with already encoded bytes.
    pub fn patch_bytes(&mut self, address: u64, bytes: &[u8]) -> Result<PatchFit, Error> {
        let mut cpu = self.runner.processor()?;
        let memory_len = cpu.memory_len();
        let line = self
            .map
            .decode_at(cpu.memory(), address)
            .ok_or(Error::OutOfRange {
                address,
                width: 1,
                memory_len,
            })?;

        patch::patch(
            cpu.memory_mut(),
            &mut self.map,
            address,
            bytes,
            line.span.length as u64,
        )
    }

    /// Assemble `line` and write it over the instruction at `address`.
    /// Returns how the new instruction fits and the address right after it.
    pub fn patch_instruction(
        &mut self,
        address: u64,
        line: &str,
        assembler: &dyn Assembler,
    ) -> Result<(PatchFit, u64), Error> {
        self.ensure_idle()?;
        if line.trim().is_empty() {
            return Err(Error::Assemble(anyhow::anyhow!(
                "instruction cannot be empty"
            )));
        }

        let mut assembled = assembler.assemble(line).map_err(Error::Assemble)?;
        self.labels.resolve(&mut assembled)?;
        let fit = self.patch_bytes(address, &assembled.bytes)?;
        Ok((fit, address + assembled.bytes.len() as u64))
    }

    // --------------------------------- inspection --------------------------------------------

    pub fn backtrace(&self) -> Result<Backtrace, Error> {
        let cpu = self.processor()?;
        Ok(Backtrace::collect(
            &cpu.register_map(),
            cpu.memory(),
            cpu.frame_record_size(),
            self.config.stack.max_frames,
            &self.labels,
        ))
    }

    /// Stack cells from `rso` to the end of memory.
    pub fn stack_slots(&self) -> Result<Vec<StackSlot>, Error> {
        let cpu = self.processor()?;
        Ok(unwind::stack_slots(
            &cpu.register_map(),
            cpu.memory(),
            cpu.frame_record_size(),
            self.config.stack.max_frames,
        ))
    }

    /// Frame base addresses, innermost first.
    pub fn frame_bases(&self) -> Result<Vec<u64>, Error> {
        let cpu = self.processor()?;
        Ok(unwind::walk(
            cpu.register(Register::Rsb),
            cpu.register(Register::Rso),
            cpu.memory(),
            cpu.frame_record_size(),
            self.config.stack.max_frames,
        )
        .collect())
    }

    pub fn memory_regions(&self) -> Result<Vec<MemoryRegion>, Error> {
        let cpu = self.processor()?;
        Ok(memory::classify(&cpu.mapped_ranges(), cpu.memory_len()))
    }

    pub fn heap_stats(&self) -> Result<HeapStats, Error> {
        let cpu = self.processor()?;
        let mapped: Vec<Range<u64>> = cpu.mapped_ranges();
        Ok(HeapStats::collect(&mapped, cpu.memory_len()))
    }

    /// Jump at `address` and whether it's taken under the current flags.
    pub fn analyze_branch(&self, address: u64) -> Result<Option<Branch>, Error> {
        let cpu = self.processor()?;
        Ok(flow::analyze_branch(
            cpu.memory(),
            address,
            cpu.register_map().flags(),
        ))
    }
}
