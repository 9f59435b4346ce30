//! Background execution of the debuggee.
//!
//! Every run gets its own thread that owns the processor while stepping. The thread talks
//! to the session only through a channel: an optional rendezvous after every instruction
//! (the thread waits until the session resumes it) and exactly one terminal message.

use crate::debugger::console::VirtualConsole;
use crate::debugger::error::Error;
use crate::debugger::processor::Processor;
use crate::debugger::step::{self, CancelToken, RunOutcome, RunRequest, StopReason};
use crate::{vms_debug, vms_error};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

enum WorkerMessage {
    Stepped,
    Finished(RunOutcome),
    Fault(anyhow::Error),
}

/// Event of a run, as seen by the session.
#[derive(Debug)]
pub enum RunEvent {
    /// An instruction retired, the worker waits for [`Runner::resume`].
    Stepped,
    Finished(RunOutcome),
    Fault(anyhow::Error),
    /// Worker thread is gone without a terminal message (it panicked).
    Disconnected,
}

impl RunEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, RunEvent::Stepped)
    }
}

struct InFlight {
    handle: JoinHandle<()>,
    events: Receiver<WorkerMessage>,
    resume: Sender<()>,
}

/// Execution coordinator: at most one run in flight.
pub struct Runner {
    processor: Arc<Mutex<Box<dyn Processor>>>,
    console: VirtualConsole,
    cancel: CancelToken,
    in_flight: Option<InFlight>,
}

impl Runner {
    pub fn new(processor: Box<dyn Processor>, console: VirtualConsole) -> Self {
        Self {
            processor: Arc::new(Mutex::new(processor)),
            console,
            cancel: CancelToken::new(),
            in_flight: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Spawn a worker thread for a run.
    /// Returns [`Error::Busy`] if a run is in flight, nothing is spawned then.
    pub fn start(&mut self, mut request: RunRequest) -> Result<(), Error> {
        if self.is_busy() {
            return Err(Error::Busy);
        }

        self.cancel.reset();
        let (event_tx, event_rx) = channel();
        let (resume_tx, resume_rx) = channel::<()>();

        let processor = self.processor.clone();
        let console = self.console.clone();
        let cancel = self.cancel.clone();
        let mode = request.mode;

        let handle = thread::Builder::new()
            .name("vm-runner".to_string())
            .spawn(move || {
                let observe = || {
                    event_tx.send(WorkerMessage::Stepped).is_ok() && resume_rx.recv().is_ok()
                };
                let result = step::execute(&processor, &console, &mut request, &cancel, observe);

                let message = match result {
                    Ok((halted, reason)) => WorkerMessage::Finished(RunOutcome {
                        mode,
                        halted,
                        cancelled: matches!(reason, StopReason::Cancelled),
                        reason,
                        breakpoints: request.breakpoints,
                    }),
                    Err(fault) => WorkerMessage::Fault(fault),
                };
                _ = event_tx.send(message);
            })?;

        vms_debug!(target: "debugger", "run started in {mode} mode");
        self.in_flight = Some(InFlight {
            handle,
            events: event_rx,
            resume: resume_tx,
        });
        Ok(())
    }

    /// Request cancellation of the current run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token shared by all runs of this runner, may be used to cancel the current run
    /// from another thread. Cancellation requested while idle is dropped at the next start.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Let the worker continue after a [`RunEvent::Stepped`].
    pub fn resume(&self) {
        if let Some(in_flight) = &self.in_flight {
            _ = in_flight.resume.send(());
        }
    }

    /// Return next event without blocking. `None` if there is no run or nothing happened yet.
    pub fn try_next_event(&mut self) -> Option<RunEvent> {
        let in_flight = self.in_flight.as_ref()?;
        let event = match in_flight.events.try_recv() {
            Ok(message) => message.into(),
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => RunEvent::Disconnected,
        };
        Some(self.settle(event))
    }

    /// Block until the next event. `None` if there is no run.
    pub fn next_event(&mut self) -> Option<RunEvent> {
        let in_flight = self.in_flight.as_ref()?;
        let event = match in_flight.events.recv() {
            Ok(message) => message.into(),
            Err(_) => RunEvent::Disconnected,
        };
        Some(self.settle(event))
    }

    /// Join the worker after its last event.
    fn settle(&mut self, event: RunEvent) -> RunEvent {
        if event.is_terminal() {
            if let Some(in_flight) = self.in_flight.take() {
                if in_flight.handle.join().is_err() {
                    vms_error!(target: "debugger", "execution thread panicked");
                }
            }
            match &event {
                RunEvent::Finished(outcome) => {
                    log::debug!(target: "debugger", "run finished: {}", outcome.reason)
                }
                RunEvent::Fault(fault) => log::debug!(target: "debugger", "run faulted: {fault:#}"),
                _ => {}
            }
        }
        event
    }

    /// Access processor state. Returns [`Error::Busy`] while a run is in flight.
    pub fn processor(&self) -> Result<MutexGuard<'_, Box<dyn Processor>>, Error> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        Ok(self.lock())
    }

    /// Access processor state from the observer window, the worker doesn't hold the lock
    /// while it waits for [`Runner::resume`].
    pub(super) fn processor_unchecked(&self) -> MutexGuard<'_, Box<dyn Processor>> {
        self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Processor>> {
        // state after a panicked step is still inspectable, the session is stopped anyway
        self.processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn console(&self) -> &VirtualConsole {
        &self.console
    }
}

impl From<WorkerMessage> for RunEvent {
    fn from(message: WorkerMessage) -> Self {
        match message {
            WorkerMessage::Stepped => RunEvent::Stepped,
            WorkerMessage::Finished(outcome) => RunEvent::Finished(outcome),
            WorkerMessage::Fault(fault) => RunEvent::Fault(fault),
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            self.cancel.cancel();
            // closing the channels releases a worker waiting at the rendezvous
            drop(in_flight.resume);
            drop(in_flight.events);
            _ = in_flight.handle.join();
        }
    }
}
