use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct ConsoleState {
    input: VecDeque<u8>,
    output: String,
    /// Output bytes of a not yet complete UTF-8 sequence.
    pending: Vec<u8>,
    empty_read: bool,
}

/// In-memory console used as standard input and output of the debuggee.
///
/// Handles are cheap to clone and share the same buffers, so one of them may be given to
/// the execution thread while another one is used by the front-end.
#[derive(Clone, Default)]
pub struct VirtualConsole {
    state: Arc<Mutex<ConsoleState>>,
}

impl VirtualConsole {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ConsoleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue text for the debuggee to read. `\r\n` is passed as `\n`.
    pub fn push_input(&self, text: &str) {
        let normalized = text.replace("\r\n", "\n");
        self.state().input.extend(normalized.bytes());
    }

    /// Number of input bytes not consumed by the debuggee.
    pub fn pending_input(&self) -> usize {
        self.state().input.len()
    }

    pub fn clear_input(&self) {
        self.state().input.clear();
    }

    /// Everything the debuggee has written so far.
    pub fn output(&self) -> String {
        self.state().output.clone()
    }

    /// Take the written output, leaving the console output empty.
    pub fn take_output(&self) -> String {
        std::mem::take(&mut self.state().output)
    }

    /// Return `true` if the debuggee tried to read from empty input since the last call.
    pub fn take_empty_read(&self) -> bool {
        std::mem::take(&mut self.state().empty_read)
    }
}

impl Read for VirtualConsole {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.state();
        if buf.is_empty() {
            return Ok(0);
        }
        if state.input.is_empty() {
            state.empty_read = true;
            return Ok(0);
        }

        let count = buf.len().min(state.input.len());
        for (dst, src) in buf.iter_mut().zip(state.input.drain(..count)) {
            *dst = src;
        }
        Ok(count)
    }
}

impl Write for VirtualConsole {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.state();
        state.pending.extend_from_slice(buf);

        let pending = std::mem::take(&mut state.pending);
        let mut rest = pending.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    state.output.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    state.output.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(invalid) => {
                            state.output.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[invalid..];
                        }
                        None => {
                            // incomplete sequence at the end, wait for more bytes
                            state.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
