//! Contracts of the external collaborators driven by the engine: the virtual processor,
//! the instruction decoder and the single-line assembler.

use crate::debugger::register::{Register, RegisterMap};
use smallvec::SmallVec;
use std::io::{Read, Write};
use std::ops::Range;

/// Size of a call frame linkage record (saved `rsb`, return `rpo`).
pub const FRAME_RECORD_SIZE: u64 = 16;
/// Size of a call frame linkage record in the legacy call stack layout (saved `rso` too).
pub const LEGACY_FRAME_RECORD_SIZE: u64 = 24;

/// I/O channels and options given to the processor for a single instruction.
pub struct StepIo<'a> {
    pub output: &'a mut dyn Write,
    pub input: &'a mut dyn Read,
    /// Echo characters read from input back to output.
    pub echo_output: bool,
    /// Suppress processor diagnostic output.
    pub silent: bool,
}

/// Virtual CPU being debugged.
///
/// Implementation executes instructions, the engine only inspects and patches its state
/// between steps.
pub trait Processor: Send {
    /// Execute a single instruction.
    /// Returns `true` if the program has halted. Any error is a processor fault,
    /// processor state is not considered resumable after it.
    fn step(&mut self, io: StepIo<'_>) -> anyhow::Result<bool>;

    /// Register file, indexed by [`Register::index`].
    fn registers(&self) -> &[u64];

    fn registers_mut(&mut self) -> &mut [u64];

    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];

    /// Ordered list of currently mapped memory ranges. First range is the program,
    /// last range is the stack (if mapped), everything between is heap.
    fn mapped_ranges(&self) -> Vec<Range<u64>>;

    /// Whether the processor uses the legacy 24-byte call frame layout.
    fn use_legacy_call_stack(&self) -> bool;

    fn register(&self, register: Register) -> u64 {
        self.registers()
            .get(register.index())
            .copied()
            .unwrap_or_default()
    }

    fn set_register(&mut self, register: Register, value: u64) {
        if let Some(slot) = self.registers_mut().get_mut(register.index()) {
            *slot = value;
        }
    }

    fn register_map(&self) -> RegisterMap {
        RegisterMap::from_slice(self.registers())
    }

    fn memory_len(&self) -> u64 {
        self.memory().len() as u64
    }

    fn frame_record_size(&self) -> u64 {
        if self.use_legacy_call_stack() {
            LEGACY_FRAME_RECORD_SIZE
        } else {
            FRAME_RECORD_SIZE
        }
    }
}

/// Single decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Rendered instruction text.
    pub text: String,
    /// Number of consumed bytes, never zero.
    pub length: u64,
    /// Addresses referenced by instruction operands, in operand order.
    pub references: SmallVec<[u64; 2]>,
}

/// Instruction decoder.
pub trait Disassembler {
    /// Decode one instruction at the start of `bytes`.
    /// Must not read past the end of the slice and must consume at least one byte,
    /// even for unrecognized or truncated input.
    fn decode_one(&self, bytes: &[u8]) -> Decoded;
}

/// Result of assembling a single statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Assembled {
    pub bytes: Vec<u8>,
    /// Unresolved label references: label name and the offset into `bytes` where
    /// the 8-byte label address must be written.
    pub label_references: Vec<(String, usize)>,
}

/// Single-line assembler used by instruction patching.
pub trait Assembler {
    fn assemble(&self, line: &str) -> anyhow::Result<Assembled>;
}

/// Read a little-endian value of `width` bytes (1..=8). Returns `None` if the range
/// is out of memory.
pub fn read_le(memory: &[u8], address: u64, width: u64) -> Option<u64> {
    debug_assert!((1..=8).contains(&width));
    let start = usize::try_from(address).ok()?;
    let end = start.checked_add(usize::try_from(width).ok()?)?;
    let bytes = memory.get(start..end)?;
    Some(
        bytes
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | *byte as u64),
    )
}

/// Read a little-endian 64-bit word.
pub fn read_u64(memory: &[u8], address: u64) -> Option<u64> {
    read_le(memory, address, 8)
}

/// Write the low `width` bytes of `value` in little-endian order.
/// Returns `false` (and writes nothing) if the range is out of memory.
pub fn write_le(memory: &mut [u8], address: u64, width: u64, value: u64) -> bool {
    let Some(start) = usize::try_from(address).ok() else {
        return false;
    };
    let Some(end) = start.checked_add(width as usize) else {
        return false;
    };
    let Some(bytes) = memory.get_mut(start..end) else {
        return false;
    };
    bytes
        .iter_mut()
        .zip(value.to_le_bytes())
        .for_each(|(dst, src)| *dst = src);
    true
}
