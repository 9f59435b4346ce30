use crate::debugger::disasm::InstructionMap;
use crate::debugger::error::Error;
use crate::debugger::flow::NOP;

/// How a new encoding fits into the place of the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFit {
    SameSize,
    /// New instruction is smaller, `padding` NOPs fill the rest of the old one.
    Shrink { padding: u64 },
    /// New instruction is larger and overwrites `consumed` NOPs following the old one.
    NopOverwrite { consumed: u64 },
}

/// Instruction slot that is going to be rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSlot {
    pub address: u64,
    /// Length of the instruction currently at `address`.
    pub span_length: u64,
    /// Number of NOP bytes directly after the current instruction.
    pub trailing_nops: u64,
}

impl PatchSlot {
    pub fn scan(memory: &[u8], address: u64, span_length: u64) -> Result<Self, Error> {
        let memory_len = memory.len() as u64;
        let span_end = address
            .checked_add(span_length)
            .filter(|end| *end <= memory_len)
            .ok_or(Error::OutOfRange {
                address,
                width: span_length,
                memory_len,
            })?;

        let trailing_nops = memory[span_end as usize..]
            .iter()
            .take_while(|byte| **byte == NOP)
            .count() as u64;

        Ok(Self {
            address,
            span_length,
            trailing_nops,
        })
    }

    /// Maximum size of an instruction that can be written into the slot.
    pub fn available(&self) -> u64 {
        self.span_length + self.trailing_nops
    }

    /// Check that an encoding of `size` bytes fits.
    pub fn fit(&self, size: u64) -> Result<PatchFit, Error> {
        if size > self.available() {
            return Err(Error::TooLarge {
                size,
                available: self.available(),
            });
        }
        Ok(match size.cmp(&self.span_length) {
            std::cmp::Ordering::Equal => PatchFit::SameSize,
            std::cmp::Ordering::Less => PatchFit::Shrink {
                padding: self.span_length - size,
            },
            std::cmp::Ordering::Greater => PatchFit::NopOverwrite {
                consumed: size - self.span_length,
            },
        })
    }

    /// Write `bytes` into the slot, padding the rest of the old instruction with NOPs.
    /// Memory is untouched if the encoding doesn't fit.
    pub fn write(&self, memory: &mut [u8], bytes: &[u8]) -> Result<PatchFit, Error> {
        let fit = self.fit(bytes.len() as u64)?;

        let start = self.address as usize;
        memory[start..start + bytes.len()].copy_from_slice(bytes);
        if let PatchFit::Shrink { .. } = fit {
            memory[start + bytes.len()..start + self.span_length as usize].fill(NOP);
        }
        Ok(fit)
    }
}

/// Replace the instruction at `address` (currently `span_length` bytes long) with `bytes`
/// and resync the instruction map from `address`.
pub fn patch(
    memory: &mut [u8],
    map: &mut InstructionMap,
    address: u64,
    bytes: &[u8],
    span_length: u64,
) -> Result<PatchFit, Error> {
    let slot = PatchSlot::scan(memory, address, span_length)?;
    let fit = slot.write(memory, bytes)?;
    map.force_resync(memory, address)?;

    log::info!(target: "debugger", "instruction at {address:#X} patched with {} bytes ({fit:?})", bytes.len());
    Ok(fit)
}
