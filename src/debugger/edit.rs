use crate::debugger::breakpoint::WatchSize;
use crate::debugger::error::Error;
use crate::debugger::processor::Processor;
use crate::debugger::register::Register;
use indexmap::IndexMap;
use std::collections::BTreeMap;

/// Register and memory overrides that are re-applied after every executed instruction,
/// so the debuggee can't change them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PersistentEdits {
    registers: IndexMap<Register, u64>,
    memory: BTreeMap<u64, u8>,
}

impl PersistentEdits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&mut self, register: Register, value: u64) {
        self.registers.insert(register, value);
    }

    pub fn remove_register(&mut self, register: Register) -> Option<u64> {
        self.registers.shift_remove(&register)
    }

    /// Pin `size` bytes at `address` to the little-endian representation of `value`.
    pub fn set_memory(
        &mut self,
        address: u64,
        size: WatchSize,
        value: u64,
        memory_len: u64,
    ) -> Result<(), Error> {
        let end = address
            .checked_add(size.bytes())
            .filter(|end| *end <= memory_len)
            .ok_or(Error::OutOfRange {
                address,
                width: size.bytes(),
                memory_len,
            })?;

        (address..end)
            .zip(value.to_le_bytes())
            .for_each(|(addr, byte)| {
                self.memory.insert(addr, byte);
            });
        Ok(())
    }

    /// Release a single pinned byte.
    pub fn remove_memory(&mut self, address: u64) -> Option<u8> {
        self.memory.remove(&address)
    }

    pub fn registers(&self) -> impl Iterator<Item = (Register, u64)> + '_ {
        self.registers.iter().map(|(reg, value)| (*reg, *value))
    }

    pub fn memory(&self) -> impl Iterator<Item = (u64, u8)> + '_ {
        self.memory.iter().map(|(addr, value)| (*addr, *value))
    }

    pub fn is_register_pinned(&self, register: Register) -> bool {
        self.registers.contains_key(&register)
    }

    pub fn is_memory_pinned(&self, address: u64) -> bool {
        self.memory.contains_key(&address)
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty() && self.memory.is_empty()
    }

    pub fn clear(&mut self) {
        self.registers.clear();
        self.memory.clear();
    }

    /// Write all overrides into processor state.
    pub fn apply(&self, processor: &mut dyn Processor) {
        self.apply_registers(processor.registers_mut());
        self.apply_memory(processor.memory_mut());
    }

    pub fn apply_registers(&self, registers: &mut [u64]) {
        for (register, value) in &self.registers {
            if let Some(slot) = registers.get_mut(register.index()) {
                *slot = *value;
            }
        }
    }

    /// Edits outside of `memory` (it may shrink when a program is reloaded) are skipped.
    pub fn apply_memory(&self, memory: &mut [u8]) {
        for (address, value) in &self.memory {
            if let Some(slot) = usize::try_from(*address)
                .ok()
                .and_then(|idx| memory.get_mut(idx))
            {
                *slot = *value;
            }
        }
    }
}
