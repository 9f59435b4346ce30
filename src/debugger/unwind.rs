//! Call stack reconstruction from frame linkage records stored in debuggee memory.
//!
//! A call pushes a linkage record and points `rsb` at it. The record holds the caller
//! `rsb` (and the caller `rso` in the legacy layout) followed by the return address:
//!
//! ```text
//!  legacy (24 bytes)            current (16 bytes)
//!  base + 0  : caller rso       base + 0 : caller rsb
//!  base + 8  : caller rsb       base + 8 : return rpo
//!  base + 16 : return rpo
//! ```

use crate::debugger::label::{Labels, Symbol};
use crate::debugger::processor::{read_u64, LEGACY_FRAME_RECORD_SIZE};
use crate::debugger::register::{Register, RegisterMap};
use std::collections::HashMap;

/// Iterator over frame base addresses, innermost first.
///
/// Stops when the next base leaves room for no full linkage record, when it doesn't
/// move toward the stack bottom (corrupted or looping chain) or after `max_frames` bases.
pub struct FrameWalker<'a> {
    memory: &'a [u8],
    record_size: u64,
    stack_top: u64,
    next: Option<u64>,
    remaining: usize,
}

impl<'a> FrameWalker<'a> {
    fn last_base(&self) -> Option<u64> {
        (self.memory.len() as u64).checked_sub(self.record_size)
    }
}

impl<'a> Iterator for FrameWalker<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        let base = self.next.take()?;
        if self.remaining == 0 {
            log::debug!(target: "debugger", "stack walk stopped at frame limit, base {base:#X}");
            return None;
        }
        if base > self.last_base()? || base < self.stack_top {
            return None;
        }
        self.remaining -= 1;

        let next_base = read_u64(self.memory, base + self.record_size - 16);
        self.next = match next_base {
            Some(next_base) if next_base <= base => {
                if next_base <= self.last_base().unwrap_or_default() {
                    log::debug!(target: "debugger", "corrupted frame chain at {base:#X}: next frame base {next_base:#X}");
                }
                None
            }
            other => other,
        };
        Some(base)
    }
}

/// Walk frame bases starting from `frame_base` (the current `rsb` value).
/// `stack_top` is the current `rso`, no valid frame base lies below it.
pub fn walk(
    frame_base: u64,
    stack_top: u64,
    memory: &[u8],
    record_size: u64,
    max_frames: usize,
) -> FrameWalker<'_> {
    debug_assert!(record_size >= 16);
    FrameWalker {
        memory,
        record_size,
        stack_top,
        next: Some(frame_base),
        remaining: max_frames,
    }
}

/// Address of the return `rpo` slot of a frame.
#[inline(always)]
pub fn return_address_slot(base: u64, record_size: u64) -> u64 {
    base + record_size - 8
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub base: u64,
    /// Address execution returns to when the frame is left.
    pub return_address: u64,
    pub symbol: Option<Symbol>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backtrace {
    /// Current program counter.
    pub pc: u64,
    pub symbol: Option<Symbol>,
    /// Frames in the call chain, innermost first.
    pub frames: Vec<FrameInfo>,
}

impl Backtrace {
    pub fn collect(
        registers: &RegisterMap,
        memory: &[u8],
        record_size: u64,
        max_frames: usize,
        labels: &Labels,
    ) -> Self {
        let pc = registers.value(Register::Rpo);
        let frames = walk(
            registers.value(Register::Rsb),
            registers.value(Register::Rso),
            memory,
            record_size,
            max_frames,
        )
        .map(|base| {
            let return_address =
                read_u64(memory, return_address_slot(base, record_size)).unwrap_or_default();
            FrameInfo {
                base,
                return_address,
                symbol: labels.symbolize(return_address),
            }
        })
        .collect();

        Self {
            pc,
            symbol: labels.symbolize(pc),
            frames,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Plain stack value.
    Value,
    /// Saved `rso` of the caller (legacy layout only).
    ReturnRso,
    /// Saved `rsb` of the caller.
    ReturnRsb,
    /// Return address.
    ReturnRpo,
}

/// 8-byte stack cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSlot {
    pub address: u64,
    pub value: u64,
    pub kind: SlotKind,
}

/// Stack cells from `rso` to the end of memory with frame linkage cells classified.
pub fn stack_slots(
    registers: &RegisterMap,
    memory: &[u8],
    record_size: u64,
    max_frames: usize,
) -> Vec<StackSlot> {
    let rso = registers.value(Register::Rso);
    let memory_len = memory.len() as u64;

    let mut linkage = HashMap::new();
    for base in walk(
        registers.value(Register::Rsb),
        rso,
        memory,
        record_size,
        max_frames,
    ) {
        let mut slot = base;
        if record_size == LEGACY_FRAME_RECORD_SIZE {
            linkage.insert(slot, SlotKind::ReturnRso);
            slot += 8;
        }
        linkage.insert(slot, SlotKind::ReturnRsb);
        linkage.insert(slot + 8, SlotKind::ReturnRpo);
    }

    let Some(last_slot) = memory_len.checked_sub(8) else {
        return vec![];
    };
    (rso..=last_slot)
        .step_by(8)
        .filter_map(|address| {
            let value = read_u64(memory, address)?;
            Some(StackSlot {
                address,
                value,
                kind: linkage.get(&address).copied().unwrap_or(SlotKind::Value),
            })
        })
        .collect()
}
