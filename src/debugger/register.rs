use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumCount, EnumIter, EnumString, FromRepr};

/// Named registers of the virtual CPU, in the order the processor stores them.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Debug,
    EnumString,
    Display,
    EnumIter,
    EnumCount,
    FromRepr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(usize)]
pub enum Register {
    /// Program offset (program counter).
    Rpo,
    /// Stack offset (top of the stack).
    Rso,
    /// Stack base (base of the current call frame).
    Rsb,
    /// Status flags.
    Rsf,
    /// Return value.
    Rrv,
    /// Fast pass parameter.
    Rfp,
    Rg0,
    Rg1,
    Rg2,
    Rg3,
    Rg4,
    Rg5,
    Rg6,
    Rg7,
    Rg8,
    Rg9,
}

impl Register {
    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Number of registers in the processor register file.
pub const REGISTER_COUNT: usize = 16;

/// Copy of processor registers taken at some point of execution.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RegisterMap([u64; REGISTER_COUNT]);

impl RegisterMap {
    /// Snapshot a processor register file. Missing registers are read as zero.
    pub fn from_slice(registers: &[u64]) -> Self {
        let mut map = Self::default();
        map.0
            .iter_mut()
            .zip(registers)
            .for_each(|(dst, src)| *dst = *src);
        map
    }

    pub fn value(&self, register: Register) -> u64 {
        self.0[register.index()]
    }

    pub fn update(&mut self, register: Register, value: u64) {
        self.0[register.index()] = value;
    }

    pub fn flags(&self) -> StatusFlags {
        StatusFlags::from_bits_retain(self.value(Register::Rsf))
    }
}

bitflags! {
/// View over the `rsf` register.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Hash)]
pub struct StatusFlags: u64 {
    const ZERO = 1 << 0;
    const CARRY = 1 << 1;
    const FILE_END = 1 << 2;
    const SIGN = 1 << 3;
    const OVERFLOW = 1 << 4;
    const AUTO_ECHO = 1 << 5;
}}

impl StatusFlags {
    /// Return `true` if the flags selected by `mask` are exactly `expected`.
    pub fn matches(self, expected: StatusFlags, mask: StatusFlags) -> bool {
        self.intersection(mask) == expected
    }
}
