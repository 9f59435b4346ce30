use crate::debugger::error::Error;
use crate::debugger::processor::read_le;
use crate::debugger::register::Register;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Width of an observed memory location.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum WatchSize {
    Bytes1,
    Bytes2,
    Bytes4,
    Bytes8,
}

impl WatchSize {
    pub fn bytes(self) -> u64 {
        match self {
            WatchSize::Bytes1 => 1,
            WatchSize::Bytes2 => 2,
            WatchSize::Bytes4 => 4,
            WatchSize::Bytes8 => 8,
        }
    }

    pub fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            1 => Some(WatchSize::Bytes1),
            2 => Some(WatchSize::Bytes2),
            4 => Some(WatchSize::Bytes4),
            8 => Some(WatchSize::Bytes8),
            _ => None,
        }
    }
}

/// Condition checked after every retired instruction.
///
/// `*Changed` variants are watches: when they fire, the observed value becomes the new
/// comparison value, so a watch fires once per change and not while the value stays put.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Breakpoint {
    RegisterEquals {
        register: Register,
        target: u64,
    },
    RegisterChanged {
        register: Register,
        last_seen: u64,
    },
    MemoryEquals {
        address: u64,
        size: WatchSize,
        target: u64,
    },
    MemoryChanged {
        address: u64,
        size: WatchSize,
        last_seen: u64,
    },
}

/// Identity of a breakpoint inside a [`BreakpointSet`].
/// Watch comparison values are state, not identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BreakpointKey {
    RegisterEquals(Register, u64),
    RegisterChanged(Register),
    MemoryEquals(u64, WatchSize, u64),
    MemoryChanged(u64, WatchSize),
}

fn ensure_in_memory(address: u64, size: WatchSize, memory_len: u64) -> Result<(), Error> {
    let fits = address
        .checked_add(size.bytes())
        .is_some_and(|end| end <= memory_len);
    if !fits {
        return Err(Error::OutOfRange {
            address,
            width: size.bytes(),
            memory_len,
        });
    }
    Ok(())
}

impl Breakpoint {
    /// Break when the program counter reaches `address`.
    pub fn at_address(address: u64) -> Self {
        Breakpoint::RegisterEquals {
            register: Register::Rpo,
            target: address,
        }
    }

    pub fn register_equals(register: Register, target: u64) -> Self {
        Breakpoint::RegisterEquals { register, target }
    }

    pub fn register_changed(register: Register, last_seen: u64) -> Self {
        Breakpoint::RegisterChanged {
            register,
            last_seen,
        }
    }

    /// Create a memory value breakpoint.
    /// Returns [`Error::OutOfRange`] if `address + size` exceeds memory.
    pub fn memory_equals(
        address: u64,
        size: WatchSize,
        target: u64,
        memory_len: u64,
    ) -> Result<Self, Error> {
        ensure_in_memory(address, size, memory_len)?;
        Ok(Breakpoint::MemoryEquals {
            address,
            size,
            target,
        })
    }

    /// Create a memory change watch.
    /// Returns [`Error::OutOfRange`] if `address + size` exceeds memory.
    pub fn memory_changed(
        address: u64,
        size: WatchSize,
        last_seen: u64,
        memory_len: u64,
    ) -> Result<Self, Error> {
        ensure_in_memory(address, size, memory_len)?;
        Ok(Breakpoint::MemoryChanged {
            address,
            size,
            last_seen,
        })
    }

    /// Check that memory observed by the breakpoint lies inside `memory_len` bytes.
    pub fn ensure_fits(&self, memory_len: u64) -> Result<(), Error> {
        match *self {
            Breakpoint::MemoryEquals { address, size, .. }
            | Breakpoint::MemoryChanged { address, size, .. } => {
                ensure_in_memory(address, size, memory_len)
            }
            Breakpoint::RegisterEquals { .. } | Breakpoint::RegisterChanged { .. } => Ok(()),
        }
    }

    pub fn key(&self) -> BreakpointKey {
        match *self {
            Breakpoint::RegisterEquals { register, target } => {
                BreakpointKey::RegisterEquals(register, target)
            }
            Breakpoint::RegisterChanged { register, .. } => BreakpointKey::RegisterChanged(register),
            Breakpoint::MemoryEquals {
                address,
                size,
                target,
            } => BreakpointKey::MemoryEquals(address, size, target),
            Breakpoint::MemoryChanged { address, size, .. } => {
                BreakpointKey::MemoryChanged(address, size)
            }
        }
    }

    pub fn is_watch(&self) -> bool {
        matches!(
            self,
            Breakpoint::RegisterChanged { .. } | Breakpoint::MemoryChanged { .. }
        )
    }

    /// Check the condition against current processor state.
    /// For watches a `true` result re-arms the watch with the observed value.
    pub fn should_break(&mut self, registers: &[u64], memory: &[u8]) -> bool {
        match self {
            Breakpoint::RegisterEquals { register, target } => {
                registers.get(register.index()) == Some(target)
            }
            Breakpoint::RegisterChanged {
                register,
                last_seen,
            } => match registers.get(register.index()) {
                Some(&value) if value != *last_seen => {
                    *last_seen = value;
                    true
                }
                _ => false,
            },
            Breakpoint::MemoryEquals {
                address,
                size,
                target,
            } => read_le(memory, *address, size.bytes()) == Some(*target),
            Breakpoint::MemoryChanged {
                address,
                size,
                last_seen,
            } => match read_le(memory, *address, size.bytes()) {
                Some(value) if value != *last_seen => {
                    *last_seen = value;
                    true
                }
                _ => false,
            },
        }
    }
}

impl Display for Breakpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Breakpoint::RegisterEquals { register, target } => {
                write!(f, "{register} == {target:#X}")
            }
            Breakpoint::RegisterChanged {
                register,
                last_seen,
            } => write!(f, "{register} != {last_seen:#X} (watch)"),
            Breakpoint::MemoryEquals {
                address,
                size,
                target,
            } => write!(f, "[{address:#X}; {}] == {target:#X}", size.bytes()),
            Breakpoint::MemoryChanged {
                address,
                size,
                last_seen,
            } => write!(
                f,
                "[{address:#X}; {}] != {last_seen:#X} (watch)",
                size.bytes()
            ),
        }
    }
}

/// Evaluate breakpoints in order, stop at the first one that fires.
/// Returns index of the fired breakpoint.
pub fn first_hit(breakpoints: &mut [Breakpoint], registers: &[u64], memory: &[u8]) -> Option<usize> {
    breakpoints
        .iter_mut()
        .position(|brkpt| brkpt.should_break(registers, memory))
}

/// Insertion ordered set of breakpoints without duplicated conditions.
#[derive(Debug, Default, Clone)]
pub struct BreakpointSet {
    breakpoints: IndexMap<BreakpointKey, Breakpoint>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a breakpoint. Returns `false` if the same condition already exists.
    pub fn add(&mut self, brkpt: Breakpoint) -> bool {
        let key = brkpt.key();
        if self.breakpoints.contains_key(&key) {
            return false;
        }
        self.breakpoints.insert(key, brkpt);
        true
    }

    /// Remove a breakpoint with the same condition. Returns removed breakpoint.
    pub fn remove(&mut self, brkpt: &Breakpoint) -> Option<Breakpoint> {
        self.breakpoints.shift_remove(&brkpt.key())
    }

    pub fn contains(&self, brkpt: &Breakpoint) -> bool {
        self.breakpoints.contains_key(&brkpt.key())
    }

    /// Add a program counter breakpoint at `address`, or remove it if it exists.
    /// Returns `true` if the breakpoint is set after the call.
    pub fn toggle_at(&mut self, address: u64) -> bool {
        let brkpt = Breakpoint::at_address(address);
        if self.remove(&brkpt).is_some() {
            return false;
        }
        self.add(brkpt)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn clear(&mut self) {
        self.breakpoints.clear()
    }

    /// Copy of breakpoints in evaluation order, for use by a single run.
    pub fn snapshot(&self) -> Vec<Breakpoint> {
        self.breakpoints.values().copied().collect()
    }

    /// Take over watch state re-armed while running on a snapshot.
    /// Breakpoints removed from the set in the meantime are ignored.
    pub fn absorb(&mut self, snapshot: &[Breakpoint]) {
        for brkpt in snapshot.iter().filter(|b| b.is_watch()) {
            if let Some(existed) = self.breakpoints.get_mut(&brkpt.key()) {
                *existed = *brkpt;
            }
        }
    }
}
