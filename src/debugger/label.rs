use crate::debugger::error::Error;
use crate::debugger::processor::Assembled;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Label installed at the program entry point.
pub const ENTRY_LABEL: &str = "ENTRY";

/// Address expressed relative to the closest label at or before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub label: String,
    pub offset: u64,
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, ":{} + 0x{:X}", self.label, self.offset)
    }
}

/// Named program addresses.
#[derive(Debug, Default, Clone)]
pub struct Labels {
    by_name: BTreeMap<String, u64>,
}

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define or move a label. Returns previous address of the label.
    pub fn insert(&mut self, name: impl Into<String>, address: u64) -> Option<u64> {
        self.by_name.insert(name.into(), address)
    }

    pub fn remove(&mut self, name: &str) -> Option<u64> {
        self.by_name.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    pub fn clear(&mut self) {
        self.by_name.clear()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Labels ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.by_name.iter().map(|(name, addr)| (name.as_str(), *addr))
    }

    /// Names of all labels pointing exactly at `address`.
    pub fn names_at(&self, address: u64) -> impl Iterator<Item = &str> {
        self.iter()
            .filter(move |(_, addr)| *addr == address)
            .map(|(name, _)| name)
    }

    /// Find the closest label at or before `address`.
    /// If several labels share the closest address the first one by name is used.
    pub fn symbolize(&self, address: u64) -> Option<Symbol> {
        let (name, label_addr) = self
            .iter()
            .filter(|(_, addr)| *addr <= address)
            .fold(None, |best: Option<(&str, u64)>, (name, addr)| match best {
                Some((_, best_addr)) if best_addr >= addr => best,
                _ => Some((name, addr)),
            })?;

        Some(Symbol {
            label: name.to_string(),
            offset: address - label_addr,
        })
    }

    /// Append `; 0xADDR -> :label` for every referenced address that carries a label.
    pub fn annotate(&self, text: &str, references: &[u64]) -> String {
        let mut line = text.to_string();
        for &reference in references {
            for name in self.names_at(reference) {
                line.push_str(&format!("  ; 0x{reference:X} -> :{name}"));
            }
        }
        line
    }

    /// Write label addresses into assembled bytes.
    /// Each reference is replaced by 8-byte little-endian address of the label.
    pub fn resolve(&self, assembled: &mut Assembled) -> Result<(), Error> {
        for (name, offset) in &assembled.label_references {
            let address = self
                .get(name)
                .ok_or_else(|| Error::UnknownLabel(name.clone()))?;

            let len = assembled.bytes.len();
            let slot = offset
                .checked_add(8)
                .and_then(|end| assembled.bytes.get_mut(*offset..end))
                .ok_or(Error::LabelOffset {
                    offset: *offset,
                    len,
                })?;
            slot.copy_from_slice(&address.to_le_bytes());
        }
        Ok(())
    }
}
