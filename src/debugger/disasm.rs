use crate::debugger::error::Error;
use crate::debugger::label::Labels;
use crate::debugger::processor::Disassembler;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::ops::Range;

/// Half-open byte range `[start, start + length)` occupied by one instruction
/// or one undecoded data byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: u64,
    pub length: u32,
}

impl Span {
    pub fn new(start: u64, length: u32) -> Self {
        Self { start, length }
    }

    #[inline(always)]
    pub fn end(&self) -> u64 {
        self.start + self.length as u64
    }

    #[inline(always)]
    pub fn contains(&self, address: u64) -> bool {
        (self.start..self.end()).contains(&address)
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end()
    }
}

/// Decoded instruction (or raw data byte) with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionLine {
    pub span: Span,
    pub text: String,
    /// Addresses referenced by instruction operands.
    pub references: SmallVec<[u64; 2]>,
}

impl InstructionLine {
    fn raw_data(address: u64, byte: u8) -> Self {
        Self {
            span: Span::new(address, 1),
            text: format!("%DAT 0x{byte:02X}"),
            references: SmallVec::new(),
        }
    }

    pub fn is_raw_data(&self) -> bool {
        self.span.length == 1 && self.text.starts_with("%DAT ")
    }

    /// Instruction text with label annotations of referenced addresses.
    pub fn render(&self, labels: &Labels) -> String {
        labels.annotate(&self.text, &self.references)
    }
}

/// Lazily maintained mapping of addresses to decoded instruction boundaries.
///
/// Code and data share one address space, so the map only decodes from points where
/// execution or the user says an instruction starts. Everything before such a point
/// that isn't explained by an already decoded instruction is kept as raw data bytes.
/// Recorded spans are always contiguous and start at address 0.
pub struct InstructionMap {
    decoder: Box<dyn Disassembler>,
    lines: BTreeMap<u64, InstructionLine>,
}

impl InstructionMap {
    pub fn new(decoder: Box<dyn Disassembler>) -> Self {
        Self {
            decoder,
            lines: BTreeMap::new(),
        }
    }

    /// Decode forward from `address` unless it's already a known instruction start.
    pub fn extend_from(&mut self, memory: &[u8], address: u64) -> Result<(), Error> {
        if self.lines.contains_key(&address) {
            return Ok(());
        }
        self.force_resync(memory, address)
    }

    /// Drop every span that doesn't end at or before `address`, fill the gap between
    /// the last kept span and `address` with raw data bytes, then decode from `address`
    /// to the end of memory.
    pub fn force_resync(&mut self, memory: &[u8], address: u64) -> Result<(), Error> {
        let memory_len = memory.len() as u64;
        if address > memory_len {
            return Err(Error::OutOfRange {
                address,
                width: 1,
                memory_len,
            });
        }

        // spans are contiguous so everything with end <= address is a prefix of the map,
        // only the last span starting before `address` may cross it
        _ = self.lines.split_off(&address);
        if let Some(last) = self.lines.last_entry() {
            if last.get().span.end() > address {
                last.remove();
            }
        }

        let gap_start = self.covered_until();
        for addr in gap_start..address {
            self.lines
                .insert(addr, InstructionLine::raw_data(addr, memory[addr as usize]));
        }

        let decoded = self.decode_forward(memory, address);
        log::debug!(target: "debugger", "disassembly resynced from {address:#X}, {decoded} instructions decoded");
        Ok(())
    }

    /// Clear the map and decode from address 0.
    pub fn full_reset(&mut self, memory: &[u8]) {
        self.lines.clear();
        self.decode_forward(memory, 0);
    }

    /// Clear the map and re-grow it from a list of known instruction starts.
    /// Addresses outside memory are ignored.
    pub fn rebuild_from(&mut self, memory: &[u8], addresses: impl IntoIterator<Item = u64>) {
        self.lines.clear();
        let mut addresses: Vec<u64> = addresses
            .into_iter()
            .filter(|addr| *addr < memory.len() as u64)
            .collect();
        addresses.sort_unstable();
        addresses.dedup();

        if addresses.first() != Some(&0) {
            addresses.insert(0, 0);
        }

        for address in addresses {
            // addresses are inside memory so the resync can't fail
            _ = self.extend_from(memory, address);
        }
    }

    /// Decode instructions from `start` to the end of memory. Returns number of decoded lines.
    fn decode_forward(&mut self, memory: &[u8], start: u64) -> usize {
        let mut count = 0;
        let mut position = start as usize;
        while position < memory.len() {
            let remaining = memory.len() - position;
            let decoded = self.decoder.decode_one(&memory[position..]);

            let mut length = decoded.length as usize;
            if length == 0 || length > remaining {
                let clamped = length.clamp(1, remaining);
                log::warn!(target: "debugger", "decoder returned length {length} at {position:#X}, clamped to {clamped}");
                length = clamped;
            }

            let address = position as u64;
            self.lines.insert(
                address,
                InstructionLine {
                    span: Span::new(address, length as u32),
                    text: decoded.text,
                    references: decoded.references,
                },
            );
            position += length;
            count += 1;
        }
        count
    }

    fn covered_until(&self) -> u64 {
        self.lines
            .last_key_value()
            .map(|(_, line)| line.span.end())
            .unwrap_or_default()
    }

    /// Known line starting at `address`, or a line decoded on the fly if `address`
    /// isn't a known instruction start. `None` if `address` is out of memory.
    pub fn decode_at(&self, memory: &[u8], address: u64) -> Option<InstructionLine> {
        if let Some(line) = self.lines.get(&address) {
            return Some(line.clone());
        }
        let bytes = memory.get(usize::try_from(address).ok()?..)?;
        if bytes.is_empty() {
            return None;
        }
        let decoded = self.decoder.decode_one(bytes);
        let length = (decoded.length as usize).clamp(1, bytes.len());
        Some(InstructionLine {
            span: Span::new(address, length as u32),
            text: decoded.text,
            references: decoded.references,
        })
    }

    pub fn is_known_start(&self, address: u64) -> bool {
        self.lines.contains_key(&address)
    }

    pub fn line(&self, address: u64) -> Option<&InstructionLine> {
        self.lines.get(&address)
    }

    /// Find a line whose span contains `address`.
    pub fn span_containing(&self, address: u64) -> Option<&InstructionLine> {
        self.lines
            .range(..=address)
            .next_back()
            .map(|(_, line)| line)
            .filter(|line| line.span.contains(address))
    }

    /// Index (in address order) of the line starting closest to `address`.
    /// On equal distance the lower line wins. Returns `None` if map is empty.
    pub fn nearest_index(&self, address: u64) -> Option<usize> {
        let after = self.lines.range(address..).next();
        let index_of_after = self.lines.range(..address).count();
        let before = index_of_after.checked_sub(1).and_then(|idx| {
            self.lines
                .range(..address)
                .next_back()
                .map(|(start, _)| (idx, *start))
        });

        match (before, after) {
            (None, None) => None,
            (Some((idx, _)), None) => Some(idx),
            (None, Some(_)) => Some(index_of_after),
            (Some((idx, before_start)), Some((after_start, _))) => {
                if address - before_start <= after_start - address {
                    Some(idx)
                } else {
                    Some(index_of_after)
                }
            }
        }
    }

    /// Lines with start address in `range`, in address order.
    pub fn lines_between(&self, range: Range<u64>) -> impl Iterator<Item = &InstructionLine> {
        self.lines.range(range).map(|(_, line)| line)
    }

    pub fn lines(&self) -> impl Iterator<Item = &InstructionLine> {
        self.lines.values()
    }

    pub fn spans(&self) -> impl Iterator<Item = Span> + '_ {
        self.lines.values().map(|line| line.span)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Return `true` if spans are gap-free from 0 and cover exactly `memory_len` bytes.
    pub fn is_contiguous(&self, memory_len: u64) -> bool {
        let mut expected = 0;
        for span in self.spans() {
            if span.start != expected || span.length == 0 {
                return false;
            }
            expected = span.end();
        }
        expected == memory_len
    }
}
