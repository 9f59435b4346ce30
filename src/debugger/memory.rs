use itertools::Itertools;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum RegionKind {
    Program,
    Heap,
    Stack,
}

/// Mapped memory range and what it's used for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub range: Range<u64>,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Classify mapped ranges: the range at address 0 holds the program, a range ending at
/// the end of memory is the stack, everything else is heap allocations.
pub fn classify(mapped: &[Range<u64>], memory_len: u64) -> Vec<MemoryRegion> {
    mapped
        .iter()
        .map(|range| {
            let kind = if range.start == 0 {
                RegionKind::Program
            } else if range.end == memory_len {
                RegionKind::Stack
            } else {
                RegionKind::Heap
            };
            MemoryRegion {
                range: range.clone(),
                kind,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeapStats {
    pub total_memory: u64,
    pub free_memory: u64,
    pub free_blocks: Vec<Range<u64>>,
    pub largest_free_block: u64,
    /// Share of free memory outside of the largest free block, in percents.
    pub fragmentation: f64,
    pub allocated_blocks: usize,
    pub allocated_size: u64,
    pub stack_size: u64,
    pub program_size: u64,
}

impl HeapStats {
    /// Calculate statistics from ordered non-overlapping mapped ranges.
    pub fn collect(mapped: &[Range<u64>], memory_len: u64) -> Self {
        let regions = classify(mapped, memory_len);
        let size_of = |kind: RegionKind| -> u64 {
            regions
                .iter()
                .filter(|r| r.kind == kind)
                .map(MemoryRegion::len)
                .sum()
        };

        let program_size = size_of(RegionKind::Program);
        let stack_size = size_of(RegionKind::Stack);
        let allocated_size = size_of(RegionKind::Heap);
        let allocated_blocks = regions
            .iter()
            .filter(|r| r.kind == RegionKind::Heap)
            .count();

        let mut free_blocks: Vec<Range<u64>> = mapped
            .iter()
            .tuple_windows()
            .filter(|(prev, next)| prev.end < next.start)
            .map(|(prev, next)| prev.end..next.start)
            .collect();
        // without a mapped stack memory after the last range is free too
        if let Some(last) = mapped.last() {
            if last.end < memory_len {
                free_blocks.push(last.end..memory_len);
            }
        }

        let free_memory = memory_len.saturating_sub(program_size + stack_size + allocated_size);
        let largest_free_block = free_blocks
            .iter()
            .map(|block| block.end - block.start)
            .max()
            .unwrap_or_default();
        let fragmentation = if free_memory == 0 {
            0.0
        } else {
            100.0 - largest_free_block as f64 / free_memory as f64 * 100.0
        };

        Self {
            total_memory: memory_len,
            free_memory,
            free_blocks,
            largest_free_block,
            fragmentation,
            allocated_blocks,
            allocated_size,
            stack_size,
            program_size,
        }
    }
}
