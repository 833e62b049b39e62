//! Address ranges of generated code.
//!
//! Backtraces record the entry address of each native frame; this table maps
//! any address inside generated code back to the function it belongs to.

use parking_lot::RwLock;

use crate::ir::FuncId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRange {
    pub start: usize,
    /// Exclusive.
    pub end: usize,
    pub func: FuncId,
    pub name: String,
    pub line: u32,
}

/// Ranges sorted by start address. Ranges never overlap.
#[derive(Debug, Default)]
pub struct CodeRanges {
    ranges: RwLock<Vec<CodeRange>>,
}

impl CodeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, range: CodeRange) {
        let mut ranges = self.ranges.write();
        let at = ranges.partition_point(|r| r.start < range.start);
        ranges.insert(at, range);
    }

    /// The range containing `addr`, or `None` for code the JIT did not emit.
    pub fn lookup(&self, addr: usize) -> Option<CodeRange> {
        let ranges = self.ranges.read();
        let after = ranges.partition_point(|r| r.start <= addr);
        let candidate = ranges.get(after.checked_sub(1)?)?;
        (addr < candidate.end).then(|| candidate.clone())
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
