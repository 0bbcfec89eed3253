use serde::{Deserialize, Serialize};

use crate::util::num::checked_average;

/// Running counters, updated on every intercepted call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Bytes requested through `malloc()`
    pub malloc_bytes: u64,
    /// Bytes requested through `calloc()` (`count * size`)
    pub calloc_bytes: u64,
    /// Bytes requested through `realloc()` (the new size)
    pub realloc_bytes: u64,
    /// Blocks handed out by any of the three, null results excluded
    pub blocks: u64,
    /// Bytes given back through `free()` or `realloc(ptr, 0)`
    pub freed_bytes: u64,

    pub malloc_calls: u64,
    pub calloc_calls: u64,
    pub realloc_calls: u64,
    pub free_calls: u64,

    pub illegal_frees: u64,
    /// `free()` or `realloc()` of a block that was already released
    pub double_frees: u64,
    /// `realloc()` of a non-null pointer with no live record
    pub untracked_reallocs: u64,
}

impl Counters {
    pub fn record_malloc(&mut self, size: usize, allocated: bool) {
        self.malloc_calls += 1;
        self.malloc_bytes = self.malloc_bytes.saturating_add(size as u64);
        self.blocks += allocated as u64;
    }

    pub fn record_calloc(&mut self, bytes: usize, allocated: bool) {
        self.calloc_calls += 1;
        self.calloc_bytes = self.calloc_bytes.saturating_add(bytes as u64);
        self.blocks += allocated as u64;
    }

    pub fn record_realloc(&mut self, size: usize, allocated: bool) {
        self.realloc_calls += 1;
        self.realloc_bytes = self.realloc_bytes.saturating_add(size as u64);
        self.blocks += allocated as u64;
    }

    pub fn record_freed(&mut self, size: usize) {
        self.freed_bytes = self.freed_bytes.saturating_add(size as u64);
    }

    pub fn total_bytes(&self) -> u64 {
        self.malloc_bytes
            .saturating_add(self.calloc_bytes)
            .saturating_add(self.realloc_bytes)
    }

    pub fn statistics(&self) -> Statistics {
        let total_bytes = self.total_bytes();
        Statistics {
            total_bytes,
            average_block_size: checked_average(total_bytes, self.blocks),
            freed_bytes: self.freed_bytes,
        }
    }
}

/// What gets reported at shutdown
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_bytes: u64,
    /// `total_bytes / blocks`, 0 if nothing was allocated
    pub average_block_size: u64,
    pub freed_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_sum_all_three_sources() {
        let mut counters = Counters::default();
        counters.record_malloc(100, true);
        counters.record_calloc(40, true);
        counters.record_realloc(60, true);
        counters.record_freed(100);

        assert_eq!(
            counters.statistics(),
            Statistics {
                total_bytes: 200,
                average_block_size: 66,
                freed_bytes: 100,
            }
        );
    }

    #[test]
    fn no_blocks_means_zero_average() {
        let counters = Counters::default();
        assert_eq!(counters.statistics(), Statistics::default());

        // a failed allocation still counts its bytes but not a block
        let mut counters = Counters::default();
        counters.record_malloc(usize::MAX, false);
        assert_eq!(counters.blocks, 0);
        assert_eq!(counters.statistics().average_block_size, 0);
        assert_eq!(counters.malloc_calls, 1);
    }

    #[test]
    fn byte_counters_saturate() {
        let mut counters = Counters::default();
        counters.malloc_bytes = u64::MAX - 1;
        counters.record_malloc(10, true);
        assert_eq!(counters.malloc_bytes, u64::MAX);
        counters.record_calloc(10, true);
        assert_eq!(counters.total_bytes(), u64::MAX);
    }
}
