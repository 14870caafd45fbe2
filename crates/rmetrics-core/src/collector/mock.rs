//! Fixed statistics source for testing samplers without a real allocator.

use super::source::{RuntimeStats, SampleError, StatsSource};

/// Returns the same statistics on every read, optionally failing.
#[derive(Debug, Clone, Default)]
pub struct FixedStats {
    stats: RuntimeStats,
    fail: bool,
    reads: u64,
}

impl FixedStats {
    pub fn new(stats: RuntimeStats) -> Self {
        Self {
            stats,
            ..Default::default()
        }
    }

    /// A process with a few megabytes of heap.
    pub fn typical() -> Self {
        Self::new(RuntimeStats {
            alloc: 4 * 1024 * 1024,
            heap_alloc: 4 * 1024 * 1024,
            heap_inuse: 5 * 1024 * 1024,
            heap_sys: 8 * 1024 * 1024,
            mallocs: 12_000,
            frees: 9_500,
            heap_objects: 2_500,
            sys: 16 * 1024 * 1024,
            total_alloc: 40 * 1024 * 1024,
            ..Default::default()
        })
    }

    /// Makes every following read fail.
    pub fn set_failing(&mut self, fail: bool) {
        self.fail = fail;
    }

    /// Number of successful reads so far.
    pub fn reads(&self) -> u64 {
        self.reads
    }
}

impl StatsSource for FixedStats {
    fn read_stats(&mut self) -> Result<RuntimeStats, SampleError> {
        if self.fail {
            return Err(SampleError::Unavailable("mock source failing".into()));
        }
        self.reads += 1;
        Ok(self.stats)
    }
}
