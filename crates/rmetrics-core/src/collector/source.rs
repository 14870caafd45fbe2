//! Runtime memory statistics and the trait that provides them.

/// Names of the runtime gauges, in report order.
pub const GAUGE_NAMES: [&str; 27] = [
    "Alloc",
    "BuckHashSys",
    "Frees",
    "GCCPUFraction",
    "GCSys",
    "HeapAlloc",
    "HeapIdle",
    "HeapInuse",
    "HeapObjects",
    "HeapReleased",
    "HeapSys",
    "LastGC",
    "Lookups",
    "MCacheInuse",
    "MCacheSys",
    "MSpanInuse",
    "MSpanSys",
    "Mallocs",
    "NextGC",
    "NumForcedGC",
    "NumGC",
    "OtherSys",
    "PauseTotalNs",
    "StackInuse",
    "StackSys",
    "Sys",
    "TotalAlloc",
];

/// One reading of the process memory statistics.
///
/// The field set is fixed; a source without an equivalent for some field
/// leaves it at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RuntimeStats {
    pub alloc: u64,
    pub buck_hash_sys: u64,
    pub frees: u64,
    pub gc_cpu_fraction: f64,
    pub gc_sys: u64,
    pub heap_alloc: u64,
    pub heap_idle: u64,
    pub heap_inuse: u64,
    pub heap_objects: u64,
    pub heap_released: u64,
    pub heap_sys: u64,
    pub last_gc: u64,
    pub lookups: u64,
    pub mcache_inuse: u64,
    pub mcache_sys: u64,
    pub mspan_inuse: u64,
    pub mspan_sys: u64,
    pub mallocs: u64,
    pub next_gc: u64,
    pub num_forced_gc: u32,
    pub num_gc: u32,
    pub other_sys: u64,
    pub pause_total_ns: u64,
    pub stack_inuse: u64,
    pub stack_sys: u64,
    pub sys: u64,
    pub total_alloc: u64,
}

impl RuntimeStats {
    /// Gauge values in [`GAUGE_NAMES`] order.
    pub fn gauge_values(&self) -> [f64; 27] {
        [
            self.alloc as f64,
            self.buck_hash_sys as f64,
            self.frees as f64,
            self.gc_cpu_fraction,
            self.gc_sys as f64,
            self.heap_alloc as f64,
            self.heap_idle as f64,
            self.heap_inuse as f64,
            self.heap_objects as f64,
            self.heap_released as f64,
            self.heap_sys as f64,
            self.last_gc as f64,
            self.lookups as f64,
            self.mcache_inuse as f64,
            self.mcache_sys as f64,
            self.mspan_inuse as f64,
            self.mspan_sys as f64,
            self.mallocs as f64,
            self.next_gc as f64,
            f64::from(self.num_forced_gc),
            f64::from(self.num_gc),
            self.other_sys as f64,
            self.pause_total_ns as f64,
            self.stack_inuse as f64,
            self.stack_sys as f64,
            self.sys as f64,
            self.total_alloc as f64,
        ]
    }

    /// Name/value pairs for every runtime gauge.
    pub fn gauges(&self) -> impl Iterator<Item = (&'static str, f64)> {
        GAUGE_NAMES.into_iter().zip(self.gauge_values())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("runtime statistics unavailable: {0}")]
    Unavailable(String),
}

/// Provider of runtime statistics.
pub trait StatsSource: Send {
    fn read_stats(&mut self) -> Result<RuntimeStats, SampleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_names_are_unique() {
        let mut names = GAUGE_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), GAUGE_NAMES.len());
    }

    #[test]
    fn gauges_follow_name_order() {
        let stats = RuntimeStats {
            alloc: 1,
            gc_cpu_fraction: 0.25,
            num_gc: 7,
            total_alloc: 99,
            ..Default::default()
        };
        let gauges: Vec<_> = stats.gauges().collect();
        assert_eq!(gauges.len(), 27);
        assert_eq!(gauges[0], ("Alloc", 1.0));
        assert_eq!(gauges[3], ("GCCPUFraction", 0.25));
        assert_eq!(gauges[20], ("NumGC", 7.0));
        assert_eq!(gauges[26], ("TotalAlloc", 99.0));
    }
}
