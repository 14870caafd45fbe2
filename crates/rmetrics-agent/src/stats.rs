//! Runtime statistics read from jemalloc through `mallctl`.
//!
//! jemalloc has no garbage collector, so the GC-related fields stay at zero.

use std::ffi::CStr;
use std::mem;
use std::ptr;

use rmetrics_core::collector::{RuntimeStats, SampleError, StatsSource};

/// Reads allocator statistics of the current process.
#[derive(Debug, Default)]
pub(crate) struct JemallocStats {
    epoch: u64,
}

impl JemallocStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Refreshes jemalloc's cached statistics.
    fn advance_epoch(&mut self) -> Result<(), SampleError> {
        self.epoch = self.epoch.wrapping_add(1);
        let mut epoch = self.epoch;
        // SAFETY: "epoch" takes a u64 as new value; `epoch` outlives the call.
        let rc = unsafe {
            tikv_jemalloc_sys::mallctl(
                c"epoch".as_ptr().cast(),
                ptr::null_mut(),
                ptr::null_mut(),
                (&mut epoch as *mut u64).cast(),
                mem::size_of::<u64>(),
            )
        };
        check(c"epoch", rc)
    }
}

fn check(name: &CStr, rc: i32) -> Result<(), SampleError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(SampleError::Unavailable(format!(
            "mallctl({}) failed with code {rc}",
            name.to_string_lossy()
        )))
    }
}

/// Reads a numeric statistic. `T` must match the width jemalloc documents
/// for `name` (`size_t` or `uint64_t`).
fn read<T: Copy + Default>(name: &CStr) -> Result<T, SampleError> {
    let mut value = T::default();
    let mut len = mem::size_of::<T>();
    // SAFETY: `name` is NUL-terminated, `value` is a writable buffer of
    // `len` bytes and no new value is written.
    let rc = unsafe {
        tikv_jemalloc_sys::mallctl(
            name.as_ptr().cast(),
            (&mut value as *mut T).cast(),
            &mut len,
            ptr::null_mut(),
            0,
        )
    };
    check(name, rc)?;
    Ok(value)
}

impl StatsSource for JemallocStats {
    fn read_stats(&mut self) -> Result<RuntimeStats, SampleError> {
        self.advance_epoch()?;

        let allocated = read::<usize>(c"stats.allocated")? as u64;
        let active = read::<usize>(c"stats.active")? as u64;
        let resident = read::<usize>(c"stats.resident")? as u64;
        let mapped = read::<usize>(c"stats.mapped")? as u64;
        let metadata = read::<usize>(c"stats.metadata")? as u64;
        let retained = read::<usize>(c"stats.retained")? as u64;

        // 4096 is MALLCTL_ARENAS_ALL: totals over every arena.
        let small_nmalloc = read::<u64>(c"stats.arenas.4096.small.nmalloc")?;
        let small_ndalloc = read::<u64>(c"stats.arenas.4096.small.ndalloc")?;
        let large_nmalloc = read::<u64>(c"stats.arenas.4096.large.nmalloc")?;
        let large_ndalloc = read::<u64>(c"stats.arenas.4096.large.ndalloc")?;

        let mallocs = small_nmalloc + large_nmalloc;
        let frees = small_ndalloc + large_ndalloc;

        Ok(RuntimeStats {
            alloc: allocated,
            heap_alloc: allocated,
            heap_inuse: active,
            heap_idle: mapped.saturating_sub(active),
            heap_released: retained,
            heap_sys: mapped,
            heap_objects: mallocs.saturating_sub(frees),
            mallocs,
            frees,
            other_sys: metadata,
            sys: resident.max(mapped + metadata),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_live_allocator_statistics() {
        let mut source = JemallocStats::new();
        let buffer: Vec<u8> = vec![1; 4 * 1024 * 1024];
        let during = source.read_stats().unwrap();
        assert!(during.alloc >= buffer.len() as u64);
        assert!(during.mallocs >= during.frees);
        assert!(during.heap_sys >= during.heap_inuse);
        assert_eq!(during.num_gc, 0);
        drop(buffer);
    }
}
