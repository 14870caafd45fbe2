//! Turns polled runtime statistics into report batches.
//!
//! Only the latest poll is kept. `PollCount` restarts from zero every time a
//! batch is taken.

use tracing::debug;

use crate::model::MetricRecord;

use super::source::{RuntimeStats, SampleError, StatsSource};

/// Counter with the number of polls since the previous batch.
pub const POLL_COUNT: &str = "PollCount";
/// Gauge with a fresh random value in `[0, 1)` per batch.
pub const RANDOM_VALUE: &str = "RandomValue";

/// Keeps the latest statistics reading and turns it into report batches.
#[derive(Debug)]
pub struct Sampler<S> {
    source: S,
    latest: Option<RuntimeStats>,
    polls_since_batch: i64,
}

impl<S: StatsSource> Sampler<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            latest: None,
            polls_since_batch: 0,
        }
    }

    /// Reads the source once. A failed read does not count as a poll and
    /// leaves the previous reading in place.
    pub fn poll(&mut self) -> Result<(), SampleError> {
        let stats = self.source.read_stats()?;
        self.latest = Some(stats);
        self.polls_since_batch += 1;
        Ok(())
    }

    pub fn polls_since_batch(&self) -> i64 {
        self.polls_since_batch
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Builds a batch from the latest reading and resets the poll count.
    ///
    /// Returns `None` until the first successful poll.
    pub fn take_batch(&mut self) -> Option<Vec<MetricRecord>> {
        let stats = self.latest?;
        let polls = std::mem::take(&mut self.polls_since_batch);

        let mut records: Vec<MetricRecord> = stats
            .gauges()
            .map(|(name, value)| MetricRecord::gauge(name, value))
            .collect();
        records.push(MetricRecord::counter(POLL_COUNT, polls));
        records.push(MetricRecord::gauge(RANDOM_VALUE, rand::random::<f64>()));

        debug!(records = records.len(), polls, "batch taken");
        Some(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{FixedStats, GAUGE_NAMES};
    use crate::model::{MetricKind, MetricValue};

    fn poll_count(batch: &[MetricRecord]) -> i64 {
        match batch.iter().find(|r| r.name == POLL_COUNT).map(|r| r.value) {
            Some(MetricValue::Counter(n)) => n,
            other => panic!("unexpected PollCount: {other:?}"),
        }
    }

    #[test]
    fn no_batch_before_first_poll() {
        let mut sampler = Sampler::new(FixedStats::typical());
        assert!(sampler.take_batch().is_none());
    }

    #[test]
    fn batch_has_fixed_shape() {
        let mut sampler = Sampler::new(FixedStats::typical());
        sampler.poll().unwrap();
        let batch = sampler.take_batch().unwrap();

        assert_eq!(batch.len(), GAUGE_NAMES.len() + 2);
        for name in GAUGE_NAMES {
            let rec = batch.iter().find(|r| r.name == name).unwrap();
            assert_eq!(rec.kind(), MetricKind::Gauge);
        }
        let random = batch.iter().find(|r| r.name == RANDOM_VALUE).unwrap();
        assert!(matches!(random.value, MetricValue::Gauge(v) if (0.0..1.0).contains(&v)));
        assert_eq!(
            batch.iter().filter(|r| r.kind() == MetricKind::Counter).count(),
            1
        );
    }

    #[test]
    fn poll_count_is_per_batch_delta() {
        let mut sampler = Sampler::new(FixedStats::typical());
        for _ in 0..5 {
            sampler.poll().unwrap();
        }
        assert_eq!(poll_count(&sampler.take_batch().unwrap()), 5);

        sampler.poll().unwrap();
        sampler.poll().unwrap();
        assert_eq!(poll_count(&sampler.take_batch().unwrap()), 2);

        // No polls in between: the latest reading is resent with a zero delta.
        assert_eq!(poll_count(&sampler.take_batch().unwrap()), 0);
    }

    #[test]
    fn failed_read_is_not_counted() {
        let mut source = FixedStats::typical();
        source.set_failing(true);
        let mut sampler = Sampler::new(source);

        assert!(sampler.poll().is_err());
        assert_eq!(sampler.polls_since_batch(), 0);
        assert!(sampler.take_batch().is_none());
        assert_eq!(sampler.source().reads(), 0);
    }
}
