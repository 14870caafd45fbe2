//! Agent loops: sampling, reporting and delivery.
//!
//! Sampling and reporting share the sampler behind a mutex. Reporting hands
//! batches to the delivery worker over a bounded queue and never waits for
//! it: when the queue is full the batch is dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

use rmetrics_core::MetricRecord;
use rmetrics_core::collector::{Sampler, StatsSource};
use rmetrics_core::model::MetricKind;
use rmetrics_core::sender::{DeliveryError, MetricBatch, Sender};

pub(crate) type SharedSampler<S> = Arc<Mutex<Sampler<S>>>;

fn lock<S>(sampler: &Mutex<Sampler<S>>) -> MutexGuard<'_, Sampler<S>> {
    sampler.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Describes a batch for logging.
pub(crate) fn describe_batch(records: &[MetricRecord]) -> String {
    let gauges = records
        .iter()
        .filter(|r| r.kind() == MetricKind::Gauge)
        .count();
    let counters = records.len() - gauges;
    format!("{gauges} gauges, {counters} counters")
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick
}

/// Polls the statistics source every `period`.
pub(crate) async fn poll_loop<S: StatsSource + 'static>(
    sampler: SharedSampler<S>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(period);
    async {
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = lock(&sampler).poll() {
                warn!(error = %e, "poll failed");
            }
        }
        debug!("stopped");
    }
    .instrument(info_span!("poll"))
    .await
}

/// Takes a batch every `period` and queues it for delivery.
pub(crate) async fn report_loop<S: StatsSource + 'static>(
    sampler: SharedSampler<S>,
    period: Duration,
    queue: mpsc::Sender<MetricBatch>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(period);
    // The first tick fires immediately, before anything was polled.
    tick.tick().await;
    let mut seq: u64 = 0;

    async {
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            let Some(records) = lock(&sampler).take_batch() else {
                debug!("nothing sampled yet");
                continue;
            };
            seq += 1;
            let summary = describe_batch(&records);
            match queue.try_send(MetricBatch { seq, records }) {
                Ok(()) => debug!(seq, "{summary} queued"),
                Err(mpsc::error::TrySendError::Full(batch)) => {
                    warn!(seq = batch.seq, "delivery queue full, batch dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("delivery queue closed");
                    break;
                }
            }
        }
        debug!(batches = seq, "stopped");
    }
    .instrument(info_span!("report"))
    .await
}

/// Delivers queued batches one at a time. A delivery in progress is
/// abandoned on shutdown.
pub(crate) async fn delivery_loop(
    sender: Arc<Sender>,
    mut queue: mpsc::Receiver<MetricBatch>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delivered: u64 = 0;
    async {
        loop {
            let batch = tokio::select! {
                batch = queue.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            tokio::select! {
                result = sender.send(&batch) => match result {
                    Ok(()) => {
                        delivered += 1;
                        debug!(seq = batch.seq, delivered, "batch delivered");
                    }
                    Err(DeliveryError::Exhausted { seq, attempts, last }) => {
                        error!(seq, attempts, error = %last, "batch lost after retries");
                    }
                    Err(DeliveryError::Rejected { seq, status }) => {
                        error!(seq, %status, "batch rejected by collector, not resent");
                    }
                    Err(e) => error!(seq = batch.seq, error = %e, "batch not sent"),
                },
                _ = shutdown.changed() => {
                    info!(seq = batch.seq, "shutdown during delivery, batch abandoned");
                    break;
                }
            }
        }
        info!(delivered, "stopped");
    }
    .instrument(info_span!("delivery"))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;

    use rmetrics_core::collector::FixedStats;
    use rmetrics_core::sender::{RetryPolicy, SenderConfig};

    /// Collector that answers the first `fail_first` POSTs with 500 and
    /// keeps every body it saw.
    #[derive(Default)]
    struct Collector {
        fail_first: usize,
        posts: AtomicUsize,
        bodies: Mutex<Vec<Bytes>>,
    }

    async fn updates(State(c): State<Arc<Collector>>, body: Bytes) -> StatusCode {
        let n = c.posts.fetch_add(1, Ordering::SeqCst);
        c.bodies.lock().unwrap().push(body);
        if n < c.fail_first {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    }

    async fn spawn_sender(collector: Collector, retry: RetryPolicy) -> (Arc<Sender>, Arc<Collector>) {
        let collector = Arc::new(collector);
        let app = Router::new()
            .route("/updates/", post(updates))
            .with_state(collector.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let config = SenderConfig {
            retry,
            ..SenderConfig::new(addr)
        };
        (Arc::new(Sender::new(config).unwrap()), collector)
    }

    fn counter_batch(seq: u64, name: &str) -> MetricBatch {
        MetricBatch {
            seq,
            records: vec![MetricRecord::counter(name, 1)],
        }
    }

    fn shared_sampler() -> SharedSampler<FixedStats> {
        Arc::new(Mutex::new(Sampler::new(FixedStats::typical())))
    }

    #[test]
    fn describes_batch_by_kind() {
        let records = vec![
            MetricRecord::gauge("Alloc", 1.0),
            MetricRecord::gauge("RandomValue", 0.5),
            MetricRecord::counter("PollCount", 3),
        ];
        assert_eq!(describe_batch(&records), "2 gauges, 1 counters");
    }

    #[tokio::test(start_paused = true)]
    async fn polls_and_reports_on_their_own_cadence() {
        let sampler = shared_sampler();
        let (queue_tx, mut queue_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);

        let poller = tokio::spawn(poll_loop(
            sampler.clone(),
            Duration::from_secs(2),
            stop_rx.clone(),
        ));
        let reporter = tokio::spawn(report_loop(
            sampler.clone(),
            Duration::from_secs(10),
            queue_tx,
            stop_rx,
        ));

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let batch = queue_rx.try_recv().unwrap();
        assert_eq!(batch.seq, 1);
        assert_eq!(batch.records.len(), 29);
        assert!(queue_rx.try_recv().is_err());

        stop_tx.send(true).unwrap();
        poller.await.unwrap();
        reporter.await.unwrap();
        // Polls at 0, 2, 4, 6, 8 and 10 seconds.
        assert!(lock(&sampler).source().reads() >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_batches() {
        let sampler = shared_sampler();
        lock(&sampler).poll().unwrap();
        let (queue_tx, mut queue_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let reporter = tokio::spawn(report_loop(
            sampler.clone(),
            Duration::from_secs(1),
            queue_tx,
            stop_rx,
        ));

        // Three reports, nobody consuming: only the first one fits.
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        stop_tx.send(true).unwrap();
        reporter.await.unwrap();

        assert_eq!(queue_rx.recv().await.unwrap().seq, 1);
        assert!(queue_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn exhausted_batch_does_not_block_the_next() {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            step: Duration::from_millis(10),
        };
        let (sender, collector) = spawn_sender(
            Collector {
                fail_first: 3,
                ..Default::default()
            },
            retry,
        )
        .await;
        let (queue_tx, queue_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        queue_tx.try_send(counter_batch(1, "first")).unwrap();
        queue_tx.try_send(counter_batch(2, "second")).unwrap();
        drop(queue_tx);

        // The loop ends on its own once the closed queue is drained.
        tokio::time::timeout(
            Duration::from_secs(10),
            delivery_loop(sender, queue_rx, stop_rx),
        )
        .await
        .unwrap();
        drop(stop_tx);

        let bodies = collector.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 4);
        for body in &bodies[..3] {
            assert!(String::from_utf8_lossy(body).contains("\"first\""));
        }
        assert!(String::from_utf8_lossy(&bodies[3]).contains("\"second\""));
    }

    #[tokio::test]
    async fn shutdown_abandons_delivery_in_progress() {
        let retry = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(60),
            step: Duration::from_secs(60),
        };
        let (sender, collector) = spawn_sender(
            Collector {
                fail_first: usize::MAX,
                ..Default::default()
            },
            retry,
        )
        .await;
        let (queue_tx, queue_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        queue_tx.try_send(counter_batch(1, "stuck")).unwrap();

        let delivery = tokio::spawn(delivery_loop(sender, queue_rx, stop_rx));
        while collector.posts.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The first attempt failed and the retry is now waiting a minute.
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), delivery)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(collector.posts.load(Ordering::SeqCst), 1);
        drop(queue_tx);
    }
}
