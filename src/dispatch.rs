//! Fixed-size publish worker pool.
//!
//! A batch is split into contiguous index ranges, one per worker. Workers share
//! one publisher handle for the topic and publish each message exactly once,
//! keyed by the wall-clock time of submission. A worker submits its whole slice
//! without waiting for acknowledgements, then drains the delivery results.
//! Outcomes are folded into a [`DispatchSummary`]; what happens on failure is a
//! [`FailurePolicy`].

use crate::clock::Clock;
use crate::event::{MessageBatch, Topic};
use crate::metrics::stats::{Stats, StatsSnapshot};
use crate::transport::{Publisher, Transport, TransportError};
use bytes::Bytes;
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_WORKERS: usize = 3;

/// How the submission timestamp is encoded as the record key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyCodec {
    /// 8-byte big-endian signed integer.
    Long,
    /// Decimal digits.
    String,
    /// No key.
    None,
}

impl KeyCodec {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "long" => Some(Self::Long),
            "string" => Some(Self::String),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::String => "string",
            Self::None => "none",
        }
    }

    pub fn encode(self, millis: i64) -> Option<Bytes> {
        match self {
            Self::Long => Some(Bytes::copy_from_slice(&millis.to_be_bytes())),
            Self::String => Some(Bytes::from(millis.to_string())),
            Self::None => None,
        }
    }

    /// Inverse of [`encode`](Self::encode); `None` if the key does not fit.
    pub fn decode(self, key: &[u8]) -> Option<i64> {
        match self {
            Self::Long => <[u8; 8]>::try_from(key).ok().map(i64::from_be_bytes),
            Self::String => std::str::from_utf8(key).ok()?.parse().ok(),
            Self::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop submitting after the first failed delivery and report an error.
    FailFast,
    /// Publish everything; failures only show up in the summary.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSummary {
    pub topic: String,
    pub batch_size: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Never submitted because fail-fast tripped first.
    pub skipped: usize,
    pub per_worker: Vec<usize>,
    pub first_error: Option<String>,
    pub stats: StatsSnapshot,
}

impl DispatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("create publisher for {topic}: {source}")]
    Publisher {
        topic: String,
        source: TransportError,
    },
    #[error("delivery to {} failed ({} of {} messages): {}", .summary.topic, .summary.failed, .summary.batch_size, .summary.first_error.as_deref().unwrap_or("unknown"))]
    DeliveryFailed { summary: Box<DispatchSummary> },
    #[error("publish worker {worker} panicked: {reason}")]
    Worker { worker: usize, reason: String },
}

/// Contiguous ranges covering `0..len`; sizes differ by at most one.
pub fn partition(len: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let base = len / workers;
    let extra = len % workers;
    let mut start = 0;
    (0..workers)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

struct WorkerReport {
    attempted: usize,
    outcomes: Vec<DispatchOutcome>,
}

impl WorkerReport {
    /// Fold one delivery result in; `true` if it failed.
    async fn record(
        &mut self,
        result: Result<Duration, TransportError>,
        stats: &Stats,
        worker: usize,
        topic: &str,
    ) -> bool {
        match result {
            Ok(ack_latency) => {
                stats.record_sent(ack_latency).await;
                self.outcomes.push(DispatchOutcome::Delivered);
                false
            }
            Err(e) => {
                tracing::error!(worker, topic = %topic, error = %e, "delivery failed");
                stats.record_error().await;
                self.outcomes.push(DispatchOutcome::Failed(e.to_string()));
                true
            }
        }
    }
}

pub struct PublishWorkerPool {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    workers: usize,
    warmup: Duration,
    policy: FailurePolicy,
    key_codec: KeyCodec,
}

impl PublishWorkerPool {
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            workers: DEFAULT_WORKERS,
            warmup: Duration::ZERO,
            policy: FailurePolicy::FailFast,
            key_codec: KeyCodec::Long,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Delay between creating the publisher and the first submission.
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_key_codec(mut self, key_codec: KeyCodec) -> Self {
        self.key_codec = key_codec;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn dispatch(
        &self,
        batch: MessageBatch,
        topic: &Topic,
    ) -> Result<DispatchSummary, DispatchError> {
        let batch_size = batch.len();
        let publisher: Arc<dyn Publisher> = self
            .transport
            .create_publisher(topic.as_str())
            .await
            .map_err(|source| DispatchError::Publisher {
                topic: topic.to_string(),
                source,
            })?
            .into();

        if !self.warmup.is_zero() {
            tracing::debug!(topic = %topic, warmup = ?self.warmup, "publisher warm-up");
            self.clock.sleep(self.warmup).await;
        }

        let stats = Arc::new(Stats::new());
        let abort = CancellationToken::new();
        let ranges = partition(batch_size, self.workers);
        let mut messages = batch.into_messages().into_iter();
        let mut handles = Vec::with_capacity(ranges.len());
        for (worker, range) in ranges.iter().enumerate() {
            let slice: Vec<String> = messages.by_ref().take(range.len()).collect();
            let publisher = publisher.clone();
            let clock = self.clock.clone();
            let stats = stats.clone();
            let abort = abort.clone();
            let policy = self.policy;
            let key_codec = self.key_codec;
            let topic = topic.to_string();
            handles.push(tokio::spawn(async move {
                let total = slice.len();
                let mut report = WorkerReport {
                    attempted: 0,
                    outcomes: Vec::with_capacity(total),
                };
                let publisher = &publisher;
                let mut in_flight = FuturesUnordered::new();
                for (i, message) in slice.into_iter().enumerate() {
                    if abort.is_cancelled() {
                        tracing::debug!(worker, topic = %topic, remaining = total - i, "stopping after a failed delivery");
                        break;
                    }
                    let key = key_codec.encode(clock.now_millis());
                    report.attempted += 1;
                    in_flight.push(async move {
                        let started = Instant::now();
                        let result = publisher.publish(key, Bytes::from(message)).await;
                        result.map(|()| started.elapsed())
                    });
                    // One poll hands the new record to the client; ready acks are folded in.
                    while let Some(Some(result)) = in_flight.next().now_or_never() {
                        if report.record(result, &stats, worker, &topic).await && policy == FailurePolicy::FailFast {
                            abort.cancel();
                        }
                    }
                }
                tracing::info!(
                    worker,
                    topic = %topic,
                    submitted = report.attempted,
                    assigned = total,
                    "worker finished sending"
                );
                while let Some(result) = in_flight.next().await {
                    if report.record(result, &stats, worker, &topic).await && policy == FailurePolicy::FailFast {
                        abort.cancel();
                    }
                }
                report
            }));
        }

        let mut summary = DispatchSummary {
            topic: topic.to_string(),
            batch_size,
            attempted: 0,
            delivered: 0,
            failed: 0,
            skipped: 0,
            per_worker: Vec::with_capacity(handles.len()),
            first_error: None,
            stats: stats.snapshot().await,
        };
        let mut worker_error = None;
        for (worker, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(report) => {
                    summary.attempted += report.attempted;
                    summary.per_worker.push(report.attempted);
                    for outcome in report.outcomes {
                        match outcome {
                            DispatchOutcome::Delivered => summary.delivered += 1,
                            DispatchOutcome::Failed(cause) => {
                                summary.failed += 1;
                                summary.first_error.get_or_insert(cause);
                            }
                        }
                    }
                }
                Err(e) => {
                    summary.per_worker.push(0);
                    worker_error.get_or_insert(DispatchError::Worker {
                        worker,
                        reason: e.to_string(),
                    });
                }
            }
        }
        if let Err(e) = publisher.shutdown().await {
            tracing::warn!(topic = %topic, error = %e, "publisher shutdown failed");
        }
        if let Some(e) = worker_error {
            return Err(e);
        }
        summary.skipped = batch_size - summary.attempted;
        summary.stats = stats.snapshot().await;

        tracing::info!(
            topic = %topic,
            batch = batch_size,
            delivered = summary.delivered,
            failed = summary.failed,
            skipped = summary.skipped,
            p99_us = summary.stats.latency_us_p99,
            "dispatch finished"
        );

        if summary.failed > 0 && self.policy == FailurePolicy::FailFast {
            return Err(DispatchError::DeliveryFailed {
                summary: Box::new(summary),
            });
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::transport::mock::MockTransport;
    use std::collections::BTreeSet;

    fn batch(n: usize) -> MessageBatch {
        (0..n).map(|i| format!("m{i}")).collect()
    }

    fn pool(transport: &MockTransport) -> PublishWorkerPool {
        let clock = Arc::new(VirtualClock::new(1_700_000_000_000));
        PublishWorkerPool::new(Arc::new(transport.clone()), clock)
    }

    #[test]
    fn partition_covers_every_index_once() {
        for len in 0..20 {
            for workers in 1..6 {
                let ranges = partition(len, workers);
                assert_eq!(ranges.len(), workers);
                let flat: Vec<usize> = ranges.iter().cloned().flatten().collect();
                assert_eq!(flat, (0..len).collect::<Vec<_>>());
                let sizes: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
                assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
            }
        }
    }

    #[test]
    fn key_codecs_encode_timestamps() {
        let ts = 1_700_000_000_123i64;
        let long = KeyCodec::Long.encode(ts).unwrap();
        assert_eq!(long.len(), 8);
        assert_eq!(KeyCodec::Long.decode(&long), Some(ts));
        assert_eq!(KeyCodec::String.encode(ts).unwrap(), Bytes::from("1700000000123"));
        assert_eq!(KeyCodec::None.encode(ts), None);
        assert_eq!(KeyCodec::Long.decode(b"short"), None);
    }

    #[tokio::test]
    async fn nine_messages_over_three_workers() {
        let transport = MockTransport::new();
        let topic = Topic::new("events").unwrap();
        let summary = pool(&transport).dispatch(batch(9), &topic).await.unwrap();

        assert_eq!(summary.per_worker, vec![3, 3, 3]);
        assert_eq!(summary.attempted, 9);
        assert_eq!(summary.delivered, 9);
        assert!(summary.is_success());
        assert_eq!(transport.attempts(), 9);
        let payloads: BTreeSet<Bytes> = transport.published().into_iter().map(|r| r.payload).collect();
        assert_eq!(payloads.len(), 9);
        assert!(transport.published().iter().all(|r| r.key.as_ref().map(|k| k.len()) == Some(8)));
    }

    #[tokio::test]
    async fn fail_fast_reports_an_error() {
        let transport = MockTransport::failing_at([4]);
        let topic = Topic::new("events").unwrap();
        let err = pool(&transport).dispatch(batch(9), &topic).await.unwrap_err();

        let DispatchError::DeliveryFailed { summary } = err else {
            panic!("expected delivery failure");
        };
        assert_eq!(summary.failed, 1);
        assert!(summary.delivered < 9);
        assert_eq!(summary.attempted + summary.skipped, 9);
        assert!(summary.first_error.is_some());
    }

    #[tokio::test]
    async fn continue_policy_publishes_everything() {
        let transport = MockTransport::failing_at([0, 5]);
        let topic = Topic::new("events").unwrap();
        let summary = pool(&transport)
            .with_policy(FailurePolicy::Continue)
            .with_workers(4)
            .dispatch(batch(10), &topic)
            .await
            .unwrap();

        assert_eq!(summary.attempted, 10);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.delivered, 8);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.per_worker, vec![3, 3, 2, 2]);
        assert_eq!(summary.stats.error_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn workers_keep_several_publishes_in_flight() {
        let mut opts = crate::transport::ConnectOptions::default();
        opts.set("publish.delay.ms", "100");
        let transport = MockTransport::from_options(&opts).unwrap();
        let topic = Topic::new("events").unwrap();

        let started = tokio::time::Instant::now();
        let summary = pool(&transport).dispatch(batch(9), &topic).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(summary.delivered, 9);
        assert_eq!(summary.per_worker, vec![3, 3, 3]);
        // Acks overlap: one delay, not three back to back per worker.
        assert!(elapsed < Duration::from_millis(200), "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_stops_submitting_once_a_failure_is_seen() {
        let mut opts = crate::transport::ConnectOptions::default();
        opts.set("fail.at", "0");
        let transport = MockTransport::from_options(&opts).unwrap();
        let topic = Topic::new("events").unwrap();
        let err = pool(&transport)
            .with_workers(1)
            .dispatch(batch(5), &topic)
            .await
            .unwrap_err();

        let DispatchError::DeliveryFailed { summary } = err else {
            panic!("expected delivery failure");
        };
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.skipped, 4);
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn warmup_sleeps_on_the_clock() {
        let transport = MockTransport::new();
        let clock = Arc::new(VirtualClock::new(0));
        let pool = PublishWorkerPool::new(Arc::new(transport.clone()), clock.clone())
            .with_warmup(Duration::from_secs(5));
        let summary = pool.dispatch(MessageBatch::default(), &Topic::new("t").unwrap()).await.unwrap();
        assert_eq!(summary.attempted, 0);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);
    }
}
