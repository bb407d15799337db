use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

// 1us to 1h, 3 significant digits
const MAX_LATENCY_US: u64 = 3_600_000_000;

/// Counters plus a latency histogram (microseconds) for one dispatch or one
/// consumer group.
pub struct Stats {
    latency_hist: RwLock<Histogram<u64>>,

    pub sent_count: RwLock<u64>,
    pub received_count: RwLock<u64>,
    pub error_count: RwLock<u64>,

    start_time: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        let hist =
            Histogram::new_with_bounds(1, MAX_LATENCY_US, 3).expect("static histogram bounds");
        Self {
            latency_hist: RwLock::new(hist),
            sent_count: RwLock::new(0),
            received_count: RwLock::new(0),
            error_count: RwLock::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record an acknowledged publish and how long the broker took.
    pub async fn record_sent(&self, ack_latency: Duration) {
        *self.sent_count.write().await += 1;
        self.record_latency_us(ack_latency.as_micros() as u64).await;
    }

    pub async fn record_error(&self) {
        *self.error_count.write().await += 1;
    }

    /// Record a batch of receipts; `None` when the message carried no usable timestamp.
    pub async fn record_received_batch(&self, latencies_us: &[Option<u64>]) {
        *self.received_count.write().await += latencies_us.len() as u64;
        let mut hist = self.latency_hist.write().await;
        for lat in latencies_us.iter().flatten() {
            let _ = hist.record((*lat).clamp(1, MAX_LATENCY_US));
        }
    }

    async fn record_latency_us(&self, us: u64) {
        let _ = self
            .latency_hist
            .write()
            .await
            .record(us.clamp(1, MAX_LATENCY_US));
    }

    pub async fn received(&self) -> u64 {
        *self.received_count.read().await
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let sent = *self.sent_count.read().await;
        let received = *self.received_count.read().await;
        let errors = *self.error_count.read().await;

        let hist = self.latency_hist.read().await;
        let (p50, p95, p99, max) = if hist.is_empty() {
            (0, 0, 0, 0)
        } else {
            (
                hist.value_at_quantile(0.5),
                hist.value_at_quantile(0.95),
                hist.value_at_quantile(0.99),
                hist.max(),
            )
        };

        StatsSnapshot {
            sent_count: sent,
            received_count: received,
            error_count: errors,
            elapsed: self.start_time.elapsed(),
            latency_us_p50: p50,
            latency_us_p95: p95,
            latency_us_p99: p99,
            latency_us_max: max,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub sent_count: u64,
    pub received_count: u64,
    pub error_count: u64,
    #[serde(skip)]
    pub elapsed: Duration,
    pub latency_us_p50: u64,
    pub latency_us_p95: u64,
    pub latency_us_p99: u64,
    pub latency_us_max: u64,
}

impl StatsSnapshot {
    /// Messages per second over the collector's lifetime (sent or received,
    /// whichever this collector tracks).
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.sent_count.max(self.received_count) as f64 / secs
        } else {
            0.0
        }
    }
}
