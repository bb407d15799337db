//! Wall-clock access for pacing and phase waits.
//!
//! Everything that reads "now" or sleeps goes through [`Clock`], so tests can
//! swap in a [`VirtualClock`] and run hours of pacing without waiting.

use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

struct Base {
    instant: Instant,
    unix_ms: i64,
}

static BASE: Lazy<Base> = Lazy::new(|| Base {
    instant: Instant::now(),
    unix_ms: chrono::Utc::now().timestamp_millis(),
});

/// Fast estimate of current UNIX time in milliseconds using a cached base and Instant
#[inline]
pub fn now_unix_ms_estimate() -> i64 {
    let delta = BASE.instant.elapsed().as_millis() as i64;
    BASE.unix_ms.saturating_add(delta)
}

#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Milliseconds since the UNIX epoch.
    fn now_millis(&self) -> i64;
    async fn sleep(&self, duration: Duration);
}

/// Real time: monotonic estimate of the wall clock plus tokio timers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        now_unix_ms_estimate()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually driven clock. `sleep` advances time instantly and records the
/// requested duration.
#[derive(Debug)]
pub struct VirtualClock {
    now_ms: AtomicI64,
    sleeps: Mutex<Vec<Duration>>,
}

impl VirtualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ms
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

#[async_trait::async_trait]
impl Clock for VirtualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
        // Let spawned tasks observe the new time before the caller resumes.
        tokio::task::yield_now().await;
    }
}
