use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::lock;

/// Source of time for every duration and metric the harness computes.
///
/// Production code uses [`SystemClock`]; tests swap in [`ManualClock`] so
/// retry backoff and deadline handling can be checked without real waits.
#[async_trait]
pub trait TimeProvider: Send + Sync + 'static {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);

    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Wall-clock time backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl TimeProvider for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to.
///
/// `sleep` advances the clock by the requested amount and returns at once,
/// recording the request so tests can assert on backoff schedules.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Moves logical time forward.
    pub fn advance(&self, duration: Duration) {
        *lock(&self.offset) += duration;
    }

    /// Total logical time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *lock(&self.offset)
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        lock(&self.sleeps).clone()
    }
}

#[async_trait]
impl TimeProvider for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *lock(&self.offset)
    }

    async fn sleep(&self, duration: Duration) {
        lock(&self.sleeps).push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
