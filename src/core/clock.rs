//! Monotonic + wall clock, test-injectable (spec.md §4 component 1).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, d: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// Deterministic clock for tests: wall time is advanced explicitly and
/// `sleep` returns immediately, advancing `now()` by the requested duration.
pub struct TestClock {
    inner: parking_lot::Mutex<DateTime<Utc>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            inner: parking_lot::Mutex::new(start),
        })
    }

    pub fn advance(&self, d: Duration) {
        let mut t = self.inner.lock();
        *t += chrono::Duration::from_std(d).unwrap_or_default();
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.inner.lock() = t;
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock()
    }

    async fn sleep(&self, d: Duration) {
        self.advance(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clock_advances_on_sleep() {
        let start = Utc::now();
        let clock = TestClock::new(start);
        clock.sleep(Duration::from_secs(5)).await;
        assert_eq!(clock.now(), start + chrono::Duration::seconds(5));
    }
}
