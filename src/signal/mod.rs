//! `SignalSource`: pure (symbol, now) -> directional signal (spec.md §4.3,
//! §6.2). Synchronous by contract — an implementation needing I/O runs it
//! off-thread and serves a cached value, so the core never blocks on it.

pub mod price_feed;
pub mod updown15m;

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

pub const MAX_CONFIDENCE: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Up,
    Down,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    pub confidence: f64,
    pub bias: Bias,
    pub p_yes: f64,
}

impl Signal {
    pub fn neutral() -> Self {
        Self {
            confidence: 0.0,
            bias: Bias::Neutral,
            p_yes: 0.5,
        }
    }

    pub fn new(confidence: f64, bias: Bias, p_yes: f64) -> Self {
        Self {
            confidence: confidence.clamp(0.0, MAX_CONFIDENCE),
            bias,
            p_yes: p_yes.clamp(0.0, 1.0),
        }
    }
}

pub trait SignalSource: Send + Sync {
    fn signal(&self, symbol: &str, now: DateTime<Utc>) -> Signal;

    /// Called once when a new window opens for `symbol`, so implementations
    /// that need an opening reference price (e.g. `UpDown15mSignalSource`)
    /// can snapshot it. No-op by default.
    fn on_window_open(&self, _symbol: &str, _window_end: DateTime<Utc>) {}
}

/// Wraps any `SignalSource` so a slow/panicking implementation degrades to
/// `Signal::neutral()` rather than stalling the caller past `timeout`
/// (spec.md §6.2). `SignalSource::signal` is synchronous, so "timeout" here
/// means "ran on a blocking thread and we gave up waiting on the join".
pub struct TimeoutSignalSource<S> {
    inner: std::sync::Arc<S>,
    timeout: Duration,
}

impl<S: SignalSource + 'static> TimeoutSignalSource<S> {
    pub fn new(inner: std::sync::Arc<S>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub async fn signal_async(&self, symbol: &str, now: DateTime<Utc>) -> Signal {
        let inner = self.inner.clone();
        let symbol = symbol.to_string();
        let handle = tokio::task::spawn_blocking(move || inner.signal(&symbol, now));

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(signal)) => signal,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "signal source panicked, falling back to neutral");
                Signal::neutral()
            }
            Err(_) => {
                warn!(timeout_ms = %self.timeout.as_millis(), "signal source timed out, falling back to neutral");
                Signal::neutral()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct SlowSource;
    impl SignalSource for SlowSource {
        fn signal(&self, _symbol: &str, _now: DateTime<Utc>) -> Signal {
            std::thread::sleep(Duration::from_millis(200));
            Signal::new(0.9, Bias::Up, 0.7)
        }
    }

    struct FastSource;
    impl SignalSource for FastSource {
        fn signal(&self, _symbol: &str, _now: DateTime<Utc>) -> Signal {
            Signal::new(0.9, Bias::Up, 0.7)
        }
    }

    #[test]
    fn confidence_is_hard_capped() {
        let s = Signal::new(0.99, Bias::Up, 0.7);
        assert_eq!(s.confidence, MAX_CONFIDENCE);
    }

    #[tokio::test]
    async fn timeout_wrapper_falls_back_to_neutral_when_slow() {
        let wrapped = TimeoutSignalSource::new(Arc::new(SlowSource), Duration::from_millis(20));
        let signal = wrapped.signal_async("BTC", Utc::now()).await;
        assert_eq!(signal, Signal::neutral());
    }

    #[tokio::test]
    async fn timeout_wrapper_passes_through_fast_result() {
        let wrapped = TimeoutSignalSource::new(Arc::new(FastSource), Duration::from_secs(2));
        let signal = wrapped.signal_async("BTC", Utc::now()).await;
        assert_eq!(signal.bias, Bias::Up);
    }
}
