//! `UpDown15mSignalSource`: the default `SignalSource` binding, grounded
//! directly in the teacher's `vault::updown15m` driftless-lognormal model.
//! Consumes a `BinancePriceFeed`-shaped collaborator for `p_now`/`sigma`;
//! the window's opening mid-price must be supplied by the caller (the
//! `Scheduler` records it when a window opens) since the feed alone can't
//! recover a price from before it started streaming.

use super::price_feed::BinancePriceFeed;
use super::{Bias, Signal, SignalSource, MAX_CONFIDENCE};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use statrs::distribution::{ContinuousCDF, Normal};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct WindowOpen {
    pub p_start: f64,
    pub window_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct UpDown15mParams {
    /// Shrinks pYes toward 0.5 to avoid overconfident tails near expiry.
    pub shrink_to_half: f64,
}

impl Default for UpDown15mParams {
    fn default() -> Self {
        Self {
            shrink_to_half: 0.35,
        }
    }
}

pub struct UpDown15mSignalSource {
    feed: Arc<BinancePriceFeed>,
    params: UpDown15mParams,
    windows: DashMap<String, WindowOpen>,
}

impl UpDown15mSignalSource {
    pub fn new(feed: Arc<BinancePriceFeed>, params: UpDown15mParams) -> Self {
        Self {
            feed,
            params,
            windows: DashMap::new(),
        }
    }

    /// Records the opening mid-price for a symbol's current window. Called
    /// once by the `Scheduler` at window-open.
    pub fn record_window_open(&self, symbol: &str, p_start: f64, window_end: DateTime<Utc>) {
        self.windows.insert(
            symbol.to_string(),
            WindowOpen {
                p_start,
                window_end,
            },
        );
    }

    fn binance_symbol(symbol: &str) -> String {
        format!("{}USDT", symbol.to_ascii_uppercase())
    }
}

impl SignalSource for UpDown15mSignalSource {
    fn signal(&self, symbol: &str, now: DateTime<Utc>) -> Signal {
        let Some(window) = self.windows.get(symbol).map(|w| *w) else {
            return Signal::neutral();
        };

        let t_rem_sec = (window.window_end - now).num_milliseconds() as f64 / 1000.0;
        if t_rem_sec <= 0.0 {
            return Signal::neutral();
        }

        let binance_symbol = Self::binance_symbol(symbol);
        let Some(latest) = self.feed.latest_mid(&binance_symbol) else {
            return Signal::neutral();
        };
        let Some(sigma) = self.feed.sigma_per_sqrt_s(&binance_symbol) else {
            return Signal::neutral();
        };

        match p_up_driftless_lognormal(window.p_start, latest.mid, sigma, t_rem_sec) {
            Some(p_up_raw) => {
                let p_yes = shrink_to_half(p_up_raw, self.params.shrink_to_half);
                let bias = if p_yes > 0.5 {
                    Bias::Up
                } else if p_yes < 0.5 {
                    Bias::Down
                } else {
                    Bias::Neutral
                };
                let confidence = ((p_yes - 0.5).abs() * 2.0).clamp(0.0, MAX_CONFIDENCE);
                Signal::new(confidence, bias, p_yes)
            }
            None => Signal::neutral(),
        }
    }

    fn on_window_open(&self, symbol: &str, window_end: DateTime<Utc>) {
        if let Some(point) = self.feed.latest_mid(&Self::binance_symbol(symbol)) {
            self.record_window_open(symbol, point.mid, window_end);
        }
    }
}

/// P(final price above `p_start`) under a driftless lognormal diffusion,
/// using the observed realized volatility `sigma_per_sqrt_s`.
pub fn p_up_driftless_lognormal(
    p_start: f64,
    p_now: f64,
    sigma_per_sqrt_s: f64,
    t_rem_sec: f64,
) -> Option<f64> {
    if !(p_start > 0.0 && p_now > 0.0) {
        return None;
    }
    if !(sigma_per_sqrt_s.is_finite() && sigma_per_sqrt_s > 0.0) {
        return None;
    }
    if !(t_rem_sec.is_finite() && t_rem_sec > 0.0) {
        return None;
    }

    let x = (p_now / p_start).ln();
    let denom = sigma_per_sqrt_s * t_rem_sec.sqrt();
    if !(denom.is_finite() && denom > 0.0) {
        return None;
    }

    let z = x / denom;
    let n = Normal::new(0.0, 1.0).ok()?;
    let p = n.cdf(z);
    p.is_finite().then(|| p.clamp(0.0001, 0.9999))
}

pub fn shrink_to_half(p: f64, shrink: f64) -> f64 {
    let s = shrink.clamp(0.0, 1.0);
    (0.5 + s * (p - 0.5)).clamp(0.0001, 0.9999)
}
