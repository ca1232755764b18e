//! Binance spot L1 mid-price feed, grounded in the teacher's
//! `scrapers::binance_price_feed`: same `barter-data` subscription and EWMA
//! log-return variance estimator, stripped of the teacher's latency/perf
//! telemetry hooks (out of scope here — this module only serves `p_now`
//! and `sigma_per_sqrt_s` to `UpDown15mSignalSource`).

use barter_data::exchange::binance::spot::BinanceSpot;
use barter_data::streams::reconnect::Event as ReconnectEvent;
use barter_data::streams::Streams;
use barter_data::subscription::book::OrderBooksL1;
use barter_instrument::instrument::market_data::kind::MarketDataInstrumentKind;
use barter_instrument::instrument::market_data::MarketDataInstrument;
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub ts: i64,
    pub mid: f64,
}

#[derive(Debug, Clone, Default)]
struct SymbolState {
    latest: Option<PricePoint>,
    history: VecDeque<PricePoint>,
    ewma_var: Option<f64>,
    last_mid: Option<f64>,
    last_ts: Option<i64>,
}

/// Live or disabled Binance L1 mid-price feed.
pub struct BinancePriceFeed {
    inner: RwLock<HashMap<String, SymbolState>>,
    max_history_len: usize,
    ewma_lambda: f64,
}

impl BinancePriceFeed {
    /// No background task; `latest_mid`/`sigma_per_sqrt_s` always return
    /// `None`. Used when no market-data feed is configured, degrading
    /// `UpDown15mSignalSource` to `Signal::neutral()`.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            max_history_len: 0,
            ewma_lambda: 0.97,
        })
    }

    pub async fn spawn(symbols: &[&str]) -> anyhow::Result<Arc<Self>> {
        let feed = Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            max_history_len: 3 * 60 * 60,
            ewma_lambda: 0.97,
        });

        let streams = init_streams(symbols).await?;
        let task_feed = feed.clone();
        tokio::spawn(async move {
            if let Err(e) = task_feed.consume(streams).await {
                warn!(error = %e, "binance price feed stopped");
            }
        });

        Ok(feed)
    }

    pub fn latest_mid(&self, symbol: &str) -> Option<PricePoint> {
        self.inner.read().get(symbol).and_then(|s| s.latest)
    }

    pub fn mid_near(&self, symbol: &str, target_ts: i64, max_skew_sec: i64) -> Option<PricePoint> {
        let state = self.inner.read();
        let sym = state.get(symbol)?;
        let mut best: Option<PricePoint> = None;
        let mut best_abs = i64::MAX;
        for p in sym.history.iter() {
            let abs = (p.ts - target_ts).abs();
            if abs <= max_skew_sec && abs < best_abs {
                best_abs = abs;
                best = Some(*p);
            }
        }
        if best.is_none() {
            if let Some(p) = sym.latest {
                if (p.ts - target_ts).abs() <= max_skew_sec {
                    best = Some(p);
                }
            }
        }
        best
    }

    pub fn sigma_per_sqrt_s(&self, symbol: &str) -> Option<f64> {
        let state = self.inner.read();
        let v = state.get(symbol)?.ewma_var?;
        (v.is_finite() && v > 0.0).then(|| v.sqrt())
    }

    async fn consume(
        self: Arc<Self>,
        streams: Streams<
            barter_data::streams::consumer::MarketStreamResult<
                MarketDataInstrument,
                barter_data::subscription::book::OrderBookL1,
            >,
        >,
    ) -> anyhow::Result<()> {
        let mut joined = streams.select_all();
        while let Some(event) = joined.next().await {
            match event {
                ReconnectEvent::Reconnecting(exchange) => {
                    warn!(?exchange, "binance stream reconnecting");
                }
                ReconnectEvent::Item(Ok(market_event)) => {
                    let symbol = to_symbol(&market_event.instrument);
                    let ts = market_event.time_received.timestamp();
                    let Some(mid) = market_event
                        .kind
                        .mid_price()
                        .and_then(|d| d.to_string().parse::<f64>().ok())
                        .filter(|m| m.is_finite() && *m > 0.0)
                    else {
                        continue;
                    };
                    self.update_symbol(&symbol, ts, mid);
                }
                ReconnectEvent::Item(Err(e)) => {
                    debug!(error = %e, "binance market stream error");
                }
            }
        }
        Ok(())
    }

    fn update_symbol(&self, symbol: &str, ts: i64, mid: f64) {
        let mut map = self.inner.write();
        let entry = map.entry(symbol.to_string()).or_default();

        if let (Some(prev_mid), Some(prev_ts)) = (entry.last_mid, entry.last_ts) {
            let dt = (ts - prev_ts).max(1) as f64;
            if prev_mid > 0.0 && mid > 0.0 {
                let r = (mid / prev_mid).ln() / dt;
                let var_obs = r * r;
                let next = match entry.ewma_var {
                    Some(v) => (self.ewma_lambda * v) + ((1.0 - self.ewma_lambda) * var_obs),
                    None => var_obs,
                };
                if next.is_finite() {
                    entry.ewma_var = Some(next);
                }
            }
        }

        entry.last_mid = Some(mid);
        entry.last_ts = Some(ts);
        entry.latest = Some(PricePoint { ts, mid });

        let should_push = match entry.history.back() {
            Some(last) => last.ts != ts,
            None => true,
        };
        if should_push {
            entry.history.push_back(PricePoint { ts, mid });
            while entry.history.len() > self.max_history_len {
                entry.history.pop_front();
            }
        } else if let Some(last) = entry.history.back_mut() {
            last.mid = mid;
        }
    }
}

async fn init_streams(
    symbols: &[&str],
) -> anyhow::Result<
    Streams<
        barter_data::streams::consumer::MarketStreamResult<
            MarketDataInstrument,
            barter_data::subscription::book::OrderBookL1,
        >,
    >,
> {
    let subs: Vec<_> = symbols
        .iter()
        .map(|s| {
            (
                BinanceSpot::default(),
                *s,
                "usdt",
                MarketDataInstrumentKind::Spot,
                OrderBooksL1,
            )
        })
        .collect();

    Streams::<OrderBooksL1>::builder()
        .subscribe(subs)
        .init()
        .await
        .map_err(|e| anyhow::anyhow!("failed to init barter-data binance streams: {e}"))
}

fn to_symbol(instrument: &MarketDataInstrument) -> String {
    format!("{}{}", instrument.base, instrument.quote).to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_feed_returns_none() {
        let feed = BinancePriceFeed::disabled();
        assert!(feed.latest_mid("BTCUSDT").is_none());
        assert!(feed.sigma_per_sqrt_s("BTCUSDT").is_none());
    }

    #[test]
    fn update_symbol_tracks_latest_and_history() {
        let feed = BinancePriceFeed {
            inner: RwLock::new(HashMap::new()),
            max_history_len: 10,
            ewma_lambda: 0.97,
        };
        feed.update_symbol("BTCUSDT", 1000, 50000.0);
        feed.update_symbol("BTCUSDT", 1001, 50010.0);
        let latest = feed.latest_mid("BTCUSDT").unwrap();
        assert_eq!(latest.ts, 1001);
        assert!(feed.sigma_per_sqrt_s("BTCUSDT").is_some());
    }
}
