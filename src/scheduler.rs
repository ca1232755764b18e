//! `Scheduler` (spec.md §4.11): enumerates 15-minute window boundaries,
//! instantiates (or resumes) one `TradeLifecycle` per configured symbol per
//! window, and runs each to completion on its own task — grounded in the
//! teacher's per-symbol worker-task fan-out pattern (`rust-backend`'s
//! `Scheduler`-equivalent in the engine crate), generalized to this crate's
//! state machine.

use crate::config::Config;
use crate::core::Clock;
use crate::domain::{Market, Role, Token, TradeRecord};
use crate::exchange::ExchangeClient;
use crate::lifecycle::state::order_from_record;
use crate::lifecycle::{LifecycleState, TradeLifecycle};
use crate::post_only::PostOnlyFailurePolicy;
use crate::signal::SignalSource;
use crate::store::Store;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const WINDOW_LEN_SECS: i64 = 900;

/// Derives the two outcome-token ids and tick size for a (symbol, window).
/// The exchange doesn't expose a market-discovery RPC in this crate's
/// surface (spec.md §6.1 names only order/fill/price operations), so token
/// ids follow the deterministic naming convention the teacher's Polymarket
/// adapter already assumes for 15-minute binary markets.
pub trait MarketResolver: Send + Sync {
    fn resolve(&self, symbol: &str, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Market;
}

pub struct DeterministicMarketResolver {
    pub tick_size: Decimal,
}

impl Default for DeterministicMarketResolver {
    fn default() -> Self {
        Self { tick_size: dec!(0.01) }
    }
}

impl MarketResolver for DeterministicMarketResolver {
    fn resolve(&self, symbol: &str, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Market {
        Market {
            symbol: symbol.to_string(),
            window_start,
            window_end,
            up_token: Token(format!("{symbol}-{}-UP", window_start.timestamp())),
            down_token: Token(format!("{symbol}-{}-DOWN", window_start.timestamp())),
            tick_size: self.tick_size,
        }
    }
}

pub struct Scheduler {
    config: Arc<Config>,
    exchange: Arc<dyn ExchangeClient>,
    store: Store,
    clock: Arc<dyn Clock>,
    signal_source: Arc<dyn SignalSource>,
    market_resolver: Arc<dyn MarketResolver>,
    post_only_policies: Mutex<std::collections::HashMap<String, Arc<PostOnlyFailurePolicy>>>,
    last_window_started: Mutex<std::collections::HashMap<String, i64>>,
    /// `TradeRecord`s the `Reconciler` found still `OPEN` at startup, keyed
    /// by `pair_id` (the same `"{symbol}-{windowStartUnix}"` key
    /// `TradeLifecycle::new` derives). `tick()` consults this before
    /// defaulting to a fresh `IDLE` lifecycle for a due window, so a crash
    /// mid-trade resumes instead of silently starting over (spec.md §4.10/
    /// §4.12, testable property P4).
    resumable: Mutex<HashMap<String, Vec<TradeRecord>>>,
}

/// Turns the `TradeRecord`s the `Reconciler` found still `OPEN` for one
/// `pair_id` into a resumable `LifecycleState`. Both legs present resumes via
/// `LifecycleState::from_legs`; only one surviving leg resumes via
/// `from_single_leg` (its partner already reached a terminal outcome before
/// the crash, so there's nothing left to rebuild for it).
fn resumed_state(market: &Market, records: Vec<TradeRecord>) -> LifecycleState {
    let mut entry = None;
    let mut hedge = None;
    for rec in &records {
        let order = order_from_record(market, rec);
        match rec.role {
            Role::Entry => entry = Some(order),
            Role::Hedge => hedge = Some(order),
        }
    }

    match (entry, hedge) {
        (Some(entry), Some(hedge)) => LifecycleState::from_legs(entry, hedge),
        (Some(order), None) => LifecycleState::from_single_leg(Role::Entry, order),
        (None, Some(order)) => LifecycleState::from_single_leg(Role::Hedge, order),
        (None, None) => LifecycleState::Idle,
    }
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        exchange: Arc<dyn ExchangeClient>,
        store: Store,
        clock: Arc<dyn Clock>,
        signal_source: Arc<dyn SignalSource>,
        market_resolver: Arc<dyn MarketResolver>,
        resumable: Vec<TradeRecord>,
    ) -> Self {
        let mut by_pair: HashMap<String, Vec<TradeRecord>> = HashMap::new();
        for record in resumable {
            by_pair.entry(record.pair_id.clone()).or_default().push(record);
        }
        Self {
            config,
            exchange,
            store,
            clock,
            signal_source,
            market_resolver,
            post_only_policies: Mutex::new(std::collections::HashMap::new()),
            last_window_started: Mutex::new(std::collections::HashMap::new()),
            resumable: Mutex::new(by_pair),
        }
    }

    /// Floors `now` to the current 15-minute boundary.
    pub fn window_start_for(now: DateTime<Utc>) -> DateTime<Utc> {
        let epoch = now.timestamp();
        let floored = epoch - epoch.rem_euclid(WINDOW_LEN_SECS);
        Utc.timestamp_opt(floored, 0).single().unwrap_or(now)
    }

    async fn policy_for(&self, symbol: &str) -> Arc<PostOnlyFailurePolicy> {
        let mut policies = self.post_only_policies.lock().await;
        policies
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(PostOnlyFailurePolicy::new(self.config.max_post_only_attempts)))
            .clone()
    }

    /// Checks every configured symbol once; for any whose current window
    /// hasn't been started yet, spawns a fresh `TradeLifecycle` task. Intended
    /// to be driven on the 1-Hz ambient tick by the caller (`main.rs`'s loop).
    /// Resumption of crash-surviving trades is handled separately by
    /// `resume_pending`, not here — a trade can outlive its own window (e.g.
    /// liquidation running past `window_end`), so keying resumption off the
    /// *current* tick's window would silently strand it the moment the
    /// window rolls over before the process restarts.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let window_start = Self::window_start_for(now);
        let window_end = window_start + ChronoDuration::seconds(WINDOW_LEN_SECS);
        let mut spawned = Vec::new();

        for symbol in &self.config.symbols {
            let already_started = {
                let mut seen = self.last_window_started.lock().await;
                let ts = window_start.timestamp();
                if seen.get(symbol.as_str()) == Some(&ts) {
                    true
                } else {
                    seen.insert(symbol.clone(), ts);
                    false
                }
            };
            if already_started {
                continue;
            }

            let market = self.market_resolver.resolve(symbol, window_start, window_end);
            self.signal_source.on_window_open(symbol, window_end);
            let policy = self.policy_for(symbol).await;
            let symbol_owned = symbol.clone();

            let mut lifecycle = TradeLifecycle::new(
                market,
                self.config.clone(),
                self.exchange.clone(),
                self.store.clone(),
                self.clock.clone(),
                self.signal_source.clone(),
                policy,
            );
            spawned.push(tokio::spawn(async move {
                match lifecycle.run().await {
                    Ok(state) => info!(symbol = %symbol_owned, state = state.label(), "lifecycle finished"),
                    Err(err) => error!(symbol = %symbol_owned, error = %err, "lifecycle failed"),
                }
            }));
        }

        spawned
    }

    /// Drains every `TradeRecord` group the `Reconciler` found still `OPEN`
    /// at startup and spawns a resumed `TradeLifecycle` for each, rebuilding
    /// `Market` from the record's own persisted `symbol`/`window_start`/
    /// `window_end` rather than any *current* window boundary — the pair's
    /// original window may already be over by the time the process restarts
    /// (spec.md §4.10/§4.12, testable property P4). Meant to be called once,
    /// before `run_until`'s tick loop starts.
    pub async fn resume_pending(&self) -> Vec<JoinHandle<()>> {
        let groups: Vec<(String, Vec<TradeRecord>)> = self.resumable.lock().await.drain().collect();
        let mut spawned = Vec::new();

        for (pair_id, records) in groups {
            let Some(first) = records.first() else { continue };
            let symbol = first.symbol.clone();
            let window_start = first.window_start;
            let market = self.market_resolver.resolve(&symbol, window_start, first.window_end);
            let policy = self.policy_for(&symbol).await;
            let state = resumed_state(&market, records);
            let symbol_owned = symbol.clone();

            // Claim this (symbol, window) in the same tracker `tick()` checks,
            // so the still-running ambient tick loop doesn't also spawn a
            // fresh IDLE lifecycle for the window this resumed trade already
            // occupies (which would double-place an entry+hedge pair).
            self.last_window_started
                .lock()
                .await
                .insert(symbol.clone(), window_start.timestamp());

            let mut lifecycle = TradeLifecycle::resume(
                market,
                pair_id,
                self.config.clone(),
                self.exchange.clone(),
                self.store.clone(),
                self.clock.clone(),
                self.signal_source.clone(),
                policy,
                state,
            );
            info!(symbol = %symbol_owned, state = lifecycle.state().label(), "resuming lifecycle from persisted state");
            spawned.push(tokio::spawn(async move {
                match lifecycle.run_resumed().await {
                    Ok(state) => info!(symbol = %symbol_owned, state = state.label(), "resumed lifecycle finished"),
                    Err(err) => error!(symbol = %symbol_owned, error = %err, "resumed lifecycle failed"),
                }
            }));
        }

        spawned
    }

    /// Runs the ambient 1-Hz tick loop until `shutdown` resolves. Each tick
    /// spawns any due lifecycles but does not block on their completion —
    /// they run independently, matching spec.md §5's "different lifecycles
    /// execute concurrently with one another". Crash-resumed trades are
    /// spawned once up front via `resume_pending` before the loop starts.
    pub async fn run_until(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        for handle in self.resume_pending().await {
            drop(handle); // fire-and-forget; each task logs its own outcome
        }

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let handles = self.tick(self.clock.now()).await;
                    for handle in handles {
                        drop(handle); // fire-and-forget; each task logs its own outcome
                    }
                }
                _ = &mut shutdown => {
                    info!("scheduler received shutdown signal");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_start_floors_to_15_minutes() {
        let now = DateTime::parse_from_rfc3339("2026-07-30T12:07:33Z")
            .unwrap()
            .with_timezone(&Utc);
        let start = Scheduler::window_start_for(now);
        assert_eq!(start.timestamp() % WINDOW_LEN_SECS, 0);
        assert!(start <= now);
        assert!(now - start < ChronoDuration::seconds(WINDOW_LEN_SECS));
    }

    #[test]
    fn deterministic_market_resolver_names_tokens_by_symbol_and_window() {
        let resolver = DeterministicMarketResolver::default();
        let start = Utc::now();
        let end = start + ChronoDuration::seconds(WINDOW_LEN_SECS);
        let market = resolver.resolve("BTC", start, end);
        assert!(market.up_token.0.starts_with("BTC-"));
        assert!(market.up_token.0.ends_with("-UP"));
        assert!(market.down_token.0.ends_with("-DOWN"));
    }
}
