//! End-to-end `TradeLifecycle` scenarios (spec.md §8 S3 and S5), driven
//! through the same `PaperExchangeClient` + `TestClock` combination the
//! unit tests in `src/lifecycle/mod.rs` use: a scripted order book plus a
//! zero-attempt `PostOnlyFailurePolicy` forces deterministic immediate
//! fills or rests, so no concurrent fill injection is needed mid-`run()`.
//! S6 (the partial-fill min-size path) is covered as a unit test inside
//! `src/lifecycle/mod.rs` instead, since it drives `advance_from_monitoring`
//! directly and that method isn't part of the crate's public surface.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use trade_engine_core::config::Config;
use trade_engine_core::core::TestClock;
use trade_engine_core::domain::{Market, Role, Token, TradeOutcome};
use trade_engine_core::exchange::paper::PaperExchangeClient;
use trade_engine_core::lifecycle::{LifecycleState, TradeLifecycle};
use trade_engine_core::post_only::PostOnlyFailurePolicy;
use trade_engine_core::signal::{Bias, Signal, SignalSource};
use trade_engine_core::store::Store;

struct FixedSignal(Signal);
impl SignalSource for FixedSignal {
    fn signal(&self, _symbol: &str, _now: chrono::DateTime<Utc>) -> Signal {
        self.0
    }
}

fn market(window_start: chrono::DateTime<Utc>) -> Market {
    Market {
        symbol: "BTC".into(),
        window_start,
        window_end: window_start + chrono::Duration::seconds(900),
        up_token: Token("up".into()),
        down_token: Token("down".into()),
        tick_size: dec!(0.01),
    }
}

async fn store() -> Store {
    let store = Store::open_in_memory().unwrap();
    store.migrate().await.unwrap();
    store
}

async fn records_for(store: &Store, market: &Market) -> Vec<trade_engine_core::domain::TradeRecord> {
    store
        .list_trades_for_window(&market.symbol, market.window_start)
        .await
        .unwrap()
}

/// S3: the entry leg fills immediately, the hedge leg never crosses and
/// rests LIVE until `fillTimeoutSec` passes. The monitor classifies
/// `ONE_FILLED(ENTRY)`, cancels the hedge, and the emergency liquidator
/// sells the entry leg entirely before `windowEnd`.
#[tokio::test]
async fn one_sided_fill_triggers_emergency_liquidation() {
    let now = Utc::now();
    let mut cfg = Config::default();
    cfg.min_edge = 0.1;
    cfg.pre_settlement.enable = false;
    cfg.fill_timeout_sec = 2;
    cfg.poll_interval_sec = 1;
    cfg.settle_delay_sec = 1;

    let exchange = Arc::new(PaperExchangeClient::new(dec!(10000)));
    // Entry (up) is quoted with ask below the pricing bid so a GTC buy
    // crosses and fills on arrival; hedge (down) keeps a normal, wider
    // book so its buy never crosses and rests LIVE.
    exchange.set_book(&Token("up".into()), dec!(0.40), dec!(0.35));
    exchange.set_book(&Token("down".into()), dec!(0.50), dec!(0.60));

    let clock = TestClock::new(now);
    let signal_source = Arc::new(FixedSignal(Signal::new(0.6, Bias::Up, 0.6)));
    let mkt = market(now);
    let db = store().await;

    let mut lifecycle = TradeLifecycle::new(
        mkt.clone(),
        Arc::new(cfg),
        exchange.clone(),
        db.clone(),
        clock,
        signal_source,
        // max_attempts=0 forces GTC immediately, so the crossed entry leg
        // fills on placement instead of resting under POST_ONLY.
        Arc::new(PostOnlyFailurePolicy::new(0)),
    );

    let state = lifecycle.run().await.unwrap();
    assert!(matches!(state, LifecycleState::Finalized), "expected Finalized, got {state:?}");

    let records = records_for(&db, &mkt).await;
    let entry = records.iter().find(|r| r.role == Role::Entry).unwrap();
    let hedge = records.iter().find(|r| r.role == Role::Hedge).unwrap();

    assert_eq!(entry.outcome, TradeOutcome::EmergencySold);
    assert_eq!(entry.exit_price, Some(dec!(0.39)));
    assert_eq!(entry.pnl, Some(dec!(-1.00)));

    assert_eq!(hedge.outcome, TradeOutcome::CanceledUnfilled);
    assert_eq!(hedge.filled_size, Decimal::ZERO);
}

/// S5: both legs fill, the signal stays strongly directional through the
/// pre-settlement window, so the optimizer sells the losing (hedge) leg
/// early while the winning (entry) leg is held to resolution.
#[tokio::test]
async fn pre_settlement_sells_losing_leg_and_resolves_winner() {
    let now = Utc::now();
    let mut cfg = Config::default();
    cfg.min_edge = 0.1;
    cfg.fill_timeout_sec = 5;
    cfg.poll_interval_sec = 1;
    cfg.settle_delay_sec = 1;
    cfg.pre_settlement.enable = true;
    cfg.pre_settlement.min_confidence = 0.80;
    cfg.pre_settlement.start_sec = 180;
    cfg.pre_settlement.stop_sec = 45;
    cfg.pre_settlement.interval_sec = 30;

    let exchange = Arc::new(PaperExchangeClient::new(dec!(10000)));
    // Both books are crossed so entry and hedge legs fill on arrival.
    exchange.set_book(&Token("up".into()), dec!(0.55), dec!(0.50));
    exchange.set_book(&Token("down".into()), dec!(0.40), dec!(0.35));

    let clock = TestClock::new(now);
    // A single high-confidence UP signal clears both min_edge and the
    // optimizer's min_confidence threshold, so it drives entry selection
    // and, once the window opens, the SellLosingLeg decision.
    let signal_source = Arc::new(FixedSignal(Signal::new(0.85, Bias::Up, 0.85)));
    let mkt = market(now);
    let db = store().await;

    let mut lifecycle = TradeLifecycle::new(
        mkt.clone(),
        Arc::new(cfg),
        exchange,
        db.clone(),
        clock,
        signal_source,
        Arc::new(PostOnlyFailurePolicy::new(0)),
    );

    let state = lifecycle.run().await.unwrap();
    assert!(matches!(state, LifecycleState::Finalized), "expected Finalized, got {state:?}");

    let records = records_for(&db, &mkt).await;
    let entry = records.iter().find(|r| r.role == Role::Entry).unwrap();
    let hedge = records.iter().find(|r| r.role == Role::Hedge).unwrap();

    assert_eq!(hedge.outcome, TradeOutcome::PreSettled);
    assert!(hedge.exit_price.is_some());
    assert!(hedge.pnl.unwrap() < Decimal::ZERO, "losing leg sold below its entry price");

    assert_eq!(entry.outcome, TradeOutcome::ResolvedWin);
    assert_eq!(entry.exit_price, Some(Decimal::ONE));
    assert!(entry.pnl.unwrap() > Decimal::ZERO, "winning leg resolves above its entry price");
}
