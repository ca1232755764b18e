//! P4 (spec.md §8): a process crash after an atomic pair is durably placed
//! must resume into the same terminal outcome a never-interrupted process
//! would have reached. Builds a pair via `AtomicPlacer` against a `tempfile`
//! on-disk `Store`, drops every in-memory handle to simulate the crash,
//! reopens a fresh `Store` at the same path, reconstructs the lifecycle
//! state through `Reconciler` + `order_from_record`/`LifecycleState::from_legs`
//! the same way `Scheduler::resume_pending` would on restart, and compares
//! the result against a sibling run that continues in-process without ever
//! dropping anything.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use trade_engine_core::config::Config;
use trade_engine_core::core::TestClock;
use trade_engine_core::domain::{
    Leg, Market, Order, OrderSide, OrderStatus, OrderType, Role, Side, Token, TradeOutcome,
};
use trade_engine_core::exchange::paper::PaperExchangeClient;
use trade_engine_core::lifecycle::state::order_from_record;
use trade_engine_core::lifecycle::{LifecycleState, TradeLifecycle};
use trade_engine_core::placer::{AtomicPlacer, PairContext};
use trade_engine_core::post_only::PostOnlyFailurePolicy;
use trade_engine_core::reconciler::Reconciler;
use trade_engine_core::signal::{Bias, Signal, SignalSource};
use trade_engine_core::store::Store;

struct NeutralSignal;
impl SignalSource for NeutralSignal {
    fn signal(&self, _symbol: &str, _now: chrono::DateTime<Utc>) -> Signal {
        Signal::new(0.0, Bias::Up, 0.5)
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

fn leg(role: Role, token: &str, price: Decimal) -> Leg {
    Leg {
        role,
        order: Order {
            exchange_id: None,
            token: Token(token.to_string()),
            side: OrderSide::Buy,
            price,
            size: dec!(10),
            order_type: OrderType::PostOnly,
            status: OrderStatus::Pending,
            filled_size: Decimal::ZERO,
            average_fill_price: None,
        },
        intended_size: dec!(10),
        intended_price: price,
    }
}

fn pair_ctx(mkt: &Market) -> PairContext {
    PairContext {
        pair_id: format!("{}-{}", mkt.symbol, mkt.window_start.timestamp()),
        symbol: mkt.symbol.clone(),
        window_start: mkt.window_start,
        window_end: mkt.window_end,
        entry_side: Side::Up,
        hedge_side: Side::Down,
        signal_confidence: 0.6,
        signal_bias: "UP".into(),
        signal_p_yes: 0.55,
    }
}

fn config() -> Arc<Config> {
    let mut cfg = Config::default();
    cfg.pre_settlement.enable = false;
    cfg.pre_settlement.interval_sec = 30;
    cfg.settle_delay_sec = 1;
    Arc::new(cfg)
}

/// An up token resolving above 0.50 and a down token resolving below it, so
/// `token_resolved_winning` is deterministic for both runs against the same
/// never-changing order book.
fn exchange_with_resolved_book() -> Arc<PaperExchangeClient> {
    let exchange = Arc::new(PaperExchangeClient::new(dec!(10000)));
    exchange.set_book(&Token("up".into()), dec!(0.60), dec!(0.40));
    exchange.set_book(&Token("down".into()), dec!(0.30), dec!(0.20));
    exchange
}

#[tokio::test]
async fn crash_after_placement_resumes_to_same_outcome_as_uninterrupted_run() {
    let now = Utc::now();
    let mkt = market(now);
    let cfg = config();

    // --- Run A: never interrupted. One AtomicPlacer call places and
    // persists both legs, then the same process continues straight into
    // `hold_both` via `resume`/`run_resumed` (both legs cross the book
    // above, so `place()` verifies them as Filled and `from_legs` yields
    // `Holding`).
    let exchange_a = exchange_with_resolved_book();
    let clock_a = TestClock::new(now);
    let store_a = Store::open_in_memory().unwrap();
    store_a.migrate().await.unwrap();

    let placer_a = AtomicPlacer::new(
        exchange_a.clone(),
        Arc::new(PostOnlyFailurePolicy::new(0)),
        clock_a.clone(),
        store_a.clone(),
        Duration::from_secs(1),
    );
    let placement_a = placer_a
        .place(
            "BTC",
            leg(Role::Entry, "up", dec!(0.59)),
            leg(Role::Hedge, "down", dec!(0.29)),
            &pair_ctx(&mkt),
        )
        .await
        .unwrap();
    let (entry_a, hedge_a) = match placement_a {
        trade_engine_core::placer::Placement::Active { entry, hedge } => (entry, hedge),
        other => panic!("expected Active placement, got {other:?}"),
    };

    let mut lifecycle_a = TradeLifecycle::resume(
        mkt.clone(),
        pair_ctx(&mkt).pair_id,
        cfg.clone(),
        exchange_a.clone(),
        store_a.clone(),
        clock_a.clone(),
        Arc::new(NeutralSignal),
        Arc::new(PostOnlyFailurePolicy::new(0)),
        LifecycleState::from_legs(entry_a, hedge_a),
    );
    let final_state_a = lifecycle_a.run_resumed().await.unwrap();
    assert_eq!(final_state_a, LifecycleState::Finalized);

    let records_a = store_a.list_trades_for_window(&mkt.symbol, mkt.window_start).await.unwrap();

    // --- Run B: the same placement, but against a tempfile-backed Store.
    // Everything in-memory is dropped after placement to simulate a crash,
    // then a fresh Store/Reconciler reconstruct the resumable state exactly
    // as `Scheduler::resume_pending` would after a restart.
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let db_path = tmp.path().to_str().unwrap().to_string();
    let exchange_b = exchange_with_resolved_book();
    let clock_b = TestClock::new(now);

    {
        let store_b = Store::open(&db_path).unwrap();
        store_b.migrate().await.unwrap();
        let placer_b = AtomicPlacer::new(
            exchange_b.clone(),
            Arc::new(PostOnlyFailurePolicy::new(0)),
            clock_b.clone(),
            store_b.clone(),
            Duration::from_secs(1),
        );
        placer_b
            .place(
                "BTC",
                leg(Role::Entry, "up", dec!(0.59)),
                leg(Role::Hedge, "down", dec!(0.29)),
                &pair_ctx(&mkt),
            )
            .await
            .unwrap();
        // `store_b` and `placer_b` drop here: nothing survives the "crash".
    }

    let store_b = Store::open(&db_path).unwrap();
    store_b.migrate().await.unwrap();

    let reconciler = Reconciler::new(store_b.clone(), exchange_b.clone());
    let report = reconciler.reconcile().await.unwrap();
    assert_eq!(report.resumable.len(), 2, "both legs should be resumable after the crash");

    let mut entry_rec = None;
    let mut hedge_rec = None;
    for rec in &report.resumable {
        match rec.role {
            Role::Entry => entry_rec = Some(rec.clone()),
            Role::Hedge => hedge_rec = Some(rec.clone()),
        }
    }
    let entry_order = order_from_record(&mkt, &entry_rec.unwrap());
    let hedge_order = order_from_record(&mkt, &hedge_rec.unwrap());
    let state_b = LifecycleState::from_legs(entry_order, hedge_order);
    assert!(matches!(state_b, LifecycleState::Holding { .. }));

    let mut lifecycle_b = TradeLifecycle::resume(
        mkt.clone(),
        pair_ctx(&mkt).pair_id,
        cfg.clone(),
        exchange_b.clone(),
        store_b.clone(),
        clock_b.clone(),
        Arc::new(NeutralSignal),
        Arc::new(PostOnlyFailurePolicy::new(0)),
        state_b,
    );
    let final_state_b = lifecycle_b.run_resumed().await.unwrap();
    assert_eq!(final_state_b, LifecycleState::Finalized);

    let records_b = store_b.list_trades_for_window(&mkt.symbol, mkt.window_start).await.unwrap();

    assert_eq!(records_a.len(), records_b.len());
    for role in [Role::Entry, Role::Hedge] {
        let a = records_a.iter().find(|r| r.role == role).unwrap();
        let b = records_b.iter().find(|r| r.role == role).unwrap();
        assert_eq!(a.outcome, b.outcome, "{role:?} outcome diverged after resume");
        assert_eq!(a.exit_price, b.exit_price, "{role:?} exit price diverged after resume");
        assert_eq!(a.pnl, b.pnl, "{role:?} pnl diverged after resume");
        assert!(
            matches!(a.outcome, TradeOutcome::ResolvedWin | TradeOutcome::ResolvedLoss),
            "{role:?} expected a resolved terminal outcome, got {:?}",
            a.outcome
        );
    }
}
