//! The `TradeLifecycle` state set (spec.md §4.10) as a plain Rust enum with
//! an explicit transition function, grounded in the `AtomicBotStatus`/
//! `BotStatus` pattern from the pack's order-monitor reference: a closed
//! set of named states instead of a class hierarchy, cheap to snapshot and
//! to resume from persisted data.

use crate::domain::{Market, Order, OrderSide, OrderStatus, OrderType, Role, Side, TradeRecord};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleState {
    Idle,
    Pricing,
    Placing,
    Monitoring {
        entry: Order,
        hedge: Order,
    },
    Holding {
        entry: Order,
        hedge: Order,
    },
    Optimizing {
        entry: Order,
        hedge: Order,
    },
    /// One leg never filled (or only partially); liquidating the filled leg.
    Liquidating {
        filled_role: Role,
        filled_order: Order,
        other: Order,
    },
    /// Both legs were filled; the optimizer chose to sell the losing side
    /// early while the winning side is held for payoff at resolution.
    LiquidatingOne {
        winning_order: Order,
        losing_side: Side,
        losing_order: Order,
    },
    /// A single surviving leg is resumable (its partner already reached a
    /// terminal outcome before the crash) and only needs the resolution
    /// check run against it. Carries the order a fresh process has no other
    /// way to recover, since `WaitingResolution` itself holds no payload.
    AwaitingSettlement {
        role: Role,
        order: Order,
    },
    WaitingResolution,
    Finalized,
    IdleSkipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Finalized | LifecycleState::IdleSkipped { .. } | LifecycleState::Failed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "IDLE",
            LifecycleState::Pricing => "PRICING",
            LifecycleState::Placing => "PLACING",
            LifecycleState::Monitoring { .. } => "MONITORING",
            LifecycleState::Holding { .. } => "HOLDING",
            LifecycleState::Optimizing { .. } => "OPTIMIZING",
            LifecycleState::Liquidating { .. } => "LIQUIDATING",
            LifecycleState::LiquidatingOne { .. } => "LIQUIDATING_ONE",
            LifecycleState::AwaitingSettlement { .. } => "AWAITING_SETTLEMENT",
            LifecycleState::WaitingResolution => "WAITING_RESOLUTION",
            LifecycleState::Finalized => "FINALIZED",
            LifecycleState::IdleSkipped { .. } => "IDLE_SKIPPED",
            LifecycleState::Failed { .. } => "FAILED",
        }
    }

    /// Reconstructs the resumable state for a pair whose two legs are both
    /// still `OPEN` in the Store, from the rebuilt `Order` for each leg
    /// (spec.md §4.10's crash-resumability requirement, testable property
    /// P4). A leg is "filled" for this purpose once its persisted
    /// `order_status` is `Filled`; anything else (`Live`,
    /// `PartiallyFilled`, `PendingVerify`) is still being monitored.
    pub fn from_legs(entry: Order, hedge: Order) -> LifecycleState {
        match (entry.status == OrderStatus::Filled, hedge.status == OrderStatus::Filled) {
            (true, true) => LifecycleState::Holding { entry, hedge },
            (true, false) => LifecycleState::Liquidating {
                filled_role: Role::Entry,
                filled_order: entry,
                other: hedge,
            },
            (false, true) => LifecycleState::Liquidating {
                filled_role: Role::Hedge,
                filled_order: hedge,
                other: entry,
            },
            (false, false) => LifecycleState::Monitoring { entry, hedge },
        }
    }

    /// Reconstructs the state for a pair where only one leg's `TradeRecord`
    /// is still `OPEN` (its partner already reached a terminal outcome, e.g.
    /// `CanceledUnfilled`, before the crash).
    pub fn from_single_leg(role: Role, order: Order) -> LifecycleState {
        LifecycleState::AwaitingSettlement { role, order }
    }
}

/// Rebuilds an `Order` good enough to resume monitoring/liquidation/
/// settlement from a persisted `TradeRecord`. The original intended order
/// size isn't itself a stored column; `bet_collateral / entry_price`
/// recovers it (both are persisted), falling back to `filled_size` if the
/// entry price is degenerate. `order_type` defaults to `Gtc` since the
/// original POST_ONLY/GTC choice isn't persisted either and every caller
/// downstream of placement only acts on `price`/`filled_size`/`status`.
pub fn order_from_record(market: &Market, rec: &TradeRecord) -> Order {
    let size = if rec.entry_price > Decimal::ZERO {
        rec.bet_collateral / rec.entry_price
    } else {
        rec.filled_size
    };
    Order {
        exchange_id: rec.order_id.clone(),
        token: market.token_for(rec.side).clone(),
        side: OrderSide::Buy,
        price: rec.entry_price,
        size,
        order_type: OrderType::Gtc,
        status: rec.order_status,
        filled_size: rec.filled_size,
        average_fill_price: if rec.filled_size > Decimal::ZERO {
            Some(rec.entry_price)
        } else {
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, TradeOutcome};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn terminal_states_are_idle_skipped_failed_and_finalized() {
        assert!(LifecycleState::Finalized.is_terminal());
        assert!(LifecycleState::IdleSkipped { reason: "x".into() }.is_terminal());
        assert!(LifecycleState::Failed { reason: "x".into() }.is_terminal());
        assert!(!LifecycleState::Idle.is_terminal());
        assert!(!LifecycleState::Pricing.is_terminal());
    }

    fn market() -> Market {
        let start = Utc::now();
        Market {
            symbol: "BTC".into(),
            window_start: start,
            window_end: start + chrono::Duration::seconds(900),
            up_token: crate::domain::Token("up".into()),
            down_token: crate::domain::Token("down".into()),
            tick_size: dec!(0.01),
        }
    }

    fn record(role: Role, side: Side, status: OrderStatus, filled_size: Decimal) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            id: Some(1),
            pair_id: "pair-1".into(),
            role,
            symbol: "BTC".into(),
            window_start: now,
            window_end: now + chrono::Duration::seconds(900),
            side,
            entry_price: dec!(0.40),
            filled_size,
            bet_collateral: dec!(4.0),
            order_id: Some("ex-1".into()),
            order_status: status,
            outcome: TradeOutcome::Open,
            exit_price: None,
            pnl: None,
            created_at: now,
            settled_at: None,
            signal_confidence: None,
            signal_bias: None,
            signal_p_yes: None,
        }
    }

    #[test]
    fn order_from_record_recovers_size_from_collateral_and_price() {
        let rec = record(Role::Entry, Side::Up, OrderStatus::Live, dec!(0));
        let order = order_from_record(&market(), &rec);
        assert_eq!(order.size, dec!(4.0) / dec!(0.40));
        assert_eq!(order.token, crate::domain::Token("up".into()));
        assert_eq!(order.exchange_id, Some("ex-1".into()));
    }

    #[test]
    fn from_legs_resumes_into_monitoring_when_neither_leg_confirmed_filled() {
        let entry = order_from_record(&market(), &record(Role::Entry, Side::Up, OrderStatus::Live, dec!(0)));
        let hedge = order_from_record(&market(), &record(Role::Hedge, Side::Down, OrderStatus::Live, dec!(0)));
        let state = LifecycleState::from_legs(entry, hedge);
        assert!(matches!(state, LifecycleState::Monitoring { .. }));
    }

    #[test]
    fn from_legs_resumes_into_holding_when_both_legs_filled() {
        let entry = order_from_record(&market(), &record(Role::Entry, Side::Up, OrderStatus::Filled, dec!(10)));
        let hedge = order_from_record(&market(), &record(Role::Hedge, Side::Down, OrderStatus::Filled, dec!(10)));
        let state = LifecycleState::from_legs(entry, hedge);
        assert!(matches!(state, LifecycleState::Holding { .. }));
    }

    #[test]
    fn from_legs_resumes_into_liquidating_when_only_entry_filled() {
        let entry = order_from_record(&market(), &record(Role::Entry, Side::Up, OrderStatus::Filled, dec!(10)));
        let hedge = order_from_record(&market(), &record(Role::Hedge, Side::Down, OrderStatus::Live, dec!(0)));
        let state = LifecycleState::from_legs(entry, hedge);
        match state {
            LifecycleState::Liquidating { filled_role, .. } => assert_eq!(filled_role, Role::Entry),
            other => panic!("expected Liquidating, got {other:?}"),
        }
    }
}
