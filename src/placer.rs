//! `AtomicPlacer` (spec.md §4.6): places the entry+hedge pair as one unit,
//! durably persists both legs before trusting any exchange-reported status
//! (I4), and re-verifies fills after `settleDelay` to guard against
//! phantom-FILLED responses (I3).

use crate::core::Clock;
use crate::domain::{Leg, Order, OrderStatus, Role, Side, Token, TradeOutcome, TradeRecord};
use crate::error::LifecycleError;
use crate::exchange::{BatchOrderRequest, ExchangeClient};
use crate::post_only::PostOnlyFailurePolicy;
use crate::store::{Store, TradeRecordPatch};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// Both legs accepted; current statuses attached for the caller to persist.
    Active { entry: Order, hedge: Order },
    /// A leg rejected crossing; the other was cancelled if still live.
    CrossingRetry,
}

/// Identifies the (pair, window) a placement belongs to and the signal
/// snapshot to stamp on each leg's `TradeRecord`, so `AtomicPlacer` can
/// write the durable rows itself instead of the caller persisting them
/// after the fact (spec.md §4.6 step 2 / invariant I4).
#[derive(Debug, Clone)]
pub struct PairContext {
    pub pair_id: String,
    pub symbol: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub entry_side: Side,
    pub hedge_side: Side,
    pub signal_confidence: f64,
    pub signal_bias: String,
    pub signal_p_yes: f64,
}

pub struct AtomicPlacer {
    exchange: Arc<dyn ExchangeClient>,
    post_only_policy: Arc<PostOnlyFailurePolicy>,
    clock: Arc<dyn Clock>,
    store: Store,
    settle_delay: Duration,
}

impl AtomicPlacer {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        post_only_policy: Arc<PostOnlyFailurePolicy>,
        clock: Arc<dyn Clock>,
        store: Store,
        settle_delay: Duration,
    ) -> Self {
        Self {
            exchange,
            post_only_policy,
            clock,
            store,
            settle_delay,
        }
    }

    pub async fn place(
        &self,
        symbol: &str,
        mut entry_leg: Leg,
        mut hedge_leg: Leg,
        ctx: &PairContext,
    ) -> Result<Placement, LifecycleError> {
        let order_type = self.post_only_policy.order_type_for(symbol);
        entry_leg.order.order_type = order_type;
        hedge_leg.order.order_type = order_type;

        let requests = vec![
            to_request(&entry_leg.order),
            to_request(&hedge_leg.order),
        ];
        let acks = self.exchange.place_batch(&requests).await?;

        let entry_ack = &acks[0];
        let hedge_ack = &acks[1];

        if is_crossing(entry_ack) || is_crossing(hedge_ack) {
            if let Ok(ack) = entry_ack {
                if !ack.status.is_terminal() {
                    let _ = self.exchange.cancel(&ack.exchange_id).await;
                }
            }
            if let Ok(ack) = hedge_ack {
                if !ack.status.is_terminal() {
                    let _ = self.exchange.cancel(&ack.exchange_id).await;
                }
            }
            self.post_only_policy.on_crossing_rejected(symbol);
            return Ok(Placement::CrossingRetry);
        }

        if entry_ack.is_err() || hedge_ack.is_err() {
            // One leg landed on the exchange and the other failed for a
            // non-crossing reason (e.g. a transient error on just one of the
            // two requests). Cancel whichever leg succeeded before bailing
            // out, so a retry never leaves a naked resting order with no
            // TradeRecord tracking it.
            if let Ok(ack) = entry_ack {
                if !ack.status.is_terminal() {
                    let _ = self.exchange.cancel(&ack.exchange_id).await;
                }
            }
            if let Ok(ack) = hedge_ack {
                if !ack.status.is_terminal() {
                    let _ = self.exchange.cancel(&ack.exchange_id).await;
                }
            }
            let err = entry_ack.as_ref().err().or(hedge_ack.as_ref().err()).cloned().unwrap();
            return Err(LifecycleError::Fatal(format!("leg placement failed without crossing: {err}")));
        }

        let entry_ack = entry_ack.clone().unwrap();
        let hedge_ack = hedge_ack.clone().unwrap();

        entry_leg.order.exchange_id = Some(entry_ack.exchange_id.clone());
        entry_leg.order.status = OrderStatus::PendingVerify;
        hedge_leg.order.exchange_id = Some(hedge_ack.exchange_id.clone());
        hedge_leg.order.status = OrderStatus::PendingVerify;

        // Durability before trust (I4): both legs committed to the Store as
        // PENDING_VERIFY *before* the settle-delay sleep, so a crash during
        // the sleep still leaves a resumable row behind for the Reconciler
        // instead of an exchange-resident order with no corresponding record.
        let entry_record_id = self
            .insert_pending_record(Role::Entry, ctx.entry_side, &entry_leg.order, ctx)
            .await?;
        let hedge_record_id = self
            .insert_pending_record(Role::Hedge, ctx.hedge_side, &hedge_leg.order, ctx)
            .await?;

        self.clock.sleep(self.settle_delay).await;

        let entry_order = self.verify_leg(entry_leg.order).await?;
        let hedge_order = self.verify_leg(hedge_leg.order).await?;

        self.update_verified_record(entry_record_id, &entry_order).await?;
        self.update_verified_record(hedge_record_id, &hedge_order).await?;

        self.post_only_policy.on_both_legs_accepted(symbol);
        info!(symbol, "atomic pair placed and verified");

        Ok(Placement::Active {
            entry: entry_order,
            hedge: hedge_order,
        })
    }

    async fn insert_pending_record(
        &self,
        role: Role,
        side: Side,
        order: &Order,
        ctx: &PairContext,
    ) -> Result<i64, LifecycleError> {
        let record = TradeRecord {
            id: None,
            pair_id: ctx.pair_id.clone(),
            role,
            symbol: ctx.symbol.clone(),
            window_start: ctx.window_start,
            window_end: ctx.window_end,
            side,
            entry_price: order.price,
            filled_size: order.filled_size,
            bet_collateral: order.price * order.size,
            order_id: order.exchange_id.clone(),
            order_status: order.status,
            outcome: TradeOutcome::Open,
            exit_price: None,
            pnl: None,
            created_at: self.clock.now(),
            settled_at: None,
            signal_confidence: Some(ctx.signal_confidence),
            signal_bias: Some(ctx.signal_bias.clone()),
            signal_p_yes: Some(ctx.signal_p_yes),
        };
        Ok(self.store.insert_trade_record(&record).await?)
    }

    async fn update_verified_record(&self, id: i64, order: &Order) -> Result<(), LifecycleError> {
        self.store
            .update_trade_record(
                id,
                &TradeRecordPatch {
                    filled_size: Some(order.filled_size),
                    order_status: Some(order.status),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn verify_leg(&self, mut order: Order) -> Result<Order, LifecycleError> {
        let exchange_id = order
            .exchange_id
            .clone()
            .ok_or_else(|| LifecycleError::Fatal("leg missing exchange id at verify".into()))?;
        let snapshot = self.exchange.get_order(&exchange_id).await?;

        order.status = match (snapshot.status, snapshot.filled_size) {
            (OrderStatus::Filled, filled) if filled > rust_decimal::Decimal::ZERO => {
                order.filled_size = filled;
                order.average_fill_price = snapshot.average_fill_price;
                OrderStatus::Filled
            }
            (OrderStatus::Filled, _) => {
                // Phantom FILLED with zero fill size (I3): don't trust it.
                warn!(exchange_id = %exchange_id, "phantom FILLED with zero fill size, treating as live");
                OrderStatus::Live
            }
            (OrderStatus::PartiallyFilled, filled) => {
                order.filled_size = filled;
                order.average_fill_price = snapshot.average_fill_price;
                OrderStatus::PartiallyFilled
            }
            (OrderStatus::Live, _) => OrderStatus::Live,
            (other, _) => other,
        };

        Ok(order)
    }
}

fn to_request(order: &Order) -> BatchOrderRequest {
    BatchOrderRequest {
        token: Token(order.token.0.clone()),
        side: order.side,
        price: order.price,
        size: order.size,
        order_type: order.order_type,
    }
}

fn is_crossing(result: &Result<crate::exchange::BatchOrderAck, crate::error::ExchangeError>) -> bool {
    matches!(result, Err(crate::error::ExchangeError::Crossing))
}
