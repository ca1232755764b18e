//! `TradeLifecycle` (spec.md §4.10): drives one `(symbol, window)` through
//! the full state machine, from signal-gated entry to a terminal outcome.
//! Every non-terminal transition persists its `TradeRecord` projection
//! before moving on, so a `Reconciler` can resume it after a restart.

pub mod state;

pub use state::LifecycleState;

use crate::config::Config;
use crate::core::Clock;
use crate::domain::{
    Leg, Market, Order, OrderSide, OrderStatus, OrderType, Role, Side, TradeOutcome, TradeRecord,
};
use crate::error::LifecycleError;
use crate::exchange::ExchangeClient;
use crate::fill_monitor::{FillMonitor, MonitorOutcome};
use crate::liquidator::{EmergencyLiquidator, LiquidationOutcome, LiquidationProgressSink, NoopProgressSink};
use crate::optimizer::{Decision, PreSettlementOptimizer};
use crate::placer::{AtomicPlacer, PairContext, Placement};
use crate::post_only::PostOnlyFailurePolicy;
use crate::pricing::{PricingInput, PricingPolicy};
use crate::signal::{Bias, Signal, SignalSource};
use crate::store::{Store, TradeRecordPatch};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Persists liquidation progress back to the `TradeRecord` row tracking one
/// leg, so `order_from_record` rebuilds the position actually remaining
/// after a crash instead of the pre-liquidation `filled_size`.
struct StoreProgressSink {
    store: Store,
    record_id: i64,
}

#[async_trait]
impl LiquidationProgressSink for StoreProgressSink {
    async fn record_progress(&self, remaining: Decimal) {
        let patch = TradeRecordPatch {
            filled_size: Some(remaining),
            ..Default::default()
        };
        if let Err(err) = self.store.update_trade_record(self.record_id, &patch).await {
            warn!(error = %err, record_id = self.record_id, "failed to persist liquidation progress");
        }
    }
}

/// One atomic pair's run, from `IDLE` to a terminal state.
pub struct TradeLifecycle {
    market: Market,
    pair_id: String,
    config: Arc<Config>,
    exchange: Arc<dyn ExchangeClient>,
    store: Store,
    clock: Arc<dyn Clock>,
    signal_source: Arc<dyn SignalSource>,
    post_only_policy: Arc<PostOnlyFailurePolicy>,
    state: LifecycleState,
}

impl TradeLifecycle {
    pub fn new(
        market: Market,
        config: Arc<Config>,
        exchange: Arc<dyn ExchangeClient>,
        store: Store,
        clock: Arc<dyn Clock>,
        signal_source: Arc<dyn SignalSource>,
        post_only_policy: Arc<PostOnlyFailurePolicy>,
    ) -> Self {
        let pair_id = format!("{}-{}", market.symbol, market.window_start.timestamp());
        Self {
            market,
            pair_id,
            config,
            exchange,
            store,
            clock,
            signal_source,
            post_only_policy,
            state: LifecycleState::Idle,
        }
    }

    /// Reconstructs a lifecycle already past `IDLE`/`PRICING`/`PLACING` from
    /// a `LifecycleState` the `Reconciler`/`Scheduler` rebuilt out of
    /// persisted `TradeRecord`s (spec.md §4.10 crash-resumability, P4).
    /// Call `run_resumed` instead of `run` to continue it.
    pub fn resume(
        market: Market,
        pair_id: String,
        config: Arc<Config>,
        exchange: Arc<dyn ExchangeClient>,
        store: Store,
        clock: Arc<dyn Clock>,
        signal_source: Arc<dyn SignalSource>,
        post_only_policy: Arc<PostOnlyFailurePolicy>,
        state: LifecycleState,
    ) -> Self {
        Self {
            market,
            pair_id,
            config,
            exchange,
            store,
            clock,
            signal_source,
            post_only_policy,
            state,
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// Continues a lifecycle reconstructed via `resume`, dispatching on
    /// whichever state it was rebuilt into and running the same downstream
    /// path `run` itself would have reached if the process hadn't crashed.
    pub async fn run_resumed(&mut self) -> Result<LifecycleState, LifecycleError> {
        match self.state.clone() {
            LifecycleState::Monitoring { entry, hedge } => {
                self.state = LifecycleState::Monitoring { entry: entry.clone(), hedge: hedge.clone() };
                let outcome = self.monitor(entry, hedge).await?;
                self.advance_from_monitoring(outcome).await
            }
            LifecycleState::Holding { entry, hedge } => self.hold_both(entry, hedge).await,
            LifecycleState::Liquidating { filled_order, filled_role, other } => {
                self.liquidate_single_leg(filled_order, filled_role, other).await
            }
            LifecycleState::AwaitingSettlement { role, order } => {
                self.state = LifecycleState::WaitingResolution;
                self.resolve_and_finalize(role, order).await
            }
            already_settled => Ok(already_settled),
        }
    }

    /// Drives the lifecycle from `IDLE` to a terminal state, given the
    /// caller already confirmed `exposureOk` (the `Scheduler`'s I5 check).
    /// Returns the terminal state reached; never panics on a recoverable
    /// failure, translating it instead into `IDLE_SKIPPED`/`FAILED`.
    pub async fn run(&mut self) -> Result<LifecycleState, LifecycleError> {
        let now = self.clock.now();
        let signal = self.signal_source.signal(&self.market.symbol, now);

        if signal.confidence < self.config.min_edge {
            self.state = LifecycleState::IdleSkipped {
                reason: format!(
                    "signal confidence {:.3} below min_edge {:.3}",
                    signal.confidence, self.config.min_edge
                ),
            };
            return Ok(self.state.clone());
        }

        self.state = LifecycleState::Pricing;
        let plan = match self.price(signal).await {
            Ok(plan) => plan,
            Err(reason) => {
                self.state = LifecycleState::IdleSkipped { reason };
                return Ok(self.state.clone());
            }
        };

        if let Some(reason) = self.exposure_rejection(&plan).await {
            self.state = LifecycleState::IdleSkipped { reason };
            return Ok(self.state.clone());
        }

        self.state = LifecycleState::Placing;
        let (entry, hedge) = match self.place_with_retry(&plan, signal).await? {
            Some(pair) => pair,
            None => {
                self.state = LifecycleState::IdleSkipped {
                    reason: "crossing retry budget exhausted".into(),
                };
                return Ok(self.state.clone());
            }
        };

        self.state = LifecycleState::Monitoring {
            entry: entry.clone(),
            hedge: hedge.clone(),
        };
        let outcome = self.monitor(entry, hedge).await?;
        self.advance_from_monitoring(outcome).await
    }

    async fn price(&self, signal: Signal) -> Result<crate::pricing::EntryPlan, String> {
        let best_bid_up = self.exchange.best_bid(&self.market.up_token).await.ok();
        let best_bid_down = self.exchange.best_bid(&self.market.down_token).await.ok();
        let balance = self
            .exchange
            .balance()
            .await
            .unwrap_or(Decimal::ZERO);

        let input = PricingInput {
            bias: signal.bias,
            confidence: signal.confidence,
            available_balance: balance,
            best_bid_up,
            best_bid_down,
            tick_size: self.market.tick_size,
            combined_cap: self.config.combined_cap,
            max_size_mode: self.config.max_size_mode,
            max_size: self.config.max_size,
            bet_percent: self.config.bet_percent,
            scaling_factor: Decimal::from_f64_retain(self.config.scaling_factor).unwrap_or(Decimal::ONE),
            min_order_size: self.config.min_order_size,
        };

        PricingPolicy::plan(&self.market, &input).map_err(|e| e.to_string())
    }

    /// I5: sums currently OPEN `betCollateral` across every symbol/window and
    /// rejects this plan if committing it would push total exposure past
    /// `maxPortfolioExposure` (a fraction of current exchange balance).
    async fn exposure_rejection(&self, plan: &crate::pricing::EntryPlan) -> Option<String> {
        let balance = self.exchange.balance().await.unwrap_or(Decimal::ZERO);
        let cap = balance * self.config.max_portfolio_exposure;

        let open = self.store.list_open_trades().await.unwrap_or_default();
        let current_exposure: Decimal = open.iter().map(|r| r.bet_collateral).sum();

        let new_bet = (plan.entry_price + plan.hedge_price) * plan.size;
        if current_exposure + new_bet > cap {
            return Some(format!(
                "exposure {} + new bet {} would exceed cap {} ({}% of balance {})",
                current_exposure, new_bet, cap, self.config.max_portfolio_exposure, balance
            ));
        }
        None
    }

    /// Places the pair, looping on `CROSSING_RETRY` up to `crossing_retry_budget`
    /// times; `Ok(None)` signals budget exhaustion (caller goes `IDLE_SKIPPED`).
    async fn place_with_retry(
        &self,
        plan: &crate::pricing::EntryPlan,
        signal: Signal,
    ) -> Result<Option<(Order, Order)>, LifecycleError> {
        let placer = AtomicPlacer::new(
            self.exchange.clone(),
            self.post_only_policy.clone(),
            self.clock.clone(),
            self.store.clone(),
            Duration::from_secs(self.config.settle_delay_sec),
        );
        let ctx = PairContext {
            pair_id: self.pair_id.clone(),
            symbol: self.market.symbol.clone(),
            window_start: self.market.window_start,
            window_end: self.market.window_end,
            entry_side: plan.entry_side,
            hedge_side: plan.hedge_side,
            signal_confidence: signal.confidence,
            signal_bias: bias_label(signal.bias).to_string(),
            signal_p_yes: signal.p_yes,
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let entry_leg = self.build_leg(Role::Entry, plan.entry_side, plan.entry_price, plan.size);
            let hedge_leg = self.build_leg(Role::Hedge, plan.hedge_side, plan.hedge_price, plan.size);

            // AtomicPlacer itself persists both legs as PENDING_VERIFY before
            // the settle-delay sleep (I4) and updates them after re-verifying,
            // so nothing further needs to be written here on success.
            match placer.place(&self.market.symbol, entry_leg, hedge_leg, &ctx).await? {
                Placement::Active { entry, hedge } => {
                    return Ok(Some((entry, hedge)));
                }
                Placement::CrossingRetry => {
                    if attempts >= self.config.crossing_retry_budget {
                        return Ok(None);
                    }
                    warn!(symbol = %self.market.symbol, attempts, "crossing retry, re-attempting placement");
                }
            }
        }
    }

    fn build_leg(&self, role: Role, side: Side, price: Decimal, size: Decimal) -> Leg {
        Leg {
            role,
            order: Order {
                exchange_id: None,
                token: self.market.token_for(side).clone(),
                side: OrderSide::Buy,
                price,
                size,
                order_type: OrderType::PostOnly,
                status: OrderStatus::Pending,
                filled_size: Decimal::ZERO,
                average_fill_price: None,
            },
            intended_size: size,
            intended_price: price,
        }
    }

    async fn monitor(&self, entry: Order, hedge: Order) -> Result<MonitorOutcome, LifecycleError> {
        let monitor = FillMonitor::new(
            self.exchange.clone(),
            self.clock.clone(),
            Duration::from_secs(self.config.fill_timeout_sec),
            Duration::from_secs(self.config.poll_interval_sec),
            self.config.min_order_size,
        );
        let outcome = monitor.monitor(entry, hedge).await?;
        self.sync_monitor_outcome(&outcome).await?;
        Ok(outcome)
    }

    async fn sync_monitor_outcome(&self, outcome: &MonitorOutcome) -> Result<(), LifecycleError> {
        match outcome {
            MonitorOutcome::BothFilled { entry, hedge }
            | MonitorOutcome::NeitherFilled { entry, hedge } => {
                self.patch_order_status(entry).await?;
                self.patch_order_status(hedge).await?;
            }
            MonitorOutcome::OneFilled { filled_order, other, .. }
            | MonitorOutcome::PartialOne { filled_order, other, .. } => {
                self.patch_order_status(filled_order).await?;
                self.patch_order_status(other).await?;
            }
        }
        Ok(())
    }

    async fn patch_order_status(&self, order: &Order) -> Result<(), LifecycleError> {
        let Some(exchange_id) = &order.exchange_id else {
            return Ok(());
        };
        if let Some(id) = self.find_record_id(exchange_id).await? {
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
        }
        Ok(())
    }

    async fn find_record_id(&self, exchange_id: &str) -> Result<Option<i64>, LifecycleError> {
        let records = self
            .store
            .list_trades_for_window(&self.market.symbol, self.market.window_start)
            .await?;
        Ok(records
            .into_iter()
            .find(|r| r.order_id.as_deref() == Some(exchange_id))
            .and_then(|r| r.id))
    }

    async fn advance_from_monitoring(
        &mut self,
        outcome: MonitorOutcome,
    ) -> Result<LifecycleState, LifecycleError> {
        match outcome {
            MonitorOutcome::NeitherFilled { .. } => {
                self.mark_final_outcomes(TradeOutcome::CanceledUnfilled, None)
                    .await?;
                self.state = LifecycleState::IdleSkipped {
                    reason: "neither leg filled before timeout".into(),
                };
                Ok(self.state.clone())
            }
            MonitorOutcome::BothFilled { entry, hedge } => self.hold_both(entry, hedge).await,
            MonitorOutcome::OneFilled { filled, filled_order, other } => {
                self.state = LifecycleState::Liquidating {
                    filled_role: filled,
                    filled_order: filled_order.clone(),
                    other: other.clone(),
                };
                self.liquidate_single_leg(filled_order, filled, other).await
            }
            MonitorOutcome::PartialOne { filled, filled_order, partial_shares, mut other } => {
                other.filled_size = partial_shares;
                self.state = LifecycleState::Liquidating {
                    filled_role: filled,
                    filled_order: filled_order.clone(),
                    other: other.clone(),
                };
                self.liquidate_partial_pair(filled_order, filled, other).await
            }
        }
    }

    async fn liquidate_single_leg(
        &mut self,
        filled_order: Order,
        filled_role: Role,
        other: Order,
    ) -> Result<LifecycleState, LifecycleError> {
        let liquidator = self.make_liquidator();
        let sink = self.progress_sink_for(filled_order.exchange_id.as_deref()).await;
        let outcome = liquidator
            .liquidate(
                &filled_order.token,
                filled_order.filled_size,
                filled_order.price,
                self.market.window_end,
                sink.as_ref(),
            )
            .await?;

        let (final_outcome, exit_price, resolved_order, extra_pnl) =
            self.resolve_liquidation_outcome(filled_order, outcome);
        self.patch_record_for_order_with_extra_pnl(&resolved_order, final_outcome, exit_price, extra_pnl)
            .await?;
        // The other leg never filled at all (I-level invariant behind
        // ONE_FILLED) and was already cancelled by the monitor; its record
        // needs its own terminal outcome so the reconciler stops treating it
        // as OPEN on the next restart.
        self.patch_record_for_order(&other, TradeOutcome::CanceledUnfilled, None)
            .await?;

        if final_outcome == TradeOutcome::Open {
            self.state = LifecycleState::WaitingResolution;
            self.resolve_and_finalize_with_banked_pnl(filled_role, resolved_order, extra_pnl)
                .await
        } else {
            self.state = LifecycleState::Finalized;
            info!(symbol = %self.market.symbol, outcome = ?final_outcome, "lifecycle finalized after single-leg liquidation");
            Ok(self.state.clone())
        }
    }

    /// Handles `PARTIAL_ONE` (spec.md §8 S6): the insufficiently-filled leg
    /// is handed to the liquidator in its own right (it resolves immediately
    /// via the min-size/deadline check into `Orphaned` or held-to-resolution),
    /// while the fully-filled leg follows the same liquidation path as
    /// `liquidate_single_leg`.
    async fn liquidate_partial_pair(
        &mut self,
        filled_order: Order,
        filled_role: Role,
        partial_order: Order,
    ) -> Result<LifecycleState, LifecycleError> {
        let liquidator = self.make_liquidator();

        let partial_sink = self.progress_sink_for(partial_order.exchange_id.as_deref()).await;
        let partial_outcome = liquidator
            .liquidate(
                &partial_order.token,
                partial_order.filled_size,
                partial_order.price,
                self.market.window_end,
                partial_sink.as_ref(),
            )
            .await?;
        let (partial_final, partial_exit, partial_resolved, partial_extra_pnl) =
            self.resolve_liquidation_outcome(partial_order, partial_outcome);
        self.patch_record_for_order_with_extra_pnl(&partial_resolved, partial_final, partial_exit, partial_extra_pnl)
            .await?;

        let main_sink = self.progress_sink_for(filled_order.exchange_id.as_deref()).await;
        let main_outcome = liquidator
            .liquidate(
                &filled_order.token,
                filled_order.filled_size,
                filled_order.price,
                self.market.window_end,
                main_sink.as_ref(),
            )
            .await?;
        let (main_final, main_exit, main_resolved, main_extra_pnl) =
            self.resolve_liquidation_outcome(filled_order, main_outcome);
        self.patch_record_for_order_with_extra_pnl(&main_resolved, main_final, main_exit, main_extra_pnl)
            .await?;

        if main_final == TradeOutcome::Open {
            self.state = LifecycleState::WaitingResolution;
            self.resolve_and_finalize_with_banked_pnl(filled_role, main_resolved, main_extra_pnl)
                .await
        } else {
            self.state = LifecycleState::Finalized;
            info!(symbol = %self.market.symbol, outcome = ?main_final, "lifecycle finalized after partial-fill liquidation");
            Ok(self.state.clone())
        }
    }

    async fn hold_both(&mut self, entry: Order, hedge: Order) -> Result<LifecycleState, LifecycleError> {
        self.state = LifecycleState::Holding {
            entry: entry.clone(),
            hedge: hedge.clone(),
        };

        let optimizer_cfg = self.config.pre_settlement.clone();
        let optimizer = PreSettlementOptimizer::new(&optimizer_cfg);
        let liquidator = self.make_liquidator();

        let mut winning: Option<(Role, Order)> = None;
        let mut losing: Option<(Role, Order)> = None;

        loop {
            let now = self.clock.now();
            if now >= self.market.window_end {
                break;
            }

            if optimizer.is_in_window(now, self.market.window_end) {
                self.state = LifecycleState::Optimizing {
                    entry: entry.clone(),
                    hedge: hedge.clone(),
                };
                let signal = self.signal_source.signal(&self.market.symbol, now);
                match optimizer.decide(signal) {
                    Decision::KeepBoth => {}
                    Decision::SellLosingLeg { losing_side } => {
                        let (losing_order, losing_role, winning_order, winning_role) =
                            if entry.side_matches(losing_side, &self.market) {
                                (entry.clone(), Role::Entry, hedge.clone(), Role::Hedge)
                            } else {
                                (hedge.clone(), Role::Hedge, entry.clone(), Role::Entry)
                            };
                        self.state = LifecycleState::LiquidatingOne {
                            winning_order: winning_order.clone(),
                            losing_side,
                            losing_order: losing_order.clone(),
                        };
                        let sink = self.progress_sink_for(losing_order.exchange_id.as_deref()).await;
                        let outcome = liquidator
                            .liquidate(
                                &losing_order.token,
                                losing_order.filled_size,
                                losing_order.price,
                                self.market.window_end,
                                sink.as_ref(),
                            )
                            .await?;
                        let (sold_outcome, sold_exit, losing_resolved, losing_extra_pnl) = {
                            let (outcome_kind, exit, resolved, extra_pnl) =
                                self.resolve_liquidation_outcome(losing_order, outcome);
                            let outcome_kind = if outcome_kind == TradeOutcome::EmergencySold {
                                TradeOutcome::PreSettled
                            } else {
                                outcome_kind
                            };
                            (outcome_kind, exit, resolved, extra_pnl)
                        };
                        self.patch_record_for_order_with_extra_pnl(
                            &losing_resolved,
                            sold_outcome,
                            sold_exit,
                            losing_extra_pnl,
                        )
                        .await?;
                        losing = Some((losing_role, losing_resolved));
                        winning = Some((winning_role, winning_order));
                        break;
                    }
                }
            }

            self.clock.sleep(Duration::from_secs(
                self.config.pre_settlement.interval_sec.max(1) as u64,
            ))
            .await;
        }

        self.state = LifecycleState::WaitingResolution;
        match (winning, losing) {
            (Some((role, order)), _) => self.resolve_and_finalize(role, order).await,
            _ => self.resolve_both_and_finalize(entry, hedge).await,
        }
    }

    /// Turns a `LiquidationOutcome` into what the caller needs to patch the
    /// record and, if the leg isn't done yet, carry forward into resolution:
    /// the terminal/open `TradeOutcome`, the sale's `exit_price` (`SoldAll`
    /// only), an `order` corrected to `filled_size = remaining` so a later
    /// patch or resolution doesn't re-book shares this liquidation already
    /// sold, and the PnL already realized on the sold prefix so it isn't
    /// lost when the remainder resolves separately.
    fn resolve_liquidation_outcome(
        &self,
        order: Order,
        outcome: LiquidationOutcome,
    ) -> (TradeOutcome, Option<Decimal>, Order, Decimal) {
        match outcome {
            LiquidationOutcome::SoldAll { average_price } => {
                (TradeOutcome::EmergencySold, Some(average_price), order, Decimal::ZERO)
            }
            LiquidationOutcome::HoldThroughResolution {
                remaining,
                sold_average_price,
            } => {
                let sold_size = order.filled_size - remaining;
                let extra_pnl = sold_average_price
                    .map(|price| (price - order.price) * sold_size)
                    .unwrap_or(Decimal::ZERO);
                let resolved_order = Order {
                    filled_size: remaining,
                    ..order
                };
                (TradeOutcome::Open, None, resolved_order, extra_pnl)
            }
            LiquidationOutcome::Orphaned {
                remaining,
                sold_average_price,
            } => {
                let sold_size = order.filled_size - remaining;
                // Orphaned shares are below the exchange minimum on the
                // losing side and will never trade again, so their full
                // cost basis books as a realized loss now.
                let expected_loss = Decimal::ZERO - remaining * order.price;
                let sold_pnl = sold_average_price
                    .map(|price| (price - order.price) * sold_size)
                    .unwrap_or(Decimal::ZERO);
                let extra_pnl = expected_loss + sold_pnl;
                let resolved_order = Order {
                    filled_size: remaining,
                    ..order
                };
                (TradeOutcome::Orphaned, None, resolved_order, extra_pnl)
            }
        }
    }

    fn make_liquidator(&self) -> EmergencyLiquidator {
        EmergencyLiquidator::new(
            self.exchange.clone(),
            self.clock.clone(),
            self.config.emergency.clone(),
            self.market.tick_size,
            self.config.min_order_size,
        )
    }

    /// Looks up the `TradeRecord` tracking `exchange_id` and returns a sink
    /// that patches its `filled_size` down after each partial liquidation
    /// sale, so a crash mid-liquidation resumes against the position
    /// actually left rather than re-selling shares already sold. Falls back
    /// to a no-op if the record can't be found (should not happen for a
    /// leg the lifecycle itself placed, but liquidation must not fail just
    /// because durability bookkeeping couldn't find a row).
    async fn progress_sink_for(&self, exchange_id: Option<&str>) -> Box<dyn LiquidationProgressSink> {
        let Some(exchange_id) = exchange_id else {
            return Box::new(NoopProgressSink);
        };
        match self.find_record_id(exchange_id).await {
            Ok(Some(id)) => Box::new(StoreProgressSink {
                store: self.store.clone(),
                record_id: id,
            }),
            Ok(None) => Box::new(NoopProgressSink),
            Err(err) => {
                warn!(error = %err, "could not resolve trade record for liquidation progress tracking");
                Box::new(NoopProgressSink)
            }
        }
    }

    /// No real settlement oracle is part of this crate's external-interface
    /// contract (spec.md §6 names only the exchange and the signal source),
    /// so resolution is approximated from the held token's best bid at
    /// window end: a token trading near 1.0 resolved to win.
    async fn resolve_and_finalize(
        &mut self,
        role: Role,
        order: Order,
    ) -> Result<LifecycleState, LifecycleError> {
        self.resolve_and_finalize_with_banked_pnl(role, order, Decimal::ZERO).await
    }

    /// Same as `resolve_and_finalize`, but adds `banked_pnl` already realized
    /// from a sold prefix of this leg (see `patch_record_for_order_with_extra_pnl`)
    /// on top of whatever this leg's eventual resolution realizes.
    async fn resolve_and_finalize_with_banked_pnl(
        &mut self,
        role: Role,
        order: Order,
        banked_pnl: Decimal,
    ) -> Result<LifecycleState, LifecycleError> {
        self.clock
            .sleep(Duration::from_secs(self.config.settle_delay_sec))
            .await;
        let won = self.token_resolved_winning(&order.token).await;
        let outcome = if won {
            TradeOutcome::ResolvedWin
        } else {
            TradeOutcome::ResolvedLoss
        };
        let exit_price = if won { Some(Decimal::ONE) } else { Some(Decimal::ZERO) };
        self.patch_record_for_order_with_extra_pnl(&order, outcome, exit_price, banked_pnl)
            .await?;
        let _ = role;
        self.state = LifecycleState::Finalized;
        Ok(self.state.clone())
    }

    async fn resolve_both_and_finalize(
        &mut self,
        entry: Order,
        hedge: Order,
    ) -> Result<LifecycleState, LifecycleError> {
        self.clock
            .sleep(Duration::from_secs(self.config.settle_delay_sec))
            .await;
        for order in [&entry, &hedge] {
            let won = self.token_resolved_winning(&order.token).await;
            let outcome = if won {
                TradeOutcome::ResolvedWin
            } else {
                TradeOutcome::ResolvedLoss
            };
            let exit_price = if won { Some(Decimal::ONE) } else { Some(Decimal::ZERO) };
            self.patch_record_for_order(order, outcome, exit_price).await?;
        }
        self.state = LifecycleState::Finalized;
        Ok(self.state.clone())
    }

    async fn token_resolved_winning(&self, token: &crate::domain::Token) -> bool {
        self.exchange
            .best_bid(token)
            .await
            .map(|bid| bid > Decimal::new(5, 1))
            .unwrap_or(false)
    }

    /// Patches a leg's terminal outcome. `exit_price`, when present, also
    /// fixes the realized `pnl` for that leg: `(exit - entryPrice) * filledSize`
    /// (spec.md §8 S1/S3/S5), where `order.price` is the entry price this
    /// leg was placed at.
    async fn patch_record_for_order(
        &self,
        order: &Order,
        outcome: TradeOutcome,
        exit_price: Option<Decimal>,
    ) -> Result<(), LifecycleError> {
        self.patch_record_for_order_with_extra_pnl(order, outcome, exit_price, Decimal::ZERO)
            .await
    }

    /// Same as `patch_record_for_order`, but banks an additional realized
    /// `extra_pnl` on top of the `exit_price`-derived amount. A liquidation
    /// that only partially sold a leg before the remainder moved to
    /// `HoldThroughResolution`/`Orphaned` realizes PnL on that sold prefix
    /// immediately — `order.filled_size` at that point already reflects just
    /// what's left (see the call sites in `liquidate_single_leg` et al.), so
    /// without this the sold prefix's proceeds would never be persisted.
    async fn patch_record_for_order_with_extra_pnl(
        &self,
        order: &Order,
        outcome: TradeOutcome,
        exit_price: Option<Decimal>,
        extra_pnl: Decimal,
    ) -> Result<(), LifecycleError> {
        let Some(exchange_id) = &order.exchange_id else {
            return Ok(());
        };
        let pnl = exit_price
            .map(|exit| (exit - order.price) * order.filled_size + extra_pnl)
            .or_else(|| (extra_pnl != Decimal::ZERO).then_some(extra_pnl));
        if let Some(id) = self.find_record_id(exchange_id).await? {
            self.store
                .update_trade_record(
                    id,
                    &TradeRecordPatch {
                        filled_size: Some(order.filled_size),
                        outcome: Some(outcome),
                        exit_price: Some(exit_price),
                        pnl: Some(pnl),
                        settled_at: Some(Some(self.clock.now())),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn mark_final_outcomes(
        &self,
        outcome: TradeOutcome,
        exit_price: Option<Decimal>,
    ) -> Result<(), LifecycleError> {
        let records = self
            .store
            .list_trades_for_window(&self.market.symbol, self.market.window_start)
            .await?;
        for record in records {
            if record.pair_id != self.pair_id {
                continue;
            }
            if let Some(id) = record.id {
                self.store
                    .update_trade_record(
                        id,
                        &TradeRecordPatch {
                            outcome: Some(outcome),
                            exit_price: Some(exit_price),
                            settled_at: Some(Some(self.clock.now())),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

trait SideMatch {
    fn side_matches(&self, side: Side, market: &Market) -> bool;
}

impl SideMatch for Order {
    fn side_matches(&self, side: Side, market: &Market) -> bool {
        self.token == *market.token_for(side)
    }
}

fn bias_label(bias: Bias) -> &'static str {
    match bias {
        Bias::Up => "UP",
        Bias::Down => "DOWN",
        Bias::Neutral => "NEUTRAL",
    }
}
