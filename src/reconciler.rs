//! `Reconciler` (spec.md §4.12): on startup, walks every `TradeRecord` still
//! `OPEN` and cross-checks it against the exchange before anything resumes,
//! so a crash mid-`MONITORING`/`LIQUIDATING` doesn't leave a stale LIVE
//! order unaccounted for. Grounded in the teacher's startup-reconciliation
//! pass in `vault::execution` (rebuilding in-memory order state from the
//! exchange rather than trusting whatever the process exited with).

use crate::domain::{OrderStatus, TradeOutcome, TradeRecord};
use crate::error::LifecycleError;
use crate::exchange::ExchangeClient;
use crate::store::{Store, TradeRecordPatch};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct ReconciliationReport {
    /// Records confirmed FILLED or still LIVE within an unexpired window —
    /// these are candidates the `Scheduler` should hand back to a resumed
    /// `TradeLifecycle`.
    pub resumable: Vec<TradeRecord>,
    pub canceled_unfilled: usize,
    /// Balance-vs-filledSize mismatches observed but deliberately not
    /// auto-corrected (I3 extended to scale events, spec.md §4.12 step 2).
    pub balance_discrepancies: Vec<String>,
}

pub struct Reconciler {
    store: Store,
    exchange: Arc<dyn ExchangeClient>,
}

impl Reconciler {
    pub fn new(store: Store, exchange: Arc<dyn ExchangeClient>) -> Self {
        Self { store, exchange }
    }

    pub async fn reconcile(&self) -> Result<ReconciliationReport, LifecycleError> {
        let mut report = ReconciliationReport::default();
        let open = self.store.list_open_trades().await?;

        // `reconcile_order` may patch `filled_size` (a FILLED/LIVE snapshot,
        // or a NotFound cancellation); `check_balances` must see those
        // corrections rather than the pre-reconciliation snapshot, or a
        // mismatch `reconcile_order` just fixed would still fire a bogus
        // discrepancy warning in the very same pass.
        let mut reconciled = Vec::with_capacity(open.len());
        for record in &open {
            let corrected = self.reconcile_order(record, &mut report).await?;
            reconciled.push(corrected);
        }

        self.check_balances(&reconciled, &mut report).await;

        Ok(report)
    }

    /// Step 1: re-query the exchange for the order this record is waiting
    /// on and reconcile its persisted status with reality. Returns the
    /// record with `filled_size` updated to whatever was just persisted, so
    /// `check_balances` can cross-check against current belief.
    async fn reconcile_order(
        &self,
        record: &TradeRecord,
        report: &mut ReconciliationReport,
    ) -> Result<TradeRecord, LifecycleError> {
        let Some(id) = record.id else { return Ok(record.clone()) };
        let Some(exchange_id) = &record.order_id else {
            report.resumable.push(record.clone());
            return Ok(record.clone());
        };

        match self.exchange.get_order(exchange_id).await {
            Ok(snapshot) if snapshot.status == OrderStatus::Filled => {
                self.store
                    .update_trade_record(
                        id,
                        &TradeRecordPatch {
                            filled_size: Some(snapshot.filled_size),
                            order_status: Some(OrderStatus::Filled),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(pair_id = %record.pair_id, role = ?record.role, "reconciled: order confirmed FILLED");
                report.resumable.push(record.clone());
                Ok(TradeRecord {
                    filled_size: snapshot.filled_size,
                    order_status: OrderStatus::Filled,
                    ..record.clone()
                })
            }
            Ok(snapshot) if snapshot.status == OrderStatus::Live => {
                if Utc::now() >= record.window_end {
                    let _ = self.exchange.cancel(exchange_id).await;
                    self.store
                        .update_trade_record(
                            id,
                            &TradeRecordPatch {
                                order_status: Some(OrderStatus::Canceled),
                                outcome: Some(TradeOutcome::CanceledUnfilled),
                                settled_at: Some(Some(Utc::now())),
                                ..Default::default()
                            },
                        )
                        .await?;
                    report.canceled_unfilled += 1;
                    info!(pair_id = %record.pair_id, "reconciled: expired LIVE order canceled");
                    Ok(TradeRecord {
                        order_status: OrderStatus::Canceled,
                        outcome: TradeOutcome::CanceledUnfilled,
                        ..record.clone()
                    })
                } else {
                    self.store
                        .update_trade_record(
                            id,
                            &TradeRecordPatch {
                                filled_size: Some(snapshot.filled_size),
                                ..Default::default()
                            },
                        )
                        .await?;
                    report.resumable.push(record.clone());
                    Ok(TradeRecord {
                        filled_size: snapshot.filled_size,
                        ..record.clone()
                    })
                }
            }
            Ok(snapshot) => {
                self.store
                    .update_trade_record(
                        id,
                        &TradeRecordPatch {
                            filled_size: Some(snapshot.filled_size),
                            order_status: Some(snapshot.status),
                            ..Default::default()
                        },
                    )
                    .await?;
                report.resumable.push(record.clone());
                Ok(TradeRecord {
                    filled_size: snapshot.filled_size,
                    order_status: snapshot.status,
                    ..record.clone()
                })
            }
            Err(crate::error::ExchangeError::NotFound(_)) => {
                self.store
                    .update_trade_record(
                        id,
                        &TradeRecordPatch {
                            order_status: Some(OrderStatus::Canceled),
                            ..Default::default()
                        },
                    )
                    .await?;
                let mut corrected = TradeRecord {
                    order_status: OrderStatus::Canceled,
                    ..record.clone()
                };
                if record.filled_size == Decimal::ZERO {
                    self.store
                        .update_trade_record(
                            id,
                            &TradeRecordPatch {
                                outcome: Some(TradeOutcome::CanceledUnfilled),
                                settled_at: Some(Some(Utc::now())),
                                ..Default::default()
                            },
                        )
                        .await?;
                    report.canceled_unfilled += 1;
                    corrected.outcome = TradeOutcome::CanceledUnfilled;
                } else {
                    report.resumable.push(record.clone());
                }
                warn!(pair_id = %record.pair_id, exchange_id, "reconciled: order not found on exchange, treated as terminal CANCELED");
                Ok(corrected)
            }
            Err(e) => {
                warn!(pair_id = %record.pair_id, error = %e, "reconciliation query failed, leaving record OPEN for a later pass");
                report.resumable.push(record.clone());
                Ok(record.clone())
            }
        }
    }

    /// Step 2: compares the exchange's reported collateral balance against
    /// the value this process believes it has committed to open positions.
    /// The wire contract (spec.md §6.1) exposes only an account-level
    /// balance, not a per-token one, so this is a coarse sanity check; a
    /// discrepancy is logged, never auto-trusted into `filledSize` —
    /// phantom-balance inflation has been observed upstream and must not be
    /// silently synced.
    async fn check_balances(&self, open: &[TradeRecord], report: &mut ReconciliationReport) {
        let believed_committed: Decimal = open
            .iter()
            .map(|r| r.filled_size * r.entry_price)
            .sum();

        let Ok(balance) = self.exchange.balance().await else {
            warn!("reconciliation: could not read exchange balance, skipping cross-check");
            return;
        };

        info!(%balance, %believed_committed, "reconciliation: exchange balance vs believed committed collateral");
        if believed_committed > balance {
            let msg = format!(
                "believed committed collateral {believed_committed} exceeds exchange balance {balance} (delta {})",
                believed_committed - balance
            );
            warn!("{msg}");
            report.balance_discrepancies.push(msg);
        }
    }
}
