//! `EmergencyLiquidator` (spec.md §4.8): sells a filled leg down before
//! window end, stepping through an urgency schedule keyed off remaining
//! time, with a `MinSizePolicy` hand-off when the remaining position drops
//! below the tradeable minimum.

use crate::config::EmergencyConfig;
use crate::core::Clock;
use crate::domain::{OrderSide, OrderType, Token};
use crate::error::LifecycleError;
use crate::exchange::{BatchOrderRequest, ExchangeClient};
use crate::pricing::round_down_to_tick;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Durably records how much of a position remains after each partial sale,
/// so a crash mid-liquidation resumes against the position actually left
/// rather than re-selling shares already sold before the crash. A no-op
/// sink is fine for callers (tests, a bare paper run) that don't need
/// crash-resumable liquidation.
#[async_trait]
pub trait LiquidationProgressSink: Send + Sync {
    async fn record_progress(&self, remaining: Decimal);
}

pub struct NoopProgressSink;

#[async_trait]
impl LiquidationProgressSink for NoopProgressSink {
    async fn record_progress(&self, _remaining: Decimal) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Urgency {
    Patient,
    Balanced,
    Aggressive,
}

impl Urgency {
    fn for_remaining(remaining: chrono::Duration) -> Self {
        let secs = remaining.num_seconds();
        if secs > 600 {
            Urgency::Patient
        } else if secs >= 300 {
            Urgency::Balanced
        } else {
            Urgency::Aggressive
        }
    }

    fn drop_step(self) -> Decimal {
        use rust_decimal_macros::dec;
        match self {
            Urgency::Patient => dec!(0.01),
            Urgency::Balanced => dec!(0.035),
            Urgency::Aggressive => dec!(0.075),
        }
    }

    fn wait(self, config: &EmergencyConfig) -> Duration {
        match self {
            Urgency::Patient => Duration::from_secs(config.wait_long_secs),
            Urgency::Balanced => Duration::from_secs(config.wait_medium_secs),
            Urgency::Aggressive => Duration::from_secs(config.wait_short_secs),
        }
    }
}

/// The leg's resolution once the sell loop stops: either the whole position
/// went out the door (`SoldAll`), or some prefix of it did before the
/// remainder dropped below the tradeable minimum or the deadline hit, in
/// which case `remaining`/`sold_average_price` tell the caller what's left
/// to settle and what the already-sold prefix realized (`None` if nothing
/// sold before the hold/orphan decision).
#[derive(Debug, Clone, PartialEq)]
pub enum LiquidationOutcome {
    SoldAll { average_price: Decimal },
    HoldThroughResolution {
        remaining: Decimal,
        sold_average_price: Option<Decimal>,
    },
    Orphaned {
        remaining: Decimal,
        sold_average_price: Option<Decimal>,
    },
}

pub struct EmergencyLiquidator {
    exchange: Arc<dyn ExchangeClient>,
    clock: Arc<dyn Clock>,
    config: EmergencyConfig,
    tick_size: Decimal,
    min_order_size: Decimal,
}

impl EmergencyLiquidator {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        clock: Arc<dyn Clock>,
        config: EmergencyConfig,
        tick_size: Decimal,
        min_order_size: Decimal,
    ) -> Self {
        Self {
            exchange,
            clock,
            config,
            tick_size,
            min_order_size,
        }
    }

    pub async fn liquidate(
        &self,
        token: &Token,
        mut position: Decimal,
        entry_price: Decimal,
        window_end: DateTime<Utc>,
        progress: &dyn LiquidationProgressSink,
    ) -> Result<LiquidationOutcome, LifecycleError> {
        let mut total_filled = Decimal::ZERO;
        let mut weighted_price_sum = Decimal::ZERO;

        loop {
            let sold_average_price = (total_filled > Decimal::ZERO).then(|| weighted_price_sum / total_filled);
            let now = self.clock.now();
            if now >= window_end - chrono::Duration::seconds(5) {
                return Ok(self
                    .resolve_remaining(token, position, entry_price, sold_average_price)
                    .await?);
            }
            if position < self.min_order_size {
                return Ok(self
                    .resolve_remaining(token, position, entry_price, sold_average_price)
                    .await?);
            }

            let urgency = Urgency::for_remaining(window_end - now);
            let best_bid = self.exchange.best_bid(token).await?;
            let price = round_down_to_tick(
                (best_bid - urgency.drop_step()).max(self.config.fallback_floor),
                self.tick_size,
            );

            let request = BatchOrderRequest {
                token: token.clone(),
                side: OrderSide::Sell,
                price,
                size: position,
                order_type: OrderType::Gtc,
            };
            let acks = self.exchange.place_batch(&[request]).await?;
            let ack = match &acks[0] {
                Ok(ack) => ack.clone(),
                Err(_) => {
                    self.clock.sleep(urgency.wait(&self.config)).await;
                    continue;
                }
            };

            // Wait the urgency-scheduled step, or stop early the moment the
            // fill stream reports this order terminal, whichever comes first
            // (spec.md §4.8 step 2) — no point holding a filled sell open
            // for the rest of the wait window.
            self.wait_for_terminal_or_timeout(&ack.exchange_id, urgency.wait(&self.config))
                .await;

            let snapshot = self.exchange.get_order(&ack.exchange_id).await?;
            let _ = self.exchange.cancel(&ack.exchange_id).await;

            if snapshot.filled_size > Decimal::ZERO {
                total_filled += snapshot.filled_size;
                weighted_price_sum +=
                    snapshot.filled_size * snapshot.average_fill_price.unwrap_or(price);
                position -= snapshot.filled_size;
                progress.record_progress(position).await;
            }

            if position <= Decimal::ZERO {
                let average_price = weighted_price_sum / total_filled;
                info!(token = %token.0, average_price = %average_price, "emergency liquidation sold all");
                return Ok(LiquidationOutcome::SoldAll { average_price });
            }
        }
    }

    /// Races `wait` against the fill stream, returning as soon as either the
    /// timer elapses or a `FillEvent` for `exchange_id` arrives. A lagged or
    /// closed broadcast channel also returns early rather than blocking for
    /// the full wait, since `get_order` right after this call is the source
    /// of truth either way.
    async fn wait_for_terminal_or_timeout(&self, exchange_id: &str, wait: Duration) {
        let mut fills = self.exchange.subscribe_fills();
        let sleep = self.clock.sleep(wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return,
                event = fills.recv() => {
                    match event {
                        Ok(event) if event.exchange_id == exchange_id => return,
                        Ok(_) => continue,
                        Err(_) => return,
                    }
                }
            }
        }
    }

    async fn resolve_remaining(
        &self,
        token: &Token,
        remaining: Decimal,
        entry_price: Decimal,
        sold_average_price: Option<Decimal>,
    ) -> Result<LiquidationOutcome, LifecycleError> {
        if remaining <= Decimal::ZERO {
            return Ok(LiquidationOutcome::HoldThroughResolution {
                remaining,
                sold_average_price,
            });
        }
        let best_bid = self.exchange.best_bid(token).await.unwrap_or(Decimal::ZERO);
        let winning_by_enough = best_bid > entry_price + self.config.min_profit_cents;
        if winning_by_enough && self.config.hold_if_winning {
            info!(token = %token.0, "position winning, holding through resolution");
            Ok(LiquidationOutcome::HoldThroughResolution {
                remaining,
                sold_average_price,
            })
        } else {
            info!(
                token = %token.0,
                hold_if_winning = self.config.hold_if_winning,
                "position below min size and not held, orphaning"
            );
            Ok(LiquidationOutcome::Orphaned {
                remaining,
                sold_average_price,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TestClock;
    use crate::exchange::paper::PaperExchangeClient;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn sells_entire_position_when_bid_is_reachable() {
        let exchange = Arc::new(PaperExchangeClient::default());
        let token = Token("down".into());
        exchange.set_book(&token, dec!(0.20), dec!(0.22));

        let clock = TestClock::new(Utc::now());
        let liquidator = EmergencyLiquidator::new(
            exchange.clone(),
            clock.clone(),
            EmergencyConfig::default(),
            dec!(0.01),
            dec!(5),
        );

        let window_end = clock.now() + chrono::Duration::seconds(700);
        // The liquidator's first step prices below the resting bid, which
        // the paper exchange treats as an immediately marketable GTC sell.
        let outcome = liquidator
            .liquidate(&token, dec!(10), dec!(0.50), window_end, &NoopProgressSink)
            .await
            .unwrap();
        assert!(matches!(outcome, LiquidationOutcome::SoldAll { .. }));
    }

    struct RecordingSink(std::sync::Mutex<Vec<Decimal>>);

    #[async_trait]
    impl LiquidationProgressSink for RecordingSink {
        async fn record_progress(&self, remaining: Decimal) {
            self.0.lock().unwrap().push(remaining);
        }
    }

    #[tokio::test]
    async fn reports_remaining_position_after_each_partial_sale() {
        let exchange = Arc::new(PaperExchangeClient::default());
        let token = Token("down".into());
        exchange.set_book(&token, dec!(0.20), dec!(0.22));

        let clock = TestClock::new(Utc::now());
        let liquidator = EmergencyLiquidator::new(
            exchange,
            clock.clone(),
            EmergencyConfig::default(),
            dec!(0.01),
            dec!(5),
        );

        let sink = RecordingSink(std::sync::Mutex::new(Vec::new()));
        let window_end = clock.now() + chrono::Duration::seconds(700);
        let outcome = liquidator
            .liquidate(&token, dec!(10), dec!(0.50), window_end, &sink)
            .await
            .unwrap();
        assert!(matches!(outcome, LiquidationOutcome::SoldAll { .. }));

        let calls = sink.0.lock().unwrap();
        assert!(!calls.is_empty(), "expected at least one progress report");
        assert_eq!(*calls.last().unwrap(), Decimal::ZERO, "final report should show nothing remaining");
    }

    #[tokio::test]
    async fn orphans_losing_dust_position() {
        let exchange = Arc::new(PaperExchangeClient::default());
        let token = Token("down".into());
        exchange.set_book(&token, dec!(0.10), dec!(0.12));

        let clock = TestClock::new(Utc::now());
        let liquidator = EmergencyLiquidator::new(
            exchange,
            clock.clone(),
            EmergencyConfig::default(),
            dec!(0.01),
            dec!(5),
        );

        let window_end = clock.now() + chrono::Duration::seconds(700);
        let outcome = liquidator
            .liquidate(&token, dec!(2), dec!(0.50), window_end, &NoopProgressSink)
            .await
            .unwrap();
        assert!(matches!(outcome, LiquidationOutcome::Orphaned { remaining, .. } if remaining == dec!(2)));
    }

    #[tokio::test]
    async fn holds_winning_dust_position() {
        let exchange = Arc::new(PaperExchangeClient::default());
        let token = Token("up".into());
        exchange.set_book(&token, dec!(0.90), dec!(0.92));

        let clock = TestClock::new(Utc::now());
        let liquidator = EmergencyLiquidator::new(
            exchange,
            clock.clone(),
            EmergencyConfig::default(),
            dec!(0.01),
            dec!(5),
        );

        let window_end = clock.now() + chrono::Duration::seconds(700);
        let outcome = liquidator
            .liquidate(&token, dec!(2), dec!(0.50), window_end, &NoopProgressSink)
            .await
            .unwrap();
        assert!(matches!(outcome, LiquidationOutcome::HoldThroughResolution { remaining, .. } if remaining == dec!(2)));
    }
}
