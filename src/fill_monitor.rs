//! `FillMonitor` (spec.md §4.7): polls two LIVE legs until both fill, the
//! deadline expires, or a terminal mix is reached. Cancels any still-LIVE
//! order synchronously before returning, tolerating 404 as success.

use crate::core::Clock;
use crate::domain::{Order, OrderStatus, Role};
use crate::error::LifecycleError;
use crate::exchange::ExchangeClient;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    BothFilled { entry: Order, hedge: Order },
    OneFilled { filled: Role, filled_order: Order, other: Order },
    PartialOne {
        filled: Role,
        filled_order: Order,
        partial_shares: Decimal,
        other: Order,
    },
    NeitherFilled { entry: Order, hedge: Order },
}

pub struct FillMonitor {
    exchange: Arc<dyn ExchangeClient>,
    clock: Arc<dyn Clock>,
    fill_timeout: Duration,
    poll_interval: Duration,
    min_order_size: Decimal,
}

impl FillMonitor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        clock: Arc<dyn Clock>,
        fill_timeout: Duration,
        poll_interval: Duration,
        min_order_size: Decimal,
    ) -> Self {
        Self {
            exchange,
            clock,
            fill_timeout,
            poll_interval,
            min_order_size,
        }
    }

    pub async fn monitor(
        &self,
        mut entry: Order,
        mut hedge: Order,
    ) -> Result<MonitorOutcome, LifecycleError> {
        let deadline = self.clock.now()
            + chrono::Duration::from_std(self.fill_timeout).unwrap_or(chrono::Duration::seconds(120));

        loop {
            self.refresh(&mut entry).await?;
            self.refresh(&mut hedge).await?;

            if entry.status == OrderStatus::Filled && hedge.status == OrderStatus::Filled {
                info!("both legs filled");
                return Ok(MonitorOutcome::BothFilled { entry, hedge });
            }

            if self.clock.now() >= deadline {
                return Ok(self.resolve_at_deadline(entry, hedge).await?);
            }

            self.clock.sleep(self.poll_interval).await;
        }
    }

    async fn refresh(&self, order: &mut Order) -> Result<(), LifecycleError> {
        if order.status.is_terminal() {
            return Ok(());
        }
        let Some(exchange_id) = order.exchange_id.clone() else {
            return Ok(());
        };
        let snapshot = self.exchange.get_order(&exchange_id).await?;
        order.filled_size = snapshot.filled_size;
        order.average_fill_price = snapshot.average_fill_price;
        order.status = snapshot.status;
        Ok(())
    }

    async fn resolve_at_deadline(
        &self,
        entry: Order,
        hedge: Order,
    ) -> Result<MonitorOutcome, LifecycleError> {
        let entry_sufficient = entry.filled_size >= self.min_order_size;
        let hedge_sufficient = hedge.filled_size >= self.min_order_size;

        let outcome = match (entry_sufficient, hedge_sufficient) {
            (true, true) => MonitorOutcome::BothFilled { entry, hedge },
            (true, false) if hedge.filled_size > Decimal::ZERO => MonitorOutcome::PartialOne {
                filled: Role::Entry,
                partial_shares: hedge.filled_size,
                filled_order: entry,
                other: hedge,
            },
            (true, false) => MonitorOutcome::OneFilled {
                filled: Role::Entry,
                filled_order: entry,
                other: hedge,
            },
            (false, true) if entry.filled_size > Decimal::ZERO => MonitorOutcome::PartialOne {
                filled: Role::Hedge,
                partial_shares: entry.filled_size,
                filled_order: hedge,
                other: entry,
            },
            (false, true) => MonitorOutcome::OneFilled {
                filled: Role::Hedge,
                filled_order: hedge,
                other: entry,
            },
            (false, false) => MonitorOutcome::NeitherFilled { entry, hedge },
        };

        self.cancel_live_legs(&outcome).await;
        Ok(outcome)
    }

    async fn cancel_live_legs(&self, outcome: &MonitorOutcome) {
        let live_orders: Vec<&Order> = match outcome {
            MonitorOutcome::BothFilled { .. } => vec![],
            MonitorOutcome::OneFilled { other, .. } => vec![other],
            MonitorOutcome::PartialOne { other, .. } => vec![other],
            MonitorOutcome::NeitherFilled { entry, hedge } => vec![entry, hedge],
        };
        for order in live_orders {
            if order.status.is_terminal() {
                continue;
            }
            if let Some(exchange_id) = &order.exchange_id {
                let _ = self.exchange.cancel(exchange_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TestClock;
    use crate::domain::{OrderSide, OrderType, Token};
    use crate::exchange::paper::PaperExchangeClient;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn live_order(exchange_id: &str, token: &str, size: Decimal) -> Order {
        Order {
            exchange_id: Some(exchange_id.to_string()),
            token: Token(token.to_string()),
            side: OrderSide::Buy,
            price: dec!(0.40),
            size,
            order_type: OrderType::PostOnly,
            status: OrderStatus::Live,
            filled_size: Decimal::ZERO,
            average_fill_price: None,
        }
    }

    #[tokio::test]
    async fn both_filled_returns_both_filled_outcome() {
        let exchange = Arc::new(PaperExchangeClient::default());
        exchange.set_book(&Token("up".into()), dec!(0.40), dec!(0.42));
        exchange.set_book(&Token("down".into()), dec!(0.50), dec!(0.52));

        let up_ack = exchange
            .place_batch(&[crate::exchange::BatchOrderRequest {
                token: Token("up".into()),
                side: OrderSide::Buy,
                price: dec!(0.39),
                size: dec!(10),
                order_type: OrderType::PostOnly,
            }])
            .await
            .unwrap();
        let entry_id = up_ack[0].as_ref().unwrap().exchange_id.clone();
        exchange.inject_fill(&entry_id, dec!(10), dec!(0.39));

        let down_ack = exchange
            .place_batch(&[crate::exchange::BatchOrderRequest {
                token: Token("down".into()),
                side: OrderSide::Buy,
                price: dec!(0.49),
                size: dec!(10),
                order_type: OrderType::PostOnly,
            }])
            .await
            .unwrap();
        let hedge_id = down_ack[0].as_ref().unwrap().exchange_id.clone();
        exchange.inject_fill(&hedge_id, dec!(10), dec!(0.49));

        let clock = TestClock::new(Utc::now());
        let monitor = FillMonitor::new(
            exchange,
            clock,
            Duration::from_secs(120),
            Duration::from_secs(5),
            dec!(5),
        );

        let entry = live_order(&entry_id, "up", dec!(10));
        let hedge = live_order(&hedge_id, "down", dec!(10));

        let outcome = monitor.monitor(entry, hedge).await.unwrap();
        assert!(matches!(outcome, MonitorOutcome::BothFilled { .. }));
    }

    #[tokio::test]
    async fn neither_filled_cancels_both_at_deadline() {
        let exchange = Arc::new(PaperExchangeClient::default());
        exchange.set_book(&Token("up".into()), dec!(0.40), dec!(0.42));
        exchange.set_book(&Token("down".into()), dec!(0.50), dec!(0.52));

        let up_ack = exchange
            .place_batch(&[crate::exchange::BatchOrderRequest {
                token: Token("up".into()),
                side: OrderSide::Buy,
                price: dec!(0.39),
                size: dec!(10),
                order_type: OrderType::PostOnly,
            }])
            .await
            .unwrap();
        let entry_id = up_ack[0].as_ref().unwrap().exchange_id.clone();

        let down_ack = exchange
            .place_batch(&[crate::exchange::BatchOrderRequest {
                token: Token("down".into()),
                side: OrderSide::Buy,
                price: dec!(0.49),
                size: dec!(10),
                order_type: OrderType::PostOnly,
            }])
            .await
            .unwrap();
        let hedge_id = down_ack[0].as_ref().unwrap().exchange_id.clone();

        let clock = TestClock::new(Utc::now());
        let monitor = FillMonitor::new(
            exchange.clone(),
            clock.clone(),
            Duration::from_secs(10),
            Duration::from_secs(5),
            dec!(5),
        );

        let entry = live_order(&entry_id, "up", dec!(10));
        let hedge = live_order(&hedge_id, "down", dec!(10));

        let outcome = monitor.monitor(entry, hedge).await.unwrap();
        assert!(matches!(outcome, MonitorOutcome::NeitherFilled { .. }));
        assert_eq!(exchange.order_status(&entry_id), Some(OrderStatus::Canceled));
        assert_eq!(exchange.order_status(&hedge_id), Some(OrderStatus::Canceled));
    }

    #[tokio::test]
    async fn partial_one_reports_the_insufficient_legs_own_fill_size() {
        let exchange = Arc::new(PaperExchangeClient::default());
        exchange.set_book(&Token("up".into()), dec!(0.40), dec!(0.42));
        exchange.set_book(&Token("down".into()), dec!(0.50), dec!(0.52));

        let up_ack = exchange
            .place_batch(&[crate::exchange::BatchOrderRequest {
                token: Token("up".into()),
                side: OrderSide::Buy,
                price: dec!(0.39),
                size: dec!(6),
                order_type: OrderType::PostOnly,
            }])
            .await
            .unwrap();
        let entry_id = up_ack[0].as_ref().unwrap().exchange_id.clone();
        exchange.inject_fill(&entry_id, dec!(6), dec!(0.39));

        let down_ack = exchange
            .place_batch(&[crate::exchange::BatchOrderRequest {
                token: Token("down".into()),
                side: OrderSide::Buy,
                price: dec!(0.49),
                size: dec!(6),
                order_type: OrderType::PostOnly,
            }])
            .await
            .unwrap();
        let hedge_id = down_ack[0].as_ref().unwrap().exchange_id.clone();
        // Hedge only partially fills: 3.77 of 6.0, below the 5.0 minimum.
        exchange.inject_fill(&hedge_id, dec!(3.77), dec!(0.49));

        let clock = TestClock::new(Utc::now());
        let monitor = FillMonitor::new(
            exchange,
            clock,
            Duration::from_secs(10),
            Duration::from_secs(5),
            dec!(5),
        );

        let entry = live_order(&entry_id, "up", dec!(6));
        let hedge = live_order(&hedge_id, "down", dec!(6));

        let outcome = monitor.monitor(entry, hedge).await.unwrap();
        match outcome {
            MonitorOutcome::PartialOne {
                filled,
                partial_shares,
                other,
                ..
            } => {
                assert_eq!(filled, Role::Entry);
                assert_eq!(partial_shares, dec!(3.77));
                assert_eq!(other.filled_size, dec!(3.77));
            }
            other => panic!("expected PartialOne, got {other:?}"),
        }
    }
}
