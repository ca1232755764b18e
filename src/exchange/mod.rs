//! `ExchangeClient`: the narrow capability surface the core consumes from
//! the CLOB (spec.md §4.2, §6.1). Transient errors are retried here with
//! bounded backoff; every other layer treats a call as atomic — success or
//! a typed failure.

pub mod clob;
pub mod paper;

use crate::core::Clock;
use crate::domain::{OrderStatus, OrderType, Token};
use crate::error::ExchangeError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BatchOrderRequest {
    pub token: Token,
    pub side: crate::domain::OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub order_type: OrderType,
}

#[derive(Debug, Clone)]
pub struct BatchOrderAck {
    pub exchange_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone)]
pub struct OrderStatusSnapshot {
    pub status: OrderStatus,
    pub filled_size: Decimal,
    pub average_fill_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct FillEvent {
    pub exchange_id: String,
    pub filled_size: Decimal,
    pub price: Decimal,
    pub ts: DateTime<Utc>,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Places 1-2 orders in a single batch (spec.md §6.1: up to 15 allowed
    /// by the wire contract, the core only ever submits an atomic pair).
    /// Each element of the result corresponds positionally to `orders`.
    async fn place_batch(
        &self,
        orders: &[BatchOrderRequest],
    ) -> Result<Vec<Result<BatchOrderAck, ExchangeError>>, ExchangeError>;

    async fn get_order(&self, exchange_id: &str) -> Result<OrderStatusSnapshot, ExchangeError>;

    /// Idempotent; a 404/"not found" from the exchange is treated as success.
    async fn cancel(&self, exchange_id: &str) -> Result<bool, ExchangeError>;

    async fn best_bid(&self, token: &Token) -> Result<Decimal, ExchangeError>;

    async fn best_ask(&self, token: &Token) -> Result<Decimal, ExchangeError>;

    async fn balance(&self) -> Result<Decimal, ExchangeError>;

    /// Authenticated fills stream; implementations reconnect transparently.
    fn subscribe_fills(&self) -> broadcast::Receiver<FillEvent>;
}

/// Retries a transient-failing operation with exponential backoff
/// (base 1s, factor 2, max 3 attempts), per spec.md §4.2. Sleeps through the
/// injected `Clock` rather than `tokio::time::sleep` directly, so a
/// `TestClock`-driven test can exercise a retry path deterministically
/// without actually waiting out the backoff.
pub async fn retry_with_backoff<F, Fut, T>(clock: &dyn Clock, mut op: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExchangeError>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    const BASE_DELAY: Duration = Duration::from_secs(1);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(ExchangeError::Transient(msg)) if attempt < MAX_ATTEMPTS => {
                let delay = BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(attempt, %msg, delay_ms = %delay.as_millis(), "retrying transient exchange error");
                clock.sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TestClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let clock = TestClock::new(Utc::now());
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(clock.as_ref(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::Transient("boom".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget_exhausted() {
        let clock = TestClock::new(Utc::now());
        let result: Result<(), ExchangeError> =
            retry_with_backoff(clock.as_ref(), || async { Err(ExchangeError::Transient("boom".into())) }).await;
        assert!(matches!(result, Err(ExchangeError::Transient(_))));
    }

    #[tokio::test]
    async fn retry_does_not_retry_non_transient_errors() {
        let clock = TestClock::new(Utc::now());
        let calls = AtomicU32::new(0);
        let result: Result<(), ExchangeError> = retry_with_backoff(clock.as_ref(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Crossing) }
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::Crossing)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
