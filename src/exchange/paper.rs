//! Deterministic paper `ExchangeClient`, grounded in
//! `vault::execution::PaperExecutionAdapter`. Unlike the teacher's version
//! (randomized latency/slippage/partial fills for backtest realism) this one
//! is driven by an explicit order book snapshot and a scripted fill plan, so
//! lifecycle tests can assert exact sequences instead of tolerating jitter.

use super::{BatchOrderAck, BatchOrderRequest, ExchangeClient, FillEvent, OrderStatusSnapshot};
use crate::domain::{OrderSide, OrderStatus, OrderType, Token};
use crate::error::ExchangeError;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
struct OpenOrder {
    token: Token,
    side: OrderSide,
    price: Decimal,
    size: Decimal,
    order_type: OrderType,
    status: OrderStatus,
    filled_size: Decimal,
    average_fill_price: Option<Decimal>,
}

/// In-memory paper exchange. Book prices and per-token behavior can be
/// scripted from tests; defaults to always-crossable GTC fills at the
/// requested price so production-style code paths exercise cleanly.
pub struct PaperExchangeClient {
    orders: DashMap<String, OpenOrder>,
    next_id: AtomicU64,
    bids: DashMap<String, Decimal>,
    asks: DashMap<String, Decimal>,
    balance: Mutex<Decimal>,
    fills_tx: broadcast::Sender<FillEvent>,
    reject_post_only_crossing: bool,
}

impl Default for PaperExchangeClient {
    fn default() -> Self {
        Self::new(dec!(10000))
    }
}

impl PaperExchangeClient {
    pub fn new(starting_balance: Decimal) -> Self {
        let (fills_tx, _) = broadcast::channel(256);
        Self {
            orders: DashMap::new(),
            next_id: AtomicU64::new(1),
            bids: DashMap::new(),
            asks: DashMap::new(),
            balance: Mutex::new(starting_balance),
            fills_tx,
            reject_post_only_crossing: true,
        }
    }

    pub fn set_book(&self, token: &Token, bid: Decimal, ask: Decimal) {
        self.bids.insert(token.0.clone(), bid);
        self.asks.insert(token.0.clone(), ask);
    }

    /// Test hook: mark an order filled (fully or partially) and emit a
    /// `FillEvent`, simulating an asynchronous exchange fill notification.
    pub fn inject_fill(&self, exchange_id: &str, fill_size: Decimal, fill_price: Decimal) {
        if let Some(mut entry) = self.orders.get_mut(exchange_id) {
            let new_filled = entry.filled_size + fill_size;
            entry.filled_size = new_filled;
            entry.average_fill_price = Some(fill_price);
            entry.status = if new_filled >= entry.size {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            let _ = self.fills_tx.send(FillEvent {
                exchange_id: exchange_id.to_string(),
                filled_size: fill_size,
                price: fill_price,
                ts: Utc::now(),
            });
        }
    }

    pub fn order_status(&self, exchange_id: &str) -> Option<OrderStatus> {
        self.orders.get(exchange_id).map(|o| o.status)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchangeClient {
    async fn place_batch(
        &self,
        orders: &[BatchOrderRequest],
    ) -> Result<Vec<Result<BatchOrderAck, ExchangeError>>, ExchangeError> {
        let mut out = Vec::with_capacity(orders.len());
        for req in orders {
            let would_cross = match req.side {
                OrderSide::Buy => self
                    .asks
                    .get(&req.token.0)
                    .map(|ask| req.price >= *ask)
                    .unwrap_or(false),
                OrderSide::Sell => self
                    .bids
                    .get(&req.token.0)
                    .map(|bid| req.price <= *bid)
                    .unwrap_or(false),
            };

            if req.order_type == OrderType::PostOnly && would_cross && self.reject_post_only_crossing {
                out.push(Err(ExchangeError::Crossing));
                continue;
            }

            let exchange_id = format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst));

            // A marketable GTC order (crosses the book) fills immediately,
            // same as a real exchange would match it on arrival.
            let (status, filled_size, average_fill_price) =
                if req.order_type == OrderType::Gtc && would_cross {
                    (OrderStatus::Filled, req.size, Some(req.price))
                } else {
                    (OrderStatus::Live, Decimal::ZERO, None)
                };

            self.orders.insert(
                exchange_id.clone(),
                OpenOrder {
                    token: req.token.clone(),
                    side: req.side,
                    price: req.price,
                    size: req.size,
                    order_type: req.order_type,
                    status,
                    filled_size,
                    average_fill_price,
                },
            );
            out.push(Ok(BatchOrderAck { exchange_id, status }));
        }
        Ok(out)
    }

    async fn get_order(&self, exchange_id: &str) -> Result<OrderStatusSnapshot, ExchangeError> {
        let entry = self
            .orders
            .get(exchange_id)
            .ok_or_else(|| ExchangeError::NotFound(exchange_id.to_string()))?;
        Ok(OrderStatusSnapshot {
            status: entry.status,
            filled_size: entry.filled_size,
            average_fill_price: entry.average_fill_price,
        })
    }

    async fn cancel(&self, exchange_id: &str) -> Result<bool, ExchangeError> {
        match self.orders.get_mut(exchange_id) {
            Some(mut entry) => {
                if entry.status.is_terminal() {
                    return Ok(true);
                }
                entry.status = OrderStatus::Canceled;
                Ok(true)
            }
            None => Ok(true),
        }
    }

    async fn best_bid(&self, token: &Token) -> Result<Decimal, ExchangeError> {
        self.bids
            .get(&token.0)
            .map(|v| *v)
            .ok_or_else(|| ExchangeError::NotFound(token.0.clone()))
    }

    async fn best_ask(&self, token: &Token) -> Result<Decimal, ExchangeError> {
        self.asks
            .get(&token.0)
            .map(|v| *v)
            .ok_or_else(|| ExchangeError::NotFound(token.0.clone()))
    }

    async fn balance(&self) -> Result<Decimal, ExchangeError> {
        Ok(*self.balance.lock().unwrap())
    }

    fn subscribe_fills(&self) -> broadcast::Receiver<FillEvent> {
        self.fills_tx.subscribe()
    }
}
