//! Shared data model (spec.md §3): `Market`, `Token`, `Order`, `Leg`,
//! `TradeRecord`, and the global invariants they must uphold.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One outcome token of a `Market`. Pays 1.0 collateral on win, 0.0 on loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token(pub String);

/// A resolvable 15-minute window for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub symbol: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub up_token: Token,
    pub down_token: Token,
    pub tick_size: Decimal,
}

impl Market {
    pub fn token_for(&self, side: Side) -> &Token {
        match side {
            Side::Up => &self.up_token,
            Side::Down => &self.down_token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Up,
    Down,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Up => Side::Down,
            Side::Down => Side::Up,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    PostOnly,
    Gtc,
}

/// Order lifecycle states (spec.md §3). Terminal: `Filled`, `Canceled`,
/// `RejectedCrossing`, `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    /// Accepted by the exchange but not yet re-confirmed (`AtomicPlacer` step 2).
    PendingVerify,
    Live,
    PartiallyFilled,
    Filled,
    Canceled,
    RejectedCrossing,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::RejectedCrossing
                | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub exchange_id: Option<String>,
    pub token: Token,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub filled_size: Decimal,
    pub average_fill_price: Option<Decimal>,
}

impl Order {
    /// Invariant: `filled_size <= size`; `Filled` implies `filled_size == size`.
    pub fn check_invariant(&self) -> bool {
        if self.filled_size > self.size {
            return false;
        }
        if self.status == OrderStatus::Filled && self.filled_size != self.size {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum Role {
    Entry,
    Hedge,
}

/// One side of an atomic pair. An atomic pair has exactly two `Leg`s, on
/// opposite tokens of the same `Market`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub role: Role,
    pub order: Order,
    pub intended_size: Decimal,
    pub intended_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOutcome {
    Open,
    HedgedComplete,
    EmergencySold,
    PreSettled,
    ResolvedWin,
    ResolvedLoss,
    Orphaned,
    CanceledUnfilled,
}

/// One durable row per `Leg`. The pair is linked by a shared `pair_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub pair_id: String,
    pub role: Role,
    pub symbol: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub side: Side,
    pub entry_price: Decimal,
    pub filled_size: Decimal,
    pub bet_collateral: Decimal,
    pub order_id: Option<String>,
    pub order_status: OrderStatus,
    pub outcome: TradeOutcome,
    pub exit_price: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Opaque signal-snapshot fields (spec.md §6.3); never interpreted by the core.
    pub signal_confidence: Option<f64>,
    pub signal_bias: Option<String>,
    pub signal_p_yes: Option<f64>,
}

impl TradeRecord {
    /// Invariant: every non-terminal record points to at most one LIVE order.
    pub fn is_open(&self) -> bool {
        self.outcome == TradeOutcome::Open
    }
}
