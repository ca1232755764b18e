//! Crate-wide error taxonomy.
//!
//! Each component returns one of these typed kinds (spec.md §7); only
//! `TradeLifecycle` is allowed to pattern-match on them and decide a state
//! transition. Everything above the lifecycle (the `Scheduler`, `main.rs`)
//! treats a `CoreError` as opaque and surfaces it via `anyhow`.

use thiserror::Error;

/// Validation failures: never retried, the lifecycle goes to `IdleSkipped`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PricingError {
    #[error("entry side has no resting bid")]
    NoMarket,
    #[error("combined entry+hedge price {combined} exceeds cap {cap}")]
    NotProfitable { combined: f64, cap: f64 },
    #[error("sized position {size} below exchange minimum {min}")]
    BelowMin { size: f64, min: f64 },
}

/// Failures returned by an `ExchangeClient` operation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("post-only order would cross the book")]
    Crossing,
    #[error("insufficient funds for order")]
    InsufficientFunds,
    #[error("order {0} not found")]
    NotFound(String),
    #[error("transient exchange error: {0}")]
    Transient(String),
}

/// Failures surfaced by the durable `Store`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("trade record conflict for pair {pair_id} role {role:?}")]
    Conflict { pair_id: String, role: String },
    #[error("trade record {0} not found")]
    NotFound(String),
    #[error("schema version {found} is ahead of binary (expected <= {supported})")]
    SchemaAhead { found: u32, supported: u32 },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Top-level error a `TradeLifecycle` step can fail with.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unrecoverable: {0}")]
    Fatal(String),
}
