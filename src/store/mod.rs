//! Durable `TradeRecord` persistence (spec.md §4.1, §6.3).
//!
//! Backed by `rusqlite` behind a single `Arc<Mutex<Connection>>`, the same
//! shape as the teacher's `VaultDb`/`ArtifactStore`: WAL mode, one writer,
//! concurrent readers, an append-only `schema_version` table driving a
//! registered, ordered, idempotent migration list.

mod schema;

use crate::domain::{OrderStatus, Role, Side, TradeOutcome, TradeRecord};
use crate::error::StoreError;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub use schema::CURRENT_SCHEMA_VERSION;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Partial update applied within a single transaction by `update_trade_record`.
#[derive(Debug, Clone, Default)]
pub struct TradeRecordPatch {
    pub filled_size: Option<Decimal>,
    pub order_id: Option<Option<String>>,
    pub order_status: Option<OrderStatus>,
    pub outcome: Option<TradeOutcome>,
    pub exit_price: Option<Option<Decimal>>,
    pub pnl: Option<Option<Decimal>>,
    pub settled_at: Option<Option<DateTime<Utc>>>,
    pub signal_confidence: Option<Option<f64>>,
    pub signal_bias: Option<Option<String>>,
    pub signal_p_yes: Option<Option<f64>>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Applies every registered migration step that hasn't run yet. Never
    /// reverses, never mutates a step already applied. Safe to call twice.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        schema::migrate(&conn)
    }

    /// Runs `f` against a single transaction cursor; commits on `Ok`, rolls
    /// back on `Err`. Callers that need to perform several writes atomically
    /// (e.g. `AtomicPlacer` persisting both legs) pass a closure that issues
    /// all of them against the supplied `Transaction` — never opening a
    /// second connection, which is what would deadlock the single writer.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub async fn insert_trade_record(&self, rec: &TradeRecord) -> Result<i64, StoreError> {
        self.transaction(|tx| insert_trade_record_tx(tx, rec)).await
    }

    pub async fn update_trade_record(
        &self,
        id: i64,
        patch: &TradeRecordPatch,
    ) -> Result<(), StoreError> {
        self.transaction(|tx| update_trade_record_tx(tx, id, patch))
            .await
    }

    pub async fn list_open_trades(&self) -> Result<Vec<TradeRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM trades WHERE outcome = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![outcome_str(TradeOutcome::Open)], row_to_trade_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn list_trades_for_window(
        &self,
        symbol: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM trades WHERE symbol = ?1 AND window_start = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![symbol, window_start.timestamp()], row_to_trade_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

pub(crate) fn insert_trade_record_tx(
    tx: &Transaction,
    rec: &TradeRecord,
) -> Result<i64, StoreError> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM trades WHERE pair_id = ?1 AND role = ?2",
            params![rec.pair_id, role_str(rec.role)],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(StoreError::Conflict {
            pair_id: rec.pair_id.clone(),
            role: format!("{:?}", rec.role),
        });
    }

    tx.execute(
        "INSERT INTO trades (
            pair_id, role, symbol, window_start, window_end, side, entry_price,
            filled_size, bet_collateral, order_id, order_status, outcome,
            exit_price, pnl, created_at, settled_at,
            signal_confidence, signal_bias, signal_p_yes
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
        params![
            rec.pair_id,
            role_str(rec.role),
            rec.symbol,
            rec.window_start.timestamp(),
            rec.window_end.timestamp(),
            side_str(rec.side),
            rec.entry_price.to_string(),
            rec.filled_size.to_string(),
            rec.bet_collateral.to_string(),
            rec.order_id,
            order_status_str(rec.order_status),
            outcome_str(rec.outcome),
            rec.exit_price.map(|d| d.to_string()),
            rec.pnl.map(|d| d.to_string()),
            rec.created_at.timestamp(),
            rec.settled_at.map(|t| t.timestamp()),
            rec.signal_confidence,
            rec.signal_bias,
            rec.signal_p_yes,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

pub(crate) fn update_trade_record_tx(
    tx: &Transaction,
    id: i64,
    patch: &TradeRecordPatch,
) -> Result<(), StoreError> {
    let affected = tx
        .query_row("SELECT id FROM trades WHERE id = ?1", params![id], |row| {
            row.get::<_, i64>(0)
        })
        .optional()?;
    if affected.is_none() {
        return Err(StoreError::NotFound(id.to_string()));
    }

    if let Some(v) = &patch.filled_size {
        tx.execute(
            "UPDATE trades SET filled_size = ?1 WHERE id = ?2",
            params![v.to_string(), id],
        )?;
    }
    if let Some(v) = &patch.order_id {
        tx.execute(
            "UPDATE trades SET order_id = ?1 WHERE id = ?2",
            params![v, id],
        )?;
    }
    if let Some(v) = &patch.order_status {
        tx.execute(
            "UPDATE trades SET order_status = ?1 WHERE id = ?2",
            params![order_status_str(*v), id],
        )?;
    }
    if let Some(v) = &patch.outcome {
        tx.execute(
            "UPDATE trades SET outcome = ?1 WHERE id = ?2",
            params![outcome_str(*v), id],
        )?;
    }
    if let Some(v) = &patch.exit_price {
        tx.execute(
            "UPDATE trades SET exit_price = ?1 WHERE id = ?2",
            params![v.map(|d| d.to_string()), id],
        )?;
    }
    if let Some(v) = &patch.pnl {
        tx.execute(
            "UPDATE trades SET pnl = ?1 WHERE id = ?2",
            params![v.map(|d| d.to_string()), id],
        )?;
    }
    if let Some(v) = &patch.settled_at {
        tx.execute(
            "UPDATE trades SET settled_at = ?1 WHERE id = ?2",
            params![v.map(|t| t.timestamp()), id],
        )?;
    }
    if let Some(v) = &patch.signal_confidence {
        tx.execute(
            "UPDATE trades SET signal_confidence = ?1 WHERE id = ?2",
            params![v, id],
        )?;
    }
    if let Some(v) = &patch.signal_bias {
        tx.execute(
            "UPDATE trades SET signal_bias = ?1 WHERE id = ?2",
            params![v, id],
        )?;
    }
    if let Some(v) = &patch.signal_p_yes {
        tx.execute(
            "UPDATE trades SET signal_p_yes = ?1 WHERE id = ?2",
            params![v, id],
        )?;
    }
    Ok(())
}

fn role_str(r: Role) -> &'static str {
    match r {
        Role::Entry => "ENTRY",
        Role::Hedge => "HEDGE",
    }
}

fn role_from_str(s: &str) -> Role {
    match s {
        "HEDGE" => Role::Hedge,
        _ => Role::Entry,
    }
}

fn side_str(s: Side) -> &'static str {
    match s {
        Side::Up => "UP",
        Side::Down => "DOWN",
    }
}

fn side_from_str(s: &str) -> Side {
    match s {
        "DOWN" => Side::Down,
        _ => Side::Up,
    }
}

fn order_status_str(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::Pending => "PENDING",
        OrderStatus::PendingVerify => "PENDING_VERIFY",
        OrderStatus::Live => "LIVE",
        OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
        OrderStatus::Filled => "FILLED",
        OrderStatus::Canceled => "CANCELED",
        OrderStatus::RejectedCrossing => "REJECTED_CROSSING",
        OrderStatus::Expired => "EXPIRED",
    }
}

fn order_status_from_str(s: &str) -> OrderStatus {
    match s {
        "PENDING_VERIFY" => OrderStatus::PendingVerify,
        "LIVE" => OrderStatus::Live,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED_CROSSING" => OrderStatus::RejectedCrossing,
        "EXPIRED" => OrderStatus::Expired,
        _ => OrderStatus::Pending,
    }
}

fn outcome_str(o: TradeOutcome) -> &'static str {
    match o {
        TradeOutcome::Open => "OPEN",
        TradeOutcome::HedgedComplete => "HEDGED_COMPLETE",
        TradeOutcome::EmergencySold => "EMERGENCY_SOLD",
        TradeOutcome::PreSettled => "PRE_SETTLED",
        TradeOutcome::ResolvedWin => "RESOLVED_WIN",
        TradeOutcome::ResolvedLoss => "RESOLVED_LOSS",
        TradeOutcome::Orphaned => "ORPHANED",
        TradeOutcome::CanceledUnfilled => "CANCELED_UNFILLED",
    }
}

fn outcome_from_str(s: &str) -> TradeOutcome {
    match s {
        "HEDGED_COMPLETE" => TradeOutcome::HedgedComplete,
        "EMERGENCY_SOLD" => TradeOutcome::EmergencySold,
        "PRE_SETTLED" => TradeOutcome::PreSettled,
        "RESOLVED_WIN" => TradeOutcome::ResolvedWin,
        "RESOLVED_LOSS" => TradeOutcome::ResolvedLoss,
        "ORPHANED" => TradeOutcome::Orphaned,
        "CANCELED_UNFILLED" => TradeOutcome::CanceledUnfilled,
        _ => TradeOutcome::Open,
    }
}

fn row_to_trade_record(row: &rusqlite::Row) -> rusqlite::Result<TradeRecord> {
    let decimal_col = |s: Option<String>| -> Option<Decimal> { s.and_then(|v| Decimal::from_str(&v).ok()) };

    Ok(TradeRecord {
        id: row.get("id")?,
        pair_id: row.get("pair_id")?,
        role: role_from_str(&row.get::<_, String>("role")?),
        symbol: row.get("symbol")?,
        window_start: Utc.timestamp_opt(row.get("window_start")?, 0).unwrap(),
        window_end: Utc.timestamp_opt(row.get("window_end")?, 0).unwrap(),
        side: side_from_str(&row.get::<_, String>("side")?),
        entry_price: Decimal::from_str(&row.get::<_, String>("entry_price")?).unwrap_or_default(),
        filled_size: Decimal::from_str(&row.get::<_, String>("filled_size")?).unwrap_or_default(),
        bet_collateral: Decimal::from_str(&row.get::<_, String>("bet_collateral")?)
            .unwrap_or_default(),
        order_id: row.get("order_id")?,
        order_status: order_status_from_str(&row.get::<_, String>("order_status")?),
        outcome: outcome_from_str(&row.get::<_, String>("outcome")?),
        exit_price: decimal_col(row.get("exit_price")?),
        pnl: decimal_col(row.get("pnl")?),
        created_at: Utc.timestamp_opt(row.get("created_at")?, 0).unwrap(),
        settled_at: row
            .get::<_, Option<i64>>("settled_at")?
            .map(|ts| Utc.timestamp_opt(ts, 0).unwrap()),
        signal_confidence: row.get("signal_confidence")?,
        signal_bias: row.get("signal_bias")?,
        signal_p_yes: row.get("signal_p_yes")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;
    use rust_decimal_macros::dec;

    fn sample_record(pair_id: &str, role: Role) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            id: None,
            pair_id: pair_id.to_string(),
            role,
            symbol: "BTC".to_string(),
            window_start: now,
            window_end: now + chrono::Duration::seconds(900),
            side: Side::Up,
            entry_price: dec!(0.52),
            filled_size: dec!(0),
            bet_collateral: dec!(10),
            order_id: None,
            order_status: OrderStatus::Pending,
            outcome: TradeOutcome::Open,
            exit_price: None,
            pnl: None,
            created_at: now,
            settled_at: None,
            signal_confidence: Some(0.65),
            signal_bias: Some("UP".to_string()),
            signal_p_yes: Some(0.52),
        }
    }

    #[tokio::test]
    async fn insert_and_list_open_trades() {
        let store = Store::open_in_memory().unwrap();
        store.migrate().await.unwrap();

        let rec = sample_record("pair-1", Role::Entry);
        let id = store.insert_trade_record(&rec).await.unwrap();
        assert!(id > 0);

        let open = store.list_open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].pair_id, "pair-1");
    }

    #[tokio::test]
    async fn duplicate_pair_role_conflicts() {
        let store = Store::open_in_memory().unwrap();
        store.migrate().await.unwrap();

        let rec = sample_record("pair-1", Role::Entry);
        store.insert_trade_record(&rec).await.unwrap();
        let err = store.insert_trade_record(&rec).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn update_trade_record_patches_fields() {
        let store = Store::open_in_memory().unwrap();
        store.migrate().await.unwrap();

        let rec = sample_record("pair-2", Role::Hedge);
        let id = store.insert_trade_record(&rec).await.unwrap();

        let patch = TradeRecordPatch {
            filled_size: Some(dec!(5.0)),
            order_status: Some(OrderStatus::Filled),
            outcome: Some(TradeOutcome::HedgedComplete),
            ..Default::default()
        };
        store.update_trade_record(id, &patch).await.unwrap();

        let open = store.list_open_trades().await.unwrap();
        assert!(open.is_empty(), "record is no longer OPEN");
    }

    #[tokio::test]
    async fn update_missing_record_errors() {
        let store = Store::open_in_memory().unwrap();
        store.migrate().await.unwrap();
        let err = store
            .update_trade_record(9999, &TradeRecordPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }
}
