//! Registered, ordered, idempotent schema migrations.
//!
//! Grounded in the teacher's `backtest_v2::artifact_store` schema-version
//! table: a `schema_version` row tracks the highest applied step; each step
//! checks-before-altering (`PRAGMA table_info`) so re-running `migrate()`
//! is a no-op. Columns are never renamed or dropped — an obsolete column is
//! left in place and simply stops being written.

use crate::error::StoreError;
use rusqlite::Connection;
use tracing::info;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

type MigrationStep = fn(&Connection) -> Result<(), StoreError>;

const MIGRATIONS: &[(u32, MigrationStep)] = &[(1, migrate_v1)];

pub(crate) fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL)",
        [],
    )?;

    let current_version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::SchemaAhead {
            found: current_version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    for (version, step) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }
        step(conn)?;
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, chrono::Utc::now().timestamp()],
        )?;
        info!(version = %version, "applied store migration");
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pair_id TEXT NOT NULL,
            role TEXT NOT NULL,
            symbol TEXT NOT NULL,
            window_start INTEGER NOT NULL,
            window_end INTEGER NOT NULL,
            side TEXT NOT NULL,
            entry_price TEXT NOT NULL,
            filled_size TEXT NOT NULL,
            bet_collateral TEXT NOT NULL,
            order_id TEXT,
            order_status TEXT NOT NULL,
            outcome TEXT NOT NULL,
            exit_price TEXT,
            pnl TEXT,
            created_at INTEGER NOT NULL,
            settled_at INTEGER,
            signal_confidence REAL,
            signal_bias TEXT,
            signal_p_yes REAL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_pair_role ON trades(pair_id, role);
        CREATE INDEX IF NOT EXISTS idx_trades_outcome ON trades(outcome);
        CREATE INDEX IF NOT EXISTS idx_trades_symbol_window ON trades(symbol, window_start);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_twice_is_a_no_op() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let version_after_first: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        migrate(&conn).unwrap();
        let version_after_second: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version_after_first, version_after_second);
        assert_eq!(version_after_second, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn rejects_a_schema_version_ahead_of_the_binary() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (999, 0)",
            [],
        )
        .unwrap();
        let err = migrate(&conn).unwrap_err();
        assert!(matches!(err, StoreError::SchemaAhead { .. }));
    }
}
