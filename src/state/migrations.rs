/// Numbered, idempotent schema migrations
use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, TradingError};

struct Migration {
    version: u32,
    description: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

/// Registry is append-only; each migration checks existence before altering
/// so re-running after a partial apply is safe.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "base schema",
        apply: migrate_base_schema,
    },
    Migration {
        version: 2,
        description: "operational_state control-flag columns",
        apply: migrate_control_flags,
    },
];

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    for migration in MIGRATIONS {
        let applied: bool = conn
            .prepare("SELECT 1 FROM schema_migrations WHERE version = ?1")?
            .exists([migration.version])?;
        if applied {
            continue;
        }

        (migration.apply)(conn).map_err(|e| {
            TradingError::MigrationFailed(format!(
                "migration {} ({}) failed: {}",
                migration.version, migration.description, e
            ))
        })?;

        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            [migration.version],
        )?;
        info!(
            "Applied migration {} ({})",
            migration.version, migration.description
        );
    }

    Ok(())
}

fn migrate_base_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS open_positions (
            symbol TEXT PRIMARY KEY,
            option_type TEXT NOT NULL,
            strike INTEGER NOT NULL,
            entry_price REAL NOT NULL,
            sl_price REAL NOT NULL,
            quantity INTEGER NOT NULL,
            actual_r REAL NOT NULL,
            entry_time TEXT NOT NULL,
            current_price REAL NOT NULL,
            unrealized_pnl REAL NOT NULL DEFAULT 0,
            unrealized_r REAL NOT NULL DEFAULT 0,
            candidate_info TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS closed_trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol TEXT NOT NULL,
            option_type TEXT NOT NULL,
            strike INTEGER NOT NULL,
            entry_price REAL NOT NULL,
            exit_price REAL NOT NULL,
            quantity INTEGER NOT NULL,
            actual_r REAL NOT NULL,
            entry_time TEXT NOT NULL,
            exit_time TEXT NOT NULL,
            exit_reason TEXT NOT NULL,
            realized_pnl REAL NOT NULL,
            realized_r REAL NOT NULL,
            trade_date TEXT NOT NULL,
            candidate_info TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_entry_orders (
            option_type TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            trigger_price REAL NOT NULL,
            limit_price REAL NOT NULL,
            quantity INTEGER NOT NULL,
            status TEXT NOT NULL,
            placed_at TEXT NOT NULL,
            candidate_info TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS active_sl_orders (
            symbol TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            trigger_price REAL NOT NULL,
            limit_price REAL NOT NULL,
            quantity INTEGER NOT NULL,
            placed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS daily_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            trade_date TEXT NOT NULL,
            cumulative_r REAL NOT NULL DEFAULT 0,
            daily_exit_triggered INTEGER NOT NULL DEFAULT 0,
            daily_exit_reason TEXT,
            open_positions INTEGER NOT NULL DEFAULT 0,
            closed_positions INTEGER NOT NULL DEFAULT 0,
            total_pnl REAL NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS all_swings_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol TEXT NOT NULL,
            swing_type TEXT NOT NULL,
            swing_price REAL NOT NULL,
            swing_time TEXT NOT NULL,
            vwap REAL NOT NULL,
            bar_index INTEGER NOT NULL,
            logged_at TEXT NOT NULL,
            UNIQUE (symbol, swing_time, swing_type)
        );

        CREATE TABLE IF NOT EXISTS swing_candidates (
            symbol TEXT PRIMARY KEY,
            option_type TEXT NOT NULL,
            swing_low REAL NOT NULL,
            swing_time TEXT NOT NULL,
            entry_price REAL NOT NULL,
            sl_price REAL NOT NULL,
            sl_points REAL NOT NULL,
            sl_percent REAL NOT NULL,
            vwap_premium REAL NOT NULL,
            lots INTEGER NOT NULL,
            qualified INTEGER NOT NULL,
            disqualify_reason TEXT,
            broken_at_startup INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS latest_bars (
            symbol TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            volume INTEGER NOT NULL,
            vwap REAL NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS best_strikes (
            option_type TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            entry_price REAL NOT NULL,
            sl_price REAL NOT NULL,
            sl_points REAL NOT NULL,
            vwap_premium REAL NOT NULL,
            lots INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS order_trigger_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            option_type TEXT NOT NULL,
            action TEXT NOT NULL,
            symbol TEXT NOT NULL,
            current_price REAL NOT NULL,
            swing_low REAL NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS operational_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            state TEXT NOT NULL,
            state_entered_at TEXT NOT NULL,
            error_reason TEXT
        );
        ",
    )
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn migrate_control_flags(conn: &Connection) -> rusqlite::Result<()> {
    if !column_exists(conn, "operational_state", "pause_requested")? {
        conn.execute(
            "ALTER TABLE operational_state ADD COLUMN pause_requested INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !column_exists(conn, "operational_state", "kill_requested")? {
        conn.execute(
            "ALTER TABLE operational_state ADD COLUMN kill_requested INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_control_flag_columns_added() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        assert!(column_exists(&conn, "operational_state", "pause_requested").unwrap());
        assert!(column_exists(&conn, "operational_state", "kill_requested").unwrap());
    }

    #[test]
    fn test_control_flag_migration_tolerates_existing_columns() {
        let conn = Connection::open_in_memory().unwrap();
        migrate_base_schema(&conn).unwrap();
        // Apply the flag migration twice directly
        migrate_control_flags(&conn).unwrap();
        migrate_control_flags(&conn).unwrap();
    }
}
