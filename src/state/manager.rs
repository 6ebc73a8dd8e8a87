/// Durable state persistence (single-writer SQLite)
use std::collections::HashMap;
use std::path::Path;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::{Result, TradingError};
use crate::filter::BestStrikes;
use crate::state::migrations::run_migrations;
use crate::types::{
    Bar, Candidate, DailyExitReason, EntryOrder, OperationalState, OptionType, OrderStatus,
    Position, PositionSummary, SlOrder, Swing,
};

/// Restored daily-state row
#[derive(Debug, Clone)]
pub struct DailyState {
    pub trade_date: String,
    pub cumulative_r: f64,
    pub daily_exit_reason: Option<DailyExitReason>,
}

/// The single source of truth for restart. All writes come from the tick
/// task; non-critical save failures are logged, never propagated.
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        run_migrations(&conn)?;
        info!("State store ready at {}", path.display());
        Ok(StateManager { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(StateManager { conn })
    }

    // ── Positions ─────────────────────────────────────────────────────

    /// Replace the open-positions mirror
    pub fn save_positions(&self, open: &HashMap<String, Position>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM open_positions", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO open_positions
                 (symbol, option_type, strike, entry_price, sl_price, quantity, actual_r,
                  entry_time, current_price, unrealized_pnl, unrealized_r, candidate_info)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for p in open.values() {
                stmt.execute(params![
                    p.symbol,
                    p.option_type.as_str(),
                    p.strike,
                    p.entry_price,
                    p.sl_price,
                    p.quantity,
                    p.actual_r,
                    p.entry_time.to_rfc3339(),
                    p.current_price,
                    p.unrealized_pnl,
                    p.unrealized_r,
                    serde_json::to_string(&p.candidate)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_open_positions(&self) -> Result<Vec<Position>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, option_type, strike, entry_price, sl_price, quantity, actual_r,
                    entry_time, current_price, unrealized_pnl, unrealized_r, candidate_info
             FROM open_positions",
        )?;

        let rows = stmt.query_map([], |row| {
            let option_type: String = row.get(1)?;
            let entry_time: String = row.get(7)?;
            let candidate_json: String = row.get(11)?;
            Ok((
                row.get::<_, String>(0)?,
                option_type,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, i32>(5)?,
                row.get::<_, f64>(6)?,
                entry_time,
                row.get::<_, f64>(8)?,
                row.get::<_, f64>(9)?,
                row.get::<_, f64>(10)?,
                candidate_json,
            ))
        })?;

        let mut positions = Vec::new();
        for row in rows {
            let (
                symbol,
                option_type,
                strike,
                entry_price,
                sl_price,
                quantity,
                actual_r,
                entry_time,
                current_price,
                unrealized_pnl,
                unrealized_r,
                candidate_json,
            ) = row?;

            let option_type = OptionType::parse(&option_type).ok_or_else(|| {
                TradingError::StateStoreError(format!("bad option_type '{}'", option_type))
            })?;
            let candidate: Candidate = serde_json::from_str(&candidate_json)?;
            let entry_time = parse_rfc3339(&entry_time)?;

            positions.push(Position {
                symbol,
                option_type,
                strike,
                entry_price,
                sl_price,
                quantity,
                actual_r,
                entry_time,
                current_price,
                unrealized_pnl,
                unrealized_r,
                realized_pnl: 0.0,
                realized_r: 0.0,
                is_closed: false,
                exit_price: None,
                exit_time: None,
                exit_reason: None,
                candidate,
            });
        }
        Ok(positions)
    }

    /// Append one closed trade to the immutable log
    pub fn log_trade(&self, p: &Position, trade_date: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO closed_trades
             (symbol, option_type, strike, entry_price, exit_price, quantity, actual_r,
              entry_time, exit_time, exit_reason, realized_pnl, realized_r, trade_date,
              candidate_info)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                p.symbol,
                p.option_type.as_str(),
                p.strike,
                p.entry_price,
                p.exit_price.unwrap_or(0.0),
                p.quantity,
                p.actual_r,
                p.entry_time.to_rfc3339(),
                p.exit_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
                p.exit_reason.clone().unwrap_or_default(),
                p.realized_pnl,
                p.realized_r,
                trade_date,
                serde_json::to_string(&p.candidate)?,
            ],
        )?;
        Ok(())
    }

    // ── Orders ────────────────────────────────────────────────────────

    pub fn save_orders(
        &self,
        pending: &HashMap<OptionType, EntryOrder>,
        active_sl: &HashMap<String, SlOrder>,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM pending_entry_orders", [])?;
        tx.execute("DELETE FROM active_sl_orders", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO pending_entry_orders
                 (option_type, order_id, symbol, trigger_price, limit_price, quantity,
                  status, placed_at, candidate_info)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (option_type, order) in pending {
                stmt.execute(params![
                    option_type.as_str(),
                    order.order_id,
                    order.symbol,
                    order.trigger_price,
                    order.limit_price,
                    order.quantity,
                    order.status.as_str(),
                    order.placed_at.to_rfc3339(),
                    serde_json::to_string(&order.candidate)?,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO active_sl_orders
                 (symbol, order_id, trigger_price, limit_price, quantity, placed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for order in active_sl.values() {
                stmt.execute(params![
                    order.symbol,
                    order.order_id,
                    order.trigger_price,
                    order.limit_price,
                    order.quantity,
                    order.placed_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_orders(
        &self,
    ) -> Result<(HashMap<OptionType, EntryOrder>, HashMap<String, SlOrder>)> {
        let mut pending = HashMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT option_type, order_id, symbol, trigger_price, limit_price, quantity,
                        status, placed_at, candidate_info
                 FROM pending_entry_orders",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i32>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?;
            for row in rows {
                let (ot, order_id, symbol, trigger, limit, qty, status, placed_at, cand) = row?;
                let option_type = OptionType::parse(&ot).ok_or_else(|| {
                    TradingError::StateStoreError(format!("bad option_type '{}'", ot))
                })?;
                pending.insert(
                    option_type,
                    EntryOrder {
                        order_id,
                        symbol,
                        trigger_price: trigger,
                        limit_price: limit,
                        quantity: qty,
                        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Pending),
                        placed_at: parse_rfc3339(&placed_at)?,
                        candidate: serde_json::from_str(&cand)?,
                    },
                );
            }
        }

        let mut active_sl = HashMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT symbol, order_id, trigger_price, limit_price, quantity, placed_at
                 FROM active_sl_orders",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, i32>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;
            for row in rows {
                let (symbol, order_id, trigger, limit, qty, placed_at) = row?;
                active_sl.insert(
                    symbol.clone(),
                    SlOrder {
                        order_id,
                        symbol,
                        trigger_price: trigger,
                        limit_price: limit,
                        quantity: qty,
                        placed_at: parse_rfc3339(&placed_at)?,
                    },
                );
            }
        }

        Ok((pending, active_sl))
    }

    // ── Daily state ───────────────────────────────────────────────────

    pub fn save_daily_state(&self, summary: &PositionSummary) -> Result<()> {
        self.conn.execute(
            "INSERT INTO daily_state
             (id, trade_date, cumulative_r, daily_exit_triggered, daily_exit_reason,
              open_positions, closed_positions, total_pnl, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                trade_date = excluded.trade_date,
                cumulative_r = excluded.cumulative_r,
                daily_exit_triggered = excluded.daily_exit_triggered,
                daily_exit_reason = excluded.daily_exit_reason,
                open_positions = excluded.open_positions,
                closed_positions = excluded.closed_positions,
                total_pnl = excluded.total_pnl,
                updated_at = excluded.updated_at",
            params![
                summary.trade_date,
                summary.cumulative_r,
                summary.daily_exit_triggered as i32,
                summary.daily_exit_reason,
                summary.open_positions as i64,
                summary.closed_positions as i64,
                summary.total_pnl,
                summary.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_daily_state(&self) -> Result<Option<DailyState>> {
        let row = self
            .conn
            .query_row(
                "SELECT trade_date, cumulative_r, daily_exit_reason FROM daily_state WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(trade_date, cumulative_r, reason)| DailyState {
            trade_date,
            cumulative_r,
            daily_exit_reason: reason.as_deref().and_then(DailyExitReason::parse),
        }))
    }

    /// New trading day: clear the dashboard mirrors and the daily row
    pub fn reset_daily_dashboard(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM daily_state;
             DELETE FROM swing_candidates;
             DELETE FROM latest_bars;
             DELETE FROM best_strikes;
             DELETE FROM order_trigger_log;
             DELETE FROM all_swings_log;
             DELETE FROM pending_entry_orders;
             DELETE FROM active_sl_orders;
             DELETE FROM open_positions;",
        )?;
        info!("Daily dashboard data reset for new trading day");
        Ok(())
    }

    // ── Observability mirrors (fire-and-forget cadence) ───────────────

    /// Log one confirmed swing; duplicates by (symbol, time, type) ignored.
    /// Returns true when a new row was inserted.
    pub fn log_swing(&self, symbol: &str, swing: &Swing) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO all_swings_log
             (symbol, swing_type, swing_price, swing_time, vwap, bar_index, logged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                symbol,
                swing.swing_type.as_str(),
                swing.price,
                swing.timestamp.to_rfc3339(),
                swing.vwap,
                swing.bar_index as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Replace the swing-candidates mirror (clears the table when empty)
    pub fn save_swing_candidates(&self, candidates: &HashMap<String, Candidate>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM swing_candidates", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO swing_candidates
                 (symbol, option_type, swing_low, swing_time, entry_price, sl_price,
                  sl_points, sl_percent, vwap_premium, lots, qualified, disqualify_reason,
                  broken_at_startup, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for c in candidates.values() {
                stmt.execute(params![
                    c.symbol,
                    c.option_type.as_str(),
                    c.swing_low,
                    c.swing_time.to_rfc3339(),
                    c.entry_price,
                    c.sl_price,
                    c.sl_points,
                    c.sl_percent,
                    c.vwap_premium,
                    c.lots,
                    c.qualified as i32,
                    c.disqualify_reason,
                    c.broken_at_startup as i32,
                    Utc::now().to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn save_latest_bars(&self, bars: &HashMap<String, Bar>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO latest_bars
                 (symbol, timestamp, open, high, low, close, volume, vwap, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(symbol) DO UPDATE SET
                    timestamp = excluded.timestamp,
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    vwap = excluded.vwap,
                    updated_at = excluded.updated_at",
            )?;
            for (symbol, bar) in bars {
                stmt.execute(params![
                    symbol,
                    bar.timestamp.to_rfc3339(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                    bar.vwap,
                    Utc::now().to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Mirror the best strikes; a None side clears its row so stale records
    /// disappear when a swing is replaced by an unqualified one
    pub fn save_best_strikes(&self, best: &BestStrikes) -> Result<()> {
        for (option_type, candidate) in
            [(OptionType::CE, &best.ce), (OptionType::PE, &best.pe)]
        {
            match candidate {
                Some(c) => {
                    self.conn.execute(
                        "INSERT INTO best_strikes
                         (option_type, symbol, entry_price, sl_price, sl_points,
                          vwap_premium, lots, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                         ON CONFLICT(option_type) DO UPDATE SET
                            symbol = excluded.symbol,
                            entry_price = excluded.entry_price,
                            sl_price = excluded.sl_price,
                            sl_points = excluded.sl_points,
                            vwap_premium = excluded.vwap_premium,
                            lots = excluded.lots,
                            updated_at = excluded.updated_at",
                        params![
                            option_type.as_str(),
                            c.symbol,
                            c.entry_price,
                            c.sl_price,
                            c.sl_points,
                            c.vwap_premium,
                            c.lots,
                            Utc::now().to_rfc3339(),
                        ],
                    )?;
                }
                None => {
                    self.conn.execute(
                        "DELETE FROM best_strikes WHERE option_type = ?1",
                        params![option_type.as_str()],
                    )?;
                }
            }
        }
        Ok(())
    }

    pub fn log_order_trigger(
        &self,
        option_type: OptionType,
        action: &str,
        symbol: &str,
        current_price: f64,
        swing_low: f64,
        reason: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO order_trigger_log
             (option_type, action, symbol, current_price, swing_low, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                option_type.as_str(),
                action,
                symbol,
                current_price,
                swing_low,
                reason,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // ── Operational state & control flags ─────────────────────────────

    pub fn update_operational_state(
        &self,
        state: OperationalState,
        error_reason: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO operational_state (id, state, state_entered_at, error_reason)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                state_entered_at = excluded.state_entered_at,
                error_reason = excluded.error_reason",
            params![state.as_str(), Utc::now().to_rfc3339(), error_reason],
        )?;
        Ok(())
    }

    /// (pause_requested, kill_requested)
    pub fn get_control_flags(&self) -> Result<(bool, bool)> {
        let row = self
            .conn
            .query_row(
                "SELECT pause_requested, kill_requested FROM operational_state WHERE id = 1",
                [],
                |row| Ok((row.get::<_, i32>(0)?, row.get::<_, i32>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(p, k)| (p != 0, k != 0)).unwrap_or((false, false)))
    }

    pub fn set_control_flag(&self, flag: &str, value: bool) -> Result<()> {
        let column = match flag {
            "pause_requested" => "pause_requested",
            "kill_requested" => "kill_requested",
            other => {
                return Err(TradingError::StateStoreError(format!(
                    "unknown control flag '{}'",
                    other
                )))
            }
        };

        // Ensure the singleton row exists before flagging it
        self.conn.execute(
            "INSERT OR IGNORE INTO operational_state (id, state, state_entered_at)
             VALUES (1, 'STARTING', ?1)",
            params![Utc::now().to_rfc3339()],
        )?;
        self.conn.execute(
            &format!("UPDATE operational_state SET {} = ?1 WHERE id = 1", column),
            params![value as i32],
        )?;
        Ok(())
    }

    /// Non-critical save wrapper: log and continue on failure
    pub fn save_or_warn<F: FnOnce(&Self) -> Result<()>>(&self, what: &str, f: F) {
        if let Err(e) = f(self) {
            warn!("Non-critical save failed ({}): {}", what, e);
        }
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TradingError::StateStoreError(format!("bad timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SwingType;

    fn candidate(symbol: &str) -> Candidate {
        Candidate {
            symbol: symbol.to_string(),
            option_type: OptionType::CE,
            strike: 26000,
            swing_low: 100.0,
            swing_time: Utc::now(),
            vwap_at_swing: 95.0,
            highest_high: 105.0,
            current_price: 100.5,
            entry_price: 99.95,
            sl_price: 106.0,
            sl_points: 6.05,
            sl_percent: 0.06,
            vwap_premium: 0.052,
            lots: 10,
            quantity: 650,
            actual_r: 3900.0,
            qualified: true,
            disqualify_reason: None,
            broken_at_startup: false,
        }
    }

    fn position(symbol: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            option_type: OptionType::CE,
            strike: 26000,
            entry_price: 99.95,
            sl_price: 106.0,
            quantity: 650,
            actual_r: 3900.0,
            entry_time: Utc::now(),
            current_price: 99.0,
            unrealized_pnl: 617.5,
            unrealized_r: 0.095,
            realized_pnl: 0.0,
            realized_r: 0.0,
            is_closed: false,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            candidate: candidate(symbol),
        }
    }

    #[test]
    fn test_positions_round_trip() {
        let sm = StateManager::open_in_memory().unwrap();
        let p = position("NIFTY30JAN2526000CE");
        let mut open = HashMap::new();
        open.insert(p.symbol.clone(), p.clone());

        sm.save_positions(&open).unwrap();
        let restored = sm.load_open_positions().unwrap();

        assert_eq!(restored.len(), 1);
        let r = &restored[0];
        assert_eq!(r.symbol, p.symbol);
        assert_eq!(r.quantity, p.quantity);
        assert!((r.entry_price - p.entry_price).abs() < 1e-9);
        assert!((r.sl_price - p.sl_price).abs() < 1e-9);
        assert!((r.actual_r - p.actual_r).abs() < 1e-9);
        assert_eq!(r.entry_time.timestamp(), p.entry_time.timestamp());
        // Candidate snapshot survives intact
        assert_eq!(r.candidate.symbol, p.candidate.symbol);
        assert!((r.candidate.vwap_at_swing - 95.0).abs() < 1e-9);
    }

    #[test]
    fn test_orders_round_trip() {
        let sm = StateManager::open_in_memory().unwrap();

        let mut pending = HashMap::new();
        pending.insert(
            OptionType::CE,
            EntryOrder {
                order_id: "X1".to_string(),
                symbol: "NIFTY30JAN2526000CE".to_string(),
                trigger_price: 99.95,
                limit_price: 96.95,
                quantity: 650,
                status: OrderStatus::Pending,
                placed_at: Utc::now(),
                candidate: candidate("NIFTY30JAN2526000CE"),
            },
        );

        let mut active_sl = HashMap::new();
        active_sl.insert(
            "NIFTY30JAN2525900PE".to_string(),
            SlOrder {
                order_id: "SL1".to_string(),
                symbol: "NIFTY30JAN2525900PE".to_string(),
                trigger_price: 106.0,
                limit_price: 109.0,
                quantity: 650,
                placed_at: Utc::now(),
            },
        );

        sm.save_orders(&pending, &active_sl).unwrap();
        let (p2, sl2) = sm.load_orders().unwrap();

        assert_eq!(p2.len(), 1);
        let restored = p2.get(&OptionType::CE).unwrap();
        assert_eq!(restored.order_id, "X1");
        assert_eq!(restored.status, OrderStatus::Pending);
        assert!((restored.trigger_price - 99.95).abs() < 1e-9);
        assert_eq!(restored.candidate.quantity, 650);

        assert_eq!(sl2.len(), 1);
        let sl = sl2.get("NIFTY30JAN2525900PE").unwrap();
        assert_eq!(sl.order_id, "SL1");
        assert!((sl.limit_price - 109.0).abs() < 1e-9);
    }

    #[test]
    fn test_daily_state_round_trip() {
        let sm = StateManager::open_in_memory().unwrap();

        let summary = PositionSummary {
            trade_date: "2025-01-30".to_string(),
            open_positions: 2,
            open_ce: 1,
            open_pe: 1,
            closed_positions: 3,
            cumulative_r: 2.75,
            total_pnl: 17875.0,
            daily_exit_triggered: true,
            daily_exit_reason: Some("+5R_TARGET".to_string()),
            timestamp: Utc::now(),
        };

        sm.save_daily_state(&summary).unwrap();
        let daily = sm.load_daily_state().unwrap().unwrap();

        assert_eq!(daily.trade_date, "2025-01-30");
        assert!((daily.cumulative_r - 2.75).abs() < 1e-9);
        assert_eq!(daily.daily_exit_reason, Some(DailyExitReason::TargetHit));
    }

    #[test]
    fn test_load_daily_state_empty() {
        let sm = StateManager::open_in_memory().unwrap();
        assert!(sm.load_daily_state().unwrap().is_none());
    }

    #[test]
    fn test_swing_log_dedup() {
        let sm = StateManager::open_in_memory().unwrap();
        let swing = Swing {
            swing_type: SwingType::Low,
            price: 100.0,
            timestamp: Utc::now(),
            vwap: 95.0,
            bar_index: 12,
        };

        assert!(sm.log_swing("NIFTY30JAN2526000CE", &swing).unwrap());
        assert!(!sm.log_swing("NIFTY30JAN2526000CE", &swing).unwrap());
    }

    #[test]
    fn test_best_strikes_cleared_when_none() {
        let sm = StateManager::open_in_memory().unwrap();

        let best = BestStrikes {
            ce: Some(candidate("NIFTY30JAN2526000CE")),
            pe: None,
        };
        sm.save_best_strikes(&best).unwrap();

        let count: u32 = sm
            .conn
            .query_row("SELECT COUNT(*) FROM best_strikes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        sm.save_best_strikes(&BestStrikes::default()).unwrap();
        let count: u32 = sm
            .conn
            .query_row("SELECT COUNT(*) FROM best_strikes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_control_flags() {
        let sm = StateManager::open_in_memory().unwrap();
        assert_eq!(sm.get_control_flags().unwrap(), (false, false));

        sm.set_control_flag("pause_requested", true).unwrap();
        assert_eq!(sm.get_control_flags().unwrap(), (true, false));

        sm.set_control_flag("kill_requested", true).unwrap();
        assert_eq!(sm.get_control_flags().unwrap(), (true, true));

        sm.set_control_flag("pause_requested", false).unwrap();
        assert_eq!(sm.get_control_flags().unwrap(), (false, true));

        assert!(sm.set_control_flag("launch_missiles", true).is_err());
    }

    #[test]
    fn test_reset_daily_dashboard() {
        let sm = StateManager::open_in_memory().unwrap();

        let mut open = HashMap::new();
        let p = position("NIFTY30JAN2526000CE");
        open.insert(p.symbol.clone(), p);
        sm.save_positions(&open).unwrap();

        sm.reset_daily_dashboard().unwrap();
        assert!(sm.load_open_positions().unwrap().is_empty());
        assert!(sm.load_daily_state().unwrap().is_none());
    }

    #[test]
    fn test_closed_trade_logged() {
        let sm = StateManager::open_in_memory().unwrap();
        let mut p = position("NIFTY30JAN2526000CE");
        p.is_closed = true;
        p.exit_price = Some(95.0);
        p.exit_time = Some(Utc::now());
        p.exit_reason = Some("SL_HIT".to_string());
        p.realized_pnl = 3217.5;
        p.realized_r = 0.495;

        sm.log_trade(&p, "2025-01-30").unwrap();

        let count: u32 = sm
            .conn
            .query_row("SELECT COUNT(*) FROM closed_trades", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
