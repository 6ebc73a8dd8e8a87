/// Position tracking with R-accounting and broker reconciliation
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::broker::{BrokerApi, BrokerPosition};
use crate::config::Config;
use crate::notify::TelegramNotifier;
use crate::types::{
    Candidate, DailyExitReason, OptionType, Position, PositionSummary,
};

pub struct PositionTracker {
    config: Arc<Config>,
    broker: Arc<dyn BrokerApi>,
    notifier: Arc<TelegramNotifier>,
    pub open_positions: HashMap<String, Position>,
    pub closed_positions: Vec<Position>,
    /// Cumulative R across closed positions today
    pub cumulative_r: f64,
    pub daily_exit_triggered: bool,
    pub daily_exit_reason: Option<DailyExitReason>,
    trade_date: String,
    /// One orphan alert per symbol per trading day
    orphan_alerted: HashSet<String>,
    /// One alert per distinct (symbol, tracked_qty, broker_qty) per day
    qty_mismatch_alerted: HashSet<(String, i32, i32)>,
}

impl PositionTracker {
    pub fn new(
        config: Arc<Config>,
        broker: Arc<dyn BrokerApi>,
        notifier: Arc<TelegramNotifier>,
        trade_date: String,
    ) -> Self {
        PositionTracker {
            config,
            broker,
            notifier,
            open_positions: HashMap::new(),
            closed_positions: Vec::new(),
            cumulative_r: 0.0,
            daily_exit_triggered: false,
            daily_exit_reason: None,
            trade_date,
            orphan_alerted: HashSet::new(),
            qty_mismatch_alerted: HashSet::new(),
        }
    }

    /// Restore from the durable store on a same-day restart
    pub fn restore_state(
        &mut self,
        open: Vec<Position>,
        closed: Vec<Position>,
        cumulative_r: f64,
        daily_exit_reason: Option<DailyExitReason>,
    ) {
        if !open.is_empty() {
            info!(
                "Restored {} open positions: {:?}",
                open.len(),
                open.iter().map(|p| p.symbol.as_str()).collect::<Vec<_>>()
            );
        }
        self.open_positions = open.into_iter().map(|p| (p.symbol.clone(), p)).collect();
        self.closed_positions = closed;
        self.cumulative_r = cumulative_r;
        self.daily_exit_reason = daily_exit_reason;
        self.daily_exit_triggered = daily_exit_reason.is_some();
    }

    /// Open a new short position from an entry fill
    pub fn add_position(
        &mut self,
        symbol: &str,
        entry_price: f64,
        sl_price: f64,
        quantity: i32,
        actual_r: f64,
        candidate: Candidate,
    ) -> Option<Position> {
        if self.daily_exit_triggered {
            warn!("add_position refused: daily exit already triggered");
            return None;
        }
        if self.open_positions.contains_key(symbol) {
            warn!("add_position refused: {} already open", symbol);
            return None;
        }

        let position = Position {
            symbol: symbol.to_string(),
            option_type: candidate.option_type,
            strike: candidate.strike,
            entry_price,
            sl_price,
            quantity,
            actual_r,
            entry_time: Utc::now(),
            current_price: entry_price,
            unrealized_pnl: 0.0,
            unrealized_r: 0.0,
            realized_pnl: 0.0,
            realized_r: 0.0,
            is_closed: false,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            candidate,
        };

        info!(
            "Position opened: {} SHORT {} @ {:.2} (SL {:.2}, R {:.0})",
            symbol, quantity, entry_price, sl_price, actual_r
        );

        self.open_positions.insert(symbol.to_string(), position.clone());
        Some(position)
    }

    /// Recompute unrealized P&L from the latest traded prices
    pub fn update_prices(&mut self, prices: &HashMap<String, f64>) {
        let r_value = self.config.r_value;
        for position in self.open_positions.values_mut() {
            if let Some(price) = prices.get(&position.symbol) {
                position.current_price = *price;
                position.unrealized_pnl =
                    (position.entry_price - price) * position.quantity as f64;
                position.unrealized_r = position.unrealized_pnl / r_value;
            }
        }
    }

    /// Close one position. Realized R accumulates into the session total.
    /// Closed positions are never reopened.
    pub fn close_position(
        &mut self,
        symbol: &str,
        exit_price: f64,
        exit_reason: &str,
    ) -> Option<Position> {
        let mut position = self.open_positions.remove(symbol)?;

        position.is_closed = true;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(Utc::now());
        position.exit_reason = Some(exit_reason.to_string());
        position.realized_pnl = (position.entry_price - exit_price) * position.quantity as f64;
        position.realized_r = position.realized_pnl / self.config.r_value;
        position.current_price = exit_price;
        position.unrealized_pnl = 0.0;
        position.unrealized_r = 0.0;

        self.cumulative_r += position.realized_r;

        info!(
            "Position closed: {} @ {:.2} | {:+.2}R (cumulative {:+.2}R) | {}",
            symbol, exit_price, position.realized_r, self.cumulative_r, exit_reason
        );

        self.closed_positions.push(position.clone());
        Some(position)
    }

    /// Close everything at the given prices (daily exit, EOD, emergency)
    pub fn close_all_positions(
        &mut self,
        reason: &str,
        prices: &HashMap<String, f64>,
    ) -> Vec<Position> {
        let symbols: Vec<String> = self.open_positions.keys().cloned().collect();
        let mut closed = Vec::new();

        for symbol in symbols {
            let exit_price = prices
                .get(&symbol)
                .copied()
                .or_else(|| self.open_positions.get(&symbol).map(|p| p.current_price))
                .unwrap_or(0.0);
            if let Some(position) = self.close_position(&symbol, exit_price, reason) {
                closed.push(position);
            }
        }

        info!("Closed {} positions - reason: {}", closed.len(), reason);
        closed
    }

    /// Can a new position for this symbol/type be opened? Pending entry
    /// orders count against both caps.
    pub fn can_open_position(
        &self,
        symbol: &str,
        option_type: OptionType,
        pending_ce: usize,
        pending_pe: usize,
    ) -> (bool, String) {
        if self.daily_exit_triggered {
            return (false, "daily exit triggered".to_string());
        }
        if self.open_positions.contains_key(symbol) {
            return (false, format!("{} already has an open position", symbol));
        }

        let open_total = self.open_positions.len();
        let pending_total = pending_ce + pending_pe;
        if open_total + pending_total >= self.config.max_positions {
            return (
                false,
                format!(
                    "position cap reached ({} open + {} pending >= {})",
                    open_total, pending_total, self.config.max_positions
                ),
            );
        }

        let open_of_type = self
            .open_positions
            .values()
            .filter(|p| p.option_type == option_type)
            .count();
        let pending_of_type = match option_type {
            OptionType::CE => pending_ce,
            OptionType::PE => pending_pe,
        };
        if open_of_type + pending_of_type >= self.config.max_per_type {
            return (
                false,
                format!(
                    "{} cap reached ({} open + {} pending >= {})",
                    option_type.as_str(),
                    open_of_type,
                    pending_of_type,
                    self.config.max_per_type
                ),
            );
        }

        (true, "ok".to_string())
    }

    /// Session R including unrealized. Crossing ±target latches the daily
    /// exit; the latch is irreversible for the day.
    pub fn check_daily_exit(&mut self) -> Option<DailyExitReason> {
        if self.daily_exit_triggered {
            return self.daily_exit_reason;
        }

        let unrealized: f64 = self.open_positions.values().map(|p| p.unrealized_r).sum();
        let total = self.cumulative_r + unrealized;

        let reason = if total >= self.config.daily_target_r {
            Some(DailyExitReason::TargetHit)
        } else if total <= self.config.daily_stop_r {
            Some(DailyExitReason::StopHit)
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!(
                "DAILY EXIT: {} (total {:+.2}R = {:+.2}R realized {:+.2}R unrealized)",
                reason.as_str(),
                total,
                self.cumulative_r,
                unrealized
            );
            self.daily_exit_triggered = true;
            self.daily_exit_reason = Some(reason);
        }

        self.daily_exit_reason
    }

    /// Latch the daily exit for reasons decided outside the R check (EOD,
    /// emergency shutdown)
    pub fn trigger_daily_exit(&mut self, reason: DailyExitReason) {
        if !self.daily_exit_triggered {
            self.daily_exit_triggered = true;
            self.daily_exit_reason = Some(reason);
        }
    }

    pub fn get_position_summary(&self) -> PositionSummary {
        let open_ce = self
            .open_positions
            .values()
            .filter(|p| p.option_type == OptionType::CE)
            .count();

        let total_pnl: f64 = self
            .closed_positions
            .iter()
            .map(|p| p.realized_pnl)
            .sum::<f64>()
            + self
                .open_positions
                .values()
                .map(|p| p.unrealized_pnl)
                .sum::<f64>();

        PositionSummary {
            trade_date: self.trade_date.clone(),
            open_positions: self.open_positions.len(),
            open_ce,
            open_pe: self.open_positions.len() - open_ce,
            closed_positions: self.closed_positions.len(),
            cumulative_r: self.cumulative_r,
            total_pnl,
            daily_exit_triggered: self.daily_exit_triggered,
            daily_exit_reason: self.daily_exit_reason.map(|r| r.as_str().to_string()),
            timestamp: Utc::now(),
        }
    }

    /// Fetch the broker position book and reconcile. Returns symbols that
    /// were phantom-closed locally (SL filled at broker while we tracked the
    /// position as open) so the caller can clean candidate pools.
    pub async fn reconcile_with_broker(&mut self) -> Vec<String> {
        let book = match self.broker.positionbook().await {
            Ok(book) => book,
            Err(e) => {
                warn!("[POS-RECONCILE] positionbook failed: {}", e);
                return Vec::new();
            }
        };
        self.reconcile_against(&book)
    }

    /// Pure reconciliation against a position-book snapshot
    pub fn reconcile_against(&mut self, book: &[BrokerPosition]) -> Vec<String> {
        let product = &self.config.product;
        let broker_qty: HashMap<&str, i32> = book
            .iter()
            .filter(|p| &p.product == product)
            .map(|p| (p.symbol.as_str(), p.quantity))
            .collect();

        // (a) tracked locally but flat at the broker: phantom-closed
        let mut phantom = Vec::new();
        let symbols: Vec<String> = self.open_positions.keys().cloned().collect();
        for symbol in symbols {
            let qty_at_broker = broker_qty.get(symbol.as_str()).copied().unwrap_or(0);
            if qty_at_broker == 0 {
                let exit_price = self
                    .open_positions
                    .get(&symbol)
                    .map(|p| p.current_price)
                    .unwrap_or(0.0);
                error!(
                    "[POS-RECONCILE] {} flat at broker but tracked open - closing as PHANTOM",
                    symbol
                );
                self.close_position(&symbol, exit_price, "PHANTOM_CLOSED");
                phantom.push(symbol);
            }
        }

        for (symbol, qty) in &broker_qty {
            if *qty == 0 {
                continue;
            }

            match self.open_positions.get(*symbol) {
                // (b) at the broker but not tracked: orphan (throttled alert)
                None => {
                    if self.orphan_alerted.insert(symbol.to_string()) {
                        error!("[POS-RECONCILE] ORPHAN position at broker: {} qty {}", symbol, qty);
                        self.notifier.send_message(format!(
                            "⚠️ ORPHAN POSITION AT BROKER\n\nSymbol: {}\nQty: {}\n\nNot tracked locally - check broker!",
                            symbol, qty
                        ));
                    }
                }
                // (c) quantity mismatch (throttled per unique tuple)
                Some(position) => {
                    let tracked = position.quantity;
                    let at_broker = qty.abs();
                    if tracked != at_broker {
                        let key = (symbol.to_string(), tracked, at_broker);
                        if self.qty_mismatch_alerted.insert(key) {
                            error!(
                                "[POS-RECONCILE] QTY MISMATCH {}: tracked {} vs broker {}",
                                symbol, tracked, at_broker
                            );
                            self.notifier.send_message(format!(
                                "⚠️ QUANTITY MISMATCH\n\nSymbol: {}\nTracked: {}\nBroker: {}",
                                symbol, tracked, at_broker
                            ));
                        }
                    }
                }
            }
        }

        phantom
    }

    /// New trading day: clear session accumulators and throttle sets
    pub fn reset_for_new_day(&mut self, trade_date: String) {
        self.open_positions.clear();
        self.closed_positions.clear();
        self.cumulative_r = 0.0;
        self.daily_exit_triggered = false;
        self.daily_exit_reason = None;
        self.trade_date = trade_date;
        self.orphan_alerted.clear();
        self.qty_mismatch_alerted.clear();
        info!("Position tracker reset for new day");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;

    fn candidate(symbol: &str, option_type: OptionType) -> Candidate {
        Candidate {
            symbol: symbol.to_string(),
            option_type,
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

    fn tracker() -> PositionTracker {
        let config: Config = toml::from_str("").unwrap();
        PositionTracker::new(
            Arc::new(config),
            Arc::new(PaperBroker::new()),
            Arc::new(TelegramNotifier::disabled("TEST")),
            "2025-01-30".to_string(),
        )
    }

    fn open(t: &mut PositionTracker, symbol: &str, option_type: OptionType, entry: f64) {
        t.add_position(symbol, entry, entry + 6.0, 650, 3900.0, candidate(symbol, option_type))
            .expect("position should open");
    }

    #[test]
    fn test_r_accounting_on_close() {
        let mut t = tracker();
        open(&mut t, "CE1", OptionType::CE, 100.0);

        // Short 650 @ 100, cover @ 95: +5 * 650 = +3250 -> +0.5R
        let before = t.cumulative_r;
        let closed = t.close_position("CE1", 95.0, "SL_HIT").unwrap();

        assert!((closed.realized_pnl - 3250.0).abs() < 1e-6);
        assert!((closed.realized_r - 0.5).abs() < 1e-9);
        assert!((t.cumulative_r - before - 0.5).abs() < 1e-9);
        assert!(closed.is_closed);
    }

    #[test]
    fn test_closed_position_not_reopened() {
        let mut t = tracker();
        open(&mut t, "CE1", OptionType::CE, 100.0);
        t.close_position("CE1", 95.0, "SL_HIT");

        // A second close is a no-op
        assert!(t.close_position("CE1", 90.0, "SL_HIT").is_none());
        assert_eq!(t.closed_positions.len(), 1);
    }

    #[test]
    fn test_unrealized_updates_for_short() {
        let mut t = tracker();
        open(&mut t, "CE1", OptionType::CE, 100.0);

        let prices = HashMap::from([("CE1".to_string(), 104.0)]);
        t.update_prices(&prices);

        let p = t.open_positions.get("CE1").unwrap();
        // Short losing 4 points: -2600 rupees
        assert!((p.unrealized_pnl + 2600.0).abs() < 1e-6);
        assert!((p.unrealized_r + 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_daily_exit_latch_target() {
        let mut t = tracker();
        open(&mut t, "CE1", OptionType::CE, 100.0);

        // Realized +4.8R
        t.cumulative_r = 4.8;
        // Unrealized +0.3R -> total 5.1R
        let prices = HashMap::from([("CE1".to_string(), 97.0)]);
        t.update_prices(&prices);

        let reason = t.check_daily_exit();
        assert_eq!(reason, Some(DailyExitReason::TargetHit));
        assert!(t.daily_exit_triggered);

        // Latch is irreversible even if R drifts back
        t.cumulative_r = 0.0;
        assert_eq!(t.check_daily_exit(), Some(DailyExitReason::TargetHit));
    }

    #[test]
    fn test_daily_exit_stop_boundary() {
        let mut t = tracker();
        t.cumulative_r = -4.99;
        assert_eq!(t.check_daily_exit(), None);

        t.cumulative_r = -5.0;
        assert_eq!(t.check_daily_exit(), Some(DailyExitReason::StopHit));
    }

    #[test]
    fn test_no_entries_after_daily_exit() {
        let mut t = tracker();
        t.trigger_daily_exit(DailyExitReason::TargetHit);

        assert!(t
            .add_position("CE1", 100.0, 106.0, 650, 3900.0, candidate("CE1", OptionType::CE))
            .is_none());

        let (ok, reason) = t.can_open_position("CE1", OptionType::CE, 0, 0);
        assert!(!ok);
        assert!(reason.contains("daily exit"));
    }

    #[test]
    fn test_can_open_per_type_cap_includes_pending() {
        let mut t = tracker();
        open(&mut t, "CE1", OptionType::CE, 100.0);
        open(&mut t, "CE2", OptionType::CE, 110.0);

        // 2 open CE + 1 pending CE = 3 >= MAX_PER_TYPE
        let (ok, reason) = t.can_open_position("CE3", OptionType::CE, 1, 0);
        assert!(!ok);
        assert!(reason.contains("CE cap"));

        // PE side is unaffected
        let (ok, _) = t.can_open_position("PE1", OptionType::PE, 1, 0);
        assert!(ok);
    }

    #[test]
    fn test_can_open_total_cap() {
        let mut t = tracker();
        open(&mut t, "CE1", OptionType::CE, 100.0);
        open(&mut t, "CE2", OptionType::CE, 110.0);
        open(&mut t, "PE1", OptionType::PE, 120.0);
        open(&mut t, "PE2", OptionType::PE, 130.0);

        // 4 open + 1 pending = 5 >= MAX_POSITIONS
        let (ok, reason) = t.can_open_position("PE3", OptionType::PE, 0, 1);
        assert!(!ok);
        assert!(reason.contains("position cap"));
    }

    #[test]
    fn test_same_symbol_not_stacked() {
        let mut t = tracker();
        open(&mut t, "CE1", OptionType::CE, 100.0);
        let (ok, reason) = t.can_open_position("CE1", OptionType::CE, 0, 0);
        assert!(!ok);
        assert!(reason.contains("already has an open position"));
    }

    #[test]
    fn test_close_all_uses_given_prices() {
        let mut t = tracker();
        open(&mut t, "CE1", OptionType::CE, 100.0);
        open(&mut t, "PE1", OptionType::PE, 200.0);

        let prices = HashMap::from([
            ("CE1".to_string(), 98.0),
            ("PE1".to_string(), 205.0),
        ]);
        let closed = t.close_all_positions("EOD_EXIT", &prices);

        assert_eq!(closed.len(), 2);
        assert!(t.open_positions.is_empty());
        // +2*650 -2600... CE1: (100-98)*650 = +1300 = +0.2R; PE1: (200-205)*650 = -3250 = -0.5R
        assert!((t.cumulative_r + 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_reconcile_phantom_closed() {
        let mut t = tracker();
        open(&mut t, "CE1", OptionType::CE, 100.0);

        // Broker book: flat
        let phantom = t.reconcile_against(&[]);
        assert_eq!(phantom, vec!["CE1".to_string()]);
        assert!(t.open_positions.is_empty());
        assert_eq!(
            t.closed_positions[0].exit_reason.as_deref(),
            Some("PHANTOM_CLOSED")
        );
    }

    #[test]
    fn test_reconcile_orphan_alert_throttled() {
        let mut t = tracker();

        let book = vec![BrokerPosition {
            symbol: "PE9".to_string(),
            quantity: -650,
            average_price: 150.0,
            product: "MIS".to_string(),
        }];

        t.reconcile_against(&book);
        t.reconcile_against(&book);
        // Alerted exactly once per symbol per day
        assert_eq!(t.orphan_alerted.len(), 1);

        t.reset_for_new_day("2025-01-31".to_string());
        assert!(t.orphan_alerted.is_empty());
    }

    #[test]
    fn test_reconcile_qty_mismatch_throttled_per_tuple() {
        let mut t = tracker();
        open(&mut t, "CE1", OptionType::CE, 100.0);

        let book = |qty: i32| {
            vec![BrokerPosition {
                symbol: "CE1".to_string(),
                quantity: qty,
                average_price: 100.0,
                product: "MIS".to_string(),
            }]
        };

        t.reconcile_against(&book(-325));
        t.reconcile_against(&book(-325));
        assert_eq!(t.qty_mismatch_alerted.len(), 1);

        // A different mismatch tuple alerts again
        t.reconcile_against(&book(-130));
        assert_eq!(t.qty_mismatch_alerted.len(), 2);
    }

    #[test]
    fn test_summary_counts() {
        let mut t = tracker();
        open(&mut t, "CE1", OptionType::CE, 100.0);
        open(&mut t, "PE1", OptionType::PE, 200.0);
        t.close_position("PE1", 195.0, "SL_HIT");

        let s = t.get_position_summary();
        assert_eq!(s.open_positions, 1);
        assert_eq!(s.open_ce, 1);
        assert_eq!(s.open_pe, 0);
        assert_eq!(s.closed_positions, 1);
        assert!(!s.daily_exit_triggered);
    }
}
