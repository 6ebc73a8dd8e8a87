/// Continuous strike filter: per-tick candidate evaluation and selection
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::data::universe::parse_symbol;
use crate::swing::MultiSwingDetector;
use crate::types::{
    Bar, Candidate, EntryOrder, OptionType, OrderTrigger, Swing, TriggerAction,
};

/// Best qualified candidate per option type after one evaluation pass
#[derive(Debug, Clone, Default)]
pub struct BestStrikes {
    pub ce: Option<Candidate>,
    pub pe: Option<Candidate>,
}

impl BestStrikes {
    pub fn get(&self, option_type: OptionType) -> Option<&Candidate> {
        match option_type {
            OptionType::CE => self.ce.as_ref(),
            OptionType::PE => self.pe.as_ref(),
        }
    }
}

/// Maintains one candidate per symbol with an unbroken swing low and
/// re-derives entry metrics from live data every tick.
pub struct ContinuousFilter {
    config: Arc<Config>,
    expiry: String,
    pub candidates: HashMap<String, Candidate>,
}

impl ContinuousFilter {
    pub fn new(config: Arc<Config>, expiry: String) -> Self {
        ContinuousFilter {
            config,
            expiry,
            candidates: HashMap::new(),
        }
    }

    /// Register a freshly confirmed swing low as a candidate. A newer swing
    /// on the same symbol replaces the old candidate.
    pub fn add_swing_candidate(&mut self, symbol: &str, swing: &Swing) {
        let Some((strike, option_type)) = parse_symbol(symbol, &self.expiry) else {
            debug!("[FILTER] {}: unparseable symbol, ignoring swing", symbol);
            return;
        };

        let tick_size = self.config.tick_size;
        let candidate = Candidate {
            symbol: symbol.to_string(),
            option_type,
            strike,
            swing_low: swing.price,
            swing_time: swing.timestamp,
            vwap_at_swing: swing.vwap,
            highest_high: swing.price,
            current_price: swing.price,
            entry_price: swing.price - tick_size,
            sl_price: swing.price + 1.0,
            sl_points: 0.0,
            sl_percent: 0.0,
            vwap_premium: 0.0,
            lots: 0,
            quantity: 0,
            actual_r: 0.0,
            qualified: false,
            disqualify_reason: None,
            broken_at_startup: false,
        };

        self.candidates.insert(symbol.to_string(), candidate);
        debug!(
            "[FILTER] {} candidate added: swing low {:.2} (vwap {:.2})",
            symbol, swing.price, swing.vwap
        );
    }

    pub fn remove_candidate(&mut self, symbol: &str) {
        if self.candidates.remove(symbol).is_some() {
            debug!("[FILTER] {} removed from candidate pool", symbol);
        }
    }

    /// Clear the pool (daily exit / EOD: prevents re-nomination)
    pub fn reset_daily_data(&mut self) {
        self.candidates.clear();
        info!("[FILTER] Candidate pool cleared");
    }

    /// Mark candidates whose swing low already broke in historical data.
    /// These were missed opportunities; they never generate orders.
    pub fn mark_historical_breaks(&mut self, detectors: &MultiSwingDetector) -> usize {
        let tick = self.config.tick_size;
        let mut broken = 0usize;

        for candidate in self.candidates.values_mut() {
            if candidate.broken_at_startup {
                continue;
            }
            let Some(detector) = detectors.get(&candidate.symbol) else {
                continue;
            };
            let break_level = candidate.swing_low - tick;
            let was_broken = detector
                .bars
                .iter()
                .any(|b| b.timestamp > candidate.swing_time && b.low <= break_level);
            if was_broken {
                candidate.broken_at_startup = true;
                broken += 1;
            }
        }

        if broken > 0 {
            info!(
                "[STARTUP-PROTECTION] {} swings already broken - will not place orders",
                broken
            );
        }
        broken
    }

    /// Re-evaluate every candidate with the latest snapshots and select the
    /// best CE and PE. Candidates for symbols with an open position are
    /// excluded; a break observed with no pending order marks the candidate
    /// as missed.
    pub fn evaluate_all_candidates(
        &mut self,
        latest_bars: &HashMap<String, Bar>,
        current_bars: &HashMap<String, Bar>,
        detectors: &MultiSwingDetector,
        open_position_symbols: &HashSet<String>,
        pending_symbols: &HashSet<String>,
    ) -> BestStrikes {
        let cfg = Arc::clone(&self.config);

        for candidate in self.candidates.values_mut() {
            let symbol = candidate.symbol.clone();

            // Highest high since the swing, including the incomplete bar
            let mut highest = detectors
                .get(&symbol)
                .and_then(|d| d.highest_high_since(candidate.swing_time))
                .unwrap_or(candidate.swing_low);
            if let Some(current) = current_bars.get(&symbol) {
                highest = highest.max(current.high);
            }
            candidate.highest_high = highest;

            // Current price: the incomplete bar leads, latest sealed bar trails
            let price = current_bars
                .get(&symbol)
                .map(|b| b.close)
                .or_else(|| latest_bars.get(&symbol).map(|b| b.close));
            if let Some(price) = price {
                candidate.current_price = price;
            }

            candidate.entry_price = candidate.swing_low - cfg.tick_size;
            candidate.sl_price = candidate.highest_high + 1.0;
            candidate.sl_points = candidate.sl_price - candidate.entry_price;
            candidate.sl_percent = if candidate.entry_price > 0.0 {
                candidate.sl_points / candidate.entry_price
            } else {
                0.0
            };
            candidate.vwap_premium = if candidate.vwap_at_swing > 0.0 {
                (candidate.entry_price - candidate.vwap_at_swing) / candidate.vwap_at_swing
            } else {
                0.0
            };

            let (lots, quantity, actual_r) =
                position_size(&cfg, candidate.entry_price, candidate.sl_price);
            candidate.lots = lots;
            candidate.quantity = quantity;
            candidate.actual_r = actual_r;

            // Break before any resting order existed: opportunity missed
            let break_level = candidate.swing_low - cfg.tick_size;
            if !candidate.broken_at_startup
                && candidate.current_price <= break_level
                && !pending_symbols.contains(&symbol)
            {
                candidate.broken_at_startup = true;
                debug!(
                    "[FILTER] {} broke {:.2} with no resting order - marked missed",
                    symbol, break_level
                );
            }

            apply_entry_filters(&cfg, candidate);
        }

        BestStrikes {
            ce: self.select_best(OptionType::CE, open_position_symbols),
            pe: self.select_best(OptionType::PE, open_position_symbols),
        }
    }

    /// Tie-break: |SL points − target| ascending, then entry price descending
    fn select_best(
        &self,
        option_type: OptionType,
        open_position_symbols: &HashSet<String>,
    ) -> Option<Candidate> {
        let target = self.config.target_sl_points;

        self.candidates
            .values()
            .filter(|c| {
                c.option_type == option_type
                    && c.qualified
                    && !c.broken_at_startup
                    && !open_position_symbols.contains(&c.symbol)
            })
            .min_by(|a, b| {
                let da = (a.sl_points - target).abs();
                let db = (b.sl_points - target).abs();
                da.partial_cmp(&db)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(
                        b.entry_price
                            .partial_cmp(&a.entry_price)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
            })
            .cloned()
    }

    /// Classify the per-type order action given the best candidate and any
    /// pending order for that type
    pub fn get_order_triggers(
        &self,
        best: &BestStrikes,
        pending: &HashMap<OptionType, EntryOrder>,
    ) -> HashMap<OptionType, OrderTrigger> {
        let mut triggers = HashMap::new();

        for option_type in OptionType::BOTH {
            let trigger = self.classify(option_type, best.get(option_type), pending.get(&option_type));
            triggers.insert(option_type, trigger);
        }

        triggers
    }

    fn classify(
        &self,
        _option_type: OptionType,
        best: Option<&Candidate>,
        pending: Option<&EntryOrder>,
    ) -> OrderTrigger {
        let cfg = &self.config;

        let Some(best) = best else {
            return if pending.is_some() {
                OrderTrigger {
                    action: TriggerAction::Cancel,
                    reason: "no qualified candidate".to_string(),
                    candidate: None,
                    limit_price: None,
                }
            } else {
                OrderTrigger::none("no qualified candidate")
            };
        };

        let break_level = best.swing_low - cfg.tick_size;
        let distance = best.current_price - best.entry_price;

        if best.current_price <= break_level {
            return match pending {
                Some(order) if order.symbol == best.symbol => OrderTrigger {
                    action: TriggerAction::CheckFill,
                    reason: format!(
                        "price {:.2} crossed trigger {:.2}",
                        best.current_price, break_level
                    ),
                    candidate: Some(best.clone()),
                    limit_price: None,
                },
                Some(_) => OrderTrigger {
                    action: TriggerAction::Cancel,
                    reason: "best candidate broke while order rests on another symbol"
                        .to_string(),
                    candidate: Some(best.clone()),
                    limit_price: None,
                },
                None => OrderTrigger::none("break with no resting order (missed)"),
            };
        }

        if distance <= cfg.entry_proximity {
            // Close enough to the break level: keep a resting order ahead of it
            let limit_price = best.entry_price - cfg.sl_limit_offset;
            let action = match pending {
                Some(order) if order.symbol == best.symbol => TriggerAction::Modify,
                _ => TriggerAction::Place,
            };
            return OrderTrigger {
                action,
                reason: format!(
                    "price {:.2} within {:.2} of entry {:.2}",
                    best.current_price, cfg.entry_proximity, best.entry_price
                ),
                candidate: Some(best.clone()),
                limit_price: Some(limit_price),
            };
        }

        if pending.is_some() {
            OrderTrigger {
                action: TriggerAction::Cancel,
                reason: format!(
                    "price {:.2} drifted {:.2} above entry {:.2}",
                    best.current_price, distance, best.entry_price
                ),
                candidate: Some(best.clone()),
                limit_price: None,
            }
        } else {
            OrderTrigger {
                action: TriggerAction::Wait,
                reason: format!(
                    "price {:.2} not yet within {:.2} of entry {:.2}",
                    best.current_price, cfg.entry_proximity, best.entry_price
                ),
                candidate: Some(best.clone()),
                limit_price: None,
            }
        }
    }

    /// Candidate counts for the heartbeat log
    pub fn summary(&self) -> (usize, usize, usize) {
        let ce = self
            .candidates
            .values()
            .filter(|c| c.option_type == OptionType::CE)
            .count();
        let pe = self.candidates.len() - ce;
        (self.candidates.len(), ce, pe)
    }
}

/// Lot count minimizing risk error against the R target, floored to whole
/// lots and capped per position
fn position_size(cfg: &Config, entry_price: f64, sl_price: f64) -> (i32, i32, f64) {
    let risk_per_unit = sl_price - entry_price;

    if risk_per_unit <= 0.0 {
        return (1, cfg.lot_size, risk_per_unit * cfg.lot_size as f64);
    }

    let required_qty = cfg.r_value / risk_per_unit;
    let required_lots = required_qty / cfg.lot_size as f64;
    let final_lots = (required_lots as i32).clamp(1, cfg.max_lots_per_position);
    let final_qty = final_lots * cfg.lot_size;
    let actual_r = risk_per_unit * final_qty as f64;

    (final_lots, final_qty, actual_r)
}

fn apply_entry_filters(cfg: &Config, candidate: &mut Candidate) {
    candidate.qualified = false;
    candidate.disqualify_reason = None;

    if candidate.entry_price < cfg.min_entry_price || candidate.entry_price > cfg.max_entry_price
    {
        candidate.disqualify_reason = Some(format!(
            "entry {:.2} outside {:.0}-{:.0}",
            candidate.entry_price, cfg.min_entry_price, cfg.max_entry_price
        ));
        return;
    }

    if candidate.vwap_premium < cfg.min_vwap_premium {
        candidate.disqualify_reason = Some(format!(
            "vwap premium {:.1}% < {:.1}%",
            candidate.vwap_premium * 100.0,
            cfg.min_vwap_premium * 100.0
        ));
        return;
    }

    if candidate.sl_percent < cfg.min_sl_percent || candidate.sl_percent > cfg.max_sl_percent {
        candidate.disqualify_reason = Some(format!(
            "SL {:.1}% outside {:.0}-{:.0}%",
            candidate.sl_percent * 100.0,
            cfg.min_sl_percent * 100.0,
            cfg.max_sl_percent * 100.0
        ));
        return;
    }

    candidate.qualified = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderStatus, Swing, SwingType};
    use chrono::{TimeZone, Utc};
    use chrono_tz::Asia::Kolkata;

    fn config() -> Arc<Config> {
        Arc::new(toml::from_str("").unwrap())
    }

    fn ts(minute: u32) -> chrono::DateTime<Utc> {
        Kolkata
            .with_ymd_and_hms(2025, 1, 30, 10, minute, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn swing(price: f64, vwap: f64, minute: u32) -> Swing {
        Swing {
            swing_type: SwingType::Low,
            price,
            timestamp: ts(minute),
            vwap,
            bar_index: 0,
        }
    }

    fn bar_at(minute: u32, high: f64, close: f64) -> Bar {
        Bar {
            timestamp: ts(minute),
            open: close,
            high,
            low: close.min(high) - 0.5,
            close,
            volume: 100,
            vwap: 95.0,
            atp: 0.0,
            tick_count: 5,
        }
    }

    fn filter_with_candidate(sym: &str, swing_price: f64, vwap: f64) -> ContinuousFilter {
        let mut f = ContinuousFilter::new(config(), "30JAN25".to_string());
        f.add_swing_candidate(sym, &swing(swing_price, vwap, 0));
        f
    }

    fn evaluate(
        f: &mut ContinuousFilter,
        sym: &str,
        current_close: f64,
        current_high: f64,
    ) -> BestStrikes {
        let detectors = MultiSwingDetector::new(&[sym.to_string()], 500);
        let latest = HashMap::from([(sym.to_string(), bar_at(1, current_high, current_close))]);
        let current = HashMap::from([(sym.to_string(), bar_at(2, current_high, current_close))]);
        f.evaluate_all_candidates(
            &latest,
            &current,
            &detectors,
            &HashSet::new(),
            &HashSet::new(),
        )
    }

    #[test]
    fn test_qualifying_candidate_selected() {
        let sym = "NIFTY30JAN2526000CE";
        // Swing at 100, VWAP 95 -> premium ~5.2%; highest high 105 -> SL 106 (6%)
        let mut f = filter_with_candidate(sym, 100.0, 95.0);
        let best = evaluate(&mut f, sym, 100.5, 105.0);

        let ce = best.ce.expect("CE candidate should qualify");
        assert_eq!(ce.symbol, sym);
        assert!((ce.entry_price - 99.95).abs() < 1e-9);
        assert!((ce.sl_price - 106.0).abs() < 1e-9);
        assert!(ce.qualified);
        assert!(best.pe.is_none());
    }

    #[test]
    fn test_price_band_filter() {
        let sym = "NIFTY30JAN2526000CE";
        let mut f = filter_with_candidate(sym, 80.0, 70.0);
        let best = evaluate(&mut f, sym, 80.5, 83.0);
        assert!(best.ce.is_none());
        let c = f.candidates.get(sym).unwrap();
        assert!(c.disqualify_reason.as_ref().unwrap().contains("entry"));
    }

    #[test]
    fn test_vwap_premium_filter() {
        let sym = "NIFTY30JAN2526000CE";
        // Premium (149.95-148)/148 ~ 1.3% < 4%
        let mut f = filter_with_candidate(sym, 150.0, 148.0);
        let best = evaluate(&mut f, sym, 150.5, 155.0);
        assert!(best.ce.is_none());
        let c = f.candidates.get(sym).unwrap();
        assert!(c.disqualify_reason.as_ref().unwrap().contains("premium"));
    }

    #[test]
    fn test_sl_percent_filter() {
        let sym = "NIFTY30JAN2526000CE";
        // Highest high 125 -> SL 126 -> ~26% > 10%
        let mut f = filter_with_candidate(sym, 100.0, 90.0);
        let best = evaluate(&mut f, sym, 100.5, 125.0);
        assert!(best.ce.is_none());
        let c = f.candidates.get(sym).unwrap();
        assert!(c.disqualify_reason.as_ref().unwrap().contains("SL"));
    }

    #[test]
    fn test_position_sizing_caps_at_max_lots() {
        let cfg = config();
        // Risk 6 pts: required qty 6500/6 = 1083 -> 16.6 lots -> capped at 10
        let (lots, qty, actual_r) = position_size(&cfg, 99.95, 105.95);
        assert_eq!(lots, 10);
        assert_eq!(qty, 650);
        assert!((actual_r - 6.0 * 650.0).abs() < 1e-6);
    }

    #[test]
    fn test_position_sizing_minimum_one_lot() {
        let cfg = config();
        // Huge risk per unit still yields one lot
        let (lots, qty, _) = position_size(&cfg, 100.0, 300.0);
        assert_eq!(lots, 1);
        assert_eq!(qty, cfg.lot_size);
    }

    #[test]
    fn test_tie_break_sl_distance_then_entry_price() {
        let mut f = ContinuousFilter::new(config(), "30JAN25".to_string());
        // A: SL points 23 -> distance 13; B: SL points 10 -> distance 0
        f.add_swing_candidate("NIFTY30JAN2525900CE", &swing(250.0, 240.0, 0));
        f.add_swing_candidate("NIFTY30JAN2526000CE", &swing(200.0, 190.0, 0));

        let detectors = MultiSwingDetector::new(
            &["NIFTY30JAN2525900CE".to_string(), "NIFTY30JAN2526000CE".to_string()],
            500,
        );
        let latest = HashMap::from([
            ("NIFTY30JAN2525900CE".to_string(), bar_at(1, 271.95, 250.5)),
            ("NIFTY30JAN2526000CE".to_string(), bar_at(1, 208.95, 200.5)),
        ]);
        let current = HashMap::new();
        let best = f.evaluate_all_candidates(
            &latest,
            &current,
            &detectors,
            &HashSet::new(),
            &HashSet::new(),
        );

        // B has SL points exactly 10 (208.95 + 1 - 199.95): wins the tie-break
        assert_eq!(best.ce.unwrap().symbol, "NIFTY30JAN2526000CE");
    }

    #[test]
    fn test_open_position_symbol_excluded() {
        let sym = "NIFTY30JAN2526000CE";
        let mut f = filter_with_candidate(sym, 100.0, 95.0);

        let detectors = MultiSwingDetector::new(&[sym.to_string()], 500);
        let latest = HashMap::from([(sym.to_string(), bar_at(1, 105.0, 100.5))]);
        let open = HashSet::from([sym.to_string()]);
        let best = f.evaluate_all_candidates(
            &latest,
            &HashMap::new(),
            &detectors,
            &open,
            &HashSet::new(),
        );
        assert!(best.ce.is_none());
    }

    #[test]
    fn test_break_without_order_marks_missed() {
        let sym = "NIFTY30JAN2526000CE";
        let mut f = filter_with_candidate(sym, 100.0, 95.0);

        // Price at 99.0 <= 99.95 with no pending order
        let best = evaluate(&mut f, sym, 99.0, 105.0);
        assert!(best.ce.is_none());
        assert!(f.candidates.get(sym).unwrap().broken_at_startup);

        // Recovery above the level does not resurrect the candidate
        let best = evaluate(&mut f, sym, 100.5, 105.0);
        assert!(best.ce.is_none());
    }

    #[test]
    fn test_trigger_place_within_proximity() {
        let sym = "NIFTY30JAN2526000CE";
        let mut f = filter_with_candidate(sym, 100.0, 95.0);
        let best = evaluate(&mut f, sym, 100.5, 105.0);

        let triggers = f.get_order_triggers(&best, &HashMap::new());
        let ce = triggers.get(&OptionType::CE).unwrap();
        assert_eq!(ce.action, TriggerAction::Place);
        // Limit is 3 below the trigger
        assert!((ce.limit_price.unwrap() - 96.95).abs() < 1e-9);
    }

    #[test]
    fn test_trigger_wait_when_far() {
        let sym = "NIFTY30JAN2526000CE";
        let mut f = filter_with_candidate(sym, 100.0, 95.0);
        let best = evaluate(&mut f, sym, 103.0, 105.0);

        let triggers = f.get_order_triggers(&best, &HashMap::new());
        assert_eq!(triggers.get(&OptionType::CE).unwrap().action, TriggerAction::Wait);
    }

    #[test]
    fn test_trigger_cancel_when_candidate_gone() {
        let f = ContinuousFilter::new(config(), "30JAN25".to_string());
        let pending = HashMap::from([(
            OptionType::CE,
            EntryOrder {
                order_id: "X1".to_string(),
                symbol: "NIFTY30JAN2526000CE".to_string(),
                trigger_price: 99.95,
                limit_price: 96.95,
                quantity: 650,
                status: OrderStatus::Pending,
                placed_at: Utc::now(),
                candidate: dummy_candidate(),
            },
        )]);

        let triggers = f.get_order_triggers(&BestStrikes::default(), &pending);
        assert_eq!(triggers.get(&OptionType::CE).unwrap().action, TriggerAction::Cancel);
        // No pending PE order and no candidate: nothing to do
        assert_eq!(triggers.get(&OptionType::PE).unwrap().action, TriggerAction::None);
    }

    #[test]
    fn test_trigger_check_fill_on_break_with_resting_order() {
        let sym = "NIFTY30JAN2526000CE";
        let mut f = filter_with_candidate(sym, 100.0, 95.0);

        let pending = HashMap::from([(
            OptionType::CE,
            EntryOrder {
                order_id: "X1".to_string(),
                symbol: sym.to_string(),
                trigger_price: 99.95,
                limit_price: 96.95,
                quantity: 650,
                status: OrderStatus::Pending,
                placed_at: Utc::now(),
                candidate: dummy_candidate(),
            },
        )]);

        // Price broke while the order rests on the same symbol. The current
        // bar carries the intraminute high that sets the SL.
        let detectors = MultiSwingDetector::new(&[sym.to_string()], 500);
        let latest = HashMap::from([(sym.to_string(), bar_at(1, 105.0, 100.2))]);
        let current = HashMap::from([(sym.to_string(), bar_at(2, 105.0, 99.5))]);
        let pending_syms = HashSet::from([sym.to_string()]);
        let best = f.evaluate_all_candidates(
            &latest,
            &current,
            &detectors,
            &HashSet::new(),
            &pending_syms,
        );

        let triggers = f.get_order_triggers(&best, &pending);
        assert_eq!(
            triggers.get(&OptionType::CE).unwrap().action,
            TriggerAction::CheckFill
        );
    }

    fn dummy_candidate() -> Candidate {
        Candidate {
            symbol: "NIFTY30JAN2526000CE".to_string(),
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
            sl_percent: 0.0605,
            vwap_premium: 0.052,
            lots: 10,
            quantity: 650,
            actual_r: 3900.0,
            qualified: true,
            disqualify_reason: None,
            broken_at_startup: false,
        }
    }
}
