/// Order churn circuit breaker
///
/// A "cycle" is a cancel followed within `cancel_place_gap` by a place of the
/// same symbol. Two cycles for one symbol inside the window block that symbol;
/// five cycles across all symbols demand a strategy pause.
use std::collections::{HashMap, HashSet, VecDeque};
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

/// Verdict for one recorded place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChurnVerdict {
    Ok,
    SymbolBlocked,
    StrategyPause,
}

pub struct OrderChurnDetector {
    window: Duration,
    cancel_place_gap: Duration,
    per_symbol_limit: usize,
    global_limit: usize,
    /// Recent cancel timestamps per symbol
    pub cancel_events: HashMap<String, VecDeque<DateTime<Utc>>>,
    /// (time, symbol) of every detected cycle
    churn_cycle_log: VecDeque<(DateTime<Utc>, String)>,
    pub blocked_symbols: HashSet<String>,
}

impl OrderChurnDetector {
    pub fn new(window_secs: i64, per_symbol_limit: usize, global_limit: usize) -> Self {
        OrderChurnDetector {
            window: Duration::seconds(window_secs),
            cancel_place_gap: Duration::seconds(30),
            per_symbol_limit,
            global_limit,
            cancel_events: HashMap::new(),
            churn_cycle_log: VecDeque::new(),
            blocked_symbols: HashSet::new(),
        }
    }

    pub fn record_cancel(&mut self, symbol: &str) {
        self.record_cancel_at(symbol, Utc::now());
    }

    pub fn record_cancel_at(&mut self, symbol: &str, now: DateTime<Utc>) {
        self.cancel_events
            .entry(symbol.to_string())
            .or_default()
            .push_back(now);
    }

    pub fn record_place(&mut self, symbol: &str) -> ChurnVerdict {
        self.record_place_at(symbol, Utc::now())
    }

    pub fn record_place_at(&mut self, symbol: &str, now: DateTime<Utc>) -> ChurnVerdict {
        self.prune(now);

        // A cycle needs a cancel of the SAME symbol within the gap
        let is_cycle = self
            .cancel_events
            .get(symbol)
            .map(|events| {
                events
                    .iter()
                    .any(|t| now - *t <= self.cancel_place_gap && *t <= now)
            })
            .unwrap_or(false);

        if !is_cycle {
            return ChurnVerdict::Ok;
        }

        self.churn_cycle_log.push_back((now, symbol.to_string()));

        let symbol_cycles = self
            .churn_cycle_log
            .iter()
            .filter(|(t, s)| s == symbol && now - *t <= self.window)
            .count();

        if symbol_cycles >= self.per_symbol_limit {
            warn!(
                "[CHURN] {} blocked: {} cancel+place cycles within window",
                symbol, symbol_cycles
            );
            self.blocked_symbols.insert(symbol.to_string());
            return ChurnVerdict::SymbolBlocked;
        }

        let global_cycles = self
            .churn_cycle_log
            .iter()
            .filter(|(t, _)| now - *t <= self.window)
            .count();

        if global_cycles >= self.global_limit {
            warn!(
                "[CHURN] Global limit reached: {} cycles across symbols - strategy pause",
                global_cycles
            );
            return ChurnVerdict::StrategyPause;
        }

        ChurnVerdict::Ok
    }

    pub fn is_blocked(&self, symbol: &str) -> bool {
        self.blocked_symbols.contains(symbol)
    }

    pub fn unblock_symbol(&mut self, symbol: &str) {
        self.blocked_symbols.remove(symbol);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some((t, _)) = self.churn_cycle_log.front() {
            if now - *t > self.window {
                self.churn_cycle_log.pop_front();
            } else {
                break;
            }
        }
        for events in self.cancel_events.values_mut() {
            while let Some(t) = events.front() {
                if now - *t > self.window {
                    events.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_cycle(&mut self, at: DateTime<Utc>, symbol: &str) {
        self.churn_cycle_log.push_back((at, symbol.to_string()));
    }
}

impl Default for OrderChurnDetector {
    fn default() -> Self {
        Self::new(300, 2, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> OrderChurnDetector {
        OrderChurnDetector::new(300, 2, 5)
    }

    #[test]
    fn test_no_churn_on_first_place() {
        let mut d = detector();
        assert_eq!(d.record_place("NIFTY25700PE"), ChurnVerdict::Ok);
    }

    #[test]
    fn test_no_churn_different_symbols() {
        let mut d = detector();
        d.record_cancel("NIFTY25700PE");
        assert_eq!(d.record_place("NIFTY25600PE"), ChurnVerdict::Ok);
        assert!(!d.is_blocked("NIFTY25600PE"));
    }

    #[test]
    fn test_single_cycle_ok() {
        let mut d = detector();
        d.record_cancel("NIFTY25700PE");
        assert_eq!(d.record_place("NIFTY25700PE"), ChurnVerdict::Ok);
    }

    #[test]
    fn test_symbol_blocked_after_two_cycles() {
        let mut d = detector();
        let sym = "NIFTY25700PE";

        d.record_cancel(sym);
        d.record_place(sym);

        d.record_cancel(sym);
        assert_eq!(d.record_place(sym), ChurnVerdict::SymbolBlocked);
        assert!(d.is_blocked(sym));
    }

    #[test]
    fn test_unblock_symbol() {
        let mut d = detector();
        let sym = "NIFTY25700PE";

        d.record_cancel(sym);
        d.record_place(sym);
        d.record_cancel(sym);
        d.record_place(sym);
        assert!(d.is_blocked(sym));

        d.unblock_symbol(sym);
        assert!(!d.is_blocked(sym));
    }

    #[test]
    fn test_global_limit_triggers_strategy_pause() {
        let mut d = detector();
        let symbols = ["SYM_A", "SYM_B", "SYM_C", "SYM_D", "SYM_E"];

        let mut last = ChurnVerdict::Ok;
        for sym in symbols {
            d.record_cancel(sym);
            last = d.record_place(sym);
        }

        // One cycle per symbol stays under the per-symbol limit; the fifth
        // cycle crosses the global limit
        assert_eq!(last, ChurnVerdict::StrategyPause);
    }

    #[test]
    fn test_cycle_window_expiry() {
        let mut d = detector();
        let sym = "NIFTY25700PE";
        let now = Utc::now();

        // Cycle from 400s ago sits outside the 300s window
        d.inject_cycle(now - Duration::seconds(400), sym);
        d.record_cancel_at(sym, now - Duration::seconds(400));

        d.record_cancel_at(sym, now);
        assert_eq!(d.record_place_at(sym, now), ChurnVerdict::Ok);
    }

    #[test]
    fn test_place_without_recent_cancel_not_a_cycle() {
        let mut d = detector();
        let sym = "NIFTY25700PE";
        let now = Utc::now();

        // Cancel 35s ago: outside the 30s cancel->place gap
        d.record_cancel_at(sym, now - Duration::seconds(35));
        assert_eq!(d.record_place_at(sym, now), ChurnVerdict::Ok);
    }

    #[test]
    fn test_two_cancels_two_places_then_blocked() {
        // The third place for the symbol within the window is refused
        let mut d = detector();
        let sym = "NIFTY25700PE";

        d.record_cancel(sym);
        d.record_place(sym);
        d.record_cancel(sym);
        d.record_place(sym);

        assert!(d.is_blocked(sym));
    }
}
