/// Per-symbol watch-counter swing detection
use std::collections::HashMap;
use chrono::{DateTime, Utc};
use chrono_tz::Asia::Kolkata;
use tracing::{debug, info, warn};

use crate::types::{Bar, Swing, SwingType};

/// Confirmation requires this many consecutive confirmatory bars after the
/// candidate extremum
const WATCH_CONFIRM: u8 = 2;

/// Unconfirmed extremum being watched
#[derive(Debug, Clone)]
struct SwingCandidate {
    swing_type: SwingType,
    price: f64,
    timestamp: DateTime<Utc>,
    vwap: f64,
    bar_index: usize,
    watch: u8,
}

/// Swing detector for one option symbol.
///
/// A swing low is confirmed when, after a candidate low bar, two subsequent
/// bars each form a higher high AND a higher close. Highs are symmetric.
/// Confirmed swings alternate in type; a more extreme bar before confirmation
/// replaces the candidate in place.
pub struct SwingDetector {
    pub symbol: String,
    pub bars: Vec<Bar>,
    pub swings: Vec<Swing>,
    candidate: Option<SwingCandidate>,
    /// The swing type we are currently hunting (alternation)
    looking_for: SwingType,
    last_timestamp: Option<DateTime<Utc>>,
    current_date: Option<String>,
    max_bars: usize,
}

impl SwingDetector {
    pub fn new(symbol: String, max_bars: usize) -> Self {
        SwingDetector {
            symbol,
            bars: Vec::new(),
            swings: Vec::new(),
            candidate: None,
            looking_for: SwingType::Low,
            last_timestamp: None,
            current_date: None,
            max_bars,
        }
    }

    /// Clear all per-day state. Forced before historical replay so a same-day
    /// restart's stale last bar cannot reject the replay as out-of-order.
    pub fn reset_for_new_day(&mut self) {
        self.bars.clear();
        self.swings.clear();
        self.candidate = None;
        self.looking_for = SwingType::Low;
        self.last_timestamp = None;
        self.current_date = None;
    }

    /// Feed one completed bar. Returns a newly confirmed swing, if any.
    pub fn update(&mut self, bar: &Bar) -> Option<Swing> {
        let bar_date = bar
            .timestamp
            .with_timezone(&Kolkata)
            .format("%Y-%m-%d")
            .to_string();

        match &self.current_date {
            None => self.current_date = Some(bar_date),
            Some(d) if *d != bar_date => {
                debug!("{}: new trading day, resetting swing state", self.symbol);
                self.reset_for_new_day();
                self.current_date = Some(bar_date);
            }
            _ => {}
        }

        // Out-of-order / duplicate protection
        if let Some(last) = self.last_timestamp {
            if bar.timestamp <= last {
                warn!(
                    "{}: rejected out-of-order bar {} (last {})",
                    self.symbol, bar.timestamp, last
                );
                return None;
            }
        }
        self.last_timestamp = Some(bar.timestamp);

        let prev = self.bars.last().cloned();
        self.bars.push(bar.clone());
        if self.bars.len() > self.max_bars {
            let excess = self.bars.len() - self.max_bars;
            self.bars.drain(0..excess);
            // Candidate bar_index values reference the trimmed list
            if let Some(c) = self.candidate.as_mut() {
                c.bar_index = c.bar_index.saturating_sub(excess);
            }
        }
        let index = self.bars.len() - 1;

        let extended = match (&self.candidate, self.looking_for) {
            (None, _) => true,
            (Some(c), SwingType::Low) => bar.low <= c.price,
            (Some(c), SwingType::High) => bar.high >= c.price,
        };

        if extended {
            // Adopt (or refresh) the candidate extremum; watch restarts
            let price = match self.looking_for {
                SwingType::Low => bar.low,
                SwingType::High => bar.high,
            };
            self.candidate = Some(SwingCandidate {
                swing_type: self.looking_for,
                price,
                timestamp: bar.timestamp,
                vwap: bar.vwap,
                bar_index: index,
                watch: 0,
            });
            return None;
        }

        let confirmatory = match (&prev, self.looking_for) {
            (Some(p), SwingType::Low) => bar.high > p.high && bar.close > p.close,
            (Some(p), SwingType::High) => bar.low < p.low && bar.close < p.close,
            (None, _) => false,
        };

        if !confirmatory {
            return None;
        }

        let candidate = self.candidate.as_mut()?;
        candidate.watch += 1;

        if candidate.watch < WATCH_CONFIRM {
            return None;
        }

        let swing = Swing {
            swing_type: candidate.swing_type,
            price: candidate.price,
            timestamp: candidate.timestamp,
            vwap: candidate.vwap,
            bar_index: candidate.bar_index,
        };
        self.swings.push(swing.clone());

        info!(
            "[SWING] {} {} @ {:.2} ({})",
            self.symbol,
            swing.swing_type.as_str(),
            swing.price,
            swing.timestamp.with_timezone(&Kolkata).format("%H:%M")
        );

        // Alternate: the confirming bar seeds the opposite-type candidate
        self.looking_for = self.looking_for.opposite();
        let seed_price = match self.looking_for {
            SwingType::Low => bar.low,
            SwingType::High => bar.high,
        };
        self.candidate = Some(SwingCandidate {
            swing_type: self.looking_for,
            price: seed_price,
            timestamp: bar.timestamp,
            vwap: bar.vwap,
            bar_index: index,
            watch: 0,
        });

        Some(swing)
    }

    /// Highest bar high at or after `since` (completed bars only)
    pub fn highest_high_since(&self, since: DateTime<Utc>) -> Option<f64> {
        let mut highest: Option<f64> = None;
        for bar in &self.bars {
            if bar.timestamp >= since {
                highest = Some(highest.map_or(bar.high, |h: f64| h.max(bar.high)));
            }
        }
        highest
    }

    /// Most recent confirmed swing low, if it is the latest swing
    pub fn latest_unbroken_swing_low(&self) -> Option<&Swing> {
        self.swings
            .iter()
            .rev()
            .find(|s| s.swing_type == SwingType::Low)
    }
}

/// Detector registry for the whole option universe, with a silent mode used
/// during historical backfill.
pub struct MultiSwingDetector {
    pub detectors: HashMap<String, SwingDetector>,
    live_mode: bool,
    max_bars: usize,
}

impl MultiSwingDetector {
    pub fn new(symbols: &[String], max_bars: usize) -> Self {
        let detectors = symbols
            .iter()
            .map(|s| (s.clone(), SwingDetector::new(s.clone(), max_bars)))
            .collect();

        MultiSwingDetector {
            detectors,
            live_mode: false,
            max_bars,
        }
    }

    /// Silent until backfill completes; the orchestrator flips this on once
    pub fn enable_live_mode(&mut self) {
        self.live_mode = true;
        info!("[SWING] Live mode enabled");
    }

    pub fn is_live(&self) -> bool {
        self.live_mode
    }

    pub fn get(&self, symbol: &str) -> Option<&SwingDetector> {
        self.detectors.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut SwingDetector> {
        self.detectors.get_mut(symbol)
    }

    /// Feed one bar for one symbol; creates a detector on first sight
    pub fn update(&mut self, symbol: &str, bar: &Bar) -> Option<Swing> {
        let detector = self
            .detectors
            .entry(symbol.to_string())
            .or_insert_with(|| SwingDetector::new(symbol.to_string(), self.max_bars));
        detector.update(bar)
    }

    /// Feed the latest completed bar for many symbols. Returns newly
    /// confirmed swings as (symbol, swing) pairs.
    pub fn update_all(&mut self, bars: &HashMap<String, Bar>) -> Vec<(String, Swing)> {
        let mut confirmed = Vec::new();
        for (symbol, bar) in bars {
            if let Some(swing) = self.update(symbol, bar) {
                confirmed.push((symbol.clone(), swing));
            }
        }
        confirmed
    }

    /// Force-reset every detector (same-day restart before replay)
    pub fn reset_all(&mut self) {
        for detector in self.detectors.values_mut() {
            detector.reset_for_new_day();
        }
    }

    /// All confirmed swings across symbols (for DB backfill after replay)
    pub fn all_swings(&self) -> Vec<(String, Swing)> {
        let mut out = Vec::new();
        for (symbol, detector) in &self.detectors {
            for swing in &detector.swings {
                out.push((symbol.clone(), swing.clone()));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(minute: u32, open: f64, high: f64, low: f64, close: f64) -> Bar {
        let ts = Kolkata
            .with_ymd_and_hms(2025, 1, 30, 10, minute, 0)
            .unwrap()
            .with_timezone(&Utc);
        Bar {
            timestamp: ts,
            open,
            high,
            low,
            close,
            volume: 100,
            vwap: 95.0,
            atp: 0.0,
            tick_count: 10,
        }
    }

    fn detector() -> SwingDetector {
        SwingDetector::new("NIFTY30JAN2526000CE".to_string(), 500)
    }

    #[test]
    fn test_swing_low_confirmed_after_two_confirmatory_bars() {
        let mut d = detector();

        assert!(d.update(&bar(0, 102.0, 103.0, 100.0, 101.0)).is_none()); // candidate low 100
        assert!(d.update(&bar(1, 101.0, 104.0, 100.5, 102.0)).is_none()); // HH + HC, watch 1
        let swing = d.update(&bar(2, 102.0, 105.0, 101.0, 103.0)); // HH + HC, watch 2

        let swing = swing.expect("swing low should confirm");
        assert_eq!(swing.swing_type, SwingType::Low);
        assert_eq!(swing.price, 100.0);
        assert_eq!(swing.vwap, 95.0);
    }

    #[test]
    fn test_candidate_updates_in_place_on_lower_low() {
        let mut d = detector();

        d.update(&bar(0, 102.0, 103.0, 100.0, 101.0)); // candidate 100
        d.update(&bar(1, 101.0, 104.0, 100.5, 102.0)); // watch 1
        d.update(&bar(2, 101.0, 103.5, 99.0, 100.0)); // lower low: candidate 99, watch resets
        d.update(&bar(3, 100.0, 104.0, 99.5, 101.0)); // watch 1
        let swing = d.update(&bar(4, 101.0, 105.0, 100.0, 102.0)); // watch 2

        let swing = swing.expect("swing low should confirm at the updated low");
        assert_eq!(swing.price, 99.0);
    }

    #[test]
    fn test_swings_alternate_low_then_high() {
        let mut d = detector();

        d.update(&bar(0, 102.0, 103.0, 100.0, 101.0));
        d.update(&bar(1, 101.0, 104.0, 100.5, 102.0));
        let low = d.update(&bar(2, 102.0, 105.0, 101.0, 103.0));
        assert_eq!(low.unwrap().swing_type, SwingType::Low);

        // Rising bars extend the high candidate
        d.update(&bar(3, 103.0, 107.0, 102.5, 106.0));
        d.update(&bar(4, 106.0, 109.0, 105.0, 108.0)); // high candidate 109
        // Two falling bars confirm the swing high
        d.update(&bar(5, 108.0, 108.5, 104.0, 105.0));
        let high = d.update(&bar(6, 105.0, 106.0, 103.0, 104.0));

        let high = high.expect("swing high should confirm");
        assert_eq!(high.swing_type, SwingType::High);
        assert_eq!(high.price, 109.0);
    }

    #[test]
    fn test_out_of_order_bar_rejected() {
        let mut d = detector();

        d.update(&bar(5, 102.0, 103.0, 100.0, 101.0));
        assert_eq!(d.bars.len(), 1);

        // Same timestamp: duplicate
        d.update(&bar(5, 102.0, 103.0, 100.0, 101.0));
        assert_eq!(d.bars.len(), 1);

        // Earlier timestamp: out of order
        d.update(&bar(3, 102.0, 103.0, 100.0, 101.0));
        assert_eq!(d.bars.len(), 1);
    }

    #[test]
    fn test_non_confirmatory_bar_does_not_advance_watch() {
        let mut d = detector();

        d.update(&bar(0, 102.0, 103.0, 100.0, 101.0)); // candidate 100
        // Higher high but lower close: not confirmatory, not a lower low
        d.update(&bar(1, 101.0, 104.0, 100.5, 100.5));
        d.update(&bar(2, 100.5, 104.5, 100.6, 101.0)); // HH + HC, watch 1
        let swing = d.update(&bar(3, 101.0, 105.0, 100.8, 102.0)); // watch 2

        assert!(swing.is_some());
    }

    #[test]
    fn test_highest_high_since() {
        let mut d = detector();
        d.update(&bar(0, 102.0, 103.0, 100.0, 101.0));
        d.update(&bar(1, 101.0, 104.0, 100.5, 102.0));
        d.update(&bar(2, 102.0, 105.0, 101.0, 103.0));

        let since = Kolkata
            .with_ymd_and_hms(2025, 1, 30, 10, 1, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(d.highest_high_since(since), Some(105.0));
    }

    #[test]
    fn test_multi_detector_silent_until_enabled() {
        let symbols = vec!["A".to_string(), "B".to_string()];
        let mut multi = MultiSwingDetector::new(&symbols, 500);
        assert!(!multi.is_live());
        multi.enable_live_mode();
        assert!(multi.is_live());
    }

    #[test]
    fn test_new_day_resets_state() {
        let mut d = detector();
        d.update(&bar(0, 102.0, 103.0, 100.0, 101.0));
        assert_eq!(d.bars.len(), 1);

        let next_day = Kolkata
            .with_ymd_and_hms(2025, 1, 31, 9, 15, 0)
            .unwrap()
            .with_timezone(&Utc);
        let b = Bar {
            timestamp: next_day,
            ..bar(0, 102.0, 103.0, 100.0, 101.0)
        };
        d.update(&b);
        assert_eq!(d.bars.len(), 1);
        assert!(d.swings.is_empty());
    }
}
