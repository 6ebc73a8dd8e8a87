/// Market session and timing utilities (IST)
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Asia::Kolkata;

use crate::config::loader::parse_hhmm;
use crate::config::Config;
use crate::error::Result;

/// Current time in exchange timezone
pub fn ist_now() -> DateTime<Utc> {
    Utc::now()
}

/// Round a timestamp down to its minute boundary
pub fn floor_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0).unwrap().with_nanosecond(0).unwrap()
}

/// Session boundaries for one trading day, resolved from config once
#[derive(Debug, Clone, Copy)]
pub struct MarketSession {
    open: (u32, u32),
    close: (u32, u32),
    force_exit: (u32, u32),
}

impl MarketSession {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(MarketSession {
            open: parse_hhmm(&cfg.market_start_time)?,
            close: parse_hhmm(&cfg.market_end_time)?,
            force_exit: parse_hhmm(&cfg.force_exit_time)?,
        })
    }

    fn at(&self, now: DateTime<Utc>, hm: (u32, u32)) -> DateTime<Utc> {
        let ist = now.with_timezone(&Kolkata);
        Kolkata
            .with_ymd_and_hms(ist.year(), ist.month(), ist.day(), hm.0, hm.1, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Market open instant for the day containing `now`
    pub fn open_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.at(now, self.open)
    }

    /// Market close instant for the day containing `now`
    pub fn close_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.at(now, self.close)
    }

    /// Forced end-of-day exit instant for the day containing `now`
    pub fn force_exit_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.at(now, self.force_exit)
    }

    pub fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        now >= self.open_at(now) && now < self.close_at(now)
    }

    pub fn is_force_exit_time(&self, now: DateTime<Utc>) -> bool {
        now >= self.force_exit_at(now)
    }

    /// Trade date string (IST) used as the daily-state key
    pub fn trade_date(&self, now: DateTime<Utc>) -> String {
        now.with_timezone(&Kolkata).format("%Y-%m-%d").to_string()
    }
}

/// Standard NSE session used by unit tests across the crate
#[cfg(test)]
pub fn session_for_tests() -> MarketSession {
    MarketSession {
        open: (9, 15),
        close: (15, 30),
        force_exit: (15, 15),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> MarketSession {
        session_for_tests()
    }

    fn ist(h: u32, m: u32) -> DateTime<Utc> {
        Kolkata
            .with_ymd_and_hms(2025, 1, 30, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_market_window_boundaries() {
        let s = session();
        assert!(!s.is_market_open(ist(9, 14)));
        assert!(s.is_market_open(ist(9, 15)));
        assert!(s.is_market_open(ist(15, 29)));
        assert!(!s.is_market_open(ist(15, 30)));
    }

    #[test]
    fn test_force_exit_boundary() {
        let s = session();
        assert!(!s.is_force_exit_time(ist(15, 14)));
        assert!(s.is_force_exit_time(ist(15, 15)));
        assert!(s.is_force_exit_time(ist(15, 29)));
    }

    #[test]
    fn test_floor_to_minute() {
        let ts = Kolkata
            .with_ymd_and_hms(2025, 1, 30, 10, 42, 37)
            .unwrap()
            .with_timezone(&Utc);
        let floored = floor_to_minute(ts);
        let ist = floored.with_timezone(&Kolkata);
        assert_eq!(ist.minute(), 42);
        assert_eq!(ist.second(), 0);
    }

    #[test]
    fn test_trade_date_is_ist() {
        let s = session();
        assert_eq!(s.trade_date(ist(10, 0)), "2025-01-30");
    }
}
