/// Configuration loading: TOML file plus environment-variable overrides
use crate::config::Config;
use crate::error::{Result, TradingError};

/// Load configuration from an optional TOML file layered with environment
/// variables. Env keys match the field names case-insensitively
/// (R_VALUE, DRY_RUN, MARKET_START_TIME, ...), so operators can override
/// any single value without touching the file.
pub fn load_config(path: &str) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::default())
        .build()
        .map_err(|e| TradingError::ConfigError(format!("Failed to build config: {}", e)))?;

    let cfg: Config = settings
        .try_deserialize()
        .map_err(|e| TradingError::ConfigError(format!("Failed to parse config: {}", e)))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.r_value <= 0.0 {
        return Err(TradingError::ConfigError(format!(
            "Invalid r_value: {}",
            cfg.r_value
        )));
    }

    if cfg.lot_size <= 0 {
        return Err(TradingError::ConfigError(format!(
            "Invalid lot_size: {}",
            cfg.lot_size
        )));
    }

    if cfg.min_entry_price >= cfg.max_entry_price {
        return Err(TradingError::ConfigError(
            "min_entry_price must be < max_entry_price".to_string(),
        ));
    }

    if cfg.min_sl_percent >= cfg.max_sl_percent {
        return Err(TradingError::ConfigError(
            "min_sl_percent must be < max_sl_percent".to_string(),
        ));
    }

    if cfg.daily_stop_r >= 0.0 || cfg.daily_target_r <= 0.0 {
        return Err(TradingError::ConfigError(
            "daily_stop_r must be negative and daily_target_r positive".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&cfg.min_data_coverage_threshold) {
        return Err(TradingError::ConfigError(format!(
            "Invalid min_data_coverage_threshold: {}",
            cfg.min_data_coverage_threshold
        )));
    }

    if cfg.max_bars_per_symbol >= cfg.bar_pruning_threshold {
        return Err(TradingError::ConfigError(
            "bar_pruning_threshold must exceed max_bars_per_symbol".to_string(),
        ));
    }

    parse_hhmm(&cfg.market_start_time)?;
    parse_hhmm(&cfg.market_end_time)?;
    parse_hhmm(&cfg.force_exit_time)?;
    parse_hhmm(&cfg.market_close_time)?;

    Ok(())
}

/// Parse an "HH:MM" session boundary into (hour, minute)
pub fn parse_hhmm(s: &str) -> Result<(u32, u32)> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 {
        return Err(TradingError::ConfigError(format!(
            "Invalid time '{}': expected HH:MM",
            s
        )));
    }
    let hour: u32 = parts[0]
        .parse()
        .map_err(|_| TradingError::ConfigError(format!("Invalid hour in '{}'", s)))?;
    let minute: u32 = parts[1]
        .parse()
        .map_err(|_| TradingError::ConfigError(format!("Invalid minute in '{}'", s)))?;
    if hour > 23 || minute > 59 {
        return Err(TradingError::ConfigError(format!(
            "Time out of range: '{}'",
            s
        )));
    }
    Ok((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        // Deserialize from an empty TOML table so serde defaults apply
        toml::from_str("").unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = base_config();
        assert!(validate_config(&cfg).is_ok());
        assert_eq!(cfg.r_value, 6500.0);
        assert_eq!(cfg.max_lots_per_position, 10);
        assert_eq!(cfg.modification_threshold, 1.00);
        assert_eq!(cfg.target_sl_points, 10.0);
        assert_eq!(cfg.failover_no_tick_threshold_secs, 15);
        assert_eq!(cfg.failover_switchback_threshold_secs, 10);
    }

    #[test]
    fn test_invalid_price_band_rejected() {
        let mut cfg = base_config();
        cfg.min_entry_price = 300.0;
        cfg.max_entry_price = 100.0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_invalid_time_rejected() {
        let mut cfg = base_config();
        cfg.market_start_time = "9:75".to_string();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("09:15").unwrap(), (9, 15));
        assert_eq!(parse_hhmm("15:30").unwrap(), (15, 30));
        assert!(parse_hhmm("25:00").is_err());
        assert!(parse_hhmm("nope").is_err());
    }

    #[test]
    fn test_paper_trading_alias() {
        let cfg: Config = toml::from_str("paper_trading = true").unwrap();
        assert!(cfg.dry_run);
    }

    #[test]
    fn test_sentinel_paths() {
        let cfg = base_config();
        assert!(cfg.kill_switch_file().ends_with("KILL_SWITCH"));
        assert!(cfg.pause_switch_file().ends_with("PAUSE_SWITCH"));
    }
}
