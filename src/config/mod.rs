/// Typed configuration: TOML file layered with environment overrides
pub mod loader;

pub use loader::load_config;

use serde::Deserialize;

/// Engine configuration, loaded once at startup. No global mutable config.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Instance / mode
    #[serde(default = "d_instance_name")]
    pub instance_name: String,
    /// Suppress real broker mutations; synthesize order ids
    #[serde(default, alias = "paper_trading")]
    pub dry_run: bool,

    // Session boundaries (IST, "HH:MM")
    #[serde(default = "d_market_start")]
    pub market_start_time: String,
    #[serde(default = "d_market_end")]
    pub market_end_time: String,
    #[serde(default = "d_force_exit")]
    pub force_exit_time: String,
    #[serde(default = "d_market_end")]
    pub market_close_time: String,

    // Position sizing
    #[serde(default = "d_r_value")]
    pub r_value: f64,
    #[serde(default = "d_lot_size")]
    pub lot_size: i32,
    #[serde(default = "d_max_lots")]
    pub max_lots_per_position: i32,

    // Open-position caps
    #[serde(default = "d_max_positions")]
    pub max_positions: usize,
    #[serde(default = "d_max_per_type")]
    pub max_per_type: usize,

    // Session risk
    #[serde(default = "d_daily_target_r")]
    pub daily_target_r: f64,
    #[serde(default = "d_daily_stop_r")]
    pub daily_stop_r: f64,

    // Entry filter thresholds
    #[serde(default = "d_min_entry_price")]
    pub min_entry_price: f64,
    #[serde(default = "d_max_entry_price")]
    pub max_entry_price: f64,
    #[serde(default = "d_min_vwap_premium")]
    pub min_vwap_premium: f64,
    #[serde(default = "d_min_sl_percent")]
    pub min_sl_percent: f64,
    #[serde(default = "d_max_sl_percent")]
    pub max_sl_percent: f64,
    #[serde(default = "d_target_sl_points")]
    pub target_sl_points: f64,

    // Order management
    #[serde(default = "d_tick_size")]
    pub tick_size: f64,
    #[serde(default = "d_modification_threshold")]
    pub modification_threshold: f64,
    /// Place the resting entry only when price is this close to the entry
    #[serde(default = "d_entry_proximity")]
    pub entry_proximity: f64,
    /// Limit offset from trigger on stop-limit orders (entry below, SL above)
    #[serde(default = "d_sl_limit_offset")]
    pub sl_limit_offset: f64,
    #[serde(default = "d_max_order_retries")]
    pub max_order_retries: u32,
    #[serde(default = "d_order_retry_delay")]
    pub order_retry_delay_secs: u64,

    // Safety
    #[serde(default = "d_max_sl_failure_count")]
    pub max_sl_failure_count: u32,
    #[serde(default = "d_emergency_retry_count")]
    pub emergency_exit_retry_count: u32,
    #[serde(default = "d_emergency_retry_delay")]
    pub emergency_exit_retry_delay_secs: u64,

    // Dual-feed timing
    #[serde(default = "d_no_tick_threshold")]
    pub failover_no_tick_threshold_secs: u64,
    #[serde(default = "d_switchback_threshold")]
    pub failover_switchback_threshold_secs: u64,

    // Watchdog
    #[serde(default = "d_min_coverage")]
    pub min_data_coverage_threshold: f64,
    #[serde(default = "d_stale_data_timeout")]
    pub stale_data_timeout_secs: u64,
    #[serde(default = "d_max_bar_age")]
    pub max_bar_age_seconds: u64,
    #[serde(default = "d_max_tick_age")]
    pub max_tick_age_secs: u64,

    // Reconnect
    #[serde(default = "d_ws_reconnect_delay")]
    pub websocket_reconnect_delay_secs: u64,
    #[serde(default = "d_ws_max_reconnects")]
    pub websocket_max_reconnect_attempts: u32,

    // Memory
    #[serde(default = "d_max_bars")]
    pub max_bars_per_symbol: usize,
    #[serde(default = "d_pruning_threshold")]
    pub bar_pruning_threshold: usize,

    // Universe
    #[serde(default = "d_strike_scan_range")]
    pub strike_scan_range: i64,
    #[serde(default = "d_strike_step")]
    pub strike_step: i64,
    /// Expiry tag embedded in option symbols, e.g. "30JAN25" (provided by launcher)
    #[serde(default)]
    pub expiry_date: String,
    /// ATM strike provided by the launcher (auto-detection is out of scope)
    #[serde(default)]
    pub atm_strike: i64,

    // Tick loop
    #[serde(default = "d_tick_interval")]
    pub tick_interval_secs: u64,

    // Broker endpoints
    #[serde(default = "d_broker_host")]
    pub broker_host: String,
    #[serde(default)]
    pub broker_api_key: String,
    #[serde(default)]
    pub primary_ws_url: String,
    #[serde(default)]
    pub backup_ws_url: String,
    #[serde(default = "d_exchange")]
    pub exchange: String,
    #[serde(default = "d_product")]
    pub product: String,
    #[serde(default = "d_strategy_name")]
    pub strategy_name: String,

    // Telegram
    #[serde(default)]
    pub telegram_enabled: bool,
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,

    // Paths
    #[serde(default = "d_state_dir")]
    pub state_dir: String,
    #[serde(default = "d_db_path")]
    pub db_path: String,

    // Logging
    #[serde(default = "d_log_level")]
    pub log_level: String,
}

fn d_instance_name() -> String {
    "LOCAL".to_string()
}
fn d_market_start() -> String {
    "09:15".to_string()
}
fn d_market_end() -> String {
    "15:30".to_string()
}
fn d_force_exit() -> String {
    "15:15".to_string()
}
fn d_r_value() -> f64 {
    6500.0
}
fn d_lot_size() -> i32 {
    65
}
fn d_max_lots() -> i32 {
    10
}
fn d_max_positions() -> usize {
    5
}
fn d_max_per_type() -> usize {
    3
}
fn d_daily_target_r() -> f64 {
    5.0
}
fn d_daily_stop_r() -> f64 {
    -5.0
}
fn d_min_entry_price() -> f64 {
    100.0
}
fn d_max_entry_price() -> f64 {
    300.0
}
fn d_min_vwap_premium() -> f64 {
    0.04
}
fn d_min_sl_percent() -> f64 {
    0.02
}
fn d_max_sl_percent() -> f64 {
    0.10
}
fn d_target_sl_points() -> f64 {
    10.0
}
fn d_tick_size() -> f64 {
    0.05
}
fn d_modification_threshold() -> f64 {
    1.00
}
fn d_entry_proximity() -> f64 {
    1.0
}
fn d_sl_limit_offset() -> f64 {
    3.0
}
fn d_max_order_retries() -> u32 {
    3
}
fn d_order_retry_delay() -> u64 {
    2
}
fn d_max_sl_failure_count() -> u32 {
    3
}
fn d_emergency_retry_count() -> u32 {
    3
}
fn d_emergency_retry_delay() -> u64 {
    2
}
fn d_no_tick_threshold() -> u64 {
    15
}
fn d_switchback_threshold() -> u64 {
    10
}
fn d_min_coverage() -> f64 {
    0.5
}
fn d_stale_data_timeout() -> u64 {
    30
}
fn d_max_bar_age() -> u64 {
    120
}
fn d_max_tick_age() -> u64 {
    30
}
fn d_ws_reconnect_delay() -> u64 {
    5
}
fn d_ws_max_reconnects() -> u32 {
    5
}
fn d_max_bars() -> usize {
    500
}
fn d_pruning_threshold() -> usize {
    600
}
fn d_strike_scan_range() -> i64 {
    20
}
fn d_strike_step() -> i64 {
    50
}
fn d_tick_interval() -> u64 {
    1
}
fn d_broker_host() -> String {
    "http://127.0.0.1:5000".to_string()
}
fn d_exchange() -> String {
    "NFO".to_string()
}
fn d_product() -> String {
    "MIS".to_string()
}
fn d_strategy_name() -> String {
    "swingbreak_live".to_string()
}
fn d_state_dir() -> String {
    "data".to_string()
}
fn d_db_path() -> String {
    "data/swingbreak.db".to_string()
}
fn d_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Kill-switch sentinel file path
    pub fn kill_switch_file(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.state_dir).join("KILL_SWITCH")
    }

    /// Pause-switch sentinel file path
    pub fn pause_switch_file(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.state_dir).join("PAUSE_SWITCH")
    }
}
