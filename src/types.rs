/// Core type definitions for the swing-break engine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel order id used while a broker place call is in flight.
/// Inserted before the API call so a concurrent tick cannot double-place.
pub const PLACING_SENTINEL: &str = "PLACING";

/// One-minute OHLCV bar with session VWAP for a single option symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    /// Minute-aligned bar timestamp
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Volume accumulated within this bar
    pub volume: i64,
    /// Session-cumulative VWAP from market open (typical price weighted)
    pub vwap: f64,
    /// Exchange-provided session average price, 0.0 when not yet seen
    pub atp: f64,
    pub tick_count: u32,
}

impl Bar {
    pub fn new(timestamp: DateTime<Utc>, price: f64, volume: i64) -> Self {
        Bar {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            vwap: 0.0,
            atp: 0.0,
            tick_count: 1,
        }
    }

    pub fn update_tick(&mut self, price: f64, volume: i64) {
        self.close = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += volume;
        self.tick_count += 1;
    }

    /// Typical price used for the session VWAP accumulator
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    pub fn is_valid(&self) -> bool {
        self.tick_count > 0 && self.high >= self.low
    }
}

/// Live quote tick delivered by a feed
#[derive(Debug, Clone)]
pub struct Tick {
    pub symbol: String,
    pub ltp: f64,
    /// Session-cumulative traded volume
    pub volume: i64,
    /// Exchange-provided session average price (ATP), 0.0 when absent
    pub average_price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Option type (Call or Put)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    CE,
    PE,
}

impl OptionType {
    pub fn as_str(&self) -> &str {
        match self {
            OptionType::CE => "CE",
            OptionType::PE => "PE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CE" => Some(OptionType::CE),
            "PE" => Some(OptionType::PE),
            _ => None,
        }
    }

    /// Both tradable option types, CE first
    pub const BOTH: [OptionType; 2] = [OptionType::CE, OptionType::PE];
}

/// Swing extremum type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwingType {
    Low,
    High,
}

impl SwingType {
    pub fn as_str(&self) -> &str {
        match self {
            SwingType::Low => "LOW",
            SwingType::High => "HIGH",
        }
    }

    pub fn opposite(&self) -> SwingType {
        match self {
            SwingType::Low => SwingType::High,
            SwingType::High => SwingType::Low,
        }
    }
}

/// A confirmed local extremum on a symbol's bar series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swing {
    pub swing_type: SwingType,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    /// Session VWAP at the moment of detection
    pub vwap: f64,
    /// Bar index at detection (within the detector's bar list)
    pub bar_index: usize,
}

/// A swing low treated as a potential short entry, with live-derived metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub option_type: OptionType,
    pub strike: i64,
    pub swing_low: f64,
    pub swing_time: DateTime<Utc>,
    pub vwap_at_swing: f64,
    /// Highest high since the swing, including the current incomplete bar
    pub highest_high: f64,
    pub current_price: f64,
    /// swing_low - one tick
    pub entry_price: f64,
    /// highest_high + 1
    pub sl_price: f64,
    pub sl_points: f64,
    pub sl_percent: f64,
    /// (entry_price - vwap_at_swing) / vwap_at_swing
    pub vwap_premium: f64,
    pub lots: i32,
    pub quantity: i32,
    pub actual_r: f64,
    pub qualified: bool,
    pub disqualify_reason: Option<String>,
    /// Swing already broken before any order existed (startup protection)
    pub broken_at_startup: bool,
}

/// Entry or exit order status as tracked locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Broker place call in flight, no real order id yet
    InFlight,
    Pending,
    Cancelled,
    Filled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::InFlight => "in_flight",
            OrderStatus::Pending => "pending",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_flight" => Some(OrderStatus::InFlight),
            "pending" => Some(OrderStatus::Pending),
            "cancelled" => Some(OrderStatus::Cancelled),
            "filled" => Some(OrderStatus::Filled),
            "rejected" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

/// Resting stop-limit SELL entry order (at most one per option type)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryOrder {
    pub order_id: String,
    pub symbol: String,
    pub trigger_price: f64,
    pub limit_price: f64,
    pub quantity: i32,
    pub status: OrderStatus,
    pub placed_at: DateTime<Utc>,
    /// Snapshot of the originating candidate, carried through to the fill
    pub candidate: Candidate,
}

impl EntryOrder {
    pub fn is_in_flight(&self) -> bool {
        self.order_id == PLACING_SENTINEL || self.status == OrderStatus::InFlight
    }
}

/// Stop-limit BUY stop-loss order protecting one open position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlOrder {
    pub order_id: String,
    pub symbol: String,
    pub trigger_price: f64,
    pub limit_price: f64,
    pub quantity: i32,
    pub placed_at: DateTime<Utc>,
}

/// A confirmed entry fill as reported by the broker
#[derive(Debug, Clone)]
pub struct Fill {
    pub option_type: OptionType,
    pub symbol: String,
    pub order_id: String,
    pub fill_price: f64,
    pub quantity: i32,
    pub candidate: Candidate,
    pub filled_at: DateTime<Utc>,
}

impl Fill {
    /// Dedup key guarding against double-processing through multiple pathways
    pub fn dedup_key(&self) -> String {
        format!("{}_{}_{}", self.symbol, self.order_id, self.fill_price)
    }
}

/// A short option position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub option_type: OptionType,
    pub strike: i64,
    pub entry_price: f64,
    /// SL price recomputed live at fill time
    pub sl_price: f64,
    pub quantity: i32,
    /// Rupee risk of the position after lot rounding
    pub actual_r: f64,
    pub entry_time: DateTime<Utc>,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub unrealized_r: f64,
    pub realized_pnl: f64,
    pub realized_r: f64,
    pub is_closed: bool,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    /// Candidate snapshot at entry, persisted for restart fidelity
    pub candidate: Candidate,
}

/// Reason the session was latched into no-more-entries mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DailyExitReason {
    TargetHit,
    StopHit,
    Eod,
    Emergency,
}

impl DailyExitReason {
    pub fn as_str(&self) -> &str {
        match self {
            DailyExitReason::TargetHit => "+5R_TARGET",
            DailyExitReason::StopHit => "-5R_STOP",
            DailyExitReason::Eod => "EOD_EXIT",
            DailyExitReason::Emergency => "EMERGENCY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "+5R_TARGET" => Some(DailyExitReason::TargetHit),
            "-5R_STOP" => Some(DailyExitReason::StopHit),
            "EOD_EXIT" => Some(DailyExitReason::Eod),
            "EMERGENCY" => Some(DailyExitReason::Emergency),
            _ => None,
        }
    }
}

/// Engine operational state, persisted for the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationalState {
    Starting,
    Active,
    Waiting,
    Paused,
    Shutdown,
    Error,
}

impl OperationalState {
    pub fn as_str(&self) -> &str {
        match self {
            OperationalState::Starting => "STARTING",
            OperationalState::Active => "ACTIVE",
            OperationalState::Waiting => "WAITING",
            OperationalState::Paused => "PAUSED",
            OperationalState::Shutdown => "SHUTDOWN",
            OperationalState::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STARTING" => Some(OperationalState::Starting),
            "ACTIVE" => Some(OperationalState::Active),
            "WAITING" => Some(OperationalState::Waiting),
            "PAUSED" => Some(OperationalState::Paused),
            "SHUTDOWN" => Some(OperationalState::Shutdown),
            "ERROR" => Some(OperationalState::Error),
            _ => None,
        }
    }
}

/// Outcome of one idempotent entry-order state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    Placed,
    Modified,
    /// Cancel-then-place to a different symbol
    Switched,
    /// Existing order retained (within threshold, or cancel not verified)
    Kept,
    Cancelled,
    /// No order existed and none was requested
    NoOrder,
    Failed,
    /// Symbol refused by the churn circuit breaker
    Blocked,
    /// Global churn limit reached; orchestrator must assert the pause switch
    StrategyPause,
}

impl EntryAction {
    pub fn as_str(&self) -> &str {
        match self {
            EntryAction::Placed => "placed",
            EntryAction::Modified => "modified",
            EntryAction::Switched => "switched",
            EntryAction::Kept => "kept",
            EntryAction::Cancelled => "cancelled",
            EntryAction::NoOrder => "none",
            EntryAction::Failed => "failed",
            EntryAction::Blocked => "blocked",
            EntryAction::StrategyPause => "strategy_pause",
        }
    }
}

/// Outcome of a broker cancel call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Cancel accepted; propagation must be verified before any re-place
    Success,
    /// Order already in a terminal state at the broker; no verify needed
    Terminal,
    Failed,
}

/// Per-option-type decision emitted by the continuous filter each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Place,
    Wait,
    Modify,
    Cancel,
    /// Price crossed the trigger; the broker is expected to report a fill
    CheckFill,
    None,
}

impl TriggerAction {
    pub fn as_str(&self) -> &str {
        match self {
            TriggerAction::Place => "place",
            TriggerAction::Wait => "wait",
            TriggerAction::Modify => "modify",
            TriggerAction::Cancel => "cancel",
            TriggerAction::CheckFill => "check_fill",
            TriggerAction::None => "none",
        }
    }
}

/// Order trigger for one option type: action plus supporting context
#[derive(Debug, Clone)]
pub struct OrderTrigger {
    pub action: TriggerAction,
    pub reason: String,
    pub candidate: Option<Candidate>,
    pub limit_price: Option<f64>,
}

impl OrderTrigger {
    pub fn none(reason: impl Into<String>) -> Self {
        OrderTrigger {
            action: TriggerAction::None,
            reason: reason.into(),
            candidate: None,
            limit_price: None,
        }
    }
}

/// Aggregate session snapshot for daily state, dashboard and notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSummary {
    pub trade_date: String,
    pub open_positions: usize,
    pub open_ce: usize,
    pub open_pe: usize,
    pub closed_positions: usize,
    pub cumulative_r: f64,
    pub total_pnl: f64,
    pub daily_exit_triggered: bool,
    pub daily_exit_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}
