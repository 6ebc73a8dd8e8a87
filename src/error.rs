/// Centralized error types for the swing-break engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TradingError {
    // Network Errors
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("WebSocket connection failed: {0}")]
    WebSocketError(String),

    #[error("WebSocket disconnected: {0}")]
    WebSocketDisconnected(String),

    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    #[error("Broker rate limit: {0}")]
    RateLimited(String),

    // Data Errors
    #[error("Stale data: {0}")]
    StaleData(String),

    #[error("Invalid bar data: {0}")]
    InvalidBarData(String),

    #[error("History fetch failed: {0}")]
    HistoryFetchFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    // Broker Errors
    #[error("Broker API error: {0}")]
    BrokerApiError(String),

    #[error("Credential failure: {0}")]
    CredentialFailure(String),

    #[error("Order placement failed: {0}")]
    OrderPlacementFailed(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Invalid order parameters: {0}")]
    InvalidOrder(String),

    // Risk-Critical Errors
    #[error("SL placement failed for {0}")]
    SlPlacementFailed(String),

    #[error("Open position without SL protection: {0}")]
    MissingSlOrder(String),

    #[error("Repeated SL failures: {0} consecutive")]
    RepeatedSlFailures(u32),

    // Safety-Critical Errors
    #[error("Kill switch asserted")]
    KillSwitchAsserted,

    #[error("Watchdog reconnect failed: {0}")]
    ReconnectFailed(String),

    #[error("Order churn limit reached: {0}")]
    ChurnLimitReached(String),

    // Persistence Errors
    #[error("State store error: {0}")]
    StateStoreError(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // System Errors
    #[error("Impossible state: {0}")]
    ImpossibleState(String),

    #[error("Emergency shutdown: {0}")]
    EmergencyShutdown(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for TradingError {
    fn from(e: rusqlite::Error) -> Self {
        TradingError::StateStoreError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TradingError>;

impl TradingError {
    /// TRANSIENT per the failure taxonomy: safe to retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TradingError::HttpError(_)
                | TradingError::NetworkTimeout(_)
                | TradingError::WebSocketDisconnected(_)
                | TradingError::RateLimited(_)
                | TradingError::StaleData(_)
                | TradingError::HistoryFetchFailed(_)
                | TradingError::OrderPlacementFailed(_)
        )
    }

    /// PERMANENT: exit at startup, never retry
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TradingError::CredentialFailure(_)
                | TradingError::ConfigError(_)
                | TradingError::MigrationFailed(_)
                | TradingError::ImpossibleState(_)
        )
    }

    /// RISK-CRITICAL: immediate mitigation required for the affected position
    pub fn is_risk_critical(&self) -> bool {
        matches!(
            self,
            TradingError::SlPlacementFailed(_)
                | TradingError::MissingSlOrder(_)
                | TradingError::RepeatedSlFailures(_)
        )
    }

    /// SAFETY-CRITICAL: bypasses the normal loop
    pub fn is_safety_critical(&self) -> bool {
        matches!(
            self,
            TradingError::KillSwitchAsserted
                | TradingError::ReconnectFailed(_)
                | TradingError::ChurnLimitReached(_)
                | TradingError::EmergencyShutdown(_)
        )
    }

    /// Error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            TradingError::HttpError(_) => "NET_001",
            TradingError::WebSocketError(_) => "NET_002",
            TradingError::WebSocketDisconnected(_) => "NET_003",
            TradingError::NetworkTimeout(_) => "NET_004",
            TradingError::RateLimited(_) => "NET_005",
            TradingError::StaleData(_) => "DATA_001",
            TradingError::InvalidBarData(_) => "DATA_002",
            TradingError::HistoryFetchFailed(_) => "DATA_003",
            TradingError::DeserializationError(_) => "DATA_004",
            TradingError::BrokerApiError(_) => "BROKER_001",
            TradingError::CredentialFailure(_) => "BROKER_002",
            TradingError::OrderPlacementFailed(_) => "ORDER_001",
            TradingError::OrderRejected(_) => "ORDER_002",
            TradingError::InvalidOrder(_) => "ORDER_003",
            TradingError::SlPlacementFailed(_) => "RISK_001",
            TradingError::MissingSlOrder(_) => "RISK_002",
            TradingError::RepeatedSlFailures(_) => "RISK_003",
            TradingError::KillSwitchAsserted => "SAFETY_001",
            TradingError::ReconnectFailed(_) => "SAFETY_002",
            TradingError::ChurnLimitReached(_) => "SAFETY_003",
            TradingError::StateStoreError(_) => "STATE_001",
            TradingError::MigrationFailed(_) => "STATE_002",
            TradingError::ConfigError(_) => "CFG_001",
            TradingError::FileError(_) => "FILE_001",
            TradingError::ImpossibleState(_) => "SYS_001",
            TradingError::EmergencyShutdown(_) => "SYS_002",
            TradingError::Other(_) => "GEN_001",
        }
    }
}
