/// Broker interface and implementations
pub mod feed;
pub mod openalgo;
pub mod paper;

pub use feed::{FeedSource, FeedTick, QuoteFeed};
pub use openalgo::OpenAlgoClient;
pub use paper::PaperBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Broker price type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceType {
    Limit,
    /// Stop-limit (trigger + limit)
    StopLimit,
    Market,
}

impl PriceType {
    pub fn as_str(&self) -> &str {
        match self {
            PriceType::Limit => "LIMIT",
            PriceType::StopLimit => "SL",
            PriceType::Market => "MARKET",
        }
    }
}

/// Parameters for a place call
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub strategy: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price_type: PriceType,
    pub quantity: i32,
    /// Limit price; 0.0 for market orders
    pub price: f64,
    /// Trigger price for stop-limit orders; 0.0 otherwise
    pub trigger_price: f64,
}

/// Raw broker reply for calls where the caller must classify the message
#[derive(Debug, Clone)]
pub struct BrokerReply {
    pub ok: bool,
    pub message: String,
}

/// One orderbook row, normalized. `order_status` is the broker's lowercase
/// lexicon: pending | complete | filled | rejected | cancelled | triggered.
#[derive(Debug, Clone)]
pub struct BrokerOrder {
    pub order_id: String,
    pub symbol: String,
    pub order_status: String,
    pub filled_quantity: i32,
    pub average_price: f64,
    pub price: f64,
    pub rejected_reason: String,
}

impl BrokerOrder {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.order_status.as_str(),
            "complete" | "filled" | "rejected" | "cancelled"
        )
    }
}

/// One position-book row
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: i32,
    pub average_price: f64,
    pub product: String,
}

/// One historical OHLCV row
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Broker REST capability set. The live REST client, the dry-run paper broker
/// and test fakes all satisfy it.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Place an order, returning the broker order id
    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<String>;

    /// Modify the price of a resting order
    async fn modify_order(&self, order_id: &str, symbol: &str, new_price: f64, quantity: i32)
        -> Result<()>;

    /// Cancel an order. Returns the raw reply so the caller can classify
    /// already-terminal responses.
    async fn cancel_order(&self, order_id: &str) -> Result<BrokerReply>;

    /// Full orderbook snapshot
    async fn orderbook(&self) -> Result<Vec<BrokerOrder>>;

    /// Open positions at the broker
    async fn positionbook(&self) -> Result<Vec<BrokerPosition>>;

    /// Intraday minute history for one symbol, date strings "YYYY-MM-DD"
    async fn history(
        &self,
        symbol: &str,
        interval: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<HistoryRow>>;

    /// Available cash margin
    async fn available_cash(&self) -> Result<f64>;
}
