/// OpenAlgo-style broker REST client
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::{
    BrokerApi, BrokerOrder, BrokerPosition, BrokerReply, HistoryRow, PlaceOrderRequest,
};
use crate::error::{Result, TradingError};

#[derive(Debug, Serialize)]
struct PlaceOrderBody<'a> {
    apikey: &'a str,
    strategy: &'a str,
    symbol: &'a str,
    action: &'a str,
    exchange: &'a str,
    #[serde(rename = "pricetype")]
    price_type: &'a str,
    product: &'a str,
    quantity: String,
    price: String,
    #[serde(rename = "trigger_price")]
    trigger_price: String,
}

/// REST client against an OpenAlgo gateway. One instance is shared by the
/// order manager and the data pipeline (history backfill).
pub struct OpenAlgoClient {
    client: Client,
    host: String,
    api_key: String,
    exchange: String,
    product: String,
}

impl OpenAlgoClient {
    pub fn new(host: String, api_key: String, exchange: String, product: String) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .expect("Failed to build HTTP client");

        OpenAlgoClient {
            client,
            host,
            api_key,
            exchange,
            product,
        }
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value> {
        let url = format!("{}/api/v1/{}", self.host, endpoint);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        debug!("{} -> {} {}", endpoint, status, text);

        serde_json::from_str(&text).map_err(|e| {
            TradingError::BrokerApiError(format!("{}: unparseable response: {}", endpoint, e))
        })
    }

    /// The orderbook payload is defensively handled: it may arrive as a list,
    /// a dict with a nested "orders"/"data"/"order_book" key, a bare string
    /// error message, or null.
    fn extract_order_list(data: &Value) -> Vec<Value> {
        match data {
            Value::Array(items) => items.clone(),
            Value::Object(map) => {
                for key in ["orders", "data", "order_book"] {
                    if let Some(Value::Array(items)) = map.get(key) {
                        return items.clone();
                    }
                }
                if map.is_empty() {
                    return Vec::new();
                }
                warn!(
                    "Orderbook dict has no recognizable list key (keys: {:?})",
                    map.keys().collect::<Vec<_>>()
                );
                Vec::new()
            }
            Value::String(s) => {
                warn!("Orderbook data arrived as string: {}", s);
                Vec::new()
            }
            Value::Null => Vec::new(),
            other => {
                warn!("Orderbook data has unexpected shape: {}", other);
                Vec::new()
            }
        }
    }

    fn parse_order(v: &Value) -> Option<BrokerOrder> {
        let obj = v.as_object()?;
        Some(BrokerOrder {
            order_id: obj.get("orderid")?.as_str()?.to_string(),
            symbol: obj
                .get("symbol")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            order_status: obj
                .get("order_status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase(),
            filled_quantity: value_as_i64(obj.get("filled_quantity")) as i32,
            average_price: value_as_f64(obj.get("average_price")),
            price: value_as_f64(obj.get("price")),
            rejected_reason: obj
                .get("rejected_reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn parse_position(v: &Value) -> Option<BrokerPosition> {
        let obj = v.as_object()?;
        Some(BrokerPosition {
            symbol: obj.get("symbol")?.as_str()?.to_string(),
            quantity: value_as_i64(obj.get("quantity")) as i32,
            average_price: value_as_f64(obj.get("averageprice")),
            product: obj
                .get("product")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn parse_history_row(v: &Value) -> Option<HistoryRow> {
        let obj = v.as_object()?;
        let ts_raw = obj.get("timestamp")?;
        let timestamp = match ts_raw {
            Value::Number(n) => Utc.timestamp_opt(n.as_i64()?, 0).single()?,
            Value::String(s) => parse_ist_timestamp(s)?,
            _ => return None,
        };
        Some(HistoryRow {
            timestamp,
            open: value_as_f64(obj.get("open")),
            high: value_as_f64(obj.get("high")),
            low: value_as_f64(obj.get("low")),
            close: value_as_f64(obj.get("close")),
            volume: value_as_i64(obj.get("volume")),
        })
    }
}

fn value_as_f64(v: Option<&Value>) -> f64 {
    match v {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn value_as_i64(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// History rows carry IST wall-clock timestamps like "2025-01-30 09:15:00"
fn parse_ist_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let cleaned = s.replace("+05:30", "").replace("+0530", "");
    let naive = NaiveDateTime::parse_from_str(cleaned.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    Kolkata
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl BrokerApi for OpenAlgoClient {
    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<String> {
        let body = PlaceOrderBody {
            apikey: &self.api_key,
            strategy: &req.strategy,
            symbol: &req.symbol,
            action: req.side.as_str(),
            exchange: &self.exchange,
            price_type: req.price_type.as_str(),
            product: &self.product,
            quantity: req.quantity.to_string(),
            price: format!("{:.2}", req.price),
            trigger_price: format!("{:.2}", req.trigger_price),
        };

        let response = self.post("placeorder", serde_json::to_value(&body)?).await?;

        if response.get("status").and_then(Value::as_str) == Some("success") {
            response
                .get("orderid")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    TradingError::OrderPlacementFailed("No orderid in response".to_string())
                })
        } else {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(TradingError::OrderPlacementFailed(message.to_string()))
        }
    }

    async fn modify_order(
        &self,
        order_id: &str,
        symbol: &str,
        new_price: f64,
        quantity: i32,
    ) -> Result<()> {
        let body = serde_json::json!({
            "apikey": self.api_key,
            "orderid": order_id,
            "symbol": symbol,
            "exchange": self.exchange,
            "product": self.product,
            "price": format!("{:.2}", new_price),
            "quantity": quantity.to_string(),
        });

        let response = self.post("modifyorder", body).await?;

        if response.get("status").and_then(Value::as_str) == Some("success") {
            Ok(())
        } else {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(TradingError::BrokerApiError(format!(
                "modifyorder failed: {}",
                message
            )))
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<BrokerReply> {
        let body = serde_json::json!({
            "apikey": self.api_key,
            "orderid": order_id,
        });

        let response = self.post("cancelorder", body).await?;

        Ok(BrokerReply {
            ok: response.get("status").and_then(Value::as_str) == Some("success"),
            message: response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn orderbook(&self) -> Result<Vec<BrokerOrder>> {
        let body = serde_json::json!({ "apikey": self.api_key });
        let response = self.post("orderbook", body).await?;

        if response.get("status").and_then(Value::as_str) != Some("success") {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(TradingError::BrokerApiError(format!(
                "orderbook failed: {}",
                message
            )));
        }

        let data = response.get("data").cloned().unwrap_or(Value::Null);
        Ok(Self::extract_order_list(&data)
            .iter()
            .filter_map(Self::parse_order)
            .collect())
    }

    async fn positionbook(&self) -> Result<Vec<BrokerPosition>> {
        let body = serde_json::json!({ "apikey": self.api_key });
        let response = self.post("positionbook", body).await?;

        if response.get("status").and_then(Value::as_str) != Some("success") {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(TradingError::BrokerApiError(format!(
                "positionbook failed: {}",
                message
            )));
        }

        let data = response.get("data").cloned().unwrap_or(Value::Null);
        Ok(Self::extract_order_list(&data)
            .iter()
            .filter_map(Self::parse_position)
            .collect())
    }

    async fn history(
        &self,
        symbol: &str,
        interval: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<HistoryRow>> {
        let body = serde_json::json!({
            "apikey": self.api_key,
            "symbol": symbol,
            "exchange": self.exchange,
            "interval": interval,
            "start_date": start_date,
            "end_date": end_date,
        });

        let response = self.post("history", body).await?;

        if response.get("status").and_then(Value::as_str) == Some("error") {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(TradingError::HistoryFetchFailed(format!(
                "{}: {}",
                symbol, message
            )));
        }

        let data = response.get("data").cloned().unwrap_or(Value::Null);
        let mut rows: Vec<HistoryRow> = Self::extract_order_list(&data)
            .iter()
            .filter_map(Self::parse_history_row)
            .collect();

        // The history API can return out-of-order rows
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }

    async fn available_cash(&self) -> Result<f64> {
        let body = serde_json::json!({ "apikey": self.api_key });
        let response = self.post("funds", body).await?;

        if response.get("status").and_then(Value::as_str) != Some("success") {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(TradingError::BrokerApiError(format!(
                "funds failed: {}",
                message
            )));
        }

        Ok(value_as_f64(
            response.get("data").and_then(|d| d.get("availablecash")),
        ))
    }
}
