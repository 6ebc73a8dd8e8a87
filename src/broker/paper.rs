/// Dry-run broker: satisfies the broker interface without real mutations
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

use crate::broker::{
    BrokerApi, BrokerOrder, BrokerPosition, BrokerReply, HistoryRow, PlaceOrderRequest,
};
use crate::error::Result;

/// Paper broker used when DRY_RUN is set. Orders are recorded locally with
/// synthesized ids and never fill; cancels always succeed.
pub struct PaperBroker {
    seq: AtomicU64,
    orders: RwLock<HashMap<String, BrokerOrder>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        PaperBroker {
            seq: AtomicU64::new(1),
            orders: RwLock::new(HashMap::new()),
        }
    }

    fn next_id(&self, symbol: &str) -> String {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        format!("DRY_{}_{}", symbol, n)
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerApi for PaperBroker {
    async fn place_order(&self, req: &PlaceOrderRequest) -> Result<String> {
        let order_id = self.next_id(&req.symbol);
        info!(
            "[DRY-RUN] Would place {} {} {} qty {} price {:.2} trigger {:.2} -> {}",
            req.price_type.as_str(),
            req.side.as_str(),
            req.symbol,
            req.quantity,
            req.price,
            req.trigger_price,
            order_id
        );

        let mut orders = self.orders.write().await;
        orders.insert(
            order_id.clone(),
            BrokerOrder {
                order_id: order_id.clone(),
                symbol: req.symbol.clone(),
                order_status: "pending".to_string(),
                filled_quantity: 0,
                average_price: 0.0,
                price: req.price,
                rejected_reason: String::new(),
            },
        );

        Ok(order_id)
    }

    async fn modify_order(
        &self,
        order_id: &str,
        _symbol: &str,
        new_price: f64,
        _quantity: i32,
    ) -> Result<()> {
        info!("[DRY-RUN] Would modify {} to {:.2}", order_id, new_price);
        let mut orders = self.orders.write().await;
        if let Some(order) = orders.get_mut(order_id) {
            order.price = new_price;
        }
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<BrokerReply> {
        info!("[DRY-RUN] Would cancel {}", order_id);
        let mut orders = self.orders.write().await;
        if let Some(order) = orders.get_mut(order_id) {
            order.order_status = "cancelled".to_string();
        }
        Ok(BrokerReply {
            ok: true,
            message: "dry-run cancel".to_string(),
        })
    }

    async fn orderbook(&self) -> Result<Vec<BrokerOrder>> {
        let orders = self.orders.read().await;
        Ok(orders.values().cloned().collect())
    }

    async fn positionbook(&self) -> Result<Vec<BrokerPosition>> {
        Ok(Vec::new())
    }

    async fn history(
        &self,
        _symbol: &str,
        _interval: &str,
        _start_date: &str,
        _end_date: &str,
    ) -> Result<Vec<HistoryRow>> {
        Ok(Vec::new())
    }

    async fn available_cash(&self) -> Result<f64> {
        Ok(f64::MAX)
    }
}
