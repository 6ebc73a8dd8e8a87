/// Entry and stop-loss order lifecycle management
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerApi, OrderSide, PlaceOrderRequest, PriceType};
use crate::config::Config;
use crate::error::Result;
use crate::orders::churn::{ChurnVerdict, OrderChurnDetector};
use crate::types::{
    Candidate, CancelOutcome, EntryAction, EntryOrder, Fill, OptionType, OrderStatus, Position,
    SlOrder, PLACING_SENTINEL,
};

/// Cancel responses carrying these fragments mean the order is already in a
/// terminal state at the broker; verification is unnecessary.
const TERMINAL_MESSAGES: [&str; 5] = [
    "cancelled status",
    "completed status",
    "rejected status",
    "order not found",
    "invalid order",
];

/// Outcome of one broker reconciliation pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub entries_removed: Vec<String>,
    pub entries_filled: Vec<Fill>,
    pub sl_missing: Vec<String>,
    pub sl_removed: Vec<String>,
}

/// Tracks one resting entry order per option type and one SL order per open
/// position. Owned by the tick task; no internal locking.
pub struct OrderManager {
    config: Arc<Config>,
    broker: Arc<dyn BrokerApi>,
    pub pending_entry_orders: HashMap<OptionType, EntryOrder>,
    pub active_sl_orders: HashMap<String, SlOrder>,
    pub filled_orders: Vec<Fill>,
    pub churn: OrderChurnDetector,
    consecutive_sl_failures: u32,
    sl_placement_failures: u32,
}

impl OrderManager {
    pub fn new(config: Arc<Config>, broker: Arc<dyn BrokerApi>) -> Self {
        OrderManager {
            config,
            broker,
            pending_entry_orders: HashMap::new(),
            active_sl_orders: HashMap::new(),
            filled_orders: Vec::new(),
            churn: OrderChurnDetector::default(),
            consecutive_sl_failures: 0,
            sl_placement_failures: 0,
        }
    }

    /// Restore order state from the durable store after a restart
    pub fn restore_state(
        &mut self,
        pending: HashMap<OptionType, EntryOrder>,
        active_sl: HashMap<String, SlOrder>,
    ) {
        if !pending.is_empty() {
            info!(
                "Restored {} pending entry orders: {:?}",
                pending.len(),
                pending.keys().map(|k| k.as_str()).collect::<Vec<_>>()
            );
        }
        if !active_sl.is_empty() {
            info!(
                "Restored {} active SL orders: {:?}",
                active_sl.len(),
                active_sl.keys().collect::<Vec<_>>()
            );
        }
        self.pending_entry_orders = pending;
        self.active_sl_orders = active_sl;
    }

    /// Symbols with a resting (or in-flight) entry order
    pub fn pending_symbols(&self) -> HashSet<String> {
        self.pending_entry_orders
            .values()
            .map(|o| o.symbol.clone())
            .collect()
    }

    pub fn consecutive_sl_failures(&self) -> u32 {
        self.consecutive_sl_failures
    }

    /// Idempotent entry-order state transition for one option type.
    /// `candidate = None` requests cancellation of any resting order.
    pub async fn manage_entry_for_type(
        &mut self,
        option_type: OptionType,
        candidate: Option<&Candidate>,
        limit_price: Option<f64>,
    ) -> EntryAction {
        let (candidate, limit_price) = match (candidate, limit_price) {
            (Some(c), Some(l)) => (c, l),
            _ => return self.cancel_entry_for_type(option_type).await,
        };

        let symbol = candidate.symbol.clone();
        let trigger_price = candidate.swing_low - self.config.tick_size;
        let quantity = candidate.quantity;

        if self.churn.is_blocked(&symbol) {
            debug!("[CHURN] {} is blocked - skipping placement", symbol);
            return EntryAction::Blocked;
        }

        let existing = self.pending_entry_orders.get(&option_type).cloned();

        match existing {
            // No existing order: place fresh
            None => {
                if let Some(verdict) = self.churn_gate(&symbol) {
                    return verdict;
                }

                // Sentinel goes in BEFORE the broker call so a retry that
                // straddles ticks cannot double-place
                self.pending_entry_orders.insert(
                    option_type,
                    EntryOrder {
                        order_id: PLACING_SENTINEL.to_string(),
                        symbol: symbol.clone(),
                        trigger_price,
                        limit_price,
                        quantity,
                        status: OrderStatus::InFlight,
                        placed_at: Utc::now(),
                        candidate: candidate.clone(),
                    },
                );

                match self
                    .place_stop_limit(&symbol, OrderSide::Sell, trigger_price, limit_price, quantity)
                    .await
                {
                    Some(order_id) => {
                        let order = self.pending_entry_orders.get_mut(&option_type).unwrap();
                        order.order_id = order_id;
                        order.status = OrderStatus::Pending;
                        info!(
                            "[PLACE-{}] {} SL-L trigger {:.2} limit {:.2} qty {}",
                            option_type.as_str(),
                            symbol,
                            trigger_price,
                            limit_price,
                            quantity
                        );
                        EntryAction::Placed
                    }
                    None => {
                        // Broker call failed: drop the sentinel so the next
                        // tick can retry
                        self.pending_entry_orders.remove(&option_type);
                        EntryAction::Failed
                    }
                }
            }

            // Same symbol: keep or modify based on drift
            Some(order) if order.symbol == symbol => {
                let trigger_diff = (order.trigger_price - trigger_price).abs();
                let limit_diff = (order.limit_price - limit_price).abs();
                let threshold = self.config.modification_threshold;

                // Strict threshold: a diff exactly equal to it is kept
                if trigger_diff <= threshold && limit_diff <= threshold {
                    debug!(
                        "[KEEP-{}] {} drift below threshold (trigger {:.2}, limit {:.2})",
                        option_type.as_str(),
                        symbol,
                        trigger_diff,
                        limit_diff
                    );
                    return EntryAction::Kept;
                }

                if !self.cancel_and_confirm(&order, option_type).await {
                    return EntryAction::Kept;
                }
                self.pending_entry_orders.remove(&option_type);

                if let Some(verdict) = self.churn_gate(&symbol) {
                    return verdict;
                }

                match self
                    .place_stop_limit(&symbol, OrderSide::Sell, trigger_price, limit_price, quantity)
                    .await
                {
                    Some(order_id) => {
                        self.pending_entry_orders.insert(
                            option_type,
                            EntryOrder {
                                order_id,
                                symbol: symbol.clone(),
                                trigger_price,
                                limit_price,
                                quantity,
                                status: OrderStatus::Pending,
                                placed_at: Utc::now(),
                                candidate: candidate.clone(),
                            },
                        );
                        info!(
                            "[MODIFY-{}] {} trigger {:.2} limit {:.2} (drift trigger {:.2}, limit {:.2})",
                            option_type.as_str(),
                            symbol,
                            trigger_price,
                            limit_price,
                            trigger_diff,
                            limit_diff
                        );
                        EntryAction::Modified
                    }
                    None => EntryAction::Failed,
                }
            }

            // Different symbol: cancel-verify then place for the new symbol
            Some(order) => {
                if !self.cancel_and_confirm(&order, option_type).await {
                    warn!(
                        "[SKIP-SWITCH-{}] Cancel of {} unconfirmed - not switching to {} \
                         to prevent duplicate orders",
                        option_type.as_str(),
                        order.symbol,
                        symbol
                    );
                    return EntryAction::Kept;
                }
                self.pending_entry_orders.remove(&option_type);

                if let Some(verdict) = self.churn_gate(&symbol) {
                    return verdict;
                }

                match self
                    .place_stop_limit(&symbol, OrderSide::Sell, trigger_price, limit_price, quantity)
                    .await
                {
                    Some(order_id) => {
                        info!(
                            "[SWITCH-{}] {} -> {} trigger {:.2} limit {:.2}",
                            option_type.as_str(),
                            order.symbol,
                            symbol,
                            trigger_price,
                            limit_price
                        );
                        self.pending_entry_orders.insert(
                            option_type,
                            EntryOrder {
                                order_id,
                                symbol: symbol.clone(),
                                trigger_price,
                                limit_price,
                                quantity,
                                status: OrderStatus::Pending,
                                placed_at: Utc::now(),
                                candidate: candidate.clone(),
                            },
                        );
                        EntryAction::Switched
                    }
                    None => EntryAction::Failed,
                }
            }
        }
    }

    async fn cancel_entry_for_type(&mut self, option_type: OptionType) -> EntryAction {
        let Some(order) = self.pending_entry_orders.get(&option_type).cloned() else {
            return EntryAction::NoOrder;
        };

        // In-flight sentinel: no broker order exists yet
        if order.is_in_flight() {
            info!(
                "[CANCEL-{}] {} was in flight - removing sentinel",
                option_type.as_str(),
                order.symbol
            );
            self.pending_entry_orders.remove(&option_type);
            return EntryAction::Cancelled;
        }

        match self.cancel_broker_order(&order.order_id).await {
            CancelOutcome::Success | CancelOutcome::Terminal => {
                self.pending_entry_orders.remove(&option_type);
                self.churn.record_cancel(&order.symbol);
                info!(
                    "[CANCEL-{}] Cancelled entry for {}",
                    option_type.as_str(),
                    order.symbol
                );
                EntryAction::Cancelled
            }
            CancelOutcome::Failed => {
                warn!(
                    "[CANCEL-FAIL-{}] Could not cancel {} for {} - keeping locally to \
                     avoid orphaning a live broker order",
                    option_type.as_str(),
                    order.order_id,
                    order.symbol
                );
                EntryAction::Kept
            }
        }
    }

    /// Record the place against the churn detector; Some(verdict) refuses it
    fn churn_gate(&mut self, symbol: &str) -> Option<EntryAction> {
        match self.churn.record_place(symbol) {
            ChurnVerdict::Ok => None,
            ChurnVerdict::SymbolBlocked => Some(EntryAction::Blocked),
            ChurnVerdict::StrategyPause => Some(EntryAction::StrategyPause),
        }
    }

    /// Cancel an existing order and confirm it is gone. Returns false when the
    /// caller must NOT place a replacement.
    async fn cancel_and_confirm(&mut self, order: &EntryOrder, option_type: OptionType) -> bool {
        if order.is_in_flight() {
            // Nothing at the broker yet; safe to replace
            return true;
        }

        match self.cancel_broker_order(&order.order_id).await {
            CancelOutcome::Failed => {
                warn!(
                    "[CANCEL-FAIL-{}] Cancel failed for {} ({}) - may be triggered/filling",
                    option_type.as_str(),
                    order.order_id,
                    order.symbol
                );
                false
            }
            CancelOutcome::Terminal => {
                self.churn.record_cancel(&order.symbol);
                true
            }
            CancelOutcome::Success => {
                self.churn.record_cancel(&order.symbol);
                if self.verify_order_cancelled(&order.order_id).await {
                    true
                } else {
                    warn!(
                        "[CANCEL-VERIFY-{}] Cancel of {} not confirmed in orderbook",
                        option_type.as_str(),
                        order.order_id
                    );
                    false
                }
            }
        }
    }

    /// Classify a broker cancel response
    async fn cancel_broker_order(&self, order_id: &str) -> CancelOutcome {
        match self.broker.cancel_order(order_id).await {
            Ok(reply) if reply.ok => CancelOutcome::Success,
            Ok(reply) => {
                let message = reply.message.to_lowercase();
                if TERMINAL_MESSAGES.iter().any(|t| message.contains(t)) {
                    info!(
                        "[CANCEL-ALREADY-DONE] {} already terminal ({})",
                        order_id, reply.message
                    );
                    CancelOutcome::Terminal
                } else {
                    CancelOutcome::Failed
                }
            }
            Err(e) => {
                error!("Error cancelling {}: {}", order_id, e);
                CancelOutcome::Failed
            }
        }
    }

    /// Synchronously verify a cancel has propagated: the order must appear
    /// cancelled/rejected or be absent from the orderbook. Prevents the race
    /// where both the old and the replacement order rest live.
    async fn verify_order_cancelled(&self, order_id: &str) -> bool {
        for attempt in 1..=3u32 {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;

            let orders = match self.broker.orderbook().await {
                Ok(orders) => orders,
                Err(e) => {
                    warn!("[CANCEL-VERIFY] Attempt {}/3 orderbook error: {}", attempt, e);
                    continue;
                }
            };

            match orders.iter().find(|o| o.order_id == order_id) {
                None => {
                    info!("[CANCEL-VERIFIED] {} absent from orderbook", order_id);
                    return true;
                }
                Some(order) => match order.order_status.as_str() {
                    "cancelled" | "rejected" => {
                        info!("[CANCEL-VERIFIED] {} status={}", order_id, order.order_status);
                        return true;
                    }
                    "complete" | "filled" => {
                        warn!("[CANCEL-FAILED] {} already filled", order_id);
                        return false;
                    }
                    other => {
                        debug!("[CANCEL-VERIFY] Attempt {}/3: {} still {}", attempt, order_id, other);
                    }
                },
            }
        }

        warn!("[CANCEL-VERIFY-TIMEOUT] {} unconfirmed after 3 attempts", order_id);
        false
    }

    /// Place a stop-limit order with bounded retries
    async fn place_stop_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        trigger_price: f64,
        limit_price: f64,
        quantity: i32,
    ) -> Option<String> {
        let request = PlaceOrderRequest {
            strategy: self.config.strategy_name.clone(),
            symbol: symbol.to_string(),
            side,
            price_type: PriceType::StopLimit,
            quantity,
            price: limit_price,
            trigger_price,
        };

        for attempt in 1..=self.config.max_order_retries {
            match self.broker.place_order(&request).await {
                Ok(order_id) => {
                    info!(
                        "[ORDER-PLACED] {} {} trigger {:.2} limit {:.2} qty {} | id {}",
                        symbol,
                        side.as_str(),
                        trigger_price,
                        limit_price,
                        quantity,
                        order_id
                    );
                    return Some(order_id);
                }
                Err(e) => {
                    error!(
                        "Stop-limit place failed (attempt {}/{}): {}",
                        attempt, self.config.max_order_retries, e
                    );
                    if attempt < self.config.max_order_retries {
                        tokio::time::sleep(std::time::Duration::from_secs(
                            self.config.order_retry_delay_secs,
                        ))
                        .await;
                    }
                }
            }
        }

        error!(
            "Failed to place stop-limit for {} after {} attempts",
            symbol, self.config.max_order_retries
        );
        None
    }

    /// Place the exit stop-loss for a just-filled short. BUY stop-limit with
    /// trigger below limit (broker constraint).
    pub async fn place_sl_order(
        &mut self,
        symbol: &str,
        trigger_price: f64,
        quantity: i32,
    ) -> Option<String> {
        let limit_price = trigger_price + self.config.sl_limit_offset;
        if trigger_price >= limit_price {
            error!(
                "Invalid SL order: trigger {:.2} must be < limit {:.2} for BUY",
                trigger_price, limit_price
            );
            self.record_sl_failure();
            return None;
        }

        match self
            .place_stop_limit_buy(symbol, trigger_price, limit_price, quantity)
            .await
        {
            Some(order_id) => {
                self.active_sl_orders.insert(
                    symbol.to_string(),
                    SlOrder {
                        order_id: order_id.clone(),
                        symbol: symbol.to_string(),
                        trigger_price,
                        limit_price,
                        quantity,
                        placed_at: Utc::now(),
                    },
                );
                info!(
                    "[SL-ORDER] {} BUY qty {} trigger {:.2} limit {:.2} | id {}",
                    symbol, quantity, trigger_price, limit_price, order_id
                );
                self.consecutive_sl_failures = 0;
                Some(order_id)
            }
            None => {
                self.record_sl_failure();
                None
            }
        }
    }

    async fn place_stop_limit_buy(
        &self,
        symbol: &str,
        trigger_price: f64,
        limit_price: f64,
        quantity: i32,
    ) -> Option<String> {
        self.place_stop_limit(symbol, OrderSide::Buy, trigger_price, limit_price, quantity)
            .await
    }

    fn record_sl_failure(&mut self) {
        self.consecutive_sl_failures += 1;
        self.sl_placement_failures += 1;
    }

    /// True once consecutive SL failures cross the configured threshold
    pub fn should_halt_trading(&self) -> bool {
        if self.consecutive_sl_failures >= self.config.max_sl_failure_count {
            error!(
                "[HALT] {} consecutive SL placement failures (threshold {})",
                self.consecutive_sl_failures, self.config.max_sl_failure_count
            );
            return true;
        }
        false
    }

    pub async fn cancel_sl_order(&mut self, symbol: &str) -> bool {
        let Some(order) = self.active_sl_orders.get(symbol).cloned() else {
            return true;
        };

        match self.cancel_broker_order(&order.order_id).await {
            CancelOutcome::Success | CancelOutcome::Terminal => {
                self.active_sl_orders.remove(symbol);
                info!("Cancelled SL order {} for {}", order.order_id, symbol);
                true
            }
            CancelOutcome::Failed => {
                error!("Failed to cancel SL order {} for {}", order.order_id, symbol);
                false
            }
        }
    }

    /// Cancel every pending entry and every active SL (daily exit / shutdown)
    pub async fn cancel_all_orders(&mut self) {
        info!("Cancelling ALL orders...");

        for option_type in OptionType::BOTH {
            if self.pending_entry_orders.contains_key(&option_type) {
                self.cancel_entry_for_type(option_type).await;
            }
        }

        let symbols: Vec<String> = self.active_sl_orders.keys().cloned().collect();
        for symbol in symbols {
            self.cancel_sl_order(&symbol).await;
        }

        info!("All orders cancelled");
    }

    /// Poll the orderbook for entry fills. Rejected orders are removed
    /// quietly; fills carry the broker's filled quantity and average price.
    pub async fn check_entry_fills(&mut self) -> Vec<Fill> {
        if self.pending_entry_orders.is_empty() {
            return Vec::new();
        }

        let orders = match self.broker.orderbook().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("[CHECK-FILLS] Orderbook error: {}", e);
                return Vec::new();
            }
        };

        let mut fills = Vec::new();

        for option_type in OptionType::BOTH {
            let Some(pending) = self.pending_entry_orders.get(&option_type).cloned() else {
                continue;
            };
            if pending.is_in_flight() {
                continue;
            }

            let Some(broker_order) = orders.iter().find(|o| o.order_id == pending.order_id)
            else {
                continue;
            };

            match broker_order.order_status.as_str() {
                "rejected" => {
                    error!(
                        "[CHECK-FILLS] {} REJECTED: {} - {}",
                        pending.order_id, pending.symbol, broker_order.rejected_reason
                    );
                    self.pending_entry_orders.remove(&option_type);
                }
                "cancelled" => {
                    warn!(
                        "[CHECK-FILLS] {} cancelled at broker - removing",
                        pending.order_id
                    );
                    self.pending_entry_orders.remove(&option_type);
                }
                "complete" | "filled" => {
                    let quantity = if broker_order.filled_quantity > 0 {
                        broker_order.filled_quantity
                    } else {
                        pending.quantity
                    };
                    let fill_price = if broker_order.average_price > 0.0 {
                        broker_order.average_price
                    } else {
                        pending.limit_price
                    };

                    let fill = Fill {
                        option_type,
                        symbol: pending.symbol.clone(),
                        order_id: pending.order_id.clone(),
                        fill_price,
                        quantity,
                        candidate: pending.candidate.clone(),
                        filled_at: Utc::now(),
                    };

                    info!(
                        "[FILL-{}] {} @ {:.2} qty {} (intended {})",
                        option_type.as_str(),
                        fill.symbol,
                        fill.fill_price,
                        quantity,
                        pending.quantity
                    );

                    self.pending_entry_orders.remove(&option_type);
                    self.filled_orders.push(fill.clone());
                    fills.push(fill);
                }
                _ => {}
            }
        }

        fills
    }

    /// Sync local order state with broker reality after a reconnect or a
    /// restart. Fills found here flow through the normal fill path upstream.
    pub async fn reconcile_with_broker(
        &mut self,
        open_positions: &HashMap<String, Position>,
    ) -> Result<ReconcileReport> {
        info!("[RECONCILE] Starting order reconciliation with broker...");
        let mut report = ReconcileReport::default();

        let orders = self.broker.orderbook().await?;
        let by_id: HashMap<&str, &crate::broker::BrokerOrder> =
            orders.iter().map(|o| (o.order_id.as_str(), o)).collect();

        info!("[RECONCILE] {} orders at broker", orders.len());

        // Entry orders
        for option_type in OptionType::BOTH {
            let Some(pending) = self.pending_entry_orders.get(&option_type).cloned() else {
                continue;
            };
            if pending.is_in_flight() {
                continue;
            }

            match by_id.get(pending.order_id.as_str()) {
                None => {
                    warn!(
                        "[RECONCILE] Entry {} ({}) not at broker - removing",
                        pending.order_id, pending.symbol
                    );
                    report.entries_removed.push(pending.symbol.clone());
                    self.pending_entry_orders.remove(&option_type);
                }
                Some(broker_order) => match broker_order.order_status.as_str() {
                    "complete" | "filled" => {
                        let quantity = if broker_order.filled_quantity > 0 {
                            broker_order.filled_quantity
                        } else {
                            pending.quantity
                        };
                        let fill_price = if broker_order.average_price > 0.0 {
                            broker_order.average_price
                        } else {
                            pending.limit_price
                        };
                        warn!(
                            "[RECONCILE] Entry {} ({}) FILLED during disconnect @ {:.2} qty {}",
                            pending.order_id, pending.symbol, fill_price, quantity
                        );
                        report.entries_filled.push(Fill {
                            option_type,
                            symbol: pending.symbol.clone(),
                            order_id: pending.order_id.clone(),
                            fill_price,
                            quantity,
                            candidate: pending.candidate.clone(),
                            filled_at: Utc::now(),
                        });
                        self.pending_entry_orders.remove(&option_type);
                    }
                    "rejected" | "cancelled" => {
                        warn!(
                            "[RECONCILE] Entry {} ({}) was {} - removing",
                            pending.order_id, pending.symbol, broker_order.order_status
                        );
                        report.entries_removed.push(pending.symbol.clone());
                        self.pending_entry_orders.remove(&option_type);
                    }
                    _ => {}
                },
            }
        }

        // Positions must each have a local SL record
        for symbol in open_positions.keys() {
            if !self.active_sl_orders.contains_key(symbol) {
                error!(
                    "[RECONCILE] CRITICAL: position {} has no SL order in local state",
                    symbol
                );
                report.sl_missing.push(symbol.clone());
            }
        }

        // Local SL records must still exist at the broker
        let sl_symbols: Vec<String> = self.active_sl_orders.keys().cloned().collect();
        for symbol in sl_symbols {
            let order = self.active_sl_orders.get(&symbol).unwrap().clone();

            match by_id.get(order.order_id.as_str()) {
                None => {
                    if open_positions.contains_key(&symbol) {
                        error!(
                            "[RECONCILE] CRITICAL: SL {} ({}) missing at broker with open position",
                            order.order_id, symbol
                        );
                        report.sl_missing.push(symbol.clone());
                    } else {
                        info!(
                            "[RECONCILE] SL {} gone and position closed - removing",
                            symbol
                        );
                        self.active_sl_orders.remove(&symbol);
                        report.sl_removed.push(symbol);
                    }
                }
                Some(broker_order) => match broker_order.order_status.as_str() {
                    "complete" | "filled" | "triggered" => {
                        info!(
                            "[RECONCILE] SL {} ({}) triggered/filled - position should be closed",
                            order.order_id, symbol
                        );
                        self.active_sl_orders.remove(&symbol);
                        report.sl_removed.push(symbol);
                    }
                    "rejected" | "cancelled" => {
                        if open_positions.contains_key(&symbol) {
                            error!(
                                "[RECONCILE] CRITICAL: SL {} ({}) was {} with position open",
                                order.order_id, symbol, broker_order.order_status
                            );
                            report.sl_missing.push(symbol.clone());
                        } else {
                            self.active_sl_orders.remove(&symbol);
                            report.sl_removed.push(symbol);
                        }
                    }
                    _ => {}
                },
            }
        }

        info!(
            "[RECONCILE] Done: {} entries removed, {} filled, {} SL missing, {} SL removed",
            report.entries_removed.len(),
            report.entries_filled.len(),
            report.sl_missing.len(),
            report.sl_removed.len()
        );

        Ok(report)
    }

    /// Force-close a position with a MARKET BUY. The position book is checked
    /// first: an absent position skips the order (prevents opening a reverse
    /// long), and the broker-reported quantity overrides the intended one.
    pub async fn emergency_market_exit(
        &mut self,
        symbol: &str,
        quantity: i32,
        reason: &str,
    ) -> Option<String> {
        error!(
            "[EMERGENCY] MARKET EXIT: {} qty {} reason {}",
            symbol, quantity, reason
        );

        let quantity = match self.broker_position_quantity(symbol).await {
            Some(0) => {
                warn!(
                    "[EMERGENCY] No open position for {} at broker - skipping exit",
                    symbol
                );
                return None;
            }
            Some(actual) => {
                info!("[EMERGENCY] Using broker-reported qty {}", actual);
                actual
            }
            None => quantity, // position check failed; proceed with caution
        };

        let request = PlaceOrderRequest {
            strategy: format!("{}_emergency", self.config.strategy_name),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            price_type: PriceType::Market,
            quantity,
            price: 0.0,
            trigger_price: 0.0,
        };

        for attempt in 1..=self.config.emergency_exit_retry_count {
            match self.broker.place_order(&request).await {
                Ok(order_id) => {
                    error!(
                        "[EMERGENCY] Exit placed: {} (attempt {}/{})",
                        order_id, attempt, self.config.emergency_exit_retry_count
                    );
                    return Some(order_id);
                }
                Err(e) => {
                    error!(
                        "[EMERGENCY] Exit attempt {}/{} failed: {}",
                        attempt, self.config.emergency_exit_retry_count, e
                    );
                }
            }
            if attempt < self.config.emergency_exit_retry_count {
                tokio::time::sleep(std::time::Duration::from_secs(
                    self.config.emergency_exit_retry_delay_secs,
                ))
                .await;
            }
        }

        error!(
            "[EMERGENCY] EXIT FAILED FOR {} AFTER {} ATTEMPTS - MANUAL INTERVENTION REQUIRED",
            symbol, self.config.emergency_exit_retry_count
        );
        None
    }

    /// MARKET exit for daily target/stop and EOD closes. Same position-book
    /// guard and quantity override as the emergency path.
    pub async fn market_exit(&mut self, symbol: &str, quantity: i32, reason: &str) -> Option<String> {
        info!("[MARKET-EXIT] {} qty {} reason {}", symbol, quantity, reason);

        let quantity = match self.broker_position_quantity(symbol).await {
            Some(0) => {
                warn!(
                    "[MARKET-EXIT] No position at broker for {} - skipping to prevent reverse position",
                    symbol
                );
                return None;
            }
            Some(actual) => actual,
            None => quantity,
        };

        let request = PlaceOrderRequest {
            strategy: self.config.strategy_name.clone(),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            price_type: PriceType::Market,
            quantity,
            price: 0.0,
            trigger_price: 0.0,
        };

        for attempt in 1..=self.config.max_order_retries {
            match self.broker.place_order(&request).await {
                Ok(order_id) => {
                    info!("[MARKET-EXIT] Order placed: {}", order_id);
                    return Some(order_id);
                }
                Err(e) => {
                    warn!(
                        "[MARKET-EXIT] Attempt {}/{} failed: {}",
                        attempt, self.config.max_order_retries, e
                    );
                }
            }
            if attempt < self.config.max_order_retries {
                tokio::time::sleep(std::time::Duration::from_secs(
                    self.config.order_retry_delay_secs,
                ))
                .await;
            }
        }

        error!("[MARKET-EXIT] Failed after {} retries", self.config.max_order_retries);
        None
    }

    /// Broker-side absolute quantity for a symbol: Some(0) = flat,
    /// None = check failed
    async fn broker_position_quantity(&self, symbol: &str) -> Option<i32> {
        match self.broker.positionbook().await {
            Ok(positions) => {
                let qty = positions
                    .iter()
                    .find(|p| p.symbol == symbol && p.product == self.config.product)
                    .map(|p| p.quantity.abs())
                    .unwrap_or(0);
                Some(qty)
            }
            Err(e) => {
                error!("Position check failed before exit: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerOrder, BrokerPosition, BrokerReply, HistoryRow};
    use crate::error::TradingError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted broker fake: queued replies, recorded calls
    #[derive(Default)]
    struct FakeBroker {
        place_results: Mutex<VecDeque<std::result::Result<String, String>>>,
        cancel_results: Mutex<VecDeque<BrokerReply>>,
        orderbooks: Mutex<VecDeque<Vec<BrokerOrder>>>,
        positions: Mutex<Vec<BrokerPosition>>,
        place_calls: Mutex<Vec<PlaceOrderRequest>>,
        cancel_calls: Mutex<Vec<String>>,
        orderbook_calls: Mutex<u32>,
        place_seq: Mutex<u32>,
    }

    impl FakeBroker {
        fn push_place_ok(&self, id: &str) {
            self.place_results.lock().unwrap().push_back(Ok(id.to_string()));
        }

        fn push_place_err(&self, msg: &str) {
            self.place_results.lock().unwrap().push_back(Err(msg.to_string()));
        }

        fn push_cancel(&self, ok: bool, message: &str) {
            self.cancel_results.lock().unwrap().push_back(BrokerReply {
                ok,
                message: message.to_string(),
            });
        }

        fn push_orderbook(&self, orders: Vec<BrokerOrder>) {
            self.orderbooks.lock().unwrap().push_back(orders);
        }

        fn place_count(&self) -> usize {
            self.place_calls.lock().unwrap().len()
        }

        fn orderbook_count(&self) -> u32 {
            *self.orderbook_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl BrokerApi for FakeBroker {
        async fn place_order(&self, req: &PlaceOrderRequest) -> Result<String> {
            self.place_calls.lock().unwrap().push(req.clone());
            let scripted = self.place_results.lock().unwrap().pop_front();
            match scripted {
                Some(Ok(id)) => Ok(id),
                Some(Err(msg)) => Err(TradingError::OrderPlacementFailed(msg)),
                None => {
                    let mut seq = self.place_seq.lock().unwrap();
                    *seq += 1;
                    Ok(format!("FAKE{}", seq))
                }
            }
        }

        async fn modify_order(&self, _o: &str, _s: &str, _p: f64, _q: i32) -> Result<()> {
            Ok(())
        }

        async fn cancel_order(&self, order_id: &str) -> Result<BrokerReply> {
            self.cancel_calls.lock().unwrap().push(order_id.to_string());
            Ok(self
                .cancel_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(BrokerReply {
                    ok: true,
                    message: String::new(),
                }))
        }

        async fn orderbook(&self) -> Result<Vec<BrokerOrder>> {
            *self.orderbook_calls.lock().unwrap() += 1;
            let mut books = self.orderbooks.lock().unwrap();
            if books.len() > 1 {
                Ok(books.pop_front().unwrap())
            } else {
                Ok(books.front().cloned().unwrap_or_default())
            }
        }

        async fn positionbook(&self) -> Result<Vec<BrokerPosition>> {
            Ok(self.positions.lock().unwrap().clone())
        }

        async fn history(
            &self,
            _s: &str,
            _i: &str,
            _sd: &str,
            _ed: &str,
        ) -> Result<Vec<HistoryRow>> {
            Ok(Vec::new())
        }

        async fn available_cash(&self) -> Result<f64> {
            Ok(1_000_000.0)
        }
    }

    fn candidate(symbol: &str, swing_low: f64) -> Candidate {
        Candidate {
            symbol: symbol.to_string(),
            option_type: OptionType::CE,
            strike: 26000,
            swing_low,
            swing_time: Utc::now(),
            vwap_at_swing: swing_low * 0.95,
            highest_high: swing_low + 5.0,
            current_price: swing_low + 0.5,
            entry_price: swing_low - 0.05,
            sl_price: swing_low + 6.0,
            sl_points: 6.05,
            sl_percent: 0.06,
            vwap_premium: 0.052,
            lots: 10,
            quantity: 650,
            actual_r: 3900.0,
            qualified: true,
            disqualify_reason: None,
            broken_at_startup: false,
        }
    }

    fn manager(broker: Arc<FakeBroker>) -> OrderManager {
        let config: Config = toml::from_str("").unwrap();
        OrderManager::new(Arc::new(config), broker)
    }

    fn broker_row(id: &str, status: &str, qty: i32, avg: f64) -> BrokerOrder {
        BrokerOrder {
            order_id: id.to_string(),
            symbol: "NIFTY30JAN2526000CE".to_string(),
            order_status: status.to_string(),
            filled_quantity: qty,
            average_price: avg,
            price: 0.0,
            rejected_reason: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_place_when_no_existing_order() {
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("X1");
        let mut m = manager(Arc::clone(&broker));

        let c = candidate("NIFTY30JAN2526000CE", 100.0);
        let action = m
            .manage_entry_for_type(OptionType::CE, Some(&c), Some(96.95))
            .await;

        assert_eq!(action, EntryAction::Placed);
        let pending = m.pending_entry_orders.get(&OptionType::CE).unwrap();
        assert_eq!(pending.order_id, "X1");
        assert_eq!(pending.status, OrderStatus::Pending);
        assert!((pending.trigger_price - 99.95).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_place_failure_removes_sentinel() {
        let broker = Arc::new(FakeBroker::default());
        for _ in 0..3 {
            broker.push_place_err("rms rejection");
        }
        let mut m = manager(Arc::clone(&broker));

        let c = candidate("NIFTY30JAN2526000CE", 100.0);
        let action = m
            .manage_entry_for_type(OptionType::CE, Some(&c), Some(96.95))
            .await;

        assert_eq!(action, EntryAction::Failed);
        assert!(m.pending_entry_orders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_equal_to_threshold_is_kept() {
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("X1");
        let mut m = manager(Arc::clone(&broker));

        let c = candidate("NIFTY30JAN2526000CE", 100.0);
        m.manage_entry_for_type(OptionType::CE, Some(&c), Some(96.95))
            .await;

        // New trigger differs by exactly the threshold (1.00): kept
        let c2 = candidate("NIFTY30JAN2526000CE", 99.0);
        let action = m
            .manage_entry_for_type(OptionType::CE, Some(&c2), Some(95.95))
            .await;

        assert_eq!(action, EntryAction::Kept);
        assert_eq!(broker.place_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_beyond_threshold_modifies() {
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("X1");
        broker.push_cancel(true, "");
        // Verify pass: orderbook no longer lists X1
        broker.push_orderbook(Vec::new());
        broker.push_place_ok("X2");
        let mut m = manager(Arc::clone(&broker));

        let c = candidate("NIFTY30JAN2526000CE", 100.0);
        m.manage_entry_for_type(OptionType::CE, Some(&c), Some(96.95))
            .await;

        let c2 = candidate("NIFTY30JAN2526000CE", 98.9);
        let action = m
            .manage_entry_for_type(OptionType::CE, Some(&c2), Some(95.85))
            .await;

        assert_eq!(action, EntryAction::Modified);
        assert_eq!(m.pending_entry_orders.get(&OptionType::CE).unwrap().order_id, "X2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_blocked_when_cancel_fails() {
        // S2: cancel failure must keep the old order and never place B
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("XA");
        broker.push_cancel(false, "order already in transit");
        let mut m = manager(Arc::clone(&broker));

        let a = candidate("NIFTY30JAN2526000CE", 100.0);
        m.manage_entry_for_type(OptionType::CE, Some(&a), Some(96.95))
            .await;

        let b = candidate("NIFTY30JAN2525900CE", 150.0);
        let action = m
            .manage_entry_for_type(OptionType::CE, Some(&b), Some(146.95))
            .await;

        assert_eq!(action, EntryAction::Kept);
        assert_eq!(m.pending_entry_orders.get(&OptionType::CE).unwrap().symbol, "NIFTY30JAN2526000CE");
        // Only the original place call ever reached the broker
        assert_eq!(broker.place_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_blocked_when_verify_fails() {
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("XA");
        broker.push_cancel(true, "");
        // Orderbook keeps showing the order as pending on every verify poll
        broker.push_orderbook(vec![broker_row("XA", "pending", 0, 0.0)]);
        let mut m = manager(Arc::clone(&broker));

        let a = candidate("NIFTY30JAN2526000CE", 100.0);
        m.manage_entry_for_type(OptionType::CE, Some(&a), Some(96.95))
            .await;

        let b = candidate("NIFTY30JAN2525900CE", 150.0);
        let action = m
            .manage_entry_for_type(OptionType::CE, Some(&b), Some(146.95))
            .await;

        assert_eq!(action, EntryAction::Kept);
        assert_eq!(broker.place_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_cancel_skips_verification() {
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("XA");
        broker.push_cancel(false, "Order is in cancelled status");
        broker.push_place_ok("XB");
        let mut m = manager(Arc::clone(&broker));

        let a = candidate("NIFTY30JAN2526000CE", 100.0);
        m.manage_entry_for_type(OptionType::CE, Some(&a), Some(96.95))
            .await;

        let b = candidate("NIFTY30JAN2525900CE", 150.0);
        let action = m
            .manage_entry_for_type(OptionType::CE, Some(&b), Some(146.95))
            .await;

        assert_eq!(action, EntryAction::Switched);
        // No verification polls were needed
        assert_eq!(broker.orderbook_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_request_removes_order() {
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("X1");
        broker.push_cancel(true, "");
        let mut m = manager(Arc::clone(&broker));

        let c = candidate("NIFTY30JAN2526000CE", 100.0);
        m.manage_entry_for_type(OptionType::CE, Some(&c), Some(96.95))
            .await;

        let action = m.manage_entry_for_type(OptionType::CE, None, None).await;
        assert_eq!(action, EntryAction::Cancelled);
        assert!(m.pending_entry_orders.is_empty());
        // P7: no order id remains for the type
        assert!(m.pending_symbols().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_churn_blocked_symbol_refused() {
        let broker = Arc::new(FakeBroker::default());
        let mut m = manager(Arc::clone(&broker));
        m.churn.blocked_symbols.insert("NIFTY30JAN2526000CE".to_string());

        let c = candidate("NIFTY30JAN2526000CE", 100.0);
        let action = m
            .manage_entry_for_type(OptionType::CE, Some(&c), Some(96.95))
            .await;

        assert_eq!(action, EntryAction::Blocked);
        assert_eq!(broker.place_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_detected_with_broker_quantities() {
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("X1");
        let mut m = manager(Arc::clone(&broker));

        let c = candidate("NIFTY30JAN2526000CE", 100.0);
        m.manage_entry_for_type(OptionType::CE, Some(&c), Some(96.95))
            .await;

        broker.push_orderbook(vec![broker_row("X1", "complete", 325, 99.90)]);
        let fills = m.check_entry_fills().await;

        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].quantity, 325);
        assert!((fills[0].fill_price - 99.90).abs() < 1e-9);
        assert!(m.pending_entry_orders.is_empty());

        // Second poll finds nothing: the pending slot is gone
        let fills = m.check_entry_fills().await;
        assert!(fills.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_entry_removed_quietly() {
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("X1");
        let mut m = manager(Arc::clone(&broker));

        let c = candidate("NIFTY30JAN2526000CE", 100.0);
        m.manage_entry_for_type(OptionType::CE, Some(&c), Some(96.95))
            .await;

        let mut rejected = broker_row("X1", "rejected", 0, 0.0);
        rejected.rejected_reason = "margin shortfall".to_string();
        broker.push_orderbook(vec![rejected]);

        let fills = m.check_entry_fills().await;
        assert!(fills.is_empty());
        assert!(m.pending_entry_orders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sl_failure_counting_and_halt() {
        let broker = Arc::new(FakeBroker::default());
        let mut m = manager(Arc::clone(&broker));

        for _ in 0..3 {
            for _ in 0..3 {
                broker.push_place_err("rms says no");
            }
            let result = m.place_sl_order("NIFTY30JAN2526000CE", 106.0, 650).await;
            assert!(result.is_none());
        }

        assert_eq!(m.consecutive_sl_failures(), 3);
        assert!(m.should_halt_trading());

        // One success resets the streak
        broker.push_place_ok("SL1");
        let result = m.place_sl_order("NIFTY30JAN2526000CE", 106.0, 650).await;
        assert!(result.is_some());
        assert_eq!(m.consecutive_sl_failures(), 0);
        assert!(!m.should_halt_trading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sl_order_prices_respect_buy_constraint() {
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("SL1");
        let mut m = manager(Arc::clone(&broker));

        m.place_sl_order("NIFTY30JAN2526000CE", 106.0, 650).await;

        let sl = m.active_sl_orders.get("NIFTY30JAN2526000CE").unwrap();
        assert!(sl.trigger_price < sl.limit_price);
        assert!((sl.limit_price - 109.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_exit_skipped_when_flat_at_broker() {
        let broker = Arc::new(FakeBroker::default());
        let mut m = manager(Arc::clone(&broker));

        let result = m
            .emergency_market_exit("NIFTY30JAN2526000CE", 650, "SL_PLACEMENT_FAILED")
            .await;

        assert!(result.is_none());
        assert_eq!(broker.place_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_exit_uses_broker_quantity() {
        let broker = Arc::new(FakeBroker::default());
        broker.positions.lock().unwrap().push(BrokerPosition {
            symbol: "NIFTY30JAN2526000CE".to_string(),
            quantity: -130,
            average_price: 100.0,
            product: "MIS".to_string(),
        });
        broker.push_place_ok("EM1");
        let mut m = manager(Arc::clone(&broker));

        let result = m
            .emergency_market_exit("NIFTY30JAN2526000CE", 650, "SL_PLACEMENT_FAILED")
            .await;

        assert_eq!(result.unwrap(), "EM1");
        let calls = broker.place_calls.lock().unwrap();
        assert_eq!(calls[0].quantity, 130);
        assert_eq!(calls[0].side.as_str(), "BUY");
        assert_eq!(calls[0].price_type.as_str(), "MARKET");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_missed_fill_and_missing_sl() {
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("X1");
        let mut m = manager(Arc::clone(&broker));

        // Restored pending entry, then a crash window where it filled
        let c = candidate("NIFTY30JAN2526000CE", 100.0);
        m.manage_entry_for_type(OptionType::CE, Some(&c), Some(96.95))
            .await;

        broker.push_orderbook(vec![broker_row("X1", "complete", 650, 102.50)]);

        // An open position on another symbol has no SL anywhere
        let mut open = HashMap::new();
        open.insert(
            "NIFTY30JAN2525900PE".to_string(),
            Position {
                symbol: "NIFTY30JAN2525900PE".to_string(),
                option_type: OptionType::PE,
                strike: 25900,
                entry_price: 120.0,
                sl_price: 126.0,
                quantity: 650,
                actual_r: 3900.0,
                entry_time: Utc::now(),
                current_price: 119.0,
                unrealized_pnl: 0.0,
                unrealized_r: 0.0,
                realized_pnl: 0.0,
                realized_r: 0.0,
                is_closed: false,
                exit_price: None,
                exit_time: None,
                exit_reason: None,
                candidate: candidate("NIFTY30JAN2525900PE", 120.0),
            },
        );

        let report = m.reconcile_with_broker(&open).await.unwrap();

        assert_eq!(report.entries_filled.len(), 1);
        assert!((report.entries_filled[0].fill_price - 102.50).abs() < 1e-9);
        assert_eq!(report.entries_filled[0].quantity, 650);
        assert!(m.pending_entry_orders.is_empty());
        assert_eq!(report.sl_missing, vec!["NIFTY30JAN2525900PE".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_clears_entries_and_sls() {
        let broker = Arc::new(FakeBroker::default());
        broker.push_place_ok("CE1");
        broker.push_place_ok("PE1");
        broker.push_place_ok("SL1");
        let mut m = manager(Arc::clone(&broker));

        let ce = candidate("NIFTY30JAN2526000CE", 100.0);
        m.manage_entry_for_type(OptionType::CE, Some(&ce), Some(96.95))
            .await;
        let mut pe = candidate("NIFTY30JAN2525900PE", 150.0);
        pe.option_type = OptionType::PE;
        m.manage_entry_for_type(OptionType::PE, Some(&pe), Some(146.95))
            .await;
        m.place_sl_order("NIFTY30JAN2525800PE", 106.0, 650).await;

        m.cancel_all_orders().await;

        assert!(m.pending_entry_orders.is_empty());
        assert!(m.active_sl_orders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_sentinel_cancel_without_broker_call() {
        let broker = Arc::new(FakeBroker::default());
        let mut m = manager(Arc::clone(&broker));

        let c = candidate("NIFTY30JAN2526000CE", 100.0);
        m.pending_entry_orders.insert(
            OptionType::CE,
            EntryOrder {
                order_id: PLACING_SENTINEL.to_string(),
                symbol: c.symbol.clone(),
                trigger_price: 99.95,
                limit_price: 96.95,
                quantity: 650,
                status: OrderStatus::InFlight,
                placed_at: Utc::now(),
                candidate: c,
            },
        );

        let action = m.manage_entry_for_type(OptionType::CE, None, None).await;
        assert_eq!(action, EntryAction::Cancelled);
        assert!(broker.cancel_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fill_dedup_key_shape() {
        let fill = Fill {
            option_type: OptionType::CE,
            symbol: "S".to_string(),
            order_id: "X1".to_string(),
            fill_price: 99.95,
            quantity: 650,
            candidate: candidate("S", 100.0),
            filled_at: Utc::now(),
        };
        assert_eq!(fill.dedup_key(), "S_X1_99.95");
    }
}
