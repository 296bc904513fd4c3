use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ExchangeGateway, OrderRequest, OrderSide, OrderStatus, OrderType};
use crate::core::config::EngineConfig;
use crate::core::error::ExecutionError;
use crate::core::event_bus::{EventBus, EventHandler, TradingEvent};
use crate::risk::RiskGuardian;

#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub client_oid: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub size: f64,
    pub price: f64, // 0.0 for market orders
    pub filled_size: f64,
    pub status: OrderStatus,
    pub strategy_id: String,
    pub reduce_only: bool,
    pub stop_loss_order_id: Option<String>,
    pub stop_loss_price: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Where the hard-stop-loss protocol ended up for a filled entry. Every
/// branch is explicit so the state machine can be asserted on in tests and
/// surfaced in logs without digging through error chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopLossOutcome {
    /// Protective stop resting on the exchange.
    Armed { stop_order_id: String },
    /// No stop was required (no stop price, or the fill was itself a
    /// reducing/protective order).
    Skipped,
    /// Stop placement exhausted its retries; the position was flattened
    /// with a reduce-only market order instead.
    EmergencyClosed { close_order_id: String },
    /// The emergency close failed too. The position is live and
    /// unprotected; operators have to intervene.
    EmergencyCloseFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSummary {
    pub total_orders: usize,
    pub pending_count: usize,
    pub live_count: usize,
    pub filled_count: usize,
    pub cancelled_count: usize,
    pub rejected_count: usize,
}

/// Order lifecycle owner: submission (behind the risk gate), cancellation,
/// fill tracking, and the hard-stop-loss protocol that guarantees no filled
/// entry is left without downside protection.
pub struct OrderManager {
    gateway: Arc<dyn ExchangeGateway>,
    event_bus: Arc<EventBus>,
    risk_guardian: Option<Arc<RiskGuardian>>,
    orders: RwLock<HashMap<String, Order>>,
    symbol_orders: RwLock<HashMap<String, HashSet<String>>>,
    client_oid_index: RwLock<HashMap<String, String>>,
    stop_loss_links: RwLock<HashMap<String, String>>, // entry id -> stop id
    retry_attempts: u32,
    retry_delay: Duration,
}

impl OrderManager {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        event_bus: Arc<EventBus>,
        risk_guardian: Option<Arc<RiskGuardian>>,
        config: &EngineConfig,
    ) -> Self {
        info!(
            "OrderManager initialized: stop retries={}, retry delay={}ms",
            config.stop_loss_retry_attempts, config.stop_loss_retry_delay_ms
        );
        Self {
            gateway,
            event_bus,
            risk_guardian,
            orders: RwLock::new(HashMap::new()),
            symbol_orders: RwLock::new(HashMap::new()),
            client_oid_index: RwLock::new(HashMap::new()),
            stop_loss_links: RwLock::new(HashMap::new()),
            retry_attempts: config.stop_loss_retry_attempts,
            retry_delay: Duration::from_millis(config.stop_loss_retry_delay_ms),
        }
    }

    /// Submit an order. The risk pipeline runs first; a rejection is final
    /// and nothing reaches the gateway. A gateway failure is returned as-is
    /// with no retry — bounded retries exist only on the stop-loss path.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        size: f64,
        price: Option<f64>,
        strategy_id: &str,
        stop_loss_price: Option<f64>,
    ) -> Result<Order, ExecutionError> {
        let mut size = size;

        if let Some(guardian) = &self.risk_guardian {
            // Market orders carry no limit price; risk checks still need a
            // notional, so fall back to the venue's last trade price.
            let calc_price = match price {
                Some(p) if p > 0.0 => p,
                _ => match self.gateway.get_instrument_details(symbol).await {
                    Ok(details) => details.last_price,
                    Err(e) => {
                        debug!("No reference price for {}: {}", symbol, e);
                        0.0
                    }
                },
            };

            let result = guardian
                .validate_order(
                    symbol,
                    side,
                    size,
                    calc_price,
                    strategy_id,
                    stop_loss_price,
                    false,
                )
                .await;

            if !result.is_passed {
                return Err(ExecutionError::rejected(
                    result
                        .reason
                        .unwrap_or_else(|| "risk validation failed".to_string()),
                ));
            }
            if (result.suggested_size - size).abs() > f64::EPSILON {
                info!(
                    "💡 Risk sizing adjusted {}: {:.4} -> {:.4}",
                    symbol, size, result.suggested_size
                );
                size = result.suggested_size;
            }
        }

        let request = OrderRequest {
            client_oid: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            order_type,
            size,
            price,
            strategy_id: strategy_id.to_string(),
            reduce_only: false,
            stop_loss_price,
        };

        let ack = self.gateway.place_order(&request).await.map_err(|e| {
            error!("❌ Order placement failed: {} {} {:.4}: {}", symbol, side, size, e);
            ExecutionError::Gateway(e)
        })?;

        let order = Order {
            order_id: ack.order_id.clone(),
            client_oid: ack.client_oid.clone().or(Some(request.client_oid.clone())),
            symbol: symbol.to_string(),
            side,
            order_type,
            size,
            price: price.unwrap_or(0.0),
            filled_size: ack.filled_size,
            status: OrderStatus::Live,
            strategy_id: strategy_id.to_string(),
            reduce_only: false,
            stop_loss_order_id: None,
            stop_loss_price,
            created_at: Utc::now(),
        };

        self.index_order(order.clone()).await;
        info!(
            "🎯 Order submitted: {} - {} {} {:.4}",
            order.order_id, symbol, side, size
        );

        self.event_bus.publish(TradingEvent::OrderSubmitted {
            order_id: order.order_id.clone(),
            symbol: symbol.to_string(),
            side,
            order_type,
            size,
            price: order.price,
            strategy_id: strategy_id.to_string(),
        });

        Ok(order)
    }

    async fn index_order(&self, order: Order) {
        if let Some(client_oid) = &order.client_oid {
            self.client_oid_index
                .write()
                .await
                .insert(client_oid.clone(), order.order_id.clone());
        }
        self.symbol_orders
            .write()
            .await
            .entry(order.symbol.clone())
            .or_default()
            .insert(order.order_id.clone());
        self.orders
            .write()
            .await
            .insert(order.order_id.clone(), order);
    }

    /// Cancel a single order. Terminal orders are a no-op failure.
    pub async fn cancel_order(&self, order_id: &str, symbol: &str) -> bool {
        let status = match self.orders.read().await.get(order_id) {
            Some(order) => order.status,
            None => {
                warn!("Cancel requested for unknown order {}", order_id);
                return false;
            }
        };
        if status.is_terminal() {
            warn!("Order {} already {:?}, cannot cancel", order_id, status);
            return false;
        }

        match self.gateway.cancel_order(order_id, symbol).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Exchange refused to cancel {}", order_id);
                return false;
            }
            Err(e) => {
                error!("❌ Cancel failed for {}: {}", order_id, e);
                return false;
            }
        }

        if let Some(order) = self.orders.write().await.get_mut(order_id) {
            order.status = OrderStatus::Cancelled;
        }
        info!("Order cancelled: {}", order_id);

        self.event_bus.publish(TradingEvent::OrderCancelled {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
        });
        self.cleanup_order(order_id).await;
        true
    }

    /// Cancel every non-terminal order, optionally scoped to one symbol.
    pub async fn cancel_all_orders(&self, symbol: Option<&str>) -> usize {
        let to_cancel: Vec<(String, String)> = {
            let orders = self.orders.read().await;
            orders
                .values()
                .filter(|o| !o.status.is_terminal())
                .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
                .map(|o| (o.order_id.clone(), o.symbol.clone()))
                .collect()
        };

        let mut cancelled = 0;
        for (order_id, symbol) in &to_cancel {
            if self.cancel_order(order_id, symbol).await {
                cancelled += 1;
            }
        }

        info!(
            "Cancelled {}/{} open orders (scope: {})",
            cancelled,
            to_cancel.len(),
            symbol.unwrap_or("all")
        );
        cancelled
    }

    /// Ghost-order protection: once a position is flat, any stop-market
    /// order still resting on the exchange would fire as a fresh entry in
    /// the opposite direction. Cancel them all.
    pub async fn cancel_all_stop_loss_orders(&self, symbol: &str) -> usize {
        let to_cancel: Vec<String> = {
            let orders = self.orders.read().await;
            orders
                .values()
                .filter(|o| {
                    o.symbol == symbol
                        && o.order_type == OrderType::StopMarket
                        && !o.status.is_terminal()
                })
                .map(|o| o.order_id.clone())
                .collect()
        };

        let mut cancelled = 0;
        for order_id in &to_cancel {
            if self.cancel_order(order_id, symbol).await {
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            info!(
                "👻 Ghost-order protection: cancelled {} resting stop(s) on {}",
                cancelled, symbol
            );
        }
        cancelled
    }

    async fn on_order_update(
        &self,
        order_id: &str,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        size: f64,
        price: f64,
        filled_size: f64,
        status: OrderStatus,
    ) {
        let known = self.orders.read().await.contains_key(order_id);
        if known {
            let mut orders = self.orders.write().await;
            if let Some(order) = orders.get_mut(order_id) {
                order.filled_size = filled_size;
                order.status = status;
                debug!(
                    "Order update: {} - status={:?}, filled={:.4}/{:.4}",
                    order_id, order.status, order.filled_size, order.size
                );
            }
        } else {
            // First sighting of an order created elsewhere (e.g. before a
            // restart); adopt it so cancels and fills have a record.
            self.index_order(Order {
                order_id: order_id.to_string(),
                client_oid: None,
                symbol: symbol.to_string(),
                side,
                order_type,
                size,
                price,
                filled_size,
                status,
                strategy_id: "default".to_string(),
                reduce_only: false,
                stop_loss_order_id: None,
                stop_loss_price: None,
                created_at: Utc::now(),
            })
            .await;
            debug!("Adopted unknown order {} from update", order_id);
        }
    }

    /// Fill handling: mark the order filled, then run the hard-stop-loss
    /// protocol for entry fills.
    async fn on_order_filled(
        &self,
        order_id: &str,
        client_oid: Option<&str>,
        filled_size: f64,
        stop_loss_price: Option<f64>,
    ) -> Option<StopLossOutcome> {
        // Resolve through the client-oid index first, then directly.
        let resolved_id = match client_oid {
            Some(coid) => self
                .client_oid_index
                .read()
                .await
                .get(coid)
                .cloned()
                .unwrap_or_else(|| order_id.to_string()),
            None => order_id.to_string(),
        };

        let order = {
            let mut orders = self.orders.write().await;
            match orders.get_mut(&resolved_id) {
                Some(order) => {
                    if filled_size > 0.0 {
                        order.filled_size = filled_size;
                    }
                    order.status = OrderStatus::Filled;
                    order.clone()
                }
                None => {
                    debug!("Fill for unknown order {}", resolved_id);
                    return None;
                }
            }
        };

        info!(
            "✅ Order filled: {} - {} {} {:.4}",
            order.order_id, order.symbol, order.side, order.filled_size
        );

        // The link map is cleared when the entry leaves the live index, so
        // the order's own record is the durable duplicate-fill guard.
        let already_protected = order.stop_loss_order_id.is_some()
            || self
                .stop_loss_links
                .read()
                .await
                .contains_key(&order.order_id);

        let outcome = if already_protected {
            None
        } else {
            let effective_stop = stop_loss_price.or(order.stop_loss_price);
            Some(self.place_stop_loss_order(&order, effective_stop).await)
        };

        self.cleanup_order(&order.order_id).await;
        outcome
    }

    /// Hard-stop-loss protocol. Either a stop ends up armed on the
    /// exchange, the position is flattened, or the failure is loudly
    /// escalated — this path never swallows an error.
    async fn place_stop_loss_order(
        &self,
        entry: &Order,
        stop_loss_price: Option<f64>,
    ) -> StopLossOutcome {
        if entry.reduce_only || entry.order_type == OrderType::StopMarket {
            debug!(
                "Order {} is protective/reducing, no stop needed",
                entry.order_id
            );
            return StopLossOutcome::Skipped;
        }

        let stop_price = match stop_loss_price {
            Some(p) if p > 0.0 => p,
            _ => {
                if entry.side == OrderSide::Buy {
                    warn!(
                        "Order {} filled without a stop price, position is unprotected by design",
                        entry.order_id
                    );
                } else {
                    debug!("Order {} carries no stop price, skipping", entry.order_id);
                }
                return StopLossOutcome::Skipped;
            }
        };

        if entry.filled_size <= 0.0 {
            return StopLossOutcome::Skipped;
        }

        let stop_side = entry.side.opposite();

        for attempt in 1..=self.retry_attempts {
            let request = OrderRequest {
                client_oid: Uuid::new_v4().to_string(),
                symbol: entry.symbol.clone(),
                side: stop_side,
                order_type: OrderType::StopMarket,
                size: entry.filled_size,
                price: Some(stop_price),
                strategy_id: entry.strategy_id.clone(),
                reduce_only: true,
                stop_loss_price: None,
            };

            match self.gateway.place_order(&request).await {
                Ok(ack) => {
                    let stop_order = Order {
                        order_id: ack.order_id.clone(),
                        client_oid: ack.client_oid.clone().or(Some(request.client_oid)),
                        symbol: entry.symbol.clone(),
                        side: stop_side,
                        order_type: OrderType::StopMarket,
                        size: entry.filled_size,
                        price: stop_price,
                        filled_size: 0.0,
                        status: OrderStatus::Live,
                        strategy_id: entry.strategy_id.clone(),
                        reduce_only: true,
                        stop_loss_order_id: None,
                        stop_loss_price: None,
                        created_at: Utc::now(),
                    };

                    self.stop_loss_links
                        .write()
                        .await
                        .insert(entry.order_id.clone(), ack.order_id.clone());
                    if let Some(order) = self.orders.write().await.get_mut(&entry.order_id) {
                        order.stop_loss_order_id = Some(ack.order_id.clone());
                    }
                    self.index_order(stop_order).await;

                    info!(
                        "🛡️  Hard stop armed: {} - {} {} {:.4} @ {:.2} (entry {}, attempt {})",
                        ack.order_id,
                        entry.symbol,
                        stop_side,
                        entry.filled_size,
                        stop_price,
                        entry.order_id,
                        attempt
                    );

                    self.event_bus.publish(TradingEvent::OrderSubmitted {
                        order_id: ack.order_id.clone(),
                        symbol: entry.symbol.clone(),
                        side: stop_side,
                        order_type: OrderType::StopMarket,
                        size: entry.filled_size,
                        price: stop_price,
                        strategy_id: entry.strategy_id.clone(),
                    });

                    return StopLossOutcome::Armed {
                        stop_order_id: ack.order_id,
                    };
                }
                Err(e) => {
                    warn!(
                        "Stop placement failed (attempt {}/{}): {}",
                        attempt, self.retry_attempts, e
                    );
                    if attempt < self.retry_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        error!(
            "🚨 Stop placement exhausted {} attempts, flattening {} {} {:.4}",
            self.retry_attempts, entry.symbol, entry.side, entry.filled_size
        );
        self.emergency_close_position(entry).await
    }

    /// Last resort: an unconditional reduce-only market order. A failure
    /// here is the most severe condition the core can produce and is never
    /// retried automatically.
    async fn emergency_close_position(&self, entry: &Order) -> StopLossOutcome {
        let close_side = entry.side.opposite();
        warn!(
            "⚠️  Emergency close: {} {} {:.4} @ market",
            entry.symbol, close_side, entry.filled_size
        );

        let request = OrderRequest {
            client_oid: Uuid::new_v4().to_string(),
            symbol: entry.symbol.clone(),
            side: close_side,
            order_type: OrderType::Market,
            size: entry.filled_size,
            price: None,
            strategy_id: entry.strategy_id.clone(),
            reduce_only: true,
            stop_loss_price: None,
        };

        match self.gateway.place_order(&request).await {
            Ok(ack) => {
                info!(
                    "✅ Emergency close submitted: {} - {} {} {:.4}",
                    ack.order_id, entry.symbol, close_side, entry.filled_size
                );
                self.event_bus.publish(TradingEvent::OrderSubmitted {
                    order_id: ack.order_id.clone(),
                    symbol: entry.symbol.clone(),
                    side: close_side,
                    order_type: OrderType::Market,
                    size: entry.filled_size,
                    price: 0.0,
                    strategy_id: entry.strategy_id.clone(),
                });
                StopLossOutcome::EmergencyClosed {
                    close_order_id: ack.order_id,
                }
            }
            Err(e) => {
                error!(
                    "🚨 EMERGENCY CLOSE FAILED - UNPROTECTED POSITION: {} {} {:.4}: {}",
                    entry.symbol, entry.side, entry.filled_size, e
                );
                self.event_bus.publish(TradingEvent::EmergencyStop {
                    reason: format!(
                        "unprotected position: {} {} {:.4} (stop and emergency close both failed)",
                        entry.symbol, entry.side, entry.filled_size
                    ),
                    timestamp: Utc::now(),
                });
                StopLossOutcome::EmergencyCloseFailed
            }
        }
    }

    async fn on_order_cancelled(&self, order_id: &str) {
        let found = {
            let mut orders = self.orders.write().await;
            match orders.get_mut(order_id) {
                Some(order) => {
                    order.status = OrderStatus::Cancelled;
                    true
                }
                None => false,
            }
        };
        if found {
            info!("Order cancelled (exchange): {}", order_id);
            self.cleanup_order(order_id).await;
        }
    }

    /// Drop a terminal order from the live indexes. The order record itself
    /// stays for inspection; only the lookups are cleared.
    async fn cleanup_order(&self, order_id: &str) {
        let order = match self.orders.read().await.get(order_id) {
            Some(order) => order.clone(),
            None => return,
        };

        let mut symbol_orders = self.symbol_orders.write().await;
        if let Some(ids) = symbol_orders.get_mut(&order.symbol) {
            ids.remove(order_id);
            if ids.is_empty() {
                symbol_orders.remove(&order.symbol);
            }
        }
        drop(symbol_orders);

        if let Some(client_oid) = &order.client_oid {
            self.client_oid_index.write().await.remove(client_oid);
        }
        if self
            .stop_loss_links
            .write()
            .await
            .remove(order_id)
            .is_some()
        {
            debug!("Cleared stop link for {}", order_id);
        }
    }

    pub async fn get_order(&self, order_id: &str) -> Option<Order> {
        self.orders.read().await.get(order_id).cloned()
    }

    pub async fn get_orders_by_symbol(&self, symbol: &str) -> Vec<Order> {
        let orders = self.orders.read().await;
        orders
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub async fn get_all_orders(&self) -> Vec<Order> {
        self.orders.read().await.values().cloned().collect()
    }

    pub async fn summary(&self) -> OrderSummary {
        let orders = self.orders.read().await;
        let count = |status: OrderStatus| orders.values().filter(|o| o.status == status).count();
        OrderSummary {
            total_orders: orders.len(),
            pending_count: count(OrderStatus::Pending),
            live_count: count(OrderStatus::Live),
            filled_count: count(OrderStatus::Filled),
            cancelled_count: count(OrderStatus::Cancelled),
            rejected_count: count(OrderStatus::Rejected),
        }
    }

    pub async fn reset(&self) {
        self.orders.write().await.clear();
        self.symbol_orders.write().await.clear();
        self.client_oid_index.write().await.clear();
        self.stop_loss_links.write().await.clear();
        info!("Order manager reset");
    }
}

#[async_trait]
impl EventHandler for OrderManager {
    fn name(&self) -> &'static str {
        "order_manager"
    }

    async fn handle(&self, event: &TradingEvent) -> anyhow::Result<()> {
        match event {
            TradingEvent::OrderUpdate {
                order_id,
                symbol,
                side,
                order_type,
                size,
                price,
                filled_size,
                status,
            } => {
                self.on_order_update(
                    order_id, symbol, *side, *order_type, *size, *price, *filled_size, *status,
                )
                .await;
            }
            TradingEvent::OrderFilled {
                order_id,
                filled_size,
                stop_loss_price,
                ..
            } => {
                self.on_order_filled(order_id, None, *filled_size, *stop_loss_price)
                    .await;
            }
            TradingEvent::OrderCancelled { order_id, .. } => {
                self.on_order_cancelled(order_id).await;
            }
            TradingEvent::PositionClosed { symbol, .. } => {
                self.cancel_all_stop_loss_orders(symbol).await;
            }
            _ => {}
        }
        Ok(())
    }
}
