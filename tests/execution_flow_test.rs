//! End-to-end scenarios against a scripted paper gateway: fill -> stop
//! armed, stop failures -> emergency close, position close -> ghost-stop
//! cleanup with realized P&L landing in the ledger.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use okx_perp_trading_bot::api::{
    ExchangeGateway, ExchangePosition, GatewayError, InstrumentDetails, OrderAck, OrderRequest,
    OrderSide, OrderType,
};
use okx_perp_trading_bot::core::event_bus::TradingEvent;
use okx_perp_trading_bot::EngineConfig;
use okx_perp_trading_bot::TradingEngine;

/// In-memory exchange double. Every request is recorded; failure injection
/// is per order type so the stop-loss path can be driven into its corners.
#[derive(Default)]
struct PaperGateway {
    next_id: AtomicU64,
    requests: Mutex<Vec<OrderRequest>>,
    cancelled: Mutex<Vec<String>>,
    fail_stop_orders: AtomicBool,
    fail_all_orders: AtomicBool,
}

impl PaperGateway {
    fn recorded_requests(&self) -> Vec<OrderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        self.requests.lock().unwrap().push(request.clone());

        if self.fail_all_orders.load(Ordering::SeqCst)
            || (request.order_type == OrderType::StopMarket
                && self.fail_stop_orders.load(Ordering::SeqCst))
        {
            return Err(GatewayError::Transport("injected outage".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(OrderAck {
            order_id: format!("paper-{}", id),
            client_oid: Some(request.client_oid.clone()),
            filled_size: 0.0,
            raw: serde_json::json!({ "venue": "paper" }),
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<bool, GatewayError> {
        self.cancelled.lock().unwrap().push(order_id.to_string());
        Ok(true)
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
        Ok(vec![])
    }

    async fn get_instrument_details(
        &self,
        symbol: &str,
    ) -> Result<InstrumentDetails, GatewayError> {
        Ok(InstrumentDetails {
            symbol: symbol.to_string(),
            lot_size: 0.001,
            min_order_size: 0.001,
            tick_size: 0.1,
            last_price: 50_000.0,
        })
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        stop_loss_retry_delay_ms: 1,
        ..EngineConfig::default()
    }
}

async fn engine_with(gateway: Arc<PaperGateway>) -> TradingEngine {
    let engine = TradingEngine::new(gateway, test_config()).await.unwrap();
    engine.start().await.unwrap();
    engine
        .capital_commander()
        .allocate_strategy("vulture", 5_000.0)
        .await;
    engine
}

fn fill_event(order_id: &str, side: OrderSide, size: f64, price: f64) -> TradingEvent {
    TradingEvent::OrderFilled {
        order_id: order_id.to_string(),
        symbol: "BTC-USDT-SWAP".to_string(),
        side,
        filled_size: size,
        price,
        strategy_id: "vulture".to_string(),
        stop_loss_price: if side == OrderSide::Buy {
            Some(49_000.0)
        } else {
            None
        },
    }
}

#[tokio::test]
async fn entry_fill_arms_a_protective_stop() {
    let gateway = Arc::new(PaperGateway::default());
    let engine = engine_with(gateway.clone()).await;

    let order = engine
        .order_manager()
        .submit_order(
            "BTC-USDT-SWAP",
            OrderSide::Buy,
            OrderType::Limit,
            0.02,
            Some(50_000.0),
            "vulture",
            Some(49_000.0),
        )
        .await
        .unwrap();

    engine
        .event_bus()
        .publish(fill_event(&order.order_id, OrderSide::Buy, order.size, 50_000.0));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The book has the long and the exchange got a reduce-only stop for
    // exactly the filled size at the requested trigger.
    let position = engine
        .position_manager()
        .get_position("BTC-USDT-SWAP")
        .await
        .unwrap();
    assert!((position.size - order.size).abs() < 1e-9);

    let requests = gateway.recorded_requests();
    let stops: Vec<_> = requests
        .iter()
        .filter(|r| r.order_type == OrderType::StopMarket)
        .collect();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].side, OrderSide::Sell);
    assert!(stops[0].reduce_only);
    assert_eq!(stops[0].price, Some(49_000.0));
    assert!((stops[0].size - order.size).abs() < 1e-9);

    engine.stop().await;
}

#[tokio::test]
async fn exhausted_stop_placement_flattens_with_one_market_order() {
    let gateway = Arc::new(PaperGateway::default());
    let engine = engine_with(gateway.clone()).await;

    let order = engine
        .order_manager()
        .submit_order(
            "BTC-USDT-SWAP",
            OrderSide::Buy,
            OrderType::Limit,
            0.02,
            Some(50_000.0),
            "vulture",
            Some(49_000.0),
        )
        .await
        .unwrap();

    // Stop placement starts failing right before the fill arrives.
    gateway.fail_stop_orders.store(true, Ordering::SeqCst);
    engine
        .event_bus()
        .publish(fill_event(&order.order_id, OrderSide::Buy, 1.0, 50_000.0));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let requests = gateway.recorded_requests();
    let stop_attempts = requests
        .iter()
        .filter(|r| r.order_type == OrderType::StopMarket)
        .count();
    let emergency_closes: Vec<_> = requests
        .iter()
        .filter(|r| r.order_type == OrderType::Market && r.reduce_only)
        .collect();

    assert_eq!(stop_attempts, 3);
    assert_eq!(emergency_closes.len(), 1);
    assert_eq!(emergency_closes[0].side, OrderSide::Sell);
    assert!((emergency_closes[0].size - 1.0).abs() < 1e-9);

    engine.stop().await;
}

#[tokio::test]
async fn closing_a_position_cancels_its_ghost_stop_and_books_pnl() {
    let gateway = Arc::new(PaperGateway::default());
    let engine = engine_with(gateway.clone()).await;

    let order = engine
        .order_manager()
        .submit_order(
            "BTC-USDT-SWAP",
            OrderSide::Buy,
            OrderType::Limit,
            0.02,
            Some(50_000.0),
            "vulture",
            Some(49_000.0),
        )
        .await
        .unwrap();

    engine
        .event_bus()
        .publish(fill_event(&order.order_id, OrderSide::Buy, order.size, 50_000.0));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stop_id = {
        let requests = gateway.recorded_requests();
        let stop_request = requests
            .iter()
            .position(|r| r.order_type == OrderType::StopMarket)
            .expect("stop was placed");
        // Paper order ids are allocated in request order.
        format!("paper-{}", stop_request)
    };

    // The position is closed by a discretionary sell at a profit.
    engine
        .event_bus()
        .publish(fill_event("external-close", OrderSide::Sell, order.size, 51_000.0));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Ghost-order protection pulled the resting stop.
    assert!(gateway.cancelled_ids().contains(&stop_id));
    assert!(engine
        .position_manager()
        .get_position("BTC-USDT-SWAP")
        .await
        .is_none());

    // Realized P&L reached the owning strategy's bucket.
    let capital = engine
        .capital_commander()
        .get_strategy_capital("vulture")
        .await
        .unwrap();
    assert!((capital.profit - order.size * 1_000.0).abs() < 1e-6);

    engine.stop().await;
}

#[tokio::test]
async fn risk_rejection_never_reaches_the_exchange() {
    let gateway = Arc::new(PaperGateway::default());
    let engine = engine_with(gateway.clone()).await;

    // 1.0 BTC at 50k is far beyond the 2_000 USDT per-order ceiling.
    let result = engine
        .order_manager()
        .submit_order(
            "BTC-USDT-SWAP",
            OrderSide::Buy,
            OrderType::Limit,
            1.0,
            Some(50_000.0),
            "vulture",
            None,
        )
        .await;

    assert!(result.is_err());
    assert!(gateway.recorded_requests().is_empty());

    engine.stop().await;
}
