use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::ExchangeGateway;
use crate::core::config::EngineConfig;
use crate::core::event_bus::{EventBus, EventKind};
use crate::execution::{OrderManager, PositionManager};
use crate::risk::{CapitalCommander, GuardianLimits, RiskGuardian};

/// OKX default minimum notional for USDT-margined swaps.
const MIN_NOTIONAL_USDT: f64 = 10.0;

/// Wires the execution core together and owns its lifecycle.
///
/// Strategy runners construct one engine per account, allocate capital to
/// their strategies, then drive orders through `order_manager()`. Everything
/// event-driven (fills, position updates) flows through the bus the engine
/// registered at construction time.
pub struct TradingEngine {
    config: EngineConfig,
    gateway: Arc<dyn ExchangeGateway>,
    event_bus: Arc<EventBus>,
    capital_commander: Arc<CapitalCommander>,
    position_manager: Arc<PositionManager>,
    order_manager: Arc<OrderManager>,
    risk_guardian: Arc<RiskGuardian>,
}

impl TradingEngine {
    pub async fn new(gateway: Arc<dyn ExchangeGateway>, config: EngineConfig) -> Result<Self> {
        config.risk.validate()?;

        let event_bus = Arc::new(EventBus::new(config.event_queue_capacity));

        let capital_commander = Arc::new(CapitalCommander::new(
            config.total_capital,
            config.risk.clone(),
        ));
        let position_manager = Arc::new(PositionManager::new(
            event_bus.clone(),
            config.sync_threshold_pct,
            Duration::from_secs(config.sync_cooldown_secs),
        ));
        capital_commander
            .set_exposure_source(position_manager.clone())
            .await;

        let risk_guardian = Arc::new(RiskGuardian::new(
            position_manager.clone(),
            capital_commander.clone(),
            config.risk.clone(),
            GuardianLimits {
                max_order_amount: config.max_order_amount,
                max_frequency: config.max_order_frequency,
                frequency_window: Duration::from_secs_f64(config.frequency_window_secs),
            },
        ));

        let order_manager = Arc::new(OrderManager::new(
            gateway.clone(),
            event_bus.clone(),
            Some(risk_guardian.clone()),
            &config,
        ));

        // Fill fan-out order: ledger releases first, the position book
        // applies the delta, then the order table arms protection.
        event_bus
            .register(EventKind::OrderFilled, capital_commander.clone())
            .await;
        event_bus
            .register(EventKind::OrderFilled, position_manager.clone())
            .await;
        event_bus
            .register(EventKind::OrderFilled, order_manager.clone())
            .await;
        event_bus
            .register(EventKind::PositionUpdate, position_manager.clone())
            .await;
        event_bus
            .register(EventKind::OrderUpdate, order_manager.clone())
            .await;
        event_bus
            .register(EventKind::OrderCancelled, order_manager.clone())
            .await;
        event_bus
            .register(EventKind::PositionClosed, order_manager.clone())
            .await;
        event_bus
            .register(EventKind::PositionClosed, capital_commander.clone())
            .await;

        Ok(Self {
            config,
            gateway,
            event_bus,
            capital_commander,
            position_manager,
            order_manager,
            risk_guardian,
        })
    }

    pub async fn start(&self) -> Result<()> {
        info!("🚀 Trading engine starting...");

        self.event_bus.start().await;
        self.load_instruments().await;

        // Startup hygiene: anything still resting from a previous run is a
        // ghost order waiting to fire.
        let cancelled = self.order_manager.cancel_all_orders(None).await;
        if cancelled > 0 {
            info!("Startup cleanup cancelled {} leftover orders", cancelled);
        }

        self.position_manager
            .start_scheduled_sync(
                self.gateway.clone(),
                Duration::from_secs(self.config.position_sync_interval_secs),
                Duration::from_secs(self.config.sync_backoff_base_secs),
                Duration::from_secs(self.config.sync_backoff_max_secs),
            )
            .await;

        info!("✅ Trading engine started");
        Ok(())
    }

    /// Pull precision constraints for the configured symbols. Failures are
    /// logged and skipped; sizing falls back to unquantized quantities.
    async fn load_instruments(&self) {
        for symbol in &self.config.symbols {
            match self.gateway.get_instrument_details(symbol).await {
                Ok(details) => {
                    self.capital_commander
                        .register_instrument(
                            symbol,
                            details.lot_size,
                            details.min_order_size,
                            MIN_NOTIONAL_USDT,
                        )
                        .await;
                }
                Err(e) => {
                    warn!("Could not load instrument {}: {}, continuing", symbol, e);
                }
            }
        }
    }

    /// Graceful shutdown: stop pulling exchange state, pull resting orders,
    /// then let the bus drain.
    pub async fn stop(&self) {
        info!("Stopping trading engine...");

        self.position_manager.stop_scheduled_sync().await;
        self.order_manager.cancel_all_orders(None).await;
        self.event_bus.stop().await;

        info!("✅ Trading engine stopped");
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn order_manager(&self) -> Arc<OrderManager> {
        self.order_manager.clone()
    }

    pub fn position_manager(&self) -> Arc<PositionManager> {
        self.position_manager.clone()
    }

    pub fn capital_commander(&self) -> Arc<CapitalCommander> {
        self.capital_commander.clone()
    }

    pub fn risk_guardian(&self) -> Arc<RiskGuardian> {
        self.risk_guardian.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
