use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::api::OrderSide;
use crate::core::config::RiskConfig;
use crate::execution::position_manager::{PositionManager, PositionSide};

use super::capital_commander::CapitalCommander;

/// The single output contract of the validation pipeline. `reason` is
/// populated only on rejection; `suggested_size` is the risk-adjusted
/// quantity and may differ from the requested size.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskValidationResult {
    pub is_passed: bool,
    pub reason: Option<String>,
    pub suggested_size: f64,
}

impl RiskValidationResult {
    fn passed(suggested_size: f64) -> Self {
        Self {
            is_passed: true,
            reason: None,
            suggested_size,
        }
    }

    fn rejected(reason: String) -> Self {
        warn!("🛑 Order rejected: {}", reason);
        Self {
            is_passed: false,
            reason: Some(reason),
            suggested_size: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardianLimits {
    pub max_order_amount: f64,     // Per-order notional ceiling (USDT)
    pub max_frequency: usize,      // Orders allowed inside the window
    pub frequency_window: Duration,
}

impl Default for GuardianLimits {
    fn default() -> Self {
        Self {
            max_order_amount: 2_000.0,
            max_frequency: 5,
            frequency_window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardianStats {
    pub total_checks: u64,
    pub total_rejections: u64,
    pub rejection_rate: f64,
    pub recent_orders: usize,
}

/// Unified pre-trade gate: every order passes through `validate_order`
/// before it may reach the gateway. Checks run in a fixed order and the
/// first failure short-circuits with a reason naming the constraint.
pub struct RiskGuardian {
    position_manager: Arc<PositionManager>,
    capital_commander: Arc<CapitalCommander>,
    risk_config: RiskConfig,
    limits: GuardianLimits,
    order_history: RwLock<VecDeque<Instant>>,
    total_checks: AtomicU64,
    total_rejections: AtomicU64,
}

impl RiskGuardian {
    pub fn new(
        position_manager: Arc<PositionManager>,
        capital_commander: Arc<CapitalCommander>,
        risk_config: RiskConfig,
        limits: GuardianLimits,
    ) -> Self {
        tracing::info!(
            "RiskGuardian initialized: max_amount={:.2} USDT, max_frequency={}/{:?}, risk_per_trade={:.1}%",
            limits.max_order_amount,
            limits.max_frequency,
            limits.frequency_window,
            risk_config.risk_per_trade_pct * 100.0
        );
        Self {
            position_manager,
            capital_commander,
            risk_config,
            limits,
            order_history: RwLock::new(VecDeque::new()),
            total_checks: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Run the full pipeline. `bypass` is reserved for emergency-close
    /// orders, which must never be blocked by the very checks that exist to
    /// protect the account.
    #[allow(clippy::too_many_arguments)]
    pub async fn validate_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        price: f64,
        strategy_id: &str,
        stop_loss_price: Option<f64>,
        bypass: bool,
    ) -> RiskValidationResult {
        self.total_checks.fetch_add(1, Ordering::Relaxed);

        // 1. Emergency-close orders skip everything.
        if bypass {
            debug!(
                "🔓 Risk bypass: {} {} {:.4} (emergency close path)",
                symbol, side, size
            );
            return RiskValidationResult::passed(size);
        }

        let amount_usdt = size * price;

        // 2. Drawdown circuit breaker, opening orders only. A breached
        // strategy must still be able to de-risk.
        if !self.is_reducing_order(symbol, side).await
            && self
                .capital_commander
                .is_strategy_circuit_breaker_triggered(strategy_id)
                .await
        {
            return self.reject(format!(
                "drawdown circuit breaker active for strategy {}, new exposure blocked",
                strategy_id
            ));
        }

        // 3. Order frequency.
        if !self.check_frequency().await {
            return self.reject(format!(
                "order frequency above limit: more than {} orders in {:?}",
                self.limits.max_frequency, self.limits.frequency_window
            ));
        }

        // 4. Per-order notional ceiling.
        if amount_usdt > self.limits.max_order_amount {
            return self.reject(format!(
                "order notional {:.2} USDT above ceiling {:.2} USDT",
                amount_usdt, self.limits.max_order_amount
            ));
        }

        // 5. Strategy policy compliance.
        let (policy_ok, policy_reason) = self
            .capital_commander
            .check_policy_compliance(strategy_id, amount_usdt, price)
            .await;
        if !policy_ok {
            return self.reject(
                policy_reason.unwrap_or_else(|| "strategy policy violation".to_string()),
            );
        }

        // 6. Global exposure ceilings.
        if let Some(reason) = self.check_global_exposure(symbol, size, price).await {
            return self.reject(reason);
        }

        // 7. Buying power.
        if !self
            .capital_commander
            .check_buying_power(strategy_id, amount_usdt)
            .await
        {
            return self.reject(format!(
                "insufficient buying power [{}]: order notional {:.2} USDT",
                strategy_id, amount_usdt
            ));
        }

        // 8. Risk-bounded sizing, when a stop price is available.
        let suggested_size = match stop_loss_price {
            Some(stop) if stop > 0.0 => {
                let quantity = self
                    .capital_commander
                    .calculate_safe_quantity(symbol, price, stop, strategy_id)
                    .await;
                if quantity <= 0.0 {
                    return self.reject(format!(
                        "risk sizing produced zero quantity for {} (entry {:.2}, stop {:.2})",
                        symbol, price, stop
                    ));
                }
                quantity
            }
            _ => size,
        };

        debug!(
            "✅ Risk checks passed: {} {} {:.4} -> suggested {:.4} ({:.2} USDT)",
            symbol, side, size, suggested_size, amount_usdt
        );
        RiskValidationResult::passed(suggested_size)
    }

    /// An order that shrinks an existing position. Sell against a long or
    /// buy against a short.
    async fn is_reducing_order(&self, symbol: &str, side: OrderSide) -> bool {
        match self.position_manager.get_position(symbol).await {
            Some(position) if position.size > 0.0 => matches!(
                (position.side, side),
                (PositionSide::Long, OrderSide::Sell) | (PositionSide::Short, OrderSide::Buy)
            ),
            _ => false,
        }
    }

    /// Sliding-window frequency limiter. The approved attempt is recorded in
    /// the window so bursts are counted from the first order, not the last.
    async fn check_frequency(&self) -> bool {
        let now = Instant::now();
        let mut history = self.order_history.write().await;
        while let Some(front) = history.front() {
            if now.duration_since(*front) > self.limits.frequency_window {
                history.pop_front();
            } else {
                break;
            }
        }

        if history.len() >= self.limits.max_frequency {
            return false;
        }
        history.push_back(now);
        true
    }

    /// Global leverage and per-symbol concentration, computed on the book
    /// as it would look after this order.
    async fn check_global_exposure(&self, symbol: &str, size: f64, price: f64) -> Option<String> {
        let new_order_exposure = size * price;
        let total_equity = self.capital_commander.get_total_equity().await;
        if total_equity <= 0.0 {
            return Some("account equity is not positive".to_string());
        }

        let current_total = self.position_manager.get_total_exposure().await;
        let real_leverage = (current_total + new_order_exposure) / total_equity;
        if real_leverage > self.risk_config.max_global_leverage {
            return Some(format!(
                "global leverage limit exceeded: {:.2}x > {:.1}x cap",
                real_leverage, self.risk_config.max_global_leverage
            ));
        }
        if real_leverage > self.risk_config.warning_leverage_threshold {
            warn!(
                "⚠️  Leverage {:.2}x above warning threshold {:.1}x",
                real_leverage, self.risk_config.warning_leverage_threshold
            );
        }

        let symbol_exposure = self.position_manager.get_symbol_exposure(symbol).await;
        let symbol_ratio = (symbol_exposure + new_order_exposure) / total_equity;
        if symbol_ratio > self.risk_config.max_single_symbol_exposure {
            return Some(format!(
                "single-symbol exposure limit exceeded: {} at {:.1}% > {:.1}% cap",
                symbol,
                symbol_ratio * 100.0,
                self.risk_config.max_single_symbol_exposure * 100.0
            ));
        }

        None
    }

    fn reject(&self, reason: String) -> RiskValidationResult {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        RiskValidationResult::rejected(reason)
    }

    pub async fn stats(&self) -> GuardianStats {
        let now = Instant::now();
        let mut history = self.order_history.write().await;
        while let Some(front) = history.front() {
            if now.duration_since(*front) > self.limits.frequency_window {
                history.pop_front();
            } else {
                break;
            }
        }

        let total_checks = self.total_checks.load(Ordering::Relaxed);
        let total_rejections = self.total_rejections.load(Ordering::Relaxed);
        GuardianStats {
            total_checks,
            total_rejections,
            rejection_rate: if total_checks > 0 {
                total_rejections as f64 / total_checks as f64
            } else {
                0.0
            },
            recent_orders: history.len(),
        }
    }

    pub async fn reset_stats(&self) {
        self.order_history.write().await.clear();
        self.total_checks.store(0, Ordering::Relaxed);
        self.total_rejections.store(0, Ordering::Relaxed);
    }
}
