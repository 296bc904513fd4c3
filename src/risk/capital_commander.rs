use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::api::OrderSide;
use crate::core::config::RiskConfig;
use crate::core::event_bus::{EventHandler, TradingEvent};

use super::profile::RiskProfile;

/// Per-strategy capital bucket. `available` is always kept equal to
/// `allocated - used + profit`.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyCapital {
    pub allocated: f64,
    pub used: f64,
    pub profit: f64,
    pub available: f64,
    pub peak_profit: f64,
    pub max_drawdown_pct: f64,
}

impl StrategyCapital {
    fn new(allocated: f64) -> Self {
        Self {
            allocated,
            used: 0.0,
            profit: 0.0,
            available: allocated,
            peak_profit: 0.0,
            max_drawdown_pct: 0.0,
        }
    }

    fn refresh_available(&mut self) {
        self.available = self.allocated - self.used + self.profit;
    }
}

/// Quantization constraints for a tradable contract.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeInstrument {
    pub symbol: String,
    pub lot_size: f64,
    pub min_order_size: f64,
    pub min_notional: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapitalSummary {
    pub total_capital: f64,
    pub unallocated: f64,
    pub total_allocated: f64,
    pub total_used: f64,
    pub total_profit: f64,
    pub total_available: f64,
    pub strategy_count: usize,
}

/// Read-only exposure figures, implemented by the position table. Injected
/// so the ledger can enforce leverage caps without owning position state.
#[async_trait]
pub trait ExposureSource: Send + Sync {
    async fn total_exposure(&self) -> f64;

    async fn symbol_exposure(&self, symbol: &str) -> f64;
}

struct Ledger {
    strategies: HashMap<String, StrategyCapital>,
    unallocated: f64,
}

/// Capital ledger and risk-bounded position sizing.
///
/// Owns the per-strategy capital buckets, the instrument registry and the
/// per-strategy risk profiles. All mutation goes through its methods; other
/// components only read snapshots.
pub struct CapitalCommander {
    total_capital: f64,
    risk_config: RiskConfig,
    ledger: RwLock<Ledger>,
    instruments: RwLock<HashMap<String, ExchangeInstrument>>,
    profiles: RwLock<HashMap<String, RiskProfile>>,
    exposure: RwLock<Option<Arc<dyn ExposureSource>>>,
}

impl CapitalCommander {
    pub fn new(total_capital: f64, risk_config: RiskConfig) -> Self {
        info!(
            "CapitalCommander initialized: total_capital={:.2} USDT, risk_per_trade={:.1}%",
            total_capital,
            risk_config.risk_per_trade_pct * 100.0
        );
        Self {
            total_capital,
            risk_config,
            ledger: RwLock::new(Ledger {
                strategies: HashMap::new(),
                unallocated: total_capital,
            }),
            instruments: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            exposure: RwLock::new(None),
        }
    }

    /// Wire in the position table after construction (it is built later in
    /// the dependency order).
    pub async fn set_exposure_source(&self, source: Arc<dyn ExposureSource>) {
        *self.exposure.write().await = Some(source);
    }

    /// Carve capital out of the unallocated pool for a strategy. Allocating
    /// to an existing strategy tops up its bucket.
    pub async fn allocate_strategy(&self, strategy_id: &str, amount: f64) -> bool {
        if amount <= 0.0 {
            error!("Allocation must be positive: {}", amount);
            return false;
        }

        let mut ledger = self.ledger.write().await;
        if amount > ledger.unallocated {
            error!(
                "Not enough unallocated capital: need {:.2}, have {:.2}",
                amount, ledger.unallocated
            );
            return false;
        }

        match ledger.strategies.get_mut(strategy_id) {
            Some(capital) => {
                warn!("Strategy {} already funded, topping up", strategy_id);
                capital.allocated += amount;
                capital.refresh_available();
            }
            None => {
                ledger
                    .strategies
                    .insert(strategy_id.to_string(), StrategyCapital::new(amount));
            }
        }
        ledger.unallocated -= amount;

        info!(
            "💰 Allocated {:.2} USDT to strategy {}, unallocated left: {:.2} USDT",
            amount, strategy_id, ledger.unallocated
        );
        true
    }

    pub async fn check_buying_power(&self, strategy_id: &str, amount_usdt: f64) -> bool {
        let ledger = self.ledger.read().await;
        let Some(capital) = ledger.strategies.get(strategy_id) else {
            error!("Strategy {} has no capital allocated", strategy_id);
            return false;
        };

        let has_power = capital.available >= amount_usdt;
        if !has_power {
            warn!(
                "Strategy {} lacks buying power: need {:.2} USDT, available {:.2} USDT",
                strategy_id, amount_usdt, capital.available
            );
        }
        has_power
    }

    /// Reserve margin before an order goes out. Fails when the bucket cannot
    /// cover the amount.
    pub async fn reserve_capital(&self, strategy_id: &str, amount_usdt: f64) -> bool {
        let mut ledger = self.ledger.write().await;
        let Some(capital) = ledger.strategies.get_mut(strategy_id) else {
            error!("Strategy {} has no capital allocated", strategy_id);
            return false;
        };
        if capital.available < amount_usdt {
            warn!(
                "Strategy {} lacks buying power: need {:.2} USDT, available {:.2} USDT",
                strategy_id, amount_usdt, capital.available
            );
            return false;
        }

        capital.used += amount_usdt;
        capital.refresh_available();
        debug!(
            "Strategy {} reserved {:.2} USDT, available now {:.2} USDT",
            strategy_id, amount_usdt, capital.available
        );
        true
    }

    /// Release a reservation after a fill, cancel or rejection. Clamped at
    /// zero so a double release cannot mint buying power.
    pub async fn release_capital(&self, strategy_id: &str, amount_usdt: f64) {
        let mut ledger = self.ledger.write().await;
        let Some(capital) = ledger.strategies.get_mut(strategy_id) else {
            error!("Strategy {} has no capital allocated", strategy_id);
            return;
        };

        capital.used = (capital.used - amount_usdt).max(0.0);
        capital.refresh_available();
        debug!(
            "Strategy {} released {:.2} USDT, available now {:.2} USDT",
            strategy_id, amount_usdt, capital.available
        );
    }

    /// Book realized P&L and feed the drawdown tracker: the profit peak only
    /// ratchets upward, and the worst observed peak-to-current drop (as a
    /// fraction of allocated capital) is retained.
    pub async fn record_profit(&self, strategy_id: &str, profit_usdt: f64) {
        let mut ledger = self.ledger.write().await;
        let Some(capital) = ledger.strategies.get_mut(strategy_id) else {
            error!("Strategy {} has no capital allocated", strategy_id);
            return;
        };

        capital.profit += profit_usdt;
        capital.peak_profit = capital.peak_profit.max(capital.profit);
        if capital.allocated > 0.0 {
            let drawdown = (capital.peak_profit - capital.profit) / capital.allocated;
            capital.max_drawdown_pct = capital.max_drawdown_pct.max(drawdown);
        }
        capital.refresh_available();

        info!(
            "📈 Strategy {} P&L {:+.2} USDT, cumulative {:+.2} USDT, max drawdown {:.1}%",
            strategy_id,
            profit_usdt,
            capital.profit,
            capital.max_drawdown_pct * 100.0
        );
    }

    pub async fn get_strategy_capital(&self, strategy_id: &str) -> Option<StrategyCapital> {
        self.ledger.read().await.strategies.get(strategy_id).cloned()
    }

    pub async fn get_all_capitals(&self) -> HashMap<String, StrategyCapital> {
        self.ledger.read().await.strategies.clone()
    }

    pub async fn get_summary(&self) -> CapitalSummary {
        let ledger = self.ledger.read().await;
        let strategies = &ledger.strategies;
        CapitalSummary {
            total_capital: self.total_capital,
            unallocated: ledger.unallocated,
            total_allocated: strategies.values().map(|c| c.allocated).sum(),
            total_used: strategies.values().map(|c| c.used).sum(),
            total_profit: strategies.values().map(|c| c.profit).sum(),
            total_available: strategies.values().map(|c| c.available).sum(),
            strategy_count: strategies.len(),
        }
    }

    /// Account equity: the full capital pool plus realized profit across all
    /// strategies. Unrealized P&L deliberately does not feed sizing.
    pub async fn get_total_equity(&self) -> f64 {
        let ledger = self.ledger.read().await;
        self.total_capital + ledger.strategies.values().map(|c| c.profit).sum::<f64>()
    }

    /// Drawdown circuit breaker: true once the strategy's worst observed
    /// drawdown exceeds the configured limit.
    pub async fn is_strategy_circuit_breaker_triggered(&self, strategy_id: &str) -> bool {
        let ledger = self.ledger.read().await;
        ledger
            .strategies
            .get(strategy_id)
            .map(|c| c.max_drawdown_pct > self.risk_config.max_drawdown_limit)
            .unwrap_or(false)
    }

    pub async fn register_instrument(
        &self,
        symbol: &str,
        lot_size: f64,
        min_order_size: f64,
        min_notional: f64,
    ) {
        info!(
            "✅ Instrument registered: {} lot_size={}, min_order_size={}, min_notional={:.2} USDT",
            symbol, lot_size, min_order_size, min_notional
        );
        self.instruments.write().await.insert(
            symbol.to_string(),
            ExchangeInstrument {
                symbol: symbol.to_string(),
                lot_size,
                min_order_size,
                min_notional,
            },
        );
    }

    pub async fn get_all_instruments(&self) -> HashMap<String, ExchangeInstrument> {
        self.instruments.read().await.clone()
    }

    pub async fn register_risk_profile(&self, profile: RiskProfile) {
        info!(
            "Risk profile registered: {} (max_leverage={}x, max_order={:.2} USDT)",
            profile.strategy_id, profile.max_leverage, profile.max_order_size_usdt
        );
        self.profiles
            .write()
            .await
            .insert(profile.strategy_id.clone(), profile);
    }

    /// Strategies without a registered profile fall back to the conservative
    /// default so unknown callers never trade with elevated limits.
    pub async fn get_strategy_profile(&self, strategy_id: &str) -> RiskProfile {
        self.profiles
            .read()
            .await
            .get(strategy_id)
            .cloned()
            .unwrap_or_else(|| RiskProfile::conservative(strategy_id))
    }

    /// Strategy-level order checks, independent of the global ceilings: the
    /// profile's own order-size cap and its leverage cap over allocated
    /// capital.
    pub async fn check_policy_compliance(
        &self,
        strategy_id: &str,
        amount_usdt: f64,
        entry_price: f64,
    ) -> (bool, Option<String>) {
        if entry_price <= 0.0 {
            return (false, Some(format!("invalid entry price: {}", entry_price)));
        }

        let profile = self.get_strategy_profile(strategy_id).await;

        if amount_usdt > profile.max_order_size_usdt {
            return (
                false,
                Some(format!(
                    "order notional {:.2} USDT above strategy cap {:.2} USDT [{}]",
                    amount_usdt, profile.max_order_size_usdt, strategy_id
                )),
            );
        }

        let ledger = self.ledger.read().await;
        let Some(capital) = ledger.strategies.get(strategy_id) else {
            return (
                false,
                Some(format!("strategy {} has no capital allocated", strategy_id)),
            );
        };
        if capital.allocated <= 0.0 {
            return (
                false,
                Some(format!("strategy {} has no capital allocated", strategy_id)),
            );
        }

        let strategy_leverage = (capital.used + amount_usdt) / capital.allocated;
        if strategy_leverage > profile.max_leverage {
            return (
                false,
                Some(format!(
                    "strategy leverage {:.2}x above profile cap {:.2}x [{}]",
                    strategy_leverage, profile.max_leverage, strategy_id
                )),
            );
        }

        (true, None)
    }

    /// Risk-bounded sizing: turn (entry, stop) into the largest quantity
    /// that respects the 1% rule, the drawdown breaker, the global leverage
    /// cap, the per-symbol exposure cap and the instrument's precision
    /// constraints. Returns 0 to signal "do not trade".
    pub async fn calculate_safe_quantity(
        &self,
        symbol: &str,
        entry_price: f64,
        stop_loss_price: f64,
        strategy_id: &str,
    ) -> f64 {
        if entry_price <= 0.0 || stop_loss_price <= 0.0 {
            warn!(
                "Invalid prices for sizing: entry={}, stop={}",
                entry_price, stop_loss_price
            );
            return 0.0;
        }

        // 1. No new risk while the strategy is in drawdown breach.
        if self.is_strategy_circuit_breaker_triggered(strategy_id).await {
            warn!(
                "🛑 Drawdown circuit breaker active for {}, sizing to zero",
                strategy_id
            );
            return 0.0;
        }

        let equity = self.get_total_equity().await;
        if equity <= 0.0 {
            error!("Account equity is not positive: {:.2}", equity);
            return 0.0;
        }

        // 2-4. 1% rule with a stop-distance floor against division blow-ups.
        let risk_amount = equity * self.risk_config.risk_per_trade_pct;
        let price_distance = (entry_price - stop_loss_price)
            .abs()
            .max(entry_price * self.risk_config.min_stop_distance_pct);
        let mut quantity = risk_amount / price_distance;

        let (current_total, current_symbol) = match &*self.exposure.read().await {
            Some(source) => (
                source.total_exposure().await,
                source.symbol_exposure(symbol).await,
            ),
            None => (0.0, 0.0),
        };

        // 5. Global leverage cap: scale down to the exact quantity that puts
        // total notional at the ceiling; zero if already at or past it.
        let max_total_notional = equity * self.risk_config.max_global_leverage;
        let headroom = max_total_notional - current_total;
        if headroom <= 0.0 {
            warn!(
                "🚨 Global leverage already at cap: exposure {:.2} / equity {:.2} >= {:.1}x",
                current_total, equity, self.risk_config.max_global_leverage
            );
            return 0.0;
        }
        let notional = quantity * entry_price;
        if notional > headroom {
            let scaled = headroom / entry_price;
            warn!(
                "Leverage cap scales quantity {:.4} -> {:.4} ({})",
                quantity, scaled, symbol
            );
            quantity = scaled;
        }

        // 6. Per-symbol exposure cap.
        let symbol_ratio = (current_symbol + quantity * entry_price) / equity;
        if symbol_ratio > self.risk_config.max_single_symbol_exposure {
            warn!(
                "Single-symbol exposure {:.1}% above limit {:.1}% ({})",
                symbol_ratio * 100.0,
                self.risk_config.max_single_symbol_exposure * 100.0,
                symbol
            );
            return 0.0;
        }

        // 7. Exchange precision: floor to lot size, then enforce minimums.
        if let Some(instrument) = self.instruments.read().await.get(symbol) {
            if instrument.lot_size > 0.0 {
                quantity = (quantity / instrument.lot_size).floor() * instrument.lot_size;
            }
            if quantity < instrument.min_order_size {
                debug!(
                    "Quantity {:.6} below min order size {} ({})",
                    quantity, instrument.min_order_size, symbol
                );
                return 0.0;
            }
            if quantity * entry_price < instrument.min_notional {
                debug!(
                    "Notional {:.2} below min notional {:.2} ({})",
                    quantity * entry_price,
                    instrument.min_notional,
                    symbol
                );
                return 0.0;
            }
        } else {
            debug!("No instrument registered for {}, skipping quantization", symbol);
        }

        debug!(
            "Safe quantity for {} [{}]: {:.6} (risk={:.2} USDT, distance={:.4})",
            symbol, strategy_id, quantity, risk_amount, price_distance
        );
        quantity
    }

    pub async fn reset(&self) {
        let mut ledger = self.ledger.write().await;
        ledger.strategies.clear();
        ledger.unallocated = self.total_capital;
        info!("Capital ledger reset");
    }
}

/// Bus hook: buy fills hand back the notional that was reserved for the
/// order; a closed position books its realized P&L into the owning bucket.
#[async_trait]
impl EventHandler for CapitalCommander {
    fn name(&self) -> &'static str {
        "capital_commander"
    }

    async fn handle(&self, event: &TradingEvent) -> anyhow::Result<()> {
        match event {
            TradingEvent::OrderFilled {
                side,
                filled_size,
                price,
                strategy_id,
                ..
            } => {
                if *side == OrderSide::Buy && *price > 0.0 && *filled_size > 0.0 {
                    self.release_capital(strategy_id, price * filled_size).await;
                }
            }
            TradingEvent::PositionClosed {
                strategy_id,
                realized_pnl,
                ..
            } => {
                self.record_profit(strategy_id, *realized_pnl).await;
            }
            _ => {}
        }
        Ok(())
    }
}
