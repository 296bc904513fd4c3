use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ExchangeGateway, ExchangePosition, OrderSide};
use crate::core::event_bus::{EventBus, EventHandler, TradingEvent};
use crate::risk::capital_commander::ExposureSource;

/// Fills smaller than this are rounding residue, not a position.
const DUST_SIZE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64, // absolute
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64, // accumulated over partial reduces
    pub leverage: u32,
    pub strategy_id: String,
}

impl Position {
    /// Signed size: long positive, short negative.
    pub fn signed_size(&self) -> f64 {
        match self.side {
            PositionSide::Long => self.size,
            PositionSide::Short => -self.size,
        }
    }

    fn recompute_unrealized(&mut self) {
        self.unrealized_pnl = match self.side {
            PositionSide::Long => (self.current_price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - self.current_price) * self.size,
        };
    }
}

#[derive(Debug, Clone)]
struct TargetPosition {
    side: PositionSide,
    size: f64,
}

/// Corrective action produced when target and actual positions diverge.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub symbol: String,
    pub side: OrderSide,
    pub amount: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionSummary {
    pub total_unrealized_pnl: f64,
    pub position_count: usize,
    pub long_count: usize,
    pub short_count: usize,
}

/// Canonical, reconciled view of open positions.
///
/// Mutated from two sources only: exchange snapshots (ground truth) and
/// order fills (local pre-accounting). A position going to zero is removed
/// immediately and announced as `PositionClosed` so resting stops get
/// cancelled and realized P&L lands in the capital ledger.
pub struct PositionManager {
    event_bus: Arc<EventBus>,
    positions: RwLock<HashMap<String, Position>>,
    targets: RwLock<HashMap<String, TargetPosition>>,
    last_sync: RwLock<HashMap<String, Instant>>,
    sync_threshold: f64,
    sync_cooldown: Duration,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    sync_shutdown: Arc<Notify>,
}

impl PositionManager {
    pub fn new(event_bus: Arc<EventBus>, sync_threshold_pct: f64, sync_cooldown: Duration) -> Self {
        info!(
            "PositionManager initialized: sync_threshold={:.0}%, cooldown={:?}",
            sync_threshold_pct * 100.0,
            sync_cooldown
        );
        Self {
            event_bus,
            positions: RwLock::new(HashMap::new()),
            targets: RwLock::new(HashMap::new()),
            last_sync: RwLock::new(HashMap::new()),
            sync_threshold: sync_threshold_pct,
            sync_cooldown,
            sync_task: Mutex::new(None),
            sync_shutdown: Arc::new(Notify::new()),
        }
    }

    /// Apply an exchange-reported snapshot. A zero-size report removes the
    /// local entry instead of leaving a stale record behind.
    pub async fn update_from_exchange(&self, report: &ExchangePosition) {
        if report.size.abs() <= DUST_SIZE {
            let removed = self.positions.write().await.remove(&report.symbol);
            if let Some(position) = removed {
                info!(
                    "👻 Exchange reports {} flat, removing local {} {:.4}",
                    report.symbol, position.side, position.size
                );
                self.event_bus.publish(TradingEvent::PositionClosed {
                    symbol: position.symbol.clone(),
                    strategy_id: position.strategy_id.clone(),
                    realized_pnl: position.realized_pnl + position.unrealized_pnl,
                });
            }
            return;
        }

        let side = if report.size > 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        };

        let mut positions = self.positions.write().await;
        let strategy_id = positions
            .get(&report.symbol)
            .map(|p| p.strategy_id.clone())
            .unwrap_or_else(|| "default".to_string());
        let realized_pnl = positions
            .get(&report.symbol)
            .map(|p| p.realized_pnl)
            .unwrap_or(0.0);

        let mut position = Position {
            symbol: report.symbol.clone(),
            side,
            size: report.size.abs(),
            entry_price: report.entry_price,
            current_price: report.entry_price,
            unrealized_pnl: report.unrealized_pnl,
            realized_pnl,
            leverage: report.leverage,
            strategy_id,
        };
        if report.entry_price > 0.0 && report.unrealized_pnl == 0.0 {
            position.recompute_unrealized();
        }

        debug!(
            "Position synced: {} {} {:.4} @ {:.2}, PnL {:+.2}",
            position.symbol, position.side, position.size, position.entry_price, position.unrealized_pnl
        );
        positions.insert(report.symbol.clone(), position);
    }

    /// Apply a fill delta. Same-direction fills average the entry price;
    /// opposite-direction fills reduce size and realize P&L on the closed
    /// quantity. Removing the last contract announces `PositionClosed`.
    pub async fn update_from_order_fill(
        &self,
        symbol: &str,
        side: OrderSide,
        filled_size: f64,
        price: f64,
        strategy_id: &str,
    ) {
        if filled_size <= DUST_SIZE || price <= 0.0 {
            return;
        }

        let fill_side = match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };

        let mut positions = self.positions.write().await;
        let fully_closed = if let Some(position) = positions.get_mut(symbol) {
            if position.side == fill_side {
                // Same-direction add: size-weighted average entry.
                let total_value = position.size * position.entry_price + filled_size * price;
                position.size += filled_size;
                position.entry_price = total_value / position.size;
                position.current_price = price;
                position.recompute_unrealized();
                debug!(
                    "Position increased: {} {} {:.4} @ avg {:.2}",
                    symbol, position.side, position.size, position.entry_price
                );
                false
            } else {
                // Opposite direction: reduce, realizing P&L on the closed
                // quantity. Anything beyond the position size is dropped
                // rather than flipped.
                let closed_size = filled_size.min(position.size);
                if filled_size > position.size + DUST_SIZE {
                    warn!(
                        "Fill {:.4} over-closes {} position {:.4}, ignoring remainder",
                        filled_size, symbol, position.size
                    );
                }
                let realized = match position.side {
                    PositionSide::Long => (price - position.entry_price) * closed_size,
                    PositionSide::Short => (position.entry_price - price) * closed_size,
                };
                position.realized_pnl += realized;
                position.size -= closed_size;
                position.current_price = price;

                if position.size <= DUST_SIZE {
                    true
                } else {
                    position.recompute_unrealized();
                    debug!(
                        "Position reduced: {} {} {:.4} left, realized {:+.2} USDT",
                        symbol, position.side, position.size, realized
                    );
                    false
                }
            }
        } else {
            positions.insert(
                symbol.to_string(),
                Position {
                    symbol: symbol.to_string(),
                    side: fill_side,
                    size: filled_size,
                    entry_price: price,
                    current_price: price,
                    unrealized_pnl: 0.0,
                    realized_pnl: 0.0,
                    leverage: 1,
                    strategy_id: strategy_id.to_string(),
                },
            );
            info!(
                "📌 Position opened: {} {} {:.4} @ {:.2}",
                symbol, fill_side, filled_size, price
            );
            false
        };

        let closed = if fully_closed {
            positions.remove(symbol)
        } else {
            None
        };
        drop(positions);

        if let Some(position) = closed {
            info!(
                "💰 Position closed: {} realized {:+.2} USDT [{}]",
                position.symbol, position.realized_pnl, position.strategy_id
            );
            self.event_bus.publish(TradingEvent::PositionClosed {
                symbol: position.symbol.clone(),
                strategy_id: position.strategy_id.clone(),
                realized_pnl: position.realized_pnl,
            });
        }
    }

    /// Refresh the mark price and the unrealized P&L derived from it.
    pub async fn update_current_price(&self, symbol: &str, price: f64) {
        if price <= 0.0 {
            return;
        }
        if let Some(position) = self.positions.write().await.get_mut(symbol) {
            position.current_price = price;
            position.recompute_unrealized();
        }
    }

    pub async fn get_position(&self, symbol: &str) -> Option<Position> {
        self.positions.read().await.get(symbol).cloned()
    }

    pub async fn get_all_positions(&self) -> Vec<Position> {
        self.positions.read().await.values().cloned().collect()
    }

    pub async fn get_total_exposure(&self) -> f64 {
        self.positions
            .read()
            .await
            .values()
            .map(|p| p.size * p.current_price)
            .sum()
    }

    pub async fn get_symbol_exposure(&self, symbol: &str) -> f64 {
        self.positions
            .read()
            .await
            .get(symbol)
            .map(|p| p.size * p.current_price)
            .unwrap_or(0.0)
    }

    pub async fn summary(&self) -> PositionSummary {
        let positions = self.positions.read().await;
        PositionSummary {
            total_unrealized_pnl: positions.values().map(|p| p.unrealized_pnl).sum(),
            position_count: positions.len(),
            long_count: positions
                .values()
                .filter(|p| p.side == PositionSide::Long)
                .count(),
            short_count: positions
                .values()
                .filter(|p| p.side == PositionSide::Short)
                .count(),
        }
    }

    /// Record the position a strategy wants to hold; `check_sync_needed`
    /// compares it against the actual book.
    pub async fn update_target_position(&self, symbol: &str, side: PositionSide, size: f64) {
        debug!("Target position: {} {} {:.4}", symbol, side, size);
        self.targets
            .write()
            .await
            .insert(symbol.to_string(), TargetPosition { side, size });
    }

    /// Compare target vs actual and emit a corrective plan when divergence
    /// exceeds the threshold. A per-symbol cooldown suppresses repeated
    /// plans so a burst of checks cannot trigger a sync storm.
    pub async fn check_sync_needed(&self, symbol: &str) -> Option<SyncPlan> {
        let target = {
            let targets = self.targets.read().await;
            targets.get(symbol).cloned()?
        };
        if target.size <= 0.0 {
            return None;
        }

        {
            let last_sync = self.last_sync.read().await;
            if let Some(last) = last_sync.get(symbol) {
                if last.elapsed() < self.sync_cooldown {
                    return None;
                }
            }
        }

        let actual_signed = self
            .positions
            .read()
            .await
            .get(symbol)
            .map(|p| p.signed_size())
            .unwrap_or(0.0);
        let target_signed = match target.side {
            PositionSide::Long => target.size,
            PositionSide::Short => -target.size,
        };

        let delta = target_signed - actual_signed;
        let diff_pct = delta.abs() / target_signed.abs();
        if diff_pct <= self.sync_threshold {
            return None;
        }

        self.last_sync
            .write()
            .await
            .insert(symbol.to_string(), Instant::now());

        let plan = SyncPlan {
            symbol: symbol.to_string(),
            side: if delta > 0.0 {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
            amount: delta.abs(),
            reason: format!(
                "position divergence: target {:.4} vs actual {:.4} ({:.1}%)",
                target_signed,
                actual_signed,
                diff_pct * 100.0
            ),
        };
        info!("🔄 Sync needed: {:?}", plan);
        Some(plan)
    }

    /// Replace local state with exchange truth. Symbols the exchange does
    /// not report are flat: their local entries are ghosts and get removed.
    pub async fn reconcile_with_exchange(&self, reports: Vec<ExchangePosition>) {
        let reported: HashSet<String> = reports.iter().map(|r| r.symbol.clone()).collect();

        for report in &reports {
            self.update_from_exchange(report).await;
        }

        let stale: Vec<String> = {
            let positions = self.positions.read().await;
            positions
                .keys()
                .filter(|symbol| !reported.contains(*symbol))
                .cloned()
                .collect()
        };
        for symbol in stale {
            let ghost = ExchangePosition {
                symbol,
                size: 0.0,
                entry_price: 0.0,
                unrealized_pnl: 0.0,
                leverage: 1,
            };
            self.update_from_exchange(&ghost).await;
        }
    }

    /// Periodically pull ground truth from the exchange. Consecutive
    /// failures back off exponentially up to a cap instead of hammering a
    /// dead API, and the schedule resets as soon as a pull succeeds.
    pub async fn start_scheduled_sync(
        self: &Arc<Self>,
        gateway: Arc<dyn ExchangeGateway>,
        interval: Duration,
        backoff_base: Duration,
        backoff_max: Duration,
    ) {
        let mut task_slot = self.sync_task.lock().await;
        if task_slot.is_some() {
            warn!("Scheduled position sync already running");
            return;
        }

        let manager = self.clone();
        let shutdown = self.sync_shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                let delay = if failures == 0 {
                    interval
                } else {
                    sync_backoff(backoff_base, backoff_max, failures)
                };

                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                match gateway.get_positions().await {
                    Ok(reports) => {
                        if failures > 0 {
                            info!("✅ Position sync recovered after {} failures", failures);
                        }
                        failures = 0;
                        manager.reconcile_with_exchange(reports).await;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "Position sync failed ({} consecutive): {}, next attempt in {:?}",
                            failures,
                            e,
                            sync_backoff(backoff_base, backoff_max, failures)
                        );
                    }
                }
            }
            info!("Scheduled position sync stopped");
        });

        *task_slot = Some(handle);
        info!("🔄 Scheduled position sync started, interval {:?}", interval);
    }

    pub async fn stop_scheduled_sync(&self) {
        let handle = self.sync_task.lock().await.take();
        if let Some(handle) = handle {
            self.sync_shutdown.notify_one();
            if let Err(e) = handle.await {
                warn!("Sync task join failed: {}", e);
            }
        }
    }

    pub async fn reset(&self) {
        self.positions.write().await.clear();
        self.targets.write().await.clear();
        self.last_sync.write().await.clear();
        info!("Position manager reset");
    }
}

/// Backoff schedule for the sync loop: base, 2x, 4x, ... capped.
fn sync_backoff(base: Duration, cap: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(5);
    (base * 2u32.pow(exp)).min(cap)
}

#[async_trait]
impl ExposureSource for PositionManager {
    async fn total_exposure(&self) -> f64 {
        self.get_total_exposure().await
    }

    async fn symbol_exposure(&self, symbol: &str) -> f64 {
        self.get_symbol_exposure(symbol).await
    }
}

#[async_trait]
impl EventHandler for PositionManager {
    fn name(&self) -> &'static str {
        "position_manager"
    }

    async fn handle(&self, event: &TradingEvent) -> anyhow::Result<()> {
        match event {
            TradingEvent::PositionUpdate {
                symbol,
                size,
                entry_price,
                unrealized_pnl,
                leverage,
            } => {
                self.update_from_exchange(&ExchangePosition {
                    symbol: symbol.clone(),
                    size: *size,
                    entry_price: *entry_price,
                    unrealized_pnl: *unrealized_pnl,
                    leverage: *leverage,
                })
                .await;
            }
            TradingEvent::OrderFilled {
                symbol,
                side,
                filled_size,
                price,
                strategy_id,
                ..
            } => {
                self.update_from_order_fill(symbol, *side, *filled_size, *price, strategy_id)
                    .await;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GatewayError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager() -> Arc<PositionManager> {
        let bus = Arc::new(EventBus::new(256));
        Arc::new(PositionManager::new(
            bus,
            0.10,
            Duration::from_secs(60),
        ))
    }

    fn snapshot(symbol: &str, size: f64, entry: f64) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            size,
            entry_price: entry,
            unrealized_pnl: 0.0,
            leverage: 3,
        }
    }

    #[tokio::test]
    async fn zero_size_report_removes_the_entry() {
        let pm = manager();
        pm.update_from_exchange(&snapshot("BTC-USDT-SWAP", 1.0, 50_000.0))
            .await;
        assert!(pm.get_position("BTC-USDT-SWAP").await.is_some());

        pm.update_from_exchange(&snapshot("BTC-USDT-SWAP", 0.0, 0.0))
            .await;
        assert!(pm.get_position("BTC-USDT-SWAP").await.is_none());
    }

    #[tokio::test]
    async fn negative_size_maps_to_short() {
        let pm = manager();
        pm.update_from_exchange(&snapshot("ETH-USDT-SWAP", -2.0, 3_000.0))
            .await;

        let position = pm.get_position("ETH-USDT-SWAP").await.unwrap();
        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.size, 2.0);
        assert_eq!(position.signed_size(), -2.0);
    }

    #[tokio::test]
    async fn same_direction_add_averages_entry_price() {
        let pm = manager();
        pm.update_from_order_fill("BTC-USDT-SWAP", OrderSide::Buy, 1.0, 50_000.0, "vulture")
            .await;
        pm.update_from_order_fill("BTC-USDT-SWAP", OrderSide::Buy, 1.0, 52_000.0, "vulture")
            .await;

        let position = pm.get_position("BTC-USDT-SWAP").await.unwrap();
        assert_eq!(position.size, 2.0);
        assert!((position.entry_price - 51_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn partial_reduce_realizes_proportional_pnl() {
        let pm = manager();
        pm.update_from_order_fill("BTC-USDT-SWAP", OrderSide::Buy, 2.0, 50_000.0, "vulture")
            .await;
        pm.update_from_order_fill("BTC-USDT-SWAP", OrderSide::Sell, 1.0, 51_000.0, "vulture")
            .await;

        let position = pm.get_position("BTC-USDT-SWAP").await.unwrap();
        assert_eq!(position.size, 1.0);
        assert!((position.realized_pnl - 1_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn full_close_removes_entry_and_reports_realized_pnl() {
        let bus = Arc::new(EventBus::new(256));
        let pm = Arc::new(PositionManager::new(
            bus.clone(),
            0.10,
            Duration::from_secs(60),
        ));

        pm.update_from_order_fill("BTC-USDT-SWAP", OrderSide::Buy, 1.0, 50_000.0, "vulture")
            .await;
        pm.update_from_order_fill("BTC-USDT-SWAP", OrderSide::Sell, 1.0, 49_000.0, "vulture")
            .await;

        assert!(pm.get_position("BTC-USDT-SWAP").await.is_none());
        // The close is announced on the bus with the realized loss.
        assert_eq!(bus.stats().await.published, 1);
    }

    #[tokio::test]
    async fn short_positions_realize_inverted_pnl() {
        let pm = manager();
        pm.update_from_order_fill("ETH-USDT-SWAP", OrderSide::Sell, 2.0, 3_000.0, "sniper")
            .await;
        pm.update_from_order_fill("ETH-USDT-SWAP", OrderSide::Buy, 2.0, 2_900.0, "sniper")
            .await;

        assert!(pm.get_position("ETH-USDT-SWAP").await.is_none());
    }

    #[tokio::test]
    async fn over_closing_fill_drops_the_remainder() {
        let pm = manager();
        pm.update_from_order_fill("BTC-USDT-SWAP", OrderSide::Buy, 1.0, 50_000.0, "vulture")
            .await;
        pm.update_from_order_fill("BTC-USDT-SWAP", OrderSide::Sell, 1.5, 51_000.0, "vulture")
            .await;

        // No flip into a short.
        assert!(pm.get_position("BTC-USDT-SWAP").await.is_none());
    }

    #[tokio::test]
    async fn price_update_recomputes_unrealized_pnl() {
        let pm = manager();
        pm.update_from_order_fill("BTC-USDT-SWAP", OrderSide::Buy, 2.0, 50_000.0, "vulture")
            .await;
        pm.update_current_price("BTC-USDT-SWAP", 51_000.0).await;

        let position = pm.get_position("BTC-USDT-SWAP").await.unwrap();
        assert!((position.unrealized_pnl - 2_000.0).abs() < 1e-9);

        pm.update_from_order_fill("ETH-USDT-SWAP", OrderSide::Sell, 1.0, 3_000.0, "sniper")
            .await;
        pm.update_current_price("ETH-USDT-SWAP", 3_100.0).await;
        let position = pm.get_position("ETH-USDT-SWAP").await.unwrap();
        assert!((position.unrealized_pnl + 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn exposure_is_absolute_size_times_price() {
        let pm = manager();
        pm.update_from_order_fill("BTC-USDT-SWAP", OrderSide::Buy, 0.5, 50_000.0, "vulture")
            .await;
        pm.update_from_order_fill("ETH-USDT-SWAP", OrderSide::Sell, 2.0, 3_000.0, "sniper")
            .await;

        assert!((pm.get_total_exposure().await - 31_000.0).abs() < 1e-6);
        assert!((pm.get_symbol_exposure("ETH-USDT-SWAP").await - 6_000.0).abs() < 1e-6);
        assert_eq!(pm.get_symbol_exposure("SOL-USDT-SWAP").await, 0.0);
    }

    #[tokio::test]
    async fn sync_plan_fires_once_within_cooldown() {
        let pm = manager();
        pm.update_target_position("BTC-USDT-SWAP", PositionSide::Long, 1.0)
            .await;
        pm.update_from_exchange(&snapshot("BTC-USDT-SWAP", 0.5, 50_000.0))
            .await;

        let plan = pm.check_sync_needed("BTC-USDT-SWAP").await.unwrap();
        assert_eq!(plan.side, OrderSide::Buy);
        assert!((plan.amount - 0.5).abs() < 1e-9);

        // Unchanged state within the cooldown: no second plan.
        assert!(pm.check_sync_needed("BTC-USDT-SWAP").await.is_none());
    }

    #[tokio::test]
    async fn divergence_below_threshold_is_left_alone() {
        let pm = manager();
        pm.update_target_position("BTC-USDT-SWAP", PositionSide::Long, 1.0)
            .await;
        pm.update_from_exchange(&snapshot("BTC-USDT-SWAP", 0.95, 50_000.0))
            .await;

        assert!(pm.check_sync_needed("BTC-USDT-SWAP").await.is_none());
    }

    #[tokio::test]
    async fn missing_local_position_counts_as_flat() {
        let pm = manager();
        pm.update_target_position("ETH-USDT-SWAP", PositionSide::Short, 2.0)
            .await;

        let plan = pm.check_sync_needed("ETH-USDT-SWAP").await.unwrap();
        assert_eq!(plan.side, OrderSide::Sell);
        assert!((plan.amount - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reconcile_removes_unreported_symbols() {
        let pm = manager();
        pm.update_from_exchange(&snapshot("BTC-USDT-SWAP", 1.0, 50_000.0))
            .await;
        pm.update_from_exchange(&snapshot("ETH-USDT-SWAP", 2.0, 3_000.0))
            .await;

        pm.reconcile_with_exchange(vec![snapshot("BTC-USDT-SWAP", 1.0, 50_000.0)])
            .await;

        assert!(pm.get_position("BTC-USDT-SWAP").await.is_some());
        assert!(pm.get_position("ETH-USDT-SWAP").await.is_none());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);

        let first = sync_backoff(base, cap, 1);
        let second = sync_backoff(base, cap, 2);
        let third = sync_backoff(base, cap, 3);
        assert_eq!(first, Duration::from_secs(1));
        assert_eq!(second, Duration::from_secs(2));
        assert_eq!(third, Duration::from_secs(4));
        assert!(first < second && second < third);

        // Far beyond the exponent cap, the wait is pinned to the ceiling.
        assert_eq!(sync_backoff(base, cap, 50), Duration::from_secs(32));
        assert_eq!(
            sync_backoff(Duration::from_secs(10), cap, 50),
            Duration::from_secs(60)
        );
    }

    struct FlakyGateway {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ExchangeGateway for FlakyGateway {
        async fn place_order(
            &self,
            _request: &crate::api::OrderRequest,
        ) -> Result<crate::api::OrderAck, GatewayError> {
            Err(GatewayError::Transport("not used".to_string()))
        }

        async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<bool, GatewayError> {
            Err(GatewayError::Transport("not used".to_string()))
        }

        async fn get_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(GatewayError::Transport("connection reset".to_string()))
            } else {
                Ok(vec![])
            }
        }

        async fn get_instrument_details(
            &self,
            _symbol: &str,
        ) -> Result<crate::api::InstrumentDetails, GatewayError> {
            Err(GatewayError::Transport("not used".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_sync_backs_off_then_recovers() {
        let pm = manager();
        pm.update_from_exchange(&snapshot("BTC-USDT-SWAP", 1.0, 50_000.0))
            .await;

        let gateway = Arc::new(FlakyGateway {
            calls: AtomicU32::new(0),
        });
        pm.start_scheduled_sync(
            gateway.clone(),
            Duration::from_secs(30),
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .await;

        // interval 30s -> fail, +1s -> fail, +2s -> success (empty book).
        tokio::time::sleep(Duration::from_secs(34)).await;
        pm.stop_scheduled_sync().await;

        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
        assert!(pm.get_position("BTC-USDT-SWAP").await.is_none());
    }
}
