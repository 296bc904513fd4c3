use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::api::{OrderSide, OrderStatus, OrderType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TradingEvent {
    OrderSubmitted {
        order_id: String,
        symbol: String,
        side: OrderSide,
        order_type: OrderType,
        size: f64,
        price: f64,
        strategy_id: String,
    },
    OrderFilled {
        order_id: String,
        symbol: String,
        side: OrderSide,
        filled_size: f64,
        price: f64,
        strategy_id: String,
        stop_loss_price: Option<f64>,
    },
    OrderCancelled {
        order_id: String,
        symbol: String,
    },
    OrderUpdate {
        order_id: String,
        symbol: String,
        side: OrderSide,
        order_type: OrderType,
        size: f64,
        price: f64,
        filled_size: f64,
        status: OrderStatus,
    },
    /// Exchange-reported position snapshot. `size` is signed: long positive,
    /// short negative, zero means flat.
    PositionUpdate {
        symbol: String,
        size: f64,
        entry_price: f64,
        unrealized_pnl: f64,
        leverage: u32,
    },
    /// A local position went to zero. Drives ghost-stop cancellation and
    /// realized-P&L booking.
    PositionClosed {
        symbol: String,
        strategy_id: String,
        realized_pnl: f64,
    },
    EmergencyStop {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OrderSubmitted,
    OrderFilled,
    OrderCancelled,
    OrderUpdate,
    PositionUpdate,
    PositionClosed,
    EmergencyStop,
    Shutdown,
}

impl TradingEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TradingEvent::OrderSubmitted { .. } => EventKind::OrderSubmitted,
            TradingEvent::OrderFilled { .. } => EventKind::OrderFilled,
            TradingEvent::OrderCancelled { .. } => EventKind::OrderCancelled,
            TradingEvent::OrderUpdate { .. } => EventKind::OrderUpdate,
            TradingEvent::PositionUpdate { .. } => EventKind::PositionUpdate,
            TradingEvent::PositionClosed { .. } => EventKind::PositionClosed,
            TradingEvent::EmergencyStop { .. } => EventKind::EmergencyStop,
            TradingEvent::Shutdown => EventKind::Shutdown,
        }
    }
}

/// A subscriber. Errors are isolated by the bus: logged and counted, never
/// propagated back to the publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &TradingEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct BusStats {
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusStatsSnapshot {
    pub published: u64,
    pub processed: u64,
    pub dropped: u64,
    pub errors: u64,
    pub handlers: usize,
}

type HandlerMap = HashMap<EventKind, Vec<Arc<dyn EventHandler>>>;

/// Typed pub/sub dispatcher decoupling producers (gateway, order manager)
/// from consumers (position manager, capital commander, strategies).
///
/// `publish` never blocks the caller: events go through a bounded queue and
/// a single dispatcher task, which also guarantees per-kind delivery order.
pub struct EventBus {
    tx: mpsc::Sender<TradingEvent>,
    rx: Mutex<Option<mpsc::Receiver<TradingEvent>>>,
    handlers: Arc<RwLock<HandlerMap>>,
    stats: Arc<BusStats>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(BusStats::default()),
            task: Mutex::new(None),
        }
    }

    pub async fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        tracing::debug!("Registering handler {} for {:?}", handler.name(), kind);
        self.handlers.write().await.entry(kind).or_default().push(handler);
    }

    /// Enqueue an event and return immediately. A full queue drops the event
    /// with an error log instead of stalling the publisher.
    pub fn publish(&self, event: TradingEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::error!("Event queue full, dropping {:?}", event.kind());
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::warn!("Event bus stopped, dropping {:?}", event.kind());
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub async fn start(&self) {
        let mut rx = match self.rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                tracing::warn!("Event bus already started");
                return;
            }
        };

        let handlers = self.handlers.clone();
        let stats = self.stats.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, TradingEvent::Shutdown) {
                    break;
                }
                Self::dispatch(&handlers, &stats, &event).await;
            }
            tracing::info!("Event dispatcher stopped");
        });

        *self.task.lock().await = Some(handle);
        tracing::info!("🚀 Event bus started");
    }

    /// Stop the bus. Events already queued are still delivered; the shutdown
    /// marker rides the same queue, so in-flight work finishes first.
    pub async fn stop(&self) {
        let handle = self.task.lock().await.take();
        let Some(handle) = handle else {
            return;
        };

        if self.tx.send(TradingEvent::Shutdown).await.is_err() {
            handle.abort();
            return;
        }

        if let Err(e) = handle.await {
            tracing::warn!("Event dispatcher join failed: {}", e);
        }
        tracing::info!("✅ Event bus stopped");
    }

    async fn dispatch(handlers: &RwLock<HandlerMap>, stats: &BusStats, event: &TradingEvent) {
        let targets: Vec<Arc<dyn EventHandler>> = {
            let map = handlers.read().await;
            match map.get(&event.kind()) {
                Some(list) => list.clone(),
                None => {
                    tracing::debug!("No handlers registered for {:?}", event.kind());
                    return;
                }
            }
        };

        for handler in targets {
            match handler.handle(event).await {
                Ok(()) => {
                    stats.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!(
                        "❌ Handler {} failed on {:?}: {:#}",
                        handler.name(),
                        event.kind(),
                        e
                    );
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub async fn stats(&self) -> BusStatsSnapshot {
        let handlers = self.handlers.read().await.values().map(Vec::len).sum();
        BusStatsSnapshot {
            published: self.stats.published.load(Ordering::Relaxed),
            processed: self.stats.processed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            handlers,
        }
    }
}
