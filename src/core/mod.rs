pub mod config;
pub mod error;
pub mod event_bus;
pub mod logging;

pub use config::{EngineConfig, RiskConfig};
pub use error::ExecutionError;
pub use event_bus::{BusStatsSnapshot, EventBus, EventHandler, EventKind, TradingEvent};
