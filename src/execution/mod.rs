pub mod order_manager;
pub mod position_manager;

pub use order_manager::{Order, OrderManager, OrderSummary, StopLossOutcome};
pub use position_manager::{Position, PositionManager, PositionSide, PositionSummary, SyncPlan};
