use thiserror::Error;

use crate::api::GatewayError;

/// Failure classes of the execution core.
///
/// The distinction matters for retry policy: `Rejected` is final and never
/// retried, `Gateway` is retried only inside the bounded hard-stop-loss
/// protocol, and `UnprotectedPosition` means the emergency close itself
/// failed and an operator has to step in.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order rejected: {reason}")]
    Rejected { reason: String },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("UNPROTECTED POSITION: {symbol} size {size} has no stop and could not be flattened")]
    UnprotectedPosition { symbol: String, size: f64 },

    #[error("unknown order: {order_id}")]
    OrderNotFound { order_id: String },
}

impl ExecutionError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// True for the conditions that page an operator rather than a strategy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnprotectedPosition { .. })
    }
}
