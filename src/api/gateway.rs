use async_trait::async_trait;
use thiserror::Error;

use super::types::{ExchangePosition, InstrumentDetails, OrderAck, OrderRequest};

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("exchange rejected request: {0}")]
    Rejected(String),
}

/// The narrow surface the execution core needs from an exchange client.
///
/// Concrete implementations own transport, authentication and wire formats;
/// the core only ever calls these four operations. Tests inject doubles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool, GatewayError>;

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError>;

    async fn get_instrument_details(&self, symbol: &str)
        -> Result<InstrumentDetails, GatewayError>;
}
