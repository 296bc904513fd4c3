pub mod gateway;
pub mod types;

pub use gateway::{ExchangeGateway, GatewayError};
pub use types::*;

#[cfg(test)]
pub use gateway::MockExchangeGateway;
