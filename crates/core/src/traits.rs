use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::*;

/// Errors that can occur during broker operations. Callers treat every
/// variant, including `Timeout`, as fail-closed.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker not connected")]
    NotConnected,
    #[error("broker call timed out")]
    Timeout,
    #[error("unknown symbol: {0}")]
    SymbolNotFound(String),
    #[error("rejected by broker: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A broker adapter: the single external collaborator of the trading core.
///
/// Methods take `&self` because one handle is shared across the order,
/// position and risk managers; implementations use interior mutability.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connect to the broker.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Disconnect from the broker.
    async fn disconnect(&self);

    /// Check if connected.
    fn is_connected(&self) -> bool;

    /// Get the current account snapshot.
    async fn account_info(&self) -> Result<AccountInfo, BrokerError>;

    /// Get the tradeable symbol set.
    async fn symbols(&self) -> Result<Vec<SymbolInfo>, BrokerError>;

    /// Get the current quote for a symbol.
    async fn symbol_tick(&self, symbol: &str) -> Result<Tick, BrokerError>;

    /// Get all open positions as reported by the broker.
    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    /// Submit an order for execution.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt, BrokerError>;

    /// Close a position, fully (`volume: None`) or partially. The reply's
    /// retcode carries the venue's verdict and must be checked explicitly.
    async fn close_position(
        &self,
        ticket: u64,
        volume: Option<Decimal>,
    ) -> Result<CloseResult, BrokerError>;

    /// Modify a position's protective levels. `None` leaves a level unchanged.
    async fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), BrokerError>;
}
