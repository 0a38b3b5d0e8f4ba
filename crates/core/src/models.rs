use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broker return code for "request completed". Brokers map their own success
/// code onto this; the engine compares against a configured value rather than
/// this constant directly.
pub const RETCODE_DONE: u32 = 10009;

// ---------------------------------------------------------------------------
// Sides & statuses
// ---------------------------------------------------------------------------

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// The lifecycle state of an order. Executed, Rejected and Cancelled are
/// terminal; an order never returns to Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Executed,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Executed | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }
}

/// The lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Partial,
    Closed,
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A trading signal produced by a strategy module. Transient: consumed by the
/// risk gate and either promoted to an [`Order`] or discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub volume: Option<Decimal>,
    pub price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Originating module tag.
    pub source: String,
    pub confidence: Decimal,
    /// Enrichment target; attached fields travel onto the resulting order.
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(symbol: &str, side: Side, source: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            volume: None,
            price: None,
            stop_loss: None,
            take_profit: None,
            source: source.to_string(),
            confidence: Decimal::ONE,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// An order on its way to (or back from) the broker. Owned exclusively by the
/// order manager for its entire lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    /// Broker-assigned ticket, set on fill.
    pub ticket: Option<u64>,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    /// Requested price; `Decimal::ZERO` means market execution.
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub status: OrderStatus,
    /// Originating module tag.
    pub source: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub fill_price: Option<Decimal>,
    pub fill_volume: Option<Decimal>,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a new market order.
    pub fn market(symbol: &str, side: Side, volume: Decimal, source: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ticket: None,
            symbol: symbol.to_string(),
            side,
            volume,
            price: Decimal::ZERO,
            stop_loss: None,
            take_profit: None,
            status: OrderStatus::Pending,
            source: source.to_string(),
            metadata: HashMap::new(),
            fill_price: None,
            fill_volume: None,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Promote an approved signal into an order. Missing volume falls back to
    /// the supplied default; missing price means market execution.
    pub fn from_signal(signal: &Signal, fallback_volume: Decimal) -> Self {
        let mut order = Self::market(
            &signal.symbol,
            signal.side,
            signal.volume.unwrap_or(fallback_volume),
            &signal.source,
        );
        order.price = signal.price.unwrap_or(Decimal::ZERO);
        order.stop_loss = signal.stop_loss;
        order.take_profit = signal.take_profit;
        order.metadata = signal.metadata.clone();
        order
    }

    /// Build the broker submission for this order at the resolved price.
    pub fn to_request(&self, price: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: self.symbol.clone(),
            side: self.side,
            volume: self.volume,
            price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            comment: self.source.clone(),
        }
    }
}

/// The parameters submitted to the broker for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub comment: String,
}

/// Successful order placement: the broker's ticket and actual fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub ticket: u64,
    pub price: Decimal,
    pub volume: Decimal,
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// A position as reported by the broker. DTO only; the position manager owns
/// the local [`Position`] records built from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub current_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub profit: Decimal,
    pub swap: Decimal,
    pub open_time: DateTime<Utc>,
}

/// A locally tracked position, keyed by broker ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub current_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub profit: Decimal,
    pub swap: Decimal,
    pub commission: Decimal,
    pub status: PositionStatus,
    /// Owning module/strategy tag; "external" when first observed during
    /// reconciliation rather than placed by this process.
    pub source: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Create a local record for a ticket first observed at the broker.
    pub fn from_broker(snapshot: &BrokerPosition) -> Self {
        Self {
            ticket: snapshot.ticket,
            symbol: snapshot.symbol.clone(),
            side: snapshot.side,
            volume: snapshot.volume,
            open_price: snapshot.open_price,
            current_price: snapshot.current_price,
            stop_loss: snapshot.stop_loss,
            take_profit: snapshot.take_profit,
            profit: snapshot.profit,
            swap: snapshot.swap,
            commission: Decimal::ZERO,
            status: PositionStatus::Open,
            source: "external".to_string(),
            opened_at: snapshot.open_time,
            closed_at: None,
        }
    }

    /// Overwrite the broker-mutable fields from a fresh snapshot.
    pub fn apply(&mut self, snapshot: &BrokerPosition) {
        self.volume = snapshot.volume;
        self.current_price = snapshot.current_price;
        self.stop_loss = snapshot.stop_loss;
        self.take_profit = snapshot.take_profit;
        self.profit = snapshot.profit;
        self.swap = snapshot.swap;
    }
}

// ---------------------------------------------------------------------------
// Broker reference data
// ---------------------------------------------------------------------------

/// Snapshot of the trading account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: Decimal,
    pub equity: Decimal,
    pub profit: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    pub currency: String,
    pub login: u64,
    pub server: String,
}

/// A tradeable symbol and its volume constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    pub min_lot: Decimal,
    pub max_lot: Decimal,
    pub lot_step: Decimal,
    pub contract_size: Decimal,
    pub digits: u32,
}

/// A bid/ask quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub time: DateTime<Utc>,
    pub volume: Decimal,
}

/// Broker acknowledgement of a close request. The retcode must be compared
/// against the configured success code, not just truthiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseResult {
    pub retcode: u32,
    pub profit: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_from_signal_falls_back_to_default_volume() {
        let mut signal = Signal::new("EURUSD", Side::Buy, "scanner");
        signal.stop_loss = Some(dec!(1.0950));
        signal
            .metadata
            .insert("session".to_string(), serde_json::json!("london"));

        let order = Order::from_signal(&signal, dec!(0.01));
        assert_eq!(order.volume, dec!(0.01));
        assert_eq!(order.price, Decimal::ZERO);
        assert_eq!(order.stop_loss, Some(dec!(1.0950)));
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.source, "scanner");
        assert!(order.metadata.contains_key("session"));
    }

    #[test]
    fn order_from_signal_prefers_signal_volume() {
        let mut signal = Signal::new("EURUSD", Side::Sell, "scanner");
        signal.volume = Some(dec!(0.25));
        signal.price = Some(dec!(1.1010));

        let order = Order::from_signal(&signal, dec!(0.01));
        assert_eq!(order.volume, dec!(0.25));
        assert_eq!(order.price, dec!(1.1010));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(OrderStatus::Executed.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
    }
}
