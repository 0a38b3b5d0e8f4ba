use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use algotrade_core::{
    Broker, BrokerError, Event, EventBus, Order, OrderStatus, Side, SymbolInfo,
};
use algotrade_risk::{RiskDecision, RiskManager};

const SOURCE: &str = "order_manager";

/// Why an order did not execute.
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("broker not connected")]
    NotConnected,
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("volume {volume} outside [{min_lot}, {max_lot}] for {symbol}")]
    VolumeOutOfRange {
        symbol: String,
        volume: Decimal,
        min_lot: Decimal,
        max_lot: Decimal,
    },
    #[error("rejected by risk manager: {0}")]
    RiskRejected(String),
    #[error("market data unavailable: {0}")]
    MarketData(String),
    #[error("broker rejected order: {0}")]
    Venue(String),
}

/// Turns approved signals into broker orders and tracks their outcome.
///
/// Owns every [`Order`] it has seen, terminal states included, in an
/// in-memory map. Each `execute_order` call ends in exactly one lifecycle
/// event: `order.rejected`, `order.placed` or `order.failed`.
pub struct OrderManager {
    broker: Arc<dyn Broker>,
    bus: Arc<EventBus>,
    risk: Arc<RiskManager>,
    orders: Mutex<HashMap<Uuid, Order>>,
    symbols: Mutex<HashMap<String, SymbolInfo>>,
}

impl OrderManager {
    pub fn new(broker: Arc<dyn Broker>, bus: Arc<EventBus>, risk: Arc<RiskManager>) -> Self {
        Self {
            broker,
            bus,
            risk,
            orders: Mutex::new(HashMap::new()),
            symbols: Mutex::new(HashMap::new()),
        }
    }

    /// Validate, risk-gate and submit an order.
    ///
    /// Validation and risk failures reject locally without any broker
    /// mutating call; only a venue refusal of the actual submission is
    /// reported as `order.failed`.
    pub async fn execute_order(&self, mut order: Order) -> Result<Order, OrderError> {
        if !self.broker.is_connected() {
            return Err(self.reject(order, OrderError::NotConnected));
        }

        let info = match self.symbol_info(&order.symbol).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                let symbol = order.symbol.clone();
                return Err(self.reject(order, OrderError::UnknownSymbol(symbol)));
            }
            Err(err) => {
                return Err(self.reject(
                    order,
                    OrderError::MarketData(format!("symbol lookup failed: {err}")),
                ));
            }
        };
        if order.volume < info.min_lot || order.volume > info.max_lot {
            let err = OrderError::VolumeOutOfRange {
                symbol: order.symbol.clone(),
                volume: order.volume,
                min_lot: info.min_lot,
                max_lot: info.max_lot,
            };
            return Err(self.reject(order, err));
        }

        if let RiskDecision::Rejected(reason) = self.risk.check_order_risk(&order).await {
            return Err(self.reject(order, OrderError::RiskRejected(reason)));
        }

        let price = if order.price.is_zero() {
            match self.broker.symbol_tick(&order.symbol).await {
                Ok(tick) => match order.side {
                    Side::Buy => tick.ask,
                    Side::Sell => tick.bid,
                },
                Err(err) => {
                    let symbol = order.symbol.clone();
                    return Err(self.reject(
                        order,
                        OrderError::MarketData(format!("no tick for {symbol}: {err}")),
                    ));
                }
            }
        } else {
            order.price
        };

        let request = order.to_request(price);
        match self.broker.place_order(&request).await {
            Ok(receipt) => {
                order.status = OrderStatus::Executed;
                order.ticket = Some(receipt.ticket);
                order.fill_price = Some(receipt.price);
                order.fill_volume = Some(receipt.volume);
                order.updated_at = Utc::now();
                info!(
                    id = %order.id,
                    ticket = receipt.ticket,
                    symbol = %order.symbol,
                    volume = %receipt.volume,
                    price = %receipt.price,
                    "order executed"
                );
                self.bus.publish(Event::order_placed(order.clone(), SOURCE));
                self.orders.lock().unwrap().insert(order.id, order.clone());
                Ok(order)
            }
            Err(err) => Err(self.fail(order, err)),
        }
    }

    /// Extension point for limit/pending order types. Market orders never
    /// linger in Pending, so the baseline only reports the count.
    pub fn check_pending_orders(&self) -> usize {
        let pending = self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .count();
        if pending > 0 {
            debug!(pending, "orders awaiting broker confirmation");
        }
        pending
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.lock().unwrap().values().cloned().collect()
    }

    pub fn order(&self, id: Uuid) -> Option<Order> {
        self.orders.lock().unwrap().get(&id).cloned()
    }

    /// Local rejection: no venue-mutating call was made.
    fn reject(&self, mut order: Order, err: OrderError) -> OrderError {
        let reason = err.to_string();
        warn!(id = %order.id, symbol = %order.symbol, %reason, "order rejected");
        order.status = OrderStatus::Rejected;
        order.reject_reason = Some(reason.clone());
        order.updated_at = Utc::now();
        self.bus
            .publish(Event::order_rejected(order.clone(), reason, SOURCE));
        self.orders.lock().unwrap().insert(order.id, order);
        err
    }

    /// Venue refusal of a submitted order; the broker's detail passes through
    /// verbatim.
    fn fail(&self, mut order: Order, err: BrokerError) -> OrderError {
        let reason = err.to_string();
        warn!(id = %order.id, symbol = %order.symbol, %reason, "order failed at broker");
        order.status = OrderStatus::Rejected;
        order.reject_reason = Some(reason.clone());
        order.updated_at = Utc::now();
        self.bus
            .publish(Event::order_failed(order.clone(), reason.clone(), SOURCE));
        self.orders.lock().unwrap().insert(order.id, order);
        OrderError::Venue(reason)
    }

    async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>, BrokerError> {
        if let Some(info) = self.symbols.lock().unwrap().get(symbol) {
            return Ok(Some(info.clone()));
        }
        let list = self.broker.symbols().await?;
        let mut cache = self.symbols.lock().unwrap();
        for info in list {
            cache.insert(info.name.clone(), info);
        }
        Ok(cache.get(symbol).cloned())
    }
}
