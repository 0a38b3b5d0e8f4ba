use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use algotrade_core::*;

/// Configuration for the simulated broker.
#[derive(Debug, Clone)]
pub struct SimulatedBrokerConfig {
    /// Starting account balance.
    pub initial_balance: Decimal,
    pub currency: String,
    /// Retcode returned by close requests; set to a non-success code to
    /// exercise venue-refusal paths.
    pub close_retcode: u32,
}

impl Default for SimulatedBrokerConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(100000),
            currency: "USD".to_string(),
            close_retcode: RETCODE_DONE,
        }
    }
}

struct Inner {
    account: AccountInfo,
    symbols: HashMap<String, SymbolInfo>,
    ticks: HashMap<String, Tick>,
    positions: HashMap<u64, BrokerPosition>,
    next_ticket: u64,
    placed: Vec<OrderRequest>,
    mutating_calls: u64,
    fail_order: Option<String>,
    fail_account: bool,
    close_retcode: u32,
}

/// An in-memory broker for paper trading and tests.
///
/// Implements the full [`Broker`] contract against internal maps, fills
/// market orders at the submitted price, and exposes knobs for seeding
/// positions, injecting failures and auditing mutating calls.
pub struct SimulatedBroker {
    connected: AtomicBool,
    inner: Mutex<Inner>,
}

impl SimulatedBroker {
    pub fn new(config: SimulatedBrokerConfig) -> Self {
        let account = AccountInfo {
            balance: config.initial_balance,
            equity: config.initial_balance,
            profit: Decimal::ZERO,
            margin: Decimal::ZERO,
            free_margin: config.initial_balance,
            currency: config.currency,
            login: 10001,
            server: "Simulated".to_string(),
        };
        Self {
            connected: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                account,
                symbols: HashMap::new(),
                ticks: HashMap::new(),
                positions: HashMap::new(),
                next_ticket: 1000,
                placed: Vec::new(),
                mutating_calls: 0,
                fail_order: None,
                fail_account: false,
                close_retcode: config.close_retcode,
            }),
        }
    }

    /// Broker pre-seeded with a quoted EURUSD market.
    pub fn with_eurusd() -> Self {
        let broker = Self::new(SimulatedBrokerConfig::default());
        broker.add_symbol(SymbolInfo {
            name: "EURUSD".to_string(),
            min_lot: dec!(0.01),
            max_lot: dec!(100),
            lot_step: dec!(0.01),
            contract_size: dec!(100000),
            digits: 5,
        });
        broker.set_tick("EURUSD", dec!(1.1000), dec!(1.1002));
        broker
    }

    pub fn add_symbol(&self, info: SymbolInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.symbols.insert(info.name.clone(), info);
    }

    pub fn set_tick(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let mut inner = self.inner.lock().unwrap();
        inner.ticks.insert(
            symbol.to_string(),
            Tick {
                symbol: symbol.to_string(),
                bid,
                ask,
                time: Utc::now(),
                volume: Decimal::ZERO,
            },
        );
    }

    /// Insert or replace a broker-side position, as if opened externally.
    pub fn seed_position(&self, position: BrokerPosition) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_ticket = inner.next_ticket.max(position.ticket + 1);
        inner.positions.insert(position.ticket, position);
    }

    /// Drop a broker-side position without a close request, as if closed
    /// externally (stop-out, manual close in the terminal).
    pub fn remove_position(&self, ticket: u64) {
        self.inner.lock().unwrap().positions.remove(&ticket);
    }

    /// Set the account's floating profit (drives daily-loss metrics).
    pub fn set_profit(&self, profit: Decimal) {
        let mut inner = self.inner.lock().unwrap();
        inner.account.profit = profit;
        inner.account.equity = inner.account.balance + profit;
    }

    /// Make the next `place_order` fail with the given venue message.
    pub fn fail_next_order(&self, reason: &str) {
        self.inner.lock().unwrap().fail_order = Some(reason.to_string());
    }

    /// Make `account_info` fail until cleared.
    pub fn set_account_failure(&self, fail: bool) {
        self.inner.lock().unwrap().fail_account = fail;
    }

    /// Retcode returned by subsequent close requests.
    pub fn set_close_retcode(&self, retcode: u32) {
        self.inner.lock().unwrap().close_retcode = retcode;
    }

    /// Every order submitted so far.
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.inner.lock().unwrap().placed.clone()
    }

    /// Count of calls to mutating methods (place/close/modify).
    pub fn mutating_calls(&self) -> u64 {
        self.inner.lock().unwrap().mutating_calls
    }
}

#[async_trait]
impl Broker for SimulatedBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn account_info(&self) -> Result<AccountInfo, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let inner = self.inner.lock().unwrap();
        if inner.fail_account {
            return Err(BrokerError::Transport("simulated account failure".to_string()));
        }
        Ok(inner.account.clone())
    }

    async fn symbols(&self) -> Result<Vec<SymbolInfo>, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        Ok(self.inner.lock().unwrap().symbols.values().cloned().collect())
    }

    async fn symbol_tick(&self, symbol: &str) -> Result<Tick, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.inner
            .lock()
            .unwrap()
            .ticks
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::SymbolNotFound(symbol.to_string()))
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let mut list: Vec<BrokerPosition> =
            self.inner.lock().unwrap().positions.values().cloned().collect();
        list.sort_by_key(|p| p.ticket);
        Ok(list)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt, BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.mutating_calls += 1;
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        if let Some(reason) = inner.fail_order.take() {
            return Err(BrokerError::Rejected(reason));
        }
        if !inner.symbols.contains_key(&request.symbol) {
            return Err(BrokerError::SymbolNotFound(request.symbol.clone()));
        }
        let price = if request.price.is_zero() {
            let tick = inner
                .ticks
                .get(&request.symbol)
                .ok_or_else(|| BrokerError::Rejected("no market".to_string()))?;
            match request.side {
                Side::Buy => tick.ask,
                Side::Sell => tick.bid,
            }
        } else {
            request.price
        };

        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.positions.insert(
            ticket,
            BrokerPosition {
                ticket,
                symbol: request.symbol.clone(),
                side: request.side,
                volume: request.volume,
                open_price: price,
                current_price: price,
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                profit: Decimal::ZERO,
                swap: Decimal::ZERO,
                open_time: Utc::now(),
            },
        );
        inner.placed.push(request.clone());
        Ok(OrderReceipt {
            ticket,
            price,
            volume: request.volume,
        })
    }

    async fn close_position(
        &self,
        ticket: u64,
        volume: Option<Decimal>,
    ) -> Result<CloseResult, BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.mutating_calls += 1;
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let retcode = inner.close_retcode;
        if retcode != RETCODE_DONE {
            // Venue refusal: nothing changes broker-side either.
            return Ok(CloseResult {
                retcode,
                profit: Decimal::ZERO,
            });
        }
        let position = inner
            .positions
            .get(&ticket)
            .cloned()
            .ok_or_else(|| BrokerError::Rejected(format!("unknown ticket {ticket}")))?;
        let close_volume = volume.unwrap_or(position.volume).min(position.volume);
        let profit = if position.volume.is_zero() {
            Decimal::ZERO
        } else {
            position.profit * close_volume / position.volume
        };
        if close_volume >= position.volume {
            inner.positions.remove(&ticket);
        } else if let Some(p) = inner.positions.get_mut(&ticket) {
            p.volume -= close_volume;
            p.profit -= profit;
        }
        inner.account.balance += profit;
        inner.account.equity = inner.account.balance + inner.account.profit;
        Ok(CloseResult { retcode, profit })
    }

    async fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.mutating_calls += 1;
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let position = inner
            .positions
            .get_mut(&ticket)
            .ok_or_else(|| BrokerError::Rejected(format!("unknown ticket {ticket}")))?;
        if stop_loss.is_some() {
            position.stop_loss = stop_loss;
        }
        if take_profit.is_some() {
            position.take_profit = take_profit;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn market_order_fills_at_tick_side() {
        let broker = SimulatedBroker::with_eurusd();
        broker.connect().await.expect("connect");

        let request = OrderRequest {
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: dec!(0.10),
            price: Decimal::ZERO,
            stop_loss: None,
            take_profit: None,
            comment: "test".to_string(),
        };
        let receipt = broker.place_order(&request).await.expect("place");
        assert_eq!(receipt.price, dec!(1.1002));
        assert_eq!(receipt.volume, dec!(0.10));

        let positions = broker.positions().await.expect("positions");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticket, receipt.ticket);
    }

    #[tokio::test]
    async fn close_honours_configured_retcode() {
        let broker = SimulatedBroker::with_eurusd();
        broker.connect().await.expect("connect");
        broker.seed_position(BrokerPosition {
            ticket: 7,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: dec!(0.10),
            open_price: dec!(1.1000),
            current_price: dec!(1.1010),
            stop_loss: None,
            take_profit: None,
            profit: dec!(10),
            swap: Decimal::ZERO,
            open_time: Utc::now(),
        });

        broker.set_close_retcode(10013);
        let refused = broker.close_position(7, None).await.expect("reply");
        assert_eq!(refused.retcode, 10013);
        assert_eq!(broker.positions().await.expect("positions").len(), 1);

        broker.set_close_retcode(RETCODE_DONE);
        let done = broker.close_position(7, None).await.expect("reply");
        assert_eq!(done.retcode, RETCODE_DONE);
        assert_eq!(done.profit, dec!(10));
        assert!(broker.positions().await.expect("positions").is_empty());
    }

    #[tokio::test]
    async fn disconnected_calls_fail() {
        let broker = SimulatedBroker::with_eurusd();
        assert!(broker.account_info().await.is_err());
        assert!(broker.symbols().await.is_err());
        assert!(broker.close_position(1, None).await.is_err());
    }
}
