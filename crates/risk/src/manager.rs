use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use algotrade_core::{Broker, Order, Signal};

use crate::config::RiskLimits;

/// Rolling view of account risk. Recomputed only by
/// [`RiskManager::update_risk_metrics`]; read-only everywhere else.
#[derive(Debug, Clone, Serialize)]
pub struct RiskState {
    /// Current daily loss as a fraction of balance (>= 0).
    pub daily_loss: Decimal,
    /// Current exposure as a fraction of balance.
    pub exposure: Decimal,
    pub open_positions: usize,
    pub updated_at: DateTime<Utc>,
}

impl Default for RiskState {
    fn default() -> Self {
        Self {
            daily_loss: Decimal::ZERO,
            exposure: Decimal::ZERO,
            open_positions: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Verdict of a risk check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskDecision {
    Approved,
    Rejected(String),
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approved)
    }
}

/// Gates signals and orders against the configured limits.
///
/// Connectivity is a precondition of every check, and any broker failure
/// while gathering inputs fails closed: the check rejects rather than
/// approving on missing data.
pub struct RiskManager {
    broker: Arc<dyn Broker>,
    limits: RiskLimits,
    state: RwLock<RiskState>,
}

impl RiskManager {
    pub fn new(broker: Arc<dyn Broker>, limits: RiskLimits) -> Self {
        Self {
            broker,
            limits,
            state: RwLock::new(RiskState::default()),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn snapshot(&self) -> RiskState {
        self.state.read().unwrap().clone()
    }

    /// Evaluate a signal against the three ordered limits: position count,
    /// daily loss, exposure. The first violated limit short-circuits.
    pub async fn evaluate_signal(&self, signal: &Signal) -> RiskDecision {
        if !self.broker.is_connected() {
            return self.reject(signal, "broker not connected".to_string());
        }
        let state = self.snapshot();
        if state.open_positions >= self.limits.max_positions {
            return self.reject(
                signal,
                format!(
                    "open position limit reached: {} of {}",
                    state.open_positions, self.limits.max_positions
                ),
            );
        }
        if state.daily_loss >= self.limits.max_daily_loss {
            return self.reject(
                signal,
                format!(
                    "daily loss {} at or above limit {}",
                    state.daily_loss, self.limits.max_daily_loss
                ),
            );
        }
        if state.exposure >= self.limits.max_exposure {
            return self.reject(
                signal,
                format!(
                    "exposure {} at or above limit {}",
                    state.exposure, self.limits.max_exposure
                ),
            );
        }
        RiskDecision::Approved
    }

    /// Coarse per-order check: the order's notional risk must stay under
    /// `balance * max_risk_per_trade`.
    pub async fn check_order_risk(&self, order: &Order) -> RiskDecision {
        if !self.broker.is_connected() {
            return RiskDecision::Rejected("broker not connected".to_string());
        }
        let account = match self.broker.account_info().await {
            Ok(account) => account,
            Err(err) => {
                return RiskDecision::Rejected(format!("account unavailable: {err}"));
            }
        };
        if account.balance <= Decimal::ZERO {
            return RiskDecision::Rejected("account balance unavailable".to_string());
        }
        let contract_size = match self.broker.symbols().await {
            Ok(list) => match list.into_iter().find(|s| s.name == order.symbol) {
                Some(info) => info.contract_size,
                None => {
                    return RiskDecision::Rejected(format!("unknown symbol {}", order.symbol));
                }
            },
            Err(err) => {
                return RiskDecision::Rejected(format!("symbols unavailable: {err}"));
            }
        };

        let risk_amount = order.volume * contract_size * self.limits.point_value;
        let allowed = account.balance * self.limits.max_risk_per_trade;
        if risk_amount > allowed {
            warn!(
                symbol = %order.symbol,
                volume = %order.volume,
                %risk_amount,
                %allowed,
                "order risk above per-trade limit"
            );
            RiskDecision::Rejected(format!(
                "order risk {risk_amount} exceeds per-trade limit {allowed}"
            ))
        } else {
            RiskDecision::Approved
        }
    }

    /// Recompute the risk state from a fresh broker snapshot. On any broker
    /// failure the previous state is kept whole; there is no partial update.
    pub async fn update_risk_metrics(&self) {
        if !self.broker.is_connected() {
            debug!("skipping risk metrics update while disconnected");
            return;
        }
        let account = match self.broker.account_info().await {
            Ok(account) => account,
            Err(err) => {
                warn!(%err, "risk metrics update skipped: account unavailable");
                return;
            }
        };
        if account.balance <= Decimal::ZERO {
            warn!(balance = %account.balance, "risk metrics update skipped: no balance");
            return;
        }
        let positions = match self.broker.positions().await {
            Ok(positions) => positions,
            Err(err) => {
                warn!(%err, "risk metrics update skipped: positions unavailable");
                return;
            }
        };

        let daily_loss = (-account.profit / account.balance).max(Decimal::ZERO);
        let notional: Decimal = positions
            .iter()
            .map(|p| p.volume * self.limits.notional_per_lot)
            .sum();
        let exposure = notional / account.balance;

        let mut state = self.state.write().unwrap();
        state.daily_loss = daily_loss;
        state.exposure = exposure;
        state.open_positions = positions.len();
        state.updated_at = Utc::now();
        debug!(
            %daily_loss,
            %exposure,
            open_positions = positions.len(),
            "risk metrics updated"
        );
    }

    fn reject(&self, signal: &Signal, reason: String) -> RiskDecision {
        warn!(
            symbol = %signal.symbol,
            source = %signal.source,
            %reason,
            "signal rejected"
        );
        RiskDecision::Rejected(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algotrade_brokers_common::SimulatedBroker;
    use algotrade_core::{BrokerPosition, Side};
    use rust_decimal_macros::dec;

    fn seeded_position(ticket: u64, volume: Decimal) -> BrokerPosition {
        BrokerPosition {
            ticket,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume,
            open_price: dec!(1.1000),
            current_price: dec!(1.1000),
            stop_loss: None,
            take_profit: None,
            profit: Decimal::ZERO,
            swap: Decimal::ZERO,
            open_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn disconnected_broker_rejects_signals() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        let risk = RiskManager::new(broker, RiskLimits::default());

        let signal = Signal::new("EURUSD", Side::Buy, "test");
        match risk.evaluate_signal(&signal).await {
            RiskDecision::Rejected(reason) => assert_eq!(reason, "broker not connected"),
            RiskDecision::Approved => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn position_count_limit_short_circuits() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        broker.connect().await.expect("connect");
        broker.seed_position(seeded_position(1, dec!(0.10)));

        let limits = RiskLimits {
            max_positions: 1,
            ..RiskLimits::default()
        };
        let risk = RiskManager::new(broker, limits);
        risk.update_risk_metrics().await;

        let signal = Signal::new("EURUSD", Side::Buy, "test");
        match risk.evaluate_signal(&signal).await {
            RiskDecision::Rejected(reason) => assert!(reason.contains("position limit")),
            RiskDecision::Approved => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn daily_loss_limit_rejects() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        broker.connect().await.expect("connect");
        broker.set_profit(dec!(-6000)); // 6% of the default 100k balance

        let risk = RiskManager::new(broker, RiskLimits::default());
        risk.update_risk_metrics().await;

        let signal = Signal::new("EURUSD", Side::Sell, "test");
        match risk.evaluate_signal(&signal).await {
            RiskDecision::Rejected(reason) => assert!(reason.contains("daily loss")),
            RiskDecision::Approved => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn exposure_limit_rejects() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        broker.connect().await.expect("connect");
        broker.seed_position(seeded_position(1, dec!(1)));

        // One lot contributes 10 / 100000 = 0.0001 exposure.
        let limits = RiskLimits {
            max_exposure: dec!(0.0001),
            ..RiskLimits::default()
        };
        let risk = RiskManager::new(broker, limits);
        risk.update_risk_metrics().await;

        let signal = Signal::new("EURUSD", Side::Buy, "test");
        match risk.evaluate_signal(&signal).await {
            RiskDecision::Rejected(reason) => assert!(reason.contains("exposure")),
            RiskDecision::Approved => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn order_risk_threshold() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        broker.connect().await.expect("connect");
        let risk = RiskManager::new(broker, RiskLimits::default());

        // 0.1 lots -> 0.1 * 100000 * 0.0001 = 1, well under 2000 allowed.
        let small = Order::market("EURUSD", Side::Buy, dec!(0.10), "test");
        assert!(risk.check_order_risk(&small).await.is_approved());

        // 300 lots -> 3000 > 2000.
        let large = Order::market("EURUSD", Side::Buy, dec!(300), "test");
        match risk.check_order_risk(&large).await {
            RiskDecision::Rejected(reason) => assert!(reason.contains("per-trade limit")),
            RiskDecision::Approved => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn broker_failure_fails_closed() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        broker.connect().await.expect("connect");
        broker.set_account_failure(true);

        let risk = RiskManager::new(broker.clone(), RiskLimits::default());
        let order = Order::market("EURUSD", Side::Buy, dec!(0.10), "test");
        match risk.check_order_risk(&order).await {
            RiskDecision::Rejected(reason) => assert!(reason.contains("account unavailable")),
            RiskDecision::Approved => panic!("expected rejection"),
        }

        // A failed metrics refresh keeps the previous state whole.
        let before = risk.snapshot();
        risk.update_risk_metrics().await;
        let after = risk.snapshot();
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[tokio::test]
    async fn clean_state_approves() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        broker.connect().await.expect("connect");

        let risk = RiskManager::new(broker, RiskLimits::default());
        risk.update_risk_metrics().await;

        let signal = Signal::new("EURUSD", Side::Buy, "test");
        assert!(risk.evaluate_signal(&signal).await.is_approved());
    }
}
