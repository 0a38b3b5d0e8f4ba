use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use algotrade_core::{Broker, BusConfig, Event, EventBus, Order, Signal};
use algotrade_risk::{RiskDecision, RiskLimits, RiskManager};

use crate::config::EngineConfig;
use crate::enrich::SignalEnricher;
use crate::orders::{OrderError, OrderManager};
use crate::positions::PositionManager;

const SOURCE: &str = "engine";

/// Engine lifecycle. Stopped is terminal for the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine already stopped")]
    Terminated,
}

/// Why a submitted signal did not become an executed order.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("signal rejected by risk manager: {0}")]
    RiskRejected(String),
    #[error(transparent)]
    Order(#[from] OrderError),
}

/// Top-level orchestrator: owns the bus and the three managers, wires the
/// cross-component subscriptions, and runs the background loops.
pub struct TradingEngine {
    config: EngineConfig,
    bus: Arc<EventBus>,
    broker: Arc<dyn Broker>,
    risk: Arc<RiskManager>,
    orders: Arc<OrderManager>,
    positions: Arc<PositionManager>,
    enrichers: Vec<Arc<dyn SignalEnricher>>,
    state: Mutex<EngineState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Guards against concurrent connect attempts on the shared handle.
    connecting: Arc<AtomicBool>,
}

impl TradingEngine {
    pub fn new(broker: Arc<dyn Broker>, limits: RiskLimits, config: EngineConfig) -> Self {
        let bus = Arc::new(EventBus::new(BusConfig::default()));
        let risk = Arc::new(RiskManager::new(broker.clone(), limits));
        let orders = Arc::new(OrderManager::new(broker.clone(), bus.clone(), risk.clone()));
        let positions = Arc::new(PositionManager::new(
            broker.clone(),
            bus.clone(),
            config.close_success_retcode,
        ));
        Self {
            config,
            bus,
            broker,
            risk,
            orders,
            positions,
            enrichers: Vec::new(),
            state: Mutex::new(EngineState::Idle),
            tasks: Mutex::new(Vec::new()),
            connecting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Append a signal enricher. Enrichers run in registration order.
    pub fn with_enricher(mut self, enricher: Arc<dyn SignalEnricher>) -> Self {
        self.enrichers.push(enricher);
        self
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn risk(&self) -> Arc<RiskManager> {
        self.risk.clone()
    }

    pub fn orders(&self) -> Arc<OrderManager> {
        self.orders.clone()
    }

    pub fn positions(&self) -> Arc<PositionManager> {
        self.positions.clone()
    }

    /// Bring the engine up: bus, broker connection, background loops.
    ///
    /// A failed broker connection does not abort startup; the reconnect loop
    /// keeps retrying at a fixed interval for as long as the engine runs.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let state = self.state.lock().unwrap();
            match *state {
                EngineState::Running => {
                    warn!("engine already running");
                    return Ok(());
                }
                EngineState::Stopped => return Err(EngineError::Terminated),
                EngineState::Idle => {}
            }
        }

        self.bus.start().await;
        self.wire_subscriptions();

        match self.broker.connect().await {
            Ok(()) => info!("broker connected"),
            Err(err) => {
                warn!(%err, "initial broker connection failed; reconnect loop will retry")
            }
        }

        self.spawn_loops();
        *self.state.lock().unwrap() = EngineState::Running;
        self.bus.publish(Event::engine_started(SOURCE));
        info!("trading engine started");
        Ok(())
    }

    /// Tear the engine down. Idempotent, and safe after a partial start.
    ///
    /// The bus is stopped last so `system.engine_stopped` still reaches
    /// subscribers.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == EngineState::Stopped {
                debug!("engine already stopped");
                return;
            }
            *state = EngineState::Stopped;
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(%err, "background loop ended abnormally");
                }
            }
        }

        if self.config.close_positions_on_stop && self.broker.is_connected() {
            let report = self.positions.close_all_positions().await;
            info!(
                closed = report.closed.len(),
                failed = report.failed.len(),
                "positions flattened on shutdown"
            );
        }

        self.broker.disconnect().await;
        self.bus.publish(Event::engine_stopped(SOURCE));
        self.bus.stop().await;
        info!("trading engine stopped");
    }

    /// The signal pipeline: enrichment, risk evaluation, order construction,
    /// execution. Rejected signals are terminal; an approved signal produces
    /// exactly one order.
    pub async fn submit_signal(&self, signal: Signal) -> Result<Order, SignalError> {
        let signal = self.enrich_signal(signal);
        match self.risk.evaluate_signal(&signal).await {
            RiskDecision::Rejected(reason) => Err(SignalError::RiskRejected(reason)),
            RiskDecision::Approved => self.handle_approved_signal(signal).await,
        }
    }

    fn enrich_signal(&self, mut signal: Signal) -> Signal {
        for enricher in &self.enrichers {
            signal = enricher.enrich(signal);
        }
        signal
    }

    async fn handle_approved_signal(&self, signal: Signal) -> Result<Order, SignalError> {
        let order = Order::from_signal(&signal, self.config.default_volume);
        debug!(
            signal = %signal.id,
            order = %order.id,
            symbol = %order.symbol,
            "signal approved, executing order"
        );
        Ok(self.orders.execute_order(order).await?)
    }

    fn wire_subscriptions(&self) {
        // A fresh fill should show up locally before the next timer tick.
        let positions = self.positions.clone();
        self.bus.subscribe("order.placed", move |_event| {
            let positions = positions.clone();
            Box::pin(async move {
                positions.sync_positions().await?;
                Ok(())
            })
        });

        // Realized profit moves the daily-loss metric.
        let risk = self.risk.clone();
        self.bus.subscribe("position.closed", move |_event| {
            let risk = risk.clone();
            Box::pin(async move {
                risk.update_risk_metrics().await;
                Ok(())
            })
        });
    }

    fn spawn_loops(&self) {
        let mut tasks = self.tasks.lock().unwrap();

        let broker = self.broker.clone();
        let connecting = self.connecting.clone();
        let reconnect_secs = self.config.reconnect_interval_secs.max(1);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(reconnect_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if broker.is_connected() {
                    continue;
                }
                if connecting.swap(true, Ordering::SeqCst) {
                    continue;
                }
                match broker.connect().await {
                    Ok(()) => info!("broker reconnected"),
                    Err(err) => debug!(%err, "reconnect attempt failed"),
                }
                connecting.store(false, Ordering::SeqCst);
            }
        }));

        let positions = self.positions.clone();
        let broker = self.broker.clone();
        let sync_secs = self.config.position_sync_interval_secs.max(1);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(sync_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !broker.is_connected() {
                    // Reconciliation stays quiet until the link is back.
                    continue;
                }
                if let Err(err) = positions.sync_positions().await {
                    warn!(%err, "position sync tick skipped");
                }
            }
        }));

        let orders = self.orders.clone();
        let pending_secs = self.config.pending_check_interval_secs.max(1);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(pending_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                orders.check_pending_orders();
            }
        }));

        let risk = self.risk.clone();
        let metrics_secs = self.config.metrics_interval_secs.max(1);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(metrics_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                risk.update_risk_metrics().await;
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algotrade_brokers_common::SimulatedBroker;
    use algotrade_core::{OrderStatus, Side};
    use rust_decimal_macros::dec;

    fn engine_with(broker: Arc<SimulatedBroker>, limits: RiskLimits) -> TradingEngine {
        TradingEngine::new(broker, limits, EngineConfig::default())
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        let engine = engine_with(broker.clone(), RiskLimits::default());

        assert_eq!(engine.state(), EngineState::Idle);
        engine.start().await.expect("start");
        assert_eq!(engine.state(), EngineState::Running);
        assert!(broker.is_connected());

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn double_start_is_a_noop_and_double_stop_is_safe() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        let engine = engine_with(broker, RiskLimits::default());

        engine.start().await.expect("start");
        engine.start().await.expect("second start is a warning, not an error");

        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn start_after_stop_is_terminal() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        let engine = engine_with(broker, RiskLimits::default());

        engine.start().await.expect("start");
        engine.stop().await;
        assert!(matches!(engine.start().await, Err(EngineError::Terminated)));
    }

    #[tokio::test]
    async fn stop_without_start_is_safe() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        let engine = engine_with(broker, RiskLimits::default());
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn approved_signal_becomes_exactly_one_order() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        let engine = engine_with(broker.clone(), RiskLimits::default());
        engine.start().await.expect("start");

        let mut signal = Signal::new("EURUSD", Side::Buy, "scanner");
        signal.volume = Some(dec!(0.10));
        let order = engine.submit_signal(signal).await.expect("executed");

        assert_eq!(order.status, OrderStatus::Executed);
        assert!(order.ticket.is_some());
        assert_eq!(broker.placed_orders().len(), 1);
        assert_eq!(engine.orders().orders().len(), 1);

        engine.stop().await;
    }

    #[tokio::test]
    async fn rejected_signal_is_terminal() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        let limits = RiskLimits {
            max_positions: 0,
            ..RiskLimits::default()
        };
        let engine = engine_with(broker.clone(), limits);
        engine.start().await.expect("start");

        let signal = Signal::new("EURUSD", Side::Buy, "scanner");
        match engine.submit_signal(signal).await {
            Err(SignalError::RiskRejected(reason)) => {
                assert!(reason.contains("position limit"))
            }
            other => panic!("expected risk rejection, got {other:?}"),
        }
        assert_eq!(broker.placed_orders().len(), 0);
        assert!(engine.orders().orders().is_empty());

        engine.stop().await;
    }

    #[tokio::test]
    async fn enrichment_runs_before_risk_and_order_construction() {
        struct Tagger;
        impl SignalEnricher for Tagger {
            fn name(&self) -> &'static str {
                "tagger"
            }
            fn enrich(&self, mut signal: Signal) -> Signal {
                signal
                    .metadata
                    .insert("tagged".to_string(), serde_json::json!(true));
                signal
            }
        }

        let broker = Arc::new(SimulatedBroker::with_eurusd());
        let engine = engine_with(broker, RiskLimits::default()).with_enricher(Arc::new(Tagger));
        engine.start().await.expect("start");

        let mut signal = Signal::new("EURUSD", Side::Buy, "scanner");
        signal.volume = Some(dec!(0.10));
        let order = engine.submit_signal(signal).await.expect("executed");
        assert_eq!(order.metadata.get("tagged"), Some(&serde_json::json!(true)));

        engine.stop().await;
    }

    #[tokio::test]
    async fn missing_signal_volume_uses_configured_default() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        let engine = engine_with(broker, RiskLimits::default());
        engine.start().await.expect("start");

        let signal = Signal::new("EURUSD", Side::Sell, "scanner");
        let order = engine.submit_signal(signal).await.expect("executed");
        assert_eq!(order.fill_volume, Some(dec!(0.01)));

        engine.stop().await;
    }

    #[tokio::test]
    async fn close_positions_on_stop_flattens() {
        let broker = Arc::new(SimulatedBroker::with_eurusd());
        let config = EngineConfig {
            close_positions_on_stop: true,
            ..EngineConfig::default()
        };
        let engine = TradingEngine::new(broker.clone(), RiskLimits::default(), config);
        engine.start().await.expect("start");

        let mut signal = Signal::new("EURUSD", Side::Buy, "scanner");
        signal.volume = Some(dec!(0.10));
        engine.submit_signal(signal).await.expect("executed");
        engine.positions().sync_positions().await.expect("sync");
        assert_eq!(engine.positions().open_count(), 1);

        engine.stop().await;
        assert_eq!(engine.positions().open_count(), 0);
        assert!(broker.positions().await.is_err()); // disconnected after stop
    }
}
