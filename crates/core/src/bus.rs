use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::events::{Event, EventPriority};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// How many emitted events to retain for introspection (FIFO eviction).
    pub history_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { history_limit: 500 }
    }
}

/// Heap entry: highest priority first, then emission order within a priority.
struct QueuedEvent {
    priority: EventPriority,
    seq: u64,
    event: Event,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct BusInner {
    subscribers: RwLock<HashMap<String, Vec<EventHandler>>>,
    queue: Mutex<BinaryHeap<QueuedEvent>>,
    history: Mutex<VecDeque<Event>>,
    history_limit: usize,
    seq: AtomicU64,
    notify: Notify,
    stopping: AtomicBool,
}

impl BusInner {
    async fn run(&self) {
        loop {
            let next = self.queue.lock().unwrap().pop();
            match next {
                Some(queued) => self.dispatch(queued.event).await,
                None => {
                    if self.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    self.notify.notified().await;
                }
            }
        }
        debug!("event bus dispatcher drained and stopped");
    }

    async fn dispatch(&self, event: Event) {
        let handlers = {
            let subs = self.subscribers.read().unwrap();
            subs.get(event.topic()).cloned().unwrap_or_default()
        };
        for (index, handler) in handlers.iter().enumerate() {
            // A failing handler must never reach the emitter or starve the
            // remaining subscribers of the same event.
            if let Err(err) = handler(event.clone()).await {
                error!(topic = event.topic(), handler = index, %err, "event handler failed");
            }
        }
    }
}

/// In-process publish/subscribe with priority scheduling and bounded history.
///
/// `publish` never blocks past enqueue; a dispatcher task drains the queue,
/// highest priority first, invoking each topic's handlers in registration
/// order.
pub struct EventBus {
    inner: Arc<BusInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                history: Mutex::new(VecDeque::new()),
                history_limit: config.history_limit,
                seq: AtomicU64::new(0),
                notify: Notify::new(),
                stopping: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Register a handler for a topic. Handlers live for the process lifetime;
    /// there is no unsubscribe.
    pub fn subscribe<F>(&self, topic: &str, handler: F)
    where
        F: Fn(Event) -> HandlerFuture + Send + Sync + 'static,
    {
        let mut subs = self.inner.subscribers.write().unwrap();
        subs.entry(topic.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Enqueue an event for dispatch and record it in the history.
    pub fn publish(&self, event: Event) {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        if self.inner.history_limit > 0 {
            let mut history = self.inner.history.lock().unwrap();
            if history.len() == self.inner.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        self.inner.queue.lock().unwrap().push(QueuedEvent {
            priority: event.priority,
            seq,
            event,
        });
        self.inner.notify.notify_one();
    }

    /// Spawn the dispatcher. Idempotent.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            warn!("event bus already running");
            return;
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
        let inner = self.inner.clone();
        *worker = Some(tokio::spawn(async move { inner.run().await }));
        debug!("event bus started");
    }

    /// Stop the dispatcher after draining pending events. In-flight handler
    /// invocations run to completion; nothing is aborted. Idempotent.
    pub async fn stop(&self) {
        let handle = self.worker.lock().unwrap().take();
        let Some(handle) = handle else {
            debug!("event bus not running");
            return;
        };
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
        if let Err(err) = handle.await {
            error!(%err, "event bus dispatcher ended abnormally");
        }
    }

    /// Retained events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.inner.history.lock().unwrap().iter().cloned().collect()
    }

    /// Events enqueued but not yet dispatched.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, Side};
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn order_event(priority: EventPriority) -> Event {
        let order = Order::market("EURUSD", Side::Buy, Decimal::ONE, "test");
        let mut event = Event::order_placed(order, "test");
        event.priority = priority;
        event
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn dispatches_by_priority() {
        let bus = EventBus::new(BusConfig::default());
        let seen: Arc<Mutex<Vec<EventPriority>>> = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        bus.subscribe("order.placed", move |event| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(event.priority);
                Ok(())
            })
        });

        // Enqueue before the dispatcher runs so priority decides the order.
        bus.publish(order_event(EventPriority::Low));
        bus.publish(order_event(EventPriority::Critical));
        bus.publish(order_event(EventPriority::Normal));
        bus.start().await;

        wait_for(|| seen.lock().unwrap().len() == 3).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                EventPriority::Critical,
                EventPriority::Normal,
                EventPriority::Low
            ]
        );
        bus.stop().await;
    }

    #[tokio::test]
    async fn same_priority_dispatches_in_publish_order() {
        let bus = EventBus::new(BusConfig::default());
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        bus.subscribe("order.placed", move |event| {
            let log = log.clone();
            Box::pin(async move {
                if let crate::events::EventPayload::Order(crate::events::OrderEvent::Placed(o)) =
                    event.payload
                {
                    log.lock().unwrap().push(o.source);
                }
                Ok(())
            })
        });

        for tag in ["first", "second", "third"] {
            let order = Order::market("EURUSD", Side::Buy, Decimal::ONE, tag);
            bus.publish(Event::order_placed(order, tag));
        }
        bus.start().await;

        wait_for(|| seen.lock().unwrap().len() == 3).await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
        bus.stop().await;
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_others() {
        let bus = EventBus::new(BusConfig::default());
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("order.placed", move |_| {
            Box::pin(async move { Err::<(), HandlerError>("boom".into()) })
        });
        let log = seen.clone();
        bus.subscribe("order.placed", move |_| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push("survivor");
                Ok(())
            })
        });

        bus.start().await;
        bus.publish(order_event(EventPriority::Normal));

        wait_for(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(*seen.lock().unwrap(), vec!["survivor"]);
        bus.stop().await;
    }

    #[tokio::test]
    async fn history_is_bounded_fifo() {
        let bus = EventBus::new(BusConfig { history_limit: 3 });
        for tag in ["a", "b", "c", "d"] {
            let order = Order::market("EURUSD", Side::Buy, Decimal::ONE, tag);
            bus.publish(Event::order_placed(order, tag));
        }
        let sources: Vec<String> = bus.history().into_iter().map(|e| e.source).collect();
        assert_eq!(sources, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn stop_drains_pending_events() {
        let bus = EventBus::new(BusConfig::default());
        let seen: Arc<Mutex<Vec<EventPriority>>> = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        bus.subscribe("order.placed", move |event| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(event.priority);
                Ok(())
            })
        });

        bus.start().await;
        for _ in 0..5 {
            bus.publish(order_event(EventPriority::Normal));
        }
        bus.stop().await;
        assert_eq!(seen.lock().unwrap().len(), 5);
        assert_eq!(bus.pending(), 0);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let bus = EventBus::new(BusConfig::default());
        bus.start().await;
        bus.start().await;
        bus.stop().await;
        bus.stop().await;
    }
}
