use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Order, Position};

/// Scheduling priority on the event bus. Higher priorities are dispatched
/// before lower ones when both are pending; ordering within a topic's
/// handlers is unaffected.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Order lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderEvent {
    Placed(Order),
    Rejected { order: Order, reason: String },
    Failed { order: Order, reason: String },
}

/// Position lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PositionEvent {
    Opened(Position),
    Closed(Position),
}

/// Engine lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemEvent {
    EngineStarted,
    EngineStopped,
}

/// Typed payload that flows over the bus; one variant per topic family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Order(OrderEvent),
    Position(PositionEvent),
    System(SystemEvent),
}

/// An event envelope: typed payload plus the routing/introspection fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub payload: EventPayload,
    pub priority: EventPriority,
    /// Emitting component.
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(payload: EventPayload, priority: EventPriority, source: &str) -> Self {
        Self {
            payload,
            priority,
            source: source.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// The topic handlers subscribe under.
    pub fn topic(&self) -> &'static str {
        match &self.payload {
            EventPayload::Order(OrderEvent::Placed(_)) => "order.placed",
            EventPayload::Order(OrderEvent::Rejected { .. }) => "order.rejected",
            EventPayload::Order(OrderEvent::Failed { .. }) => "order.failed",
            EventPayload::Position(PositionEvent::Opened(_)) => "position.opened",
            EventPayload::Position(PositionEvent::Closed(_)) => "position.closed",
            EventPayload::System(SystemEvent::EngineStarted) => "system.engine_started",
            EventPayload::System(SystemEvent::EngineStopped) => "system.engine_stopped",
        }
    }

    pub fn order_placed(order: Order, source: &str) -> Self {
        Self::new(
            EventPayload::Order(OrderEvent::Placed(order)),
            EventPriority::High,
            source,
        )
    }

    pub fn order_rejected(order: Order, reason: String, source: &str) -> Self {
        Self::new(
            EventPayload::Order(OrderEvent::Rejected { order, reason }),
            EventPriority::High,
            source,
        )
    }

    pub fn order_failed(order: Order, reason: String, source: &str) -> Self {
        Self::new(
            EventPayload::Order(OrderEvent::Failed { order, reason }),
            EventPriority::High,
            source,
        )
    }

    pub fn position_opened(position: Position, source: &str) -> Self {
        Self::new(
            EventPayload::Position(PositionEvent::Opened(position)),
            EventPriority::Normal,
            source,
        )
    }

    pub fn position_closed(position: Position, source: &str) -> Self {
        Self::new(
            EventPayload::Position(PositionEvent::Closed(position)),
            EventPriority::Normal,
            source,
        )
    }

    pub fn engine_started(source: &str) -> Self {
        Self::new(
            EventPayload::System(SystemEvent::EngineStarted),
            EventPriority::Critical,
            source,
        )
    }

    pub fn engine_stopped(source: &str) -> Self {
        Self::new(
            EventPayload::System(SystemEvent::EngineStopped),
            EventPriority::Critical,
            source,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use rust_decimal::Decimal;

    #[test]
    fn topics_match_payloads() {
        let order = Order::market("EURUSD", Side::Buy, Decimal::ONE, "test");
        assert_eq!(
            Event::order_placed(order.clone(), "t").topic(),
            "order.placed"
        );
        assert_eq!(
            Event::order_rejected(order.clone(), "r".into(), "t").topic(),
            "order.rejected"
        );
        assert_eq!(
            Event::order_failed(order, "r".into(), "t").topic(),
            "order.failed"
        );
        assert_eq!(Event::engine_started("t").topic(), "system.engine_started");
        assert_eq!(Event::engine_stopped("t").topic(), "system.engine_stopped");
    }

    #[test]
    fn priority_ordering() {
        assert!(EventPriority::Critical > EventPriority::High);
        assert!(EventPriority::High > EventPriority::Normal);
        assert!(EventPriority::Normal > EventPriority::Low);
    }
}
