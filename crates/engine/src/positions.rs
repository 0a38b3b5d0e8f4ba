use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use algotrade_core::{
    Broker, BrokerError, Event, EventBus, Position, PositionStatus,
};

const SOURCE: &str = "position_manager";

/// Why a position operation did not go through. Local state is never mutated
/// on a failure path.
#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    #[error("broker not connected")]
    NotConnected,
    #[error("unknown ticket: {0}")]
    UnknownTicket(u64),
    #[error("broker refused close for ticket {ticket} (retcode {retcode})")]
    CloseRefused { ticket: u64, retcode: u32 },
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Outcome of one reconciliation tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub opened: usize,
    pub updated: usize,
    pub closed: usize,
}

/// Outcome of a best-effort close of all positions.
#[derive(Debug, Clone, Default)]
pub struct CloseAllReport {
    pub closed: Vec<u64>,
    pub failed: Vec<(u64, String)>,
}

/// Keeps a local position cache consistent with broker-reported truth.
///
/// The broker ticket is the authoritative key. Other components only ever
/// receive clones of the records, never references into the maps.
pub struct PositionManager {
    broker: Arc<dyn Broker>,
    bus: Arc<EventBus>,
    /// Retcode that confirms a close request at the venue.
    success_retcode: u32,
    open: Mutex<HashMap<u64, Position>>,
    closed: Mutex<Vec<Position>>,
}

impl PositionManager {
    pub fn new(broker: Arc<dyn Broker>, bus: Arc<EventBus>, success_retcode: u32) -> Self {
        Self {
            broker,
            bus,
            success_retcode,
            open: Mutex::new(HashMap::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    /// One reconciliation tick against the broker's open-position list.
    ///
    /// Processing order within the tick is fixed: new, then updated, then
    /// closed, so `position.opened` events always precede `position.closed`
    /// events of the same tick. A failed fetch skips the whole tick and
    /// leaves local state as of the last successful one.
    pub async fn sync_positions(&self) -> Result<SyncReport, BrokerError> {
        let mut snapshots = self.broker.positions().await?;
        snapshots.sort_by_key(|p| p.ticket);

        let mut report = SyncReport::default();
        let mut events = Vec::new();
        let mut closed_records = Vec::new();
        {
            let mut open = self.open.lock().unwrap();
            let live: HashSet<u64> = snapshots.iter().map(|p| p.ticket).collect();

            for snapshot in &snapshots {
                match open.get_mut(&snapshot.ticket) {
                    Some(position) => {
                        position.apply(snapshot);
                        report.updated += 1;
                    }
                    None => {
                        let position = Position::from_broker(snapshot);
                        events.push(Event::position_opened(position.clone(), SOURCE));
                        open.insert(snapshot.ticket, position);
                        report.opened += 1;
                    }
                }
            }

            let mut gone: Vec<u64> = open
                .keys()
                .filter(|ticket| !live.contains(ticket))
                .copied()
                .collect();
            gone.sort_unstable();
            for ticket in gone {
                if let Some(mut position) = open.remove(&ticket) {
                    position.status = PositionStatus::Closed;
                    position.closed_at = Some(Utc::now());
                    events.push(Event::position_closed(position.clone(), SOURCE));
                    closed_records.push(position);
                    report.closed += 1;
                }
            }
        }
        self.closed.lock().unwrap().extend(closed_records);
        for event in events {
            self.bus.publish(event);
        }

        if report.opened > 0 || report.closed > 0 {
            info!(
                opened = report.opened,
                updated = report.updated,
                closed = report.closed,
                "positions reconciled"
            );
        } else {
            debug!(updated = report.updated, "positions reconciled");
        }
        Ok(report)
    }

    /// Close a tracked position. Local state changes only after the broker
    /// confirms with the configured success retcode.
    pub async fn close_position(&self, ticket: u64) -> Result<Position, PositionError> {
        if !self.open.lock().unwrap().contains_key(&ticket) {
            return Err(PositionError::UnknownTicket(ticket));
        }
        if !self.broker.is_connected() {
            return Err(PositionError::NotConnected);
        }

        let result = self.broker.close_position(ticket, None).await?;
        if result.retcode != self.success_retcode {
            warn!(
                ticket,
                retcode = result.retcode,
                "broker refused close request"
            );
            return Err(PositionError::CloseRefused {
                ticket,
                retcode: result.retcode,
            });
        }

        let mut position = self
            .open
            .lock()
            .unwrap()
            .remove(&ticket)
            .ok_or(PositionError::UnknownTicket(ticket))?;
        position.status = PositionStatus::Closed;
        position.closed_at = Some(Utc::now());
        position.profit = result.profit;
        self.closed.lock().unwrap().push(position.clone());
        info!(ticket, profit = %position.profit, "position closed");
        self.bus
            .publish(Event::position_closed(position.clone(), SOURCE));
        Ok(position)
    }

    /// Close every active position, sequentially. A failure on one ticket
    /// does not stop the attempts on the rest.
    pub async fn close_all_positions(&self) -> CloseAllReport {
        let mut tickets: Vec<u64> = self.open.lock().unwrap().keys().copied().collect();
        tickets.sort_unstable();

        let mut report = CloseAllReport::default();
        for ticket in tickets {
            match self.close_position(ticket).await {
                Ok(_) => report.closed.push(ticket),
                Err(err) => {
                    warn!(ticket, %err, "close attempt failed");
                    report.failed.push((ticket, err.to_string()));
                }
            }
        }
        report
    }

    /// Move a position's stop-loss.
    pub async fn modify_stop_loss(
        &self,
        ticket: u64,
        stop_loss: Decimal,
    ) -> Result<(), PositionError> {
        if !self.broker.is_connected() {
            return Err(PositionError::NotConnected);
        }
        if !self.open.lock().unwrap().contains_key(&ticket) {
            return Err(PositionError::UnknownTicket(ticket));
        }
        self.broker
            .modify_position(ticket, Some(stop_loss), None)
            .await?;
        if let Some(position) = self.open.lock().unwrap().get_mut(&ticket) {
            position.stop_loss = Some(stop_loss);
        }
        Ok(())
    }

    /// Move a position's take-profit.
    pub async fn modify_take_profit(
        &self,
        ticket: u64,
        take_profit: Decimal,
    ) -> Result<(), PositionError> {
        if !self.broker.is_connected() {
            return Err(PositionError::NotConnected);
        }
        if !self.open.lock().unwrap().contains_key(&ticket) {
            return Err(PositionError::UnknownTicket(ticket));
        }
        self.broker
            .modify_position(ticket, None, Some(take_profit))
            .await?;
        if let Some(position) = self.open.lock().unwrap().get_mut(&ticket) {
            position.take_profit = Some(take_profit);
        }
        Ok(())
    }

    /// Close part of a position's volume. A request for the full volume (or
    /// more) degrades to a full close.
    pub async fn partial_close(&self, ticket: u64, volume: Decimal) -> Result<(), PositionError> {
        if !self.broker.is_connected() {
            return Err(PositionError::NotConnected);
        }
        let current = self
            .open
            .lock()
            .unwrap()
            .get(&ticket)
            .map(|p| p.volume)
            .ok_or(PositionError::UnknownTicket(ticket))?;
        if volume >= current {
            return self.close_position(ticket).await.map(|_| ());
        }

        let result = self.broker.close_position(ticket, Some(volume)).await?;
        if result.retcode != self.success_retcode {
            return Err(PositionError::CloseRefused {
                ticket,
                retcode: result.retcode,
            });
        }
        if let Some(position) = self.open.lock().unwrap().get_mut(&ticket) {
            position.volume -= volume;
            position.status = PositionStatus::Partial;
        }
        info!(ticket, %volume, "position partially closed");
        Ok(())
    }

    /// Active positions, ordered by ticket.
    pub fn open_positions(&self) -> Vec<Position> {
        let mut list: Vec<Position> = self.open.lock().unwrap().values().cloned().collect();
        list.sort_by_key(|p| p.ticket);
        list
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        self.closed.lock().unwrap().clone()
    }

    pub fn position(&self, ticket: u64) -> Option<Position> {
        self.open.lock().unwrap().get(&ticket).cloned()
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().unwrap().len()
    }
}
