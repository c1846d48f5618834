//! Fan-out of task events to live observers.
//!
//! Each observer connection gets its own bounded `tokio::sync::broadcast`
//! channel. Sending never waits: when a connection's buffer is full the
//! channel overwrites that connection's oldest event and the subscriber sees
//! the gap as a lag count. A connection whose receiver has gone away is pruned
//! on the next broadcast. Sequence numbers are assigned and events enqueued
//! under the registry lock, so every connection observes the order in which
//! mutations were reported.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::event::{Event, EventKind};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Identifies one observer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub struct Broadcaster {
    registry: Mutex<Registry>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct Registry {
    next_seq: u64,
    next_connection: u64,
    connections: BTreeMap<ConnectionId, broadcast::Sender<Event>>,
}

impl Broadcaster {
    /// `capacity` is the per-connection queue bound.
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            capacity: capacity.max(1),
            clock,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new observer connection.
    pub fn connect(&self) -> Subscription {
        let (tx, rx) = broadcast::channel(self.capacity);
        let mut registry = self.registry();
        registry.next_connection += 1;
        let id = ConnectionId(registry.next_connection);
        registry.connections.insert(id, tx);
        debug!(connection = %id, observers = registry.connections.len(), "observer connected");
        Subscription { id, rx }
    }

    /// Remove a connection. Events already queued for it are still readable;
    /// after those the subscription reports closed.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.registry().connections.remove(&id).is_some();
        if removed {
            debug!(connection = %id, "observer disconnected");
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.registry().connections.len()
    }

    /// Deliver an event to every live connection. Returns how many
    /// connections accepted it.
    pub fn broadcast(&self, kind: EventKind) -> usize {
        let name = kind.name();
        let mut registry = self.registry();
        registry.next_seq += 1;
        let event = Event {
            seq: registry.next_seq,
            timestamp: self.clock.now(),
            kind,
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in &registry.connections {
            match tx.send(event.clone()) {
                Ok(_) => delivered += 1,
                Err(_) => dead.push(*id),
            }
        }
        for id in &dead {
            registry.connections.remove(id);
            warn!(connection = %id, "pruned observer with closed receiver");
        }
        drop(registry);

        metrics::events_broadcast().add(1, &[KeyValue::new("type", name)]);
        if !dead.is_empty() {
            metrics::observers_pruned().add(dead.len() as u64, &[]);
        }
        debug!(seq = event.seq, event_type = name, task_id = %event.kind.task_id(), delivered, "event broadcast");
        delivered
    }
}

/// Result of waiting on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(Event),
    /// The connection fell behind; this many of its oldest events were dropped.
    Lagged(u64),
    /// The connection was disconnected and its queue is drained.
    Closed,
}

/// Receiving end of one observer connection.
pub struct Subscription {
    id: ConnectionId,
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Wait for the next delivery.
    pub async fn next(&mut self) -> Delivery {
        match self.rx.recv().await {
            Ok(event) => Delivery::Event(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(connection = %self.id, skipped, "observer lagging, oldest events dropped");
                metrics::observer_lag().add(skipped, &[]);
                Delivery::Lagged(skipped)
            }
            Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
        }
    }

    /// Next event, skipping over lag notices. `None` once closed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.next().await {
                Delivery::Event(event) => return Some(event),
                Delivery::Lagged(_) => continue,
                Delivery::Closed => return None,
            }
        }
    }

    /// A queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskId;

    fn released(task_id: TaskId) -> EventKind {
        EventKind::Released {
            task_id,
            reason: "test".into(),
        }
    }

    #[tokio::test]
    async fn every_connection_sees_events_in_order() {
        let hub = Broadcaster::new(16);
        let mut a = hub.connect();
        let mut b = hub.connect();
        let ids: Vec<TaskId> = (0..5).map(|_| TaskId::new()).collect();
        for id in &ids {
            assert_eq!(hub.broadcast(released(*id)), 2);
        }
        for sub in [&mut a, &mut b] {
            let mut last_seq = 0;
            for id in &ids {
                let event = sub.recv().await.unwrap();
                assert_eq!(event.kind.task_id(), *id);
                assert!(event.seq > last_seq);
                last_seq = event.seq;
            }
        }
    }

    #[tokio::test]
    async fn slow_connection_drops_oldest_without_affecting_others() {
        let hub = Broadcaster::new(2);
        let mut slow = hub.connect();
        let mut fast = hub.connect();
        let ids: Vec<TaskId> = (0..4).map(|_| TaskId::new()).collect();
        for id in &ids {
            hub.broadcast(released(*id));
            assert_eq!(fast.recv().await.unwrap().kind.task_id(), *id);
        }

        assert_eq!(slow.next().await, Delivery::Lagged(2));
        assert_eq!(slow.recv().await.unwrap().kind.task_id(), ids[2]);
        assert_eq!(slow.recv().await.unwrap().kind.task_id(), ids[3]);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let hub = Broadcaster::new(4);
        let dropped = hub.connect();
        let mut live = hub.connect();
        drop(dropped);

        assert_eq!(hub.broadcast(released(TaskId::new())), 1);
        assert_eq!(hub.connection_count(), 1);
        assert!(live.recv().await.is_some());
    }

    #[tokio::test]
    async fn disconnect_closes_subscription_after_drain() {
        let hub = Broadcaster::new(4);
        let mut sub = hub.connect();
        hub.broadcast(released(TaskId::new()));
        assert!(hub.disconnect(sub.id()));
        assert!(!hub.disconnect(sub.id()));
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.broadcast(released(TaskId::new())), 0);
    }
}
