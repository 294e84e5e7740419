// src/core/sse.rs

//! The SSE relay (C13, spec §4.9): per-subscriber bounded queues fed from
//! the Event Bus, with filters applied before delivery. Generalizes
//! `spineldb::core::pubsub::PubSubManager` — there each channel is a shared
//! `broadcast` sender every subscriber reads from directly; here each
//! subscriber needs its own *filtered* view of one shared stream, which a
//! broadcast channel can't apply before delivery, so each subscription gets
//! its own bounded `mpsc` channel instead and a single fan-out task decides
//! what reaches it.

use crate::core::events::DomainEvent;
use crate::core::ids::{InstanceId, WorkerId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// What a subscriber receives: domain events, periodic heartbeats (spec
/// §4.9: "every 15s"), and a final close signal on shutdown.
#[derive(Debug, Clone)]
pub enum SseEvent {
    Domain(DomainEvent),
    Heartbeat,
}

/// A subscriber's filter (spec §4.9). `None` in any field means "no
/// restriction on that dimension".
#[derive(Debug, Clone, Default)]
pub struct SubscriberFilter {
    pub instance_ids: Option<HashSet<InstanceId>>,
    pub worker_ids: Option<HashSet<WorkerId>>,
    pub event_types: Option<HashSet<String>>,
}

impl SubscriberFilter {
    fn matches(&self, event: &DomainEvent) -> bool {
        if let Some(ids) = &self.instance_ids
            && let Some(id) = event.instance_id()
            && !ids.contains(&id)
        {
            return false;
        }
        if let Some(ids) = &self.worker_ids
            && let Some(id) = event.worker_id()
            && !ids.contains(&id)
        {
            return false;
        }
        if let Some(types) = &self.event_types
            && !types.contains(event.type_name())
        {
            return false;
        }
        true
    }
}

struct Subscriber {
    filter: SubscriberFilter,
    tx: mpsc::Sender<SseEvent>,
}

/// The relay itself. Subscriptions live in a `DashMap` keyed by a
/// monotonic id (mirrors the `DashMap<Bytes, Sender>` shape
/// `PubSubManager` uses for its channel registry).
pub struct SseRelay {
    queue_depth: usize,
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    connected: AtomicU64,
    dropped: AtomicU64,
}

impl SseRelay {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth,
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            connected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, filter: SubscriberFilter) -> (u64, mpsc::Receiver<SseEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.subscribers.insert(id, Subscriber { filter, tx });
        self.connected.fetch_add(1, Ordering::Relaxed);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Delivers one domain event to every matching subscriber. A subscriber
    /// whose queue is full is dropped rather than blocking the publisher
    /// (spec §4.9: "on overflow the relay drops the subscriber with a
    /// `queue_overflow` reason"). `system.shutdown` bypasses filters: every
    /// subscriber must see it so clients can reconnect cleanly.
    fn fan_out(&self, event: &DomainEvent) {
        let is_shutdown = matches!(event, DomainEvent::SystemShutdown { .. });
        let mut overflowed = Vec::new();
        for entry in self.subscribers.iter() {
            let id = *entry.key();
            let sub = entry.value();
            if !is_shutdown && !sub.filter.matches(event) {
                continue;
            }
            if sub.tx.try_send(SseEvent::Domain(event.clone())).is_err() {
                overflowed.push(id);
            }
        }
        for id in overflowed {
            self.subscribers.remove(&id);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(subscriber_id = id, "sse subscriber overflowed, reason=queue_overflow");
        }
    }

    fn heartbeat_all(&self) {
        let mut overflowed = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().tx.try_send(SseEvent::Heartbeat).is_err() {
                overflowed.push(*entry.key());
            }
        }
        for id in overflowed {
            self.subscribers.remove(&id);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Runs the fan-out loop until `shutdown` fires, at which point it
    /// publishes `system.shutdown` on the bus (so every subscriber,
    /// including any that would otherwise be filtered out, hears it) and
    /// then closes every subscription by dropping its sender (spec §4.9).
    pub async fn run(
        self: Arc<Self>,
        bus: Arc<crate::core::events::EventBus>,
        heartbeat_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut events = bus.subscribe();
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        loop {
            tokio::select! {
                result = events.recv() => {
                    match result {
                        Ok(event) => self.fan_out(&event),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = heartbeat.tick() => self.heartbeat_all(),
                _ = shutdown.recv() => {
                    bus.publish(DomainEvent::SystemShutdown { at: chrono::Utc::now() });
                    if let Ok(event) = events.try_recv() {
                        self.fan_out(&event);
                    }
                    self.subscribers.clear();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::InstanceId;

    fn instance_event(id: InstanceId) -> DomainEvent {
        DomainEvent::Instance {
            id,
            version: 1,
            at: chrono::Utc::now(),
            event: crate::core::events::InstanceEventKind::Created,
        }
    }

    #[tokio::test]
    async fn unfiltered_subscriber_receives_event() {
        let relay = SseRelay::new(4);
        let (_, mut rx) = relay.subscribe(SubscriberFilter::default());
        relay.fan_out(&instance_event(InstanceId::new()));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SseEvent::Domain(DomainEvent::Instance { .. })));
    }

    #[tokio::test]
    async fn filtered_subscriber_skips_non_matching_instance() {
        let relay = SseRelay::new(4);
        let wanted = InstanceId::new();
        let mut ids = HashSet::new();
        ids.insert(wanted);
        let (_, mut rx) = relay.subscribe(SubscriberFilter {
            instance_ids: Some(ids),
            ..Default::default()
        });
        relay.fan_out(&instance_event(InstanceId::new()));
        relay.fan_out(&instance_event(wanted));
        let event = rx.try_recv().unwrap();
        match event {
            SseEvent::Domain(DomainEvent::Instance { id, .. }) => assert_eq!(id, wanted),
            _ => panic!("expected domain event"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_dropped() {
        let relay = SseRelay::new(1);
        let (_, _rx) = relay.subscribe(SubscriberFilter::default());
        relay.fan_out(&instance_event(InstanceId::new()));
        relay.fan_out(&instance_event(InstanceId::new()));
        assert_eq!(relay.subscriber_count(), 0);
        assert_eq!(relay.dropped_count(), 1);
    }
}
