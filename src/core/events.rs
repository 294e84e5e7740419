// src/core/events.rs

//! The in-process event bus (C1): a typed, synchronous pub/sub hub that
//! fans domain events out to the SSE relay (C13) and the external
//! CloudEvents publisher (C14). Modeled on `spineldb`'s `EventBus`, which
//! uses a single `tokio::sync::broadcast` channel as its distribution
//! primitive for replication; here the one channel carries every domain
//! event instead of replicated write commands.
//!
//! Ordering: events for a given aggregate are only ever published from
//! inside `AggregateStore::save` (see `core::store`), which serializes
//! saves for a given id via compare-and-swap on its version. Because the
//! publish happens synchronously inside the successful save, the order
//! events for one `aggregate_id` reach this channel always matches the
//! order their versions were committed in, even though unrelated
//! aggregates may interleave freely (spec §5: "Across aggregates, no
//! ordering is implied").

use crate::core::ids::{InstanceId, WorkerId};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Generous, like `spineldb`'s
/// `BROADCAST_BUS_CAPACITY`, so bursts of placement/scaling activity don't
/// cause slow subscribers to miss events before the SSE relay (which uses
/// its own bounded per-subscriber queues, see `core::sse`) can drain them.
const EVENT_BUS_CAPACITY: usize = 16_384;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerEventKind {
    Created,
    Provisioning,
    Running,
    CapacityReserved { instance_id: InstanceId },
    CapacityReleased { instance_id: InstanceId },
    PortsBound { instance_id: InstanceId, count: usize },
    PortsReleased { instance_id: InstanceId },
    DrainStarted,
    DrainCancelled,
    Stopping,
    Stopped,
    Terminated { reason: String },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceEventKind {
    Created,
    Scheduled { worker_id: WorkerId },
    Instantiating,
    PortsAllocated,
    Running { lab_id: String },
    Collecting,
    Grading,
    GradingCompleted { score: f64 },
    StoppingRequested,
    Stopped,
    Archived,
    Terminated { reason: String },
}

/// The closed set of event kinds the engine emits. Deliberately a single
/// flat enum rather than per-aggregate trait objects: per the design notes,
/// "the set of kinds per aggregate is closed and versioned", and a plain
/// match is enough to route them (SSE filters, CloudEvents `type` mapping).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    Worker {
        id: WorkerId,
        version: u64,
        at: DateTime<Utc>,
        event: WorkerEventKind,
    },
    Instance {
        id: InstanceId,
        version: u64,
        at: DateTime<Utc>,
        event: InstanceEventKind,
    },
    /// Emitted by the scheduler (§4.6 step 1) when no eligible worker exists.
    ScaleUpRequested {
        template: String,
        region: String,
        at: DateTime<Utc>,
    },
    /// Every scale-up/down decision the controller makes (§4.7 Audit).
    ScalingAction {
        action: String,
        worker_id: Option<WorkerId>,
        template: String,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Broadcast once on shutdown; SSE relay uses this to close subscribers
    /// cleanly (§4.9).
    SystemShutdown { at: DateTime<Utc> },
}

impl DomainEvent {
    /// A stable string used for CloudEvents `type` and SSE `event_types` filters.
    pub fn type_name(&self) -> &'static str {
        match self {
            DomainEvent::Worker { event, .. } => match event {
                WorkerEventKind::Created => "worker.created",
                WorkerEventKind::Provisioning => "worker.provisioning",
                WorkerEventKind::Running => "worker.running",
                WorkerEventKind::CapacityReserved { .. } => "worker.capacity_reserved",
                WorkerEventKind::CapacityReleased { .. } => "worker.capacity_released",
                WorkerEventKind::PortsBound { .. } => "worker.ports_bound",
                WorkerEventKind::PortsReleased { .. } => "worker.ports_released",
                WorkerEventKind::DrainStarted => "worker.drain_started",
                WorkerEventKind::DrainCancelled => "worker.drain_cancelled",
                WorkerEventKind::Stopping => "worker.stopping",
                WorkerEventKind::Stopped => "worker.stopped",
                WorkerEventKind::Terminated { .. } => "worker.terminated",
            },
            DomainEvent::Instance { event, .. } => match event {
                InstanceEventKind::Created => "instance.created",
                InstanceEventKind::Scheduled { .. } => "instance.scheduled",
                InstanceEventKind::Instantiating => "instance.instantiating",
                InstanceEventKind::PortsAllocated => "instance.ports_allocated",
                InstanceEventKind::Running { .. } => "instance.running",
                InstanceEventKind::Collecting => "instance.collecting",
                InstanceEventKind::Grading => "instance.grading",
                InstanceEventKind::GradingCompleted { .. } => "instance.grading_completed",
                InstanceEventKind::StoppingRequested => "instance.stopping",
                InstanceEventKind::Stopped => "instance.stopped",
                InstanceEventKind::Archived => "instance.archived",
                InstanceEventKind::Terminated { .. } => "instance.terminated",
            },
            DomainEvent::ScaleUpRequested { .. } => "fleet.scale_up_requested",
            DomainEvent::ScalingAction { .. } => "fleet.scaling_action",
            DomainEvent::SystemShutdown { .. } => "system.shutdown",
        }
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        match self {
            DomainEvent::Worker { id, .. } => Some(*id),
            DomainEvent::ScalingAction { worker_id, .. } => *worker_id,
            _ => None,
        }
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        match self {
            DomainEvent::Instance { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// The central distribution hub for domain events. A thin wrapper around a
/// `broadcast::Sender`; consumers that need filtering or back-pressure
/// control (SSE subscribers) build that on top rather than the bus itself
/// blocking or dropping on their behalf (spec §4.2: "Subscribers must not
/// block the publisher").
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an event to all current subscribers. At-least-once within
    /// this process; if there are no subscribers the send is a no-op, not
    /// an error (spec §4.2).
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
