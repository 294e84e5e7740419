// src/core/stats.rs

//! `EngineStats` (SPEC_FULL §3): read-only observability counters, never
//! part of any aggregate's persisted state or invariants, mirroring
//! `spineldb`'s `StatsState` (a bundle of `AtomicU64`s updated from
//! anywhere, read by `INFO`). Here the "INFO" surface is
//! `EngineHandle::health()` (SPEC_FULL §6).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineStats {
    placements_made: AtomicU64,
    scale_up_actions: AtomicU64,
    scale_down_actions: AtomicU64,
    instantiation_failures: AtomicU64,
    sse_subscribers_connected: AtomicU64,
    sse_subscribers_dropped: AtomicU64,
    cloudevents_inbound: AtomicU64,
    cloudevents_outbound: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EngineStatsSnapshot {
    pub placements_made: u64,
    pub scale_up_actions: u64,
    pub scale_down_actions: u64,
    pub instantiation_failures: u64,
    pub sse_subscribers_connected: u64,
    pub sse_subscribers_dropped: u64,
    pub cloudevents_inbound: u64,
    pub cloudevents_outbound: u64,
}

macro_rules! counter_ops {
    ($field:ident, $inc:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter_ops!(placements_made, record_placement);
    counter_ops!(scale_up_actions, record_scale_up);
    counter_ops!(scale_down_actions, record_scale_down);
    counter_ops!(instantiation_failures, record_instantiation_failure);
    counter_ops!(sse_subscribers_connected, record_sse_connected);
    counter_ops!(sse_subscribers_dropped, record_sse_dropped);
    counter_ops!(cloudevents_inbound, record_cloudevent_inbound);
    counter_ops!(cloudevents_outbound, record_cloudevent_outbound);

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            placements_made: self.placements_made.load(Ordering::Relaxed),
            scale_up_actions: self.scale_up_actions.load(Ordering::Relaxed),
            scale_down_actions: self.scale_down_actions.load(Ordering::Relaxed),
            instantiation_failures: self.instantiation_failures.load(Ordering::Relaxed),
            sse_subscribers_connected: self.sse_subscribers_connected.load(Ordering::Relaxed),
            sse_subscribers_dropped: self.sse_subscribers_dropped.load(Ordering::Relaxed),
            cloudevents_inbound: self.cloudevents_inbound.load(Ordering::Relaxed),
            cloudevents_outbound: self.cloudevents_outbound.load(Ordering::Relaxed),
        }
    }
}
