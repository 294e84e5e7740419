// src/server/context.rs

//! `EngineContext`/`EngineHandle`: the process-level wiring around
//! `EngineState`. Modeled on `spineldb::server::context::ServerContext`,
//! which bundles `ServerState` with the listener, shutdown signal, and
//! background-task join handles a running server needs beyond the shared
//! state itself.

use crate::core::leader::LeaderHandle;
use crate::core::stats::EngineStatsSnapshot;
use crate::core::EngineState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// A read-only query surface over the running engine (SPEC_FULL §6), the
/// orchestration-engine equivalent of `spineldb`'s `INFO` command output.
/// Cheap to clone and safe to hand to anything that only needs to observe
/// the engine, never mutate it.
#[derive(Clone)]
pub struct EngineHandle {
    state: Arc<EngineState>,
    scheduler_leader: LeaderHandle,
    controller_leader: LeaderHandle,
}

/// A snapshot returned by [`EngineHandle::health`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineHealth {
    pub scheduler_is_leader: bool,
    pub scheduler_epoch: u64,
    pub controller_is_leader: bool,
    pub controller_epoch: u64,
    pub subscriber_count: usize,
    pub stats: EngineStatsSnapshot,
}

impl EngineHandle {
    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            scheduler_is_leader: self.scheduler_leader.is_leader(),
            scheduler_epoch: self.scheduler_leader.epoch(),
            controller_is_leader: self.controller_leader.is_leader(),
            controller_epoch: self.controller_leader.epoch(),
            subscriber_count: self.state.sse.subscriber_count(),
            stats: self.state.stats.snapshot(),
        }
    }
}

/// Owns the running engine for the lifetime of the process: the shared
/// state, a query handle, the shutdown broadcaster, and the `JoinSet` every
/// background loop is spawned into (SPEC_FULL §5).
pub struct EngineContext {
    pub state: Arc<EngineState>,
    pub handle: EngineHandle,
    pub scheduler_leader: LeaderHandle,
    pub controller_leader: LeaderHandle,
    pub shutdown_tx: broadcast::Sender<()>,
    pub tasks: JoinSet<()>,
}

impl EngineContext {
    pub fn new(
        state: Arc<EngineState>,
        scheduler_leader: LeaderHandle,
        controller_leader: LeaderHandle,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = EngineHandle {
            state: state.clone(),
            scheduler_leader: scheduler_leader.clone(),
            controller_leader: controller_leader.clone(),
        };
        Self {
            state,
            handle,
            scheduler_leader,
            controller_leader,
            shutdown_tx,
            tasks: JoinSet::new(),
        }
    }

    /// Broadcasts shutdown to every spawned loop and waits for all of them
    /// to exit, the same drain `spineldb::server::connection_loop` performs
    /// against its own `JoinSet` on graceful shutdown.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        while self.tasks.join_next().await.is_some() {}
    }
}
