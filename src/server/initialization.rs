// src/server/initialization.rs

//! Startup wiring: builds `EngineState` and the two leader elections the
//! engine needs (scheduler, controller), the same role
//! `spineldb::server::initialization::setup` plays in building
//! `ServerState` and binding its listener before any background task runs.

use crate::config::Config;
use crate::core::adapters::{InMemoryArtifactStore, InMemoryCloudAdapter, InMemoryLabHostClient};
use crate::core::leader::LeaderElector;
use crate::core::EngineState;
use crate::server::context::EngineContext;
use anyhow::Result;
use std::sync::Arc;
use uuid::Uuid;

/// Builds the engine context. Real deployments would pass real
/// `CloudAdapter`/`LabHostClient`/`ArtifactStore` implementations in here;
/// the demonstration binary uses the in-memory reference ones.
pub async fn setup(config: Config) -> Result<(EngineContext, LeaderElector, LeaderElector)> {
    let state = EngineState::initialize(
        config,
        Arc::new(InMemoryCloudAdapter::new()),
        Arc::new(InMemoryLabHostClient::new()),
        Arc::new(InMemoryArtifactStore::new()),
    );

    let holder_id = Uuid::new_v4().to_string();
    let (scheduler_elector, scheduler_leader) = LeaderElector::new(
        state.coordination.clone(),
        "scheduler",
        holder_id.clone(),
        state.config.leader.lease_ttl,
        state.config.leader.lease_renew,
    );
    let (controller_elector, controller_leader) = LeaderElector::new(
        state.coordination.clone(),
        "controller",
        holder_id,
        state.config.leader.lease_ttl,
        state.config.leader.lease_renew,
    );

    let ctx = EngineContext::new(state, scheduler_leader, controller_leader);
    Ok((ctx, scheduler_elector, controller_elector))
}
