// src/server/spawner.rs

//! Spawns every long-running loop into the context's `JoinSet`, exactly as
//! `spineldb::server::spawner::spawn_all` fans `EvictionManager`,
//! `TtlManager`, and friends out from `ServerState`. Each loop gets its own
//! `broadcast::Receiver<()>` subscribed off `ctx.shutdown_tx` and exits
//! promptly on it.

use crate::core::cloudevents::CloudEventsPublisher;
use crate::core::controller::ResourceController;
use crate::core::leader::LeaderElector;
use crate::core::scheduler::Scheduler;
use crate::server::context::EngineContext;
use anyhow::Result;

pub async fn spawn_all(
    ctx: &mut EngineContext,
    scheduler_elector: LeaderElector,
    controller_elector: LeaderElector,
) -> Result<()> {
    let state = ctx.state.clone();

    ctx.tasks.spawn(scheduler_elector.run(ctx.shutdown_tx.subscribe()));
    ctx.tasks.spawn(controller_elector.run(ctx.shutdown_tx.subscribe()));

    let scheduler = Scheduler::new(state.clone(), ctx.scheduler_leader.clone(), &state.config);
    ctx.tasks.spawn(scheduler.run(ctx.shutdown_tx.subscribe()));

    let controller = ResourceController::new(state.clone(), ctx.controller_leader.clone(), &state.config);
    ctx.tasks.spawn(controller.run(ctx.shutdown_tx.subscribe()));

    let sse = state.sse.clone();
    let bus = state.event_bus.clone();
    let heartbeat_interval = state.config.sse.heartbeat_interval;
    let sse_shutdown = ctx.shutdown_tx.subscribe();
    ctx.tasks.spawn(async move { sse.run(bus, heartbeat_interval, sse_shutdown).await });

    let cloudevents = state.cloudevents.clone();
    let bus = state.event_bus.clone();
    let stats = state.stats.clone();
    let cloudevents_shutdown = ctx.shutdown_tx.subscribe();
    ctx.tasks
        .spawn(async move { CloudEventsPublisher::run(cloudevents, bus, stats, cloudevents_shutdown).await });

    Ok(())
}
