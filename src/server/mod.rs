// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use tracing::info;

pub mod context;
mod initialization;
mod spawner;

pub use context::EngineHealth;

/// Brings the engine up, runs it until a shutdown signal arrives, then
/// drains every background loop before returning. Mirrors the three-phase
/// shape of `spineldb::server::run` (`initialization::setup` ->
/// `spawner::spawn_all` -> run-until-signalled), minus the RESP connection
/// loop: this engine has no client-facing transport of its own (spec §1).
pub async fn run(config: Config) -> Result<()> {
    let (mut ctx, scheduler_elector, controller_elector) = initialization::setup(config).await?;
    spawner::spawn_all(&mut ctx, scheduler_elector, controller_elector).await?;

    info!("cml-orchestratord engine started");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining background tasks");
    ctx.shutdown().await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
