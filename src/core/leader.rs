// src/core/leader.rs

//! Leader election (spec §5): scheduler and controller are singletons via
//! short-lease election on the coordination store. Grounded directly in
//! `spineldb`'s Warden (`core::warden::worker::MasterMonitor`): a
//! `tokio::select!` tick loop that periodically tries to acquire/renew a
//! lease and reacts to loss of quorum — simplified here to a single
//! in-process coordination store instead of a gossiping Warden cluster,
//! since only one process is ever the leader candidate in this engine.

use crate::core::coordination::CoordinationStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Handed to every loop that needs to know whether it currently holds a
/// lease, and under what epoch its mutations should be fenced (spec §5:
/// "every mutation initiated by a loop carries the current lease epoch").
#[derive(Clone)]
pub struct LeaderHandle {
    is_leader_rx: watch::Receiver<bool>,
    epoch: Arc<AtomicU64>,
}

impl LeaderHandle {
    pub fn is_leader(&self) -> bool {
        *self.is_leader_rx.borrow()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Resolves once leadership status changes from its current value.
    pub async fn changed(&mut self) {
        let _ = self.is_leader_rx.changed().await;
    }
}

pub struct LeaderElector {
    store: Arc<CoordinationStore>,
    lease_name: String,
    holder_id: String,
    ttl: Duration,
    renew_interval: Duration,
    is_leader_tx: watch::Sender<bool>,
    epoch: Arc<AtomicU64>,
}

impl LeaderElector {
    pub fn new(
        store: Arc<CoordinationStore>,
        lease_name: impl Into<String>,
        holder_id: impl Into<String>,
        ttl: Duration,
        renew_interval: Duration,
    ) -> (Self, LeaderHandle) {
        let (is_leader_tx, is_leader_rx) = watch::channel(false);
        let epoch = Arc::new(AtomicU64::new(0));
        let elector = Self {
            store,
            lease_name: lease_name.into(),
            holder_id: holder_id.into(),
            ttl,
            renew_interval,
            is_leader_tx,
            epoch: epoch.clone(),
        };
        (elector, LeaderHandle { is_leader_rx, epoch })
    }

    /// Runs until `shutdown` fires, at which point a held lease is released
    /// (spec §6 exit behavior: "release leader lease").
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut held_epoch: Option<u64> = None;
        let mut ticker = tokio::time::interval(self.renew_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    held_epoch = self.try_acquire_or_renew(held_epoch).await;
                }
                _ = shutdown.recv() => {
                    if let Some(epoch) = held_epoch {
                        self.store.release_lease(&self.lease_name, &self.holder_id, epoch);
                    }
                    let _ = self.is_leader_tx.send(false);
                    break;
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self, held_epoch: Option<u64>) -> Option<u64> {
        match held_epoch {
            None => match self.store.acquire_lease(&self.lease_name, &self.holder_id, self.ttl) {
                Ok(handle) => {
                    info!(lease = %self.lease_name, epoch = handle.epoch, "acquired leader lease");
                    self.epoch.store(handle.epoch, Ordering::Release);
                    let _ = self.is_leader_tx.send(true);
                    Some(handle.epoch)
                }
                Err(_) => {
                    let _ = self.is_leader_tx.send(false);
                    None
                }
            },
            Some(epoch) => match self.store.renew_lease(&self.lease_name, &self.holder_id, epoch, self.ttl) {
                Ok(_) => Some(epoch),
                Err(e) => {
                    warn!(lease = %self.lease_name, error = %e, "lost leader lease");
                    let _ = self.is_leader_tx.send(false);
                    None
                }
            },
        }
    }
}
