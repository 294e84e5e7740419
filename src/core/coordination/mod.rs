// src/core/coordination/mod.rs

//! The coordination store (C2): named leases, a CAS list primitive, and a
//! TTL dedup set. Grounded in the `Mutex<MasterState>` pattern
//! `spineldb::core::warden::state` uses to guard failover bookkeeping — a
//! single `parking_lot::Mutex` around a plain `HashMap`, since contention is
//! low and every operation is O(1) or O(n) over a small map.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::errors::OrchestratorError;

#[derive(Debug, Clone)]
struct LeaseRow {
    holder: String,
    epoch: u64,
    expires_at: Instant,
}

/// One named mutual-exclusion lease with a fencing epoch (spec §5,
/// GLOSSARY "Lease epoch"). `acquire`/`renew` bump the epoch so a
/// lease-holder that stalls past its TTL and later wakes up can be told its
/// write is stale (`OrchestratorError::StaleLeaseEpoch`) instead of
/// silently clobbering the new holder's work.
pub struct CoordinationStore {
    leases: Mutex<HashMap<String, LeaseRow>>,
    lists: Mutex<HashMap<String, Vec<String>>>,
    dedup: Mutex<HashMap<String, Instant>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseHandle {
    pub epoch: u64,
}

impl CoordinationStore {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            lists: Mutex::new(HashMap::new()),
            dedup: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires `name` for `holder` if unheld or expired. Returns the new
    /// epoch on success.
    pub fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseHandle, OrchestratorError> {
        let mut leases = self.leases.lock();
        let now = Instant::now();
        match leases.get(name) {
            Some(row) if row.expires_at > now && row.holder != holder => {
                Err(OrchestratorError::Conflict {
                    aggregate_id: format!("lease:{name}"),
                    expected: row.epoch,
                    actual: row.epoch,
                })
            }
            Some(row) => {
                let epoch = row.epoch + 1;
                leases.insert(
                    name.to_string(),
                    LeaseRow { holder: holder.to_string(), epoch, expires_at: now + ttl },
                );
                Ok(LeaseHandle { epoch })
            }
            None => {
                let epoch = 1;
                leases.insert(
                    name.to_string(),
                    LeaseRow { holder: holder.to_string(), epoch, expires_at: now + ttl },
                );
                Ok(LeaseHandle { epoch })
            }
        }
    }

    /// Renews a held lease, extending its TTL without bumping the epoch (an
    /// uninterrupted holder keeps writing under the same fencing token).
    /// Fails with `StaleLeaseEpoch` if another holder has since acquired it.
    pub fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        epoch: u64,
        ttl: Duration,
    ) -> Result<LeaseHandle, OrchestratorError> {
        let mut leases = self.leases.lock();
        match leases.get_mut(name) {
            Some(row) if row.holder == holder && row.epoch == epoch => {
                row.expires_at = Instant::now() + ttl;
                Ok(LeaseHandle { epoch })
            }
            Some(row) => Err(OrchestratorError::StaleLeaseEpoch {
                lease: name.to_string(),
                current: row.epoch,
                attempted: epoch,
            }),
            None => Err(OrchestratorError::NotFound(format!("lease:{name}"))),
        }
    }

    pub fn release_lease(&self, name: &str, holder: &str, epoch: u64) {
        let mut leases = self.leases.lock();
        if let Some(row) = leases.get(name)
            && row.holder == holder
            && row.epoch == epoch
        {
            leases.remove(name);
        }
    }

    pub fn is_leased(&self, name: &str) -> bool {
        let leases = self.leases.lock();
        leases.get(name).is_some_and(|row| row.expires_at > Instant::now())
    }

    /// CAS append to a named list: succeeds only if the list's current
    /// length equals `expected_len`, used by the port allocator to claim a
    /// port range slice without a separate lock type (spec §4.5).
    pub fn cas_list_append(
        &self,
        key: &str,
        expected_len: usize,
        value: String,
    ) -> Result<usize, OrchestratorError> {
        let mut lists = self.lists.lock();
        let entry = lists.entry(key.to_string()).or_default();
        if entry.len() != expected_len {
            return Err(OrchestratorError::Conflict {
                aggregate_id: format!("list:{key}"),
                expected: expected_len as u64,
                actual: entry.len() as u64,
            });
        }
        entry.push(value);
        Ok(entry.len())
    }

    pub fn list_snapshot(&self, key: &str) -> Vec<String> {
        self.lists.lock().get(key).cloned().unwrap_or_default()
    }

    /// Records that `id` was seen, returning `true` if it was *not* already
    /// present (i.e. this call should process it) within `ttl`. Used for
    /// inbound CloudEvent dedup-by-id (spec §4.10). Expired entries are
    /// swept lazily on each call rather than by a background task — the
    /// dedup set is expected to stay small relative to event volume.
    pub fn dedup_check(&self, id: &str, ttl: Duration) -> bool {
        let mut dedup = self.dedup.lock();
        let now = Instant::now();
        dedup.retain(|_, seen_at| now.duration_since(*seen_at) < ttl);
        if dedup.contains_key(id) {
            false
        } else {
            dedup.insert(id.to_string(), now);
            true
        }
    }
}

impl Default for CoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}
