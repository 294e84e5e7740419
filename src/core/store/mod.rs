// src/core/store/mod.rs

//! The aggregate store (C3): an in-memory, versioned record per aggregate
//! id with optimistic-concurrency saves, modeled directly on `spineldb`'s
//! `DashMap`-backed keyspace shard — the same `dashmap::Entry` API that
//! gives that shard atomic check-and-set per key gives each aggregate here
//! atomic compare-and-swap on its version number, with no external lock.
//!
//! A successful `save` publishes the resulting `DomainEvent` on the
//! `EventBus` synchronously, inside the same critical section that moved
//! the version forward — this is what gives per-aggregate event ordering
//! (see `core::events`) without a separate outbox or write-ahead log.

use crate::core::errors::OrchestratorError;
use crate::core::events::{DomainEvent, EventBus};
use crate::core::retry::RetryPolicy;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

pub struct AggregateStore<S> {
    bus: Arc<EventBus>,
    rows: DashMap<String, (S, u64)>,
}

impl<S: Clone> AggregateStore<S> {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus, rows: DashMap::new() }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    pub fn load(&self, id: &str) -> Result<(S, u64), OrchestratorError> {
        self.rows
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    pub fn try_load(&self, id: &str) -> Option<(S, u64)> {
        self.rows.get(id).map(|r| r.value().clone())
    }

    /// Inserts a brand-new aggregate at version 0. Fails with `Conflict` if
    /// the id is already present — ids are freshly generated UUIDs, so this
    /// should never race in practice, but the check is cheap insurance.
    pub fn create(&self, id: String, state: S, event: DomainEvent) -> Result<u64, OrchestratorError> {
        match self.rows.entry(id.clone()) {
            Entry::Occupied(o) => Err(OrchestratorError::Conflict {
                aggregate_id: id,
                expected: 0,
                actual: o.get().1,
            }),
            Entry::Vacant(v) => {
                v.insert((state, 0));
                self.bus.publish(event);
                Ok(0)
            }
        }
    }

    /// Compare-and-swap save: succeeds only if the row's current version
    /// equals `expected_version`, then publishes `event` and returns the new
    /// version. `event` is built by the caller from `expected_version + 1`.
    pub fn save(
        &self,
        id: &str,
        expected_version: u64,
        new_state: S,
        event: DomainEvent,
    ) -> Result<u64, OrchestratorError> {
        self.save_all(id, expected_version, new_state, vec![event])
    }

    /// Same compare-and-swap as `save`, but for a transition that produces
    /// more than one domain event (e.g. a worker's port release and
    /// capacity release cascading from one instance termination) — spec
    /// §4.1 describes `save` as publishing "the aggregate's uncommitted
    /// events" (plural), so a single CAS may legitimately carry several.
    pub fn save_all(
        &self,
        id: &str,
        expected_version: u64,
        new_state: S,
        events: Vec<DomainEvent>,
    ) -> Result<u64, OrchestratorError> {
        match self.rows.entry(id.to_string()) {
            Entry::Vacant(_) => Err(OrchestratorError::NotFound(id.to_string())),
            Entry::Occupied(mut o) => {
                let current_version = o.get().1;
                if current_version != expected_version {
                    return Err(OrchestratorError::Conflict {
                        aggregate_id: id.to_string(),
                        expected: expected_version,
                        actual: current_version,
                    });
                }
                let new_version = expected_version + 1;
                o.insert((new_state, new_version));
                for event in events {
                    self.bus.publish(event);
                }
                Ok(new_version)
            }
        }
    }

    /// A point-in-time snapshot of every row, for the scheduler/controller
    /// scan loops (spec §4.6, §4.7). Cloning the whole map trades memory for
    /// simplicity; fleets are expected to stay in the thousands of workers,
    /// not millions, so this is not a bottleneck (spec's non-goals exclude
    /// planet-scale fleets).
    pub fn snapshot(&self) -> Vec<(String, S, u64)> {
        self.rows
            .iter()
            .map(|r| (r.key().clone(), r.value().0.clone(), r.value().1))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Retries a read-modify-write cycle against CAS conflicts (spec §5: "a
/// command method that loses the CAS race is retried by the caller against
/// the freshly loaded state, not surfaced to the operator"). `mutate` is
/// given the freshly loaded state and must produce the new state plus the
/// event to publish; it may also return any other error type `mutate`
/// itself wants to surface (e.g. a business-rule violation), which aborts
/// the retry loop immediately since re-loading won't change that outcome.
pub fn load_mutate_save<S, F>(
    store: &AggregateStore<S>,
    id: &str,
    mutate: F,
) -> Result<(S, u64), OrchestratorError>
where
    S: Clone,
    F: Fn(&S, u64) -> Result<(S, DomainEvent), OrchestratorError>,
{
    let policy = RetryPolicy::for_aggregate_store();
    let mut attempt = 0;
    loop {
        let (current, version) = store.load(id)?;
        let (next, event) = mutate(&current, version)?;
        match store.save(id, version, next.clone(), event) {
            Ok(new_version) => return Ok((next, new_version)),
            Err(OrchestratorError::Conflict { .. }) if attempt + 1 < policy.max_attempts => {
                attempt += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Same retry shape as `load_mutate_save`, for a `mutate` that produces
/// several events from one transition (see `AggregateStore::save_all`).
pub fn load_mutate_save_many<S, F>(
    store: &AggregateStore<S>,
    id: &str,
    mutate: F,
) -> Result<(S, u64), OrchestratorError>
where
    S: Clone,
    F: Fn(&S, u64) -> Result<(S, Vec<DomainEvent>), OrchestratorError>,
{
    let policy = RetryPolicy::for_aggregate_store();
    let mut attempt = 0;
    loop {
        let (current, version) = store.load(id)?;
        let (next, events) = mutate(&current, version)?;
        match store.save_all(id, version, next.clone(), events) {
            Ok(new_version) => return Ok((next, new_version)),
            Err(OrchestratorError::Conflict { .. }) if attempt + 1 < policy.max_attempts => {
                attempt += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}
