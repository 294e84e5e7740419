// src/core/ports/mod.rs

//! The port allocator (C4, spec §4.5): maps a `LabletDefinition`'s
//! `port_template` placeholders onto free ports in a `Worker`'s
//! `port_range`, first-fit low-to-high. Deterministic and pure — it reads a
//! `Worker`'s free-port set and returns a mapping, leaving the actual
//! reservation (`Worker::bind_ports`) to the caller's aggregate-store save,
//! the same "pure decision, caller persists" split used throughout the
//! domain layer.

use crate::core::domain::worker::{PortMap, Worker};
use crate::core::errors::OrchestratorError;
use crate::core::ids::PortPlaceholder;

/// Picks `template.len()` free ports on `worker`, lowest first, and maps
/// each to its placeholder name. Fails with `PortAllocationFailed` if the
/// worker doesn't have enough free ports left (spec §4.5: "a definition
/// whose `port_template` exceeds the worker's remaining free ports is
/// never scheduled onto it").
pub fn allocate(worker: &Worker, template: &[PortPlaceholder]) -> Result<PortMap, OrchestratorError> {
    let free = worker.free_ports();
    if free.len() < template.len() {
        return Err(OrchestratorError::PortAllocationFailed(worker.id.to_string()));
    }
    let mut free_iter = free.into_iter();
    let mut mapping = PortMap::new();
    for placeholder in template {
        let port = free_iter
            .next()
            .ok_or_else(|| OrchestratorError::PortAllocationFailed(worker.id.to_string()))?;
        mapping.insert(placeholder.name.clone(), port);
    }
    Ok(mapping)
}

/// Whether `worker` has enough free capacity to host `template` at all,
/// used by the scheduler's placement scoring pass (spec §4.6 step 1)
/// without actually committing an allocation.
pub fn can_allocate(worker: &Worker, template: &[PortPlaceholder]) -> bool {
    worker.free_port_count() >= template.len()
}
