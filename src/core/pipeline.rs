// src/core/pipeline.rs

//! The instantiation pipeline (C12, spec §4.8): takes a SCHEDULED instance
//! through port allocation, artifact fetch, topology rewrite, lab-host
//! import, and lab start. Split into a synchronous `begin` (pure in-memory
//! work: allocate ports, bind them on the worker, flip the instance to
//! INSTANTIATING) and an async `run_remaining` (the I/O-bound steps),
//! because only the synchronous half needs to race the scheduler's next
//! tick — once an instance is INSTANTIATING it can never be re-dispatched.

use crate::core::adapters::ArtifactStore;
use crate::core::domain::instance::LabletInstance;
use crate::core::domain::worker::Worker;
use crate::core::errors::OrchestratorError;
use crate::core::events::DomainEvent;
use crate::core::ids::InstanceId;
use crate::core::ports;
use crate::core::retry::{retry_async, RetryPolicy};
use crate::core::state::EngineState;
use crate::core::store::{load_mutate_save, load_mutate_save_many};
use crate::core::topology;
use chrono::Utc;
use tracing::{info, warn};

/// Step 1 (spec §4.8): allocates ports on the bound worker and transitions
/// PENDING's successor, SCHEDULED, to INSTANTIATING. Synchronous and
/// in-memory only; must complete before the scheduler cycle that dispatched
/// `instance` returns, so a second cycle never sees it as SCHEDULED again.
pub async fn begin(state: &EngineState, instance: &LabletInstance) -> Result<(), OrchestratorError> {
    let Some(worker_id) = instance.worker_id else {
        return Err(OrchestratorError::Internal(format!(
            "instance {} has no worker_id while SCHEDULED",
            instance.id
        )));
    };
    let (definition, _) = state.definitions.load(&instance.definition_id.to_string())?;

    let (worker, _) = load_mutate_save(&state.workers, &worker_id.to_string(), |worker, version| {
        let allocation = ports::allocate(worker, &definition.port_template)?;
        let (next, kind) = worker.bind_ports(instance.id, allocation)?;
        Ok((next.clone(), DomainEvent::Worker { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
    })?;

    let allocated_ports = worker
        .port_allocations
        .iter()
        .find(|a| a.instance_id == instance.id)
        .map(|a| a.ports.clone())
        .ok_or_else(|| OrchestratorError::Internal("just-bound ports vanished".into()))?;

    load_mutate_save(&state.instances, &instance.id.to_string(), |inst, version| {
        let (next, kind) = inst.begin_instantiating(allocated_ports.clone())?;
        Ok((next.clone(), DomainEvent::Instance { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
    })?;

    Ok(())
}

/// Steps 2-5 (spec §4.8): fetch the artifact, verify its hash, rewrite the
/// topology, import and start the lab. Runs as a detached background task
/// spawned right after `begin` succeeds. On any unrecoverable failure the
/// instance is terminated and its reservations released via
/// `terminate_and_release`, rather than left stuck in INSTANTIATING (the
/// scheduler's reconcile step also catches this case on `instantiation_timeout`
/// as a backstop).
pub async fn run_remaining(state: std::sync::Arc<EngineState>, instance_id: InstanceId) {
    if let Err(e) = run_remaining_fallible(&state, instance_id).await {
        warn!(instance_id = %instance_id, error = %e, "instantiation pipeline failed, terminating instance");
        state.stats.record_instantiation_failure();
        if let Err(e) = terminate_and_release(&state, instance_id, &format!("pipeline_failure: {e}")).await {
            warn!(instance_id = %instance_id, error = %e, "failed to terminate instance after pipeline failure");
        }
    }
}

async fn run_remaining_fallible(state: &EngineState, instance_id: InstanceId) -> Result<(), OrchestratorError> {
    let (instance, _) = state.instances.load(&instance_id.to_string())?;
    let (definition, _) = state.definitions.load(&instance.definition_id.to_string())?;
    let worker_id = instance
        .worker_id
        .ok_or_else(|| OrchestratorError::Internal(format!("instance {instance_id} has no worker_id")))?;
    let (worker, _) = state.workers.load(&worker_id.to_string())?;
    let endpoint = worker
        .private_endpoint
        .clone()
        .ok_or_else(|| OrchestratorError::Internal(format!("worker {worker_id} has no private_endpoint")))?;
    let allocated_ports = instance
        .allocated_ports
        .clone()
        .ok_or_else(|| OrchestratorError::Internal(format!("instance {instance_id} has no allocated_ports")))?;

    let document = fetch_and_verify(state.artifacts.as_ref(), &definition.artifact_uri, &definition.topology_hash).await?;
    let rewritten = topology::rewrite(&document, &allocated_ports)?;

    let policy = RetryPolicy::for_external_call();
    let lab_host = state.lab_host.clone();
    let endpoint_for_import = endpoint.clone();
    let lab_id = retry_async(
        policy,
        |_attempt| {
            let lab_host = lab_host.clone();
            let endpoint = endpoint_for_import.clone();
            let rewritten = rewritten.clone();
            async move { lab_host.import_topology(&endpoint, &rewritten).await }
        },
        |e: &OrchestratorError| e.is_transient(),
    )
    .await?;

    let lab_host = state.lab_host.clone();
    let endpoint_for_start = endpoint.clone();
    let lab_id_for_start = lab_id.clone();
    retry_async(
        policy,
        |_attempt| {
            let lab_host = lab_host.clone();
            let endpoint = endpoint_for_start.clone();
            let lab_id = lab_id_for_start.clone();
            async move { lab_host.start_lab(&endpoint, &lab_id).await }
        },
        |e: &OrchestratorError| e.is_transient(),
    )
    .await?;

    load_mutate_save(&state.instances, &instance_id.to_string(), |inst, version| {
        let (next, kind) = inst.mark_running(lab_id.clone())?;
        Ok((next.clone(), DomainEvent::Instance { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
    })?;

    info!(instance_id = %instance_id, worker_id = %worker_id, "instance running");
    Ok(())
}

async fn fetch_and_verify(
    artifacts: &dyn ArtifactStore,
    artifact_uri: &str,
    expected_hash: &str,
) -> Result<String, OrchestratorError> {
    let policy = RetryPolicy::for_external_call();
    let document = retry_async(
        policy,
        |_attempt| artifacts.fetch_topology(artifact_uri),
        |e: &OrchestratorError| e.is_transient(),
    )
    .await?;
    let actual_hash = crate::core::adapters::artifact_store::compute_topology_hash(&document);
    if actual_hash != expected_hash {
        return Err(OrchestratorError::ExternalPermanent {
            system: "artifact-store".into(),
            message: format!("topology_hash mismatch for {artifact_uri}: expected {expected_hash}, got {actual_hash}"),
        });
    }
    Ok(document)
}

/// Terminates `instance_id` and releases whatever the worker was holding for
/// it (ports, capacity) in one CAS-retried, multi-event save, so a failure
/// partway through instantiation never leaves an orphaned reservation (spec
/// §7, §8). Shared by the pipeline's own failure path and the scheduler's
/// reconcile step (`instantiation_timeout`, `worker_lost`).
pub async fn terminate_and_release(
    state: &EngineState,
    instance_id: InstanceId,
    reason: &str,
) -> Result<(), OrchestratorError> {
    let (instance, _) = state.instances.load(&instance_id.to_string())?;
    if instance.state.is_terminal() {
        return Ok(());
    }

    if let Some(worker_id) = instance.worker_id
        && let Some((_, _)) = state.workers.try_load(&worker_id.to_string())
    {
        release_from_worker(state, worker_id, instance_id)?;
    }

    load_mutate_save(&state.instances, &instance_id.to_string(), |inst, version| {
        if inst.state.is_terminal() {
            return Err(OrchestratorError::InvalidTransition(format!("instance {instance_id} already terminal")));
        }
        let (next, kind) = inst.terminate(reason.to_string())?;
        Ok((next.clone(), DomainEvent::Instance { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
    })
    .map(|_| ())
    .or_else(|e| match e {
        OrchestratorError::InvalidTransition(_) => Ok(()),
        other => Err(other),
    })
}

fn release_from_worker(state: &EngineState, worker_id: crate::core::ids::WorkerId, instance_id: InstanceId) -> Result<(), OrchestratorError> {
    let definition_requirement = requirement_for(state, instance_id);
    load_mutate_save_many(&state.workers, &worker_id.to_string(), |worker: &Worker, version| {
        let (after_ports, ports_event) = worker.release_ports(instance_id);
        let (after_capacity, capacity_event) = after_ports.release_capacity(instance_id, &definition_requirement);
        let mut events = Vec::new();
        if let Some(kind) = ports_event {
            events.push(DomainEvent::Worker { id: worker.id, version: version + 1, at: Utc::now(), event: kind });
        }
        if let Some(kind) = capacity_event {
            events.push(DomainEvent::Worker { id: worker.id, version: version + 1, at: Utc::now(), event: kind });
        }
        Ok((after_capacity, events))
    })
    .map(|_| ())
}

/// Looks up the capacity shape to release for `instance_id`. Falls back to
/// an all-zero requirement (a pure no-op release) if the instance or its
/// definition has already been cleaned up, which `release_capacity`'s own
/// idempotence then absorbs harmlessly.
fn requirement_for(state: &EngineState, instance_id: InstanceId) -> crate::core::domain::definition::ResourceRequirements {
    state
        .instances
        .try_load(&instance_id.to_string())
        .and_then(|(instance, _)| state.definitions.try_load(&instance.definition_id.to_string()))
        .map(|(definition, _)| definition.resource_requirements)
        .unwrap_or(crate::core::domain::definition::ResourceRequirements { cpu: 0, memory_gb: 0, storage_gb: 0, node_count: 0 })
}
