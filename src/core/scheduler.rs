// src/core/scheduler.rs

//! The Scheduler (C10, spec §4.6): singleton-by-lease, places PENDING
//! instances onto the best-fitting eligible worker, hands off SCHEDULED
//! instances to the Instantiation Pipeline at lead time, and reconciles
//! anomalies. Runs the same `tokio::select!` tick-or-shutdown loop shape
//! as `spineldb`'s `EvictionManager::run`, gated on `LeaderHandle::is_leader`
//! instead of always running.

use crate::config::Config;
use crate::core::domain::definition::{LabletDefinition, ResourceRequirements};
use crate::core::domain::instance::{InstanceStatus, LabletInstance};
use crate::core::domain::worker::Worker;
use crate::core::events::DomainEvent;
use crate::core::ids::WorkerId;
use crate::core::leader::LeaderHandle;
use crate::core::pipeline;
use crate::core::ports;
use crate::core::state::EngineState;
use crate::core::store::load_mutate_save;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Simple `*`-wildcard glob match (no other metacharacters), enough for
/// AMI patterns like `cml-*` (spec §3 `ami_pattern`). Implemented by hand
/// rather than pulling in a dedicated glob crate since the only supported
/// wildcard is a single trailing/leading/middle `*`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    if !text.starts_with(first) {
        return false;
    }
    let mut rest = &text[first.len()..];
    let mut last_was_wildcard_boundary = true;
    for part in parts {
        last_was_wildcard_boundary = true;
        if part.is_empty() {
            continue;
        }
        if let Some(idx) = rest.find(part) {
            rest = &rest[idx + part.len()..];
        } else {
            return false;
        }
    }
    last_was_wildcard_boundary || rest.is_empty()
}

/// Whether `worker` is a placement candidate for `definition` (spec §4.6
/// step 1 eligibility predicates). The "region matches" predicate from
/// spec.md collapses here to worker-template membership: the data model
/// (spec §3) carries no per-definition/per-instance region, so a worker is
/// already only ever created in one of its template's configured regions
/// (see DESIGN.md open-question resolution).
pub fn is_eligible(worker: &Worker, definition: &LabletDefinition, template_ami_pattern: &str) -> bool {
    if !worker.is_eligible_for_scheduling() {
        return false;
    }
    let license_ok = definition
        .license_affinity
        .iter()
        .any(|l| l.to_string() == worker.license_state);
    if !license_ok {
        return false;
    }
    if !glob_match(&definition.ami_pattern, template_ami_pattern) {
        return false;
    }
    if !ports::can_allocate(worker, &definition.port_template) {
        return false;
    }
    worker_fits(worker, &definition.resource_requirements)
}

fn worker_fits(worker: &Worker, requirement: &ResourceRequirements) -> bool {
    let free = crate::core::domain::worker::Capacity {
        cpu: worker.declared_capacity.cpu.saturating_sub(worker.allocated_capacity.cpu),
        memory_gb: worker.declared_capacity.memory_gb.saturating_sub(worker.allocated_capacity.memory_gb),
        storage_gb: worker.declared_capacity.storage_gb.saturating_sub(worker.allocated_capacity.storage_gb),
        max_nodes: worker.declared_capacity.max_nodes.saturating_sub(worker.allocated_capacity.max_nodes),
    };
    free.fits(requirement)
}

/// Post-placement utilization score, maximized to consolidate load onto
/// the most-loaded worker that still fits (spec §4.6 step 1).
fn score(worker: &Worker, requirement: &ResourceRequirements) -> f64 {
    let hypothetical = worker.allocated_capacity.saturating_add(requirement);
    hypothetical.utilization_against(&worker.declared_capacity)
}

pub struct Scheduler {
    state: Arc<EngineState>,
    leader: LeaderHandle,
    interval: std::time::Duration,
}

impl Scheduler {
    pub fn new(state: Arc<EngineState>, leader: LeaderHandle, config: &Config) -> Self {
        Self { state, leader, interval: config.scheduler.interval }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.leader.is_leader() {
                        self.run_cycle().await;
                    }
                }
                _ = self.leader.changed() => {}
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn run_cycle(&mut self) {
        self.place().await;
        self.dispatch().await;
        self.reconcile().await;
    }

    /// Step 1 (spec §4.6): place PENDING instances in
    /// `(timeslot_start ASC NULLS FIRST, created_at ASC, id ASC)` order,
    /// committing one decision at a time so later decisions in the same
    /// cycle observe the capacity taken by earlier ones.
    async fn place(&self) {
        let mut pending: Vec<LabletInstance> = self
            .state
            .instances
            .snapshot()
            .into_iter()
            .map(|(_, i, _)| i)
            .filter(|i| i.state == InstanceStatus::Pending)
            .collect();
        // `Option<T>: Ord` already sorts `None` before `Some(_)`, matching
        // "timeslot_start ASC NULLS FIRST" (spec §4.6 step 1) directly.
        pending.sort_by_key(|i| (i.timeslot_start, i.state_history[0].at, i.id));

        for instance in pending {
            let Ok((definition, _)) = self.state.definitions.load(&instance.definition_id.to_string()) else {
                continue;
            };
            if !definition.is_eligible_for_scheduling() {
                continue;
            }

            let workers: Vec<Worker> = self.state.workers.snapshot().into_iter().map(|(_, w, _)| w).collect();
            let best = workers
                .iter()
                .filter(|w| {
                    let ami = self
                        .state
                        .template_by_name(&w.template_name)
                        .map(|t| t.ami_pattern.as_str())
                        .unwrap_or("");
                    is_eligible(w, &definition, ami)
                })
                .max_by(|a, b| {
                    score(a, &definition.resource_requirements)
                        .partial_cmp(&score(b, &definition.resource_requirements))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(b.id.cmp(&a.id))
                });

            match best {
                Some(worker) => self.commit_placement(&instance, worker.id, &definition).await,
                None => self.emit_scale_up_hint(&definition),
            }
        }
    }

    async fn commit_placement(&self, instance: &LabletInstance, worker_id: WorkerId, definition: &LabletDefinition) {
        let requirement = definition.resource_requirements;
        let reserved = load_mutate_save(&self.state.workers, &worker_id.to_string(), |worker, version| {
            let (next, kind) = worker.reserve_capacity(instance.id, &requirement)?;
            Ok((next.clone(), DomainEvent::Worker { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
        });
        if let Err(e) = reserved {
            warn!(instance_id = %instance.id, worker_id = %worker_id, error = %e, "failed to reserve capacity, leaving instance PENDING");
            return;
        }
        let scheduled = load_mutate_save(&self.state.instances, &instance.id.to_string(), |inst, version| {
            let (next, kind) = inst.schedule(worker_id)?;
            Ok((next.clone(), DomainEvent::Instance { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
        });
        match scheduled {
            Ok(_) => {
                self.state.stats.record_placement();
                info!(instance_id = %instance.id, worker_id = %worker_id, "scheduled instance onto worker");
            }
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "failed to mark instance scheduled after reserving capacity");
            }
        }
    }

    fn emit_scale_up_hint(&self, definition: &LabletDefinition) {
        let Some(template) = self
            .state
            .templates
            .iter()
            .find(|t| definition.license_affinity.iter().any(|l| l.to_string() == t.license_type)
                && glob_match(&definition.ami_pattern, &t.ami_pattern)
                && t.capacity.fits(&definition.resource_requirements))
        else {
            warn!(definition_id = %definition.id, "no worker template can ever satisfy this definition");
            return;
        };
        let region = template.regions.first().cloned().unwrap_or_default();
        self.state.event_bus.publish(DomainEvent::ScaleUpRequested {
            template: template.name.clone(),
            region,
            at: Utc::now(),
        });
    }

    /// Step 2 (spec §4.6): hand off SCHEDULED instances within lead time
    /// to the instantiation pipeline. The port allocation + INSTANTIATING
    /// transition happens synchronously here so a later cycle can never
    /// re-select the same SCHEDULED instance; the remaining I/O-bound
    /// pipeline steps are spawned in the background.
    async fn dispatch(&self) {
        let lead_time = chrono::Duration::from_std(self.state.config.scheduler.lead_time).unwrap_or_default();
        let now = Utc::now();
        let scheduled: Vec<LabletInstance> = self
            .state
            .instances
            .snapshot()
            .into_iter()
            .map(|(_, i, _)| i)
            .filter(|i| i.state == InstanceStatus::Scheduled)
            .collect();
        for instance in scheduled {
            let start = instance.timeslot_start.unwrap_or(now);
            if start - now > lead_time {
                continue;
            }
            match pipeline::begin(&self.state, &instance).await {
                Ok(()) => {
                    let state = self.state.clone();
                    let instance_id = instance.id;
                    tokio::spawn(async move {
                        pipeline::run_remaining(state, instance_id).await;
                    });
                }
                Err(e) => warn!(instance_id = %instance.id, error = %e, "failed to begin instantiation"),
            }
        }
    }

    /// Step 3 (spec §4.6): anomaly detection.
    async fn reconcile(&self) {
        let timeout = chrono::Duration::from_std(self.state.config.scheduler.instantiation_timeout).unwrap_or_default();
        let now = Utc::now();
        let instances: Vec<LabletInstance> = self.state.instances.snapshot().into_iter().map(|(_, i, _)| i).collect();

        for instance in &instances {
            match instance.state {
                InstanceStatus::Instantiating => {
                    let started_at = instance
                        .state_history
                        .iter()
                        .rev()
                        .find(|r| r.state == InstanceStatus::Instantiating)
                        .map(|r| r.at)
                        .unwrap_or(now);
                    if now - started_at > timeout {
                        if let Err(e) = pipeline::terminate_and_release(&self.state, instance.id, "instantiation_timeout").await {
                            warn!(instance_id = %instance.id, error = %e, "failed to terminate timed-out instantiation");
                        }
                    }
                }
                InstanceStatus::Running | InstanceStatus::Collecting => {
                    if let Some(end) = instance.timeslot_end
                        && now > end
                    {
                        let _ = load_mutate_save(&self.state.instances, &instance.id.to_string(), |inst, version| {
                            let (next, kind) = inst.request_stopping()?;
                            Ok((next.clone(), DomainEvent::Instance { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
                        });
                    }
                }
                _ => {}
            }

            if instance.state.requires_worker()
                && let Some(worker_id) = instance.worker_id
            {
                let worker_gone = match self.state.workers.try_load(&worker_id.to_string()) {
                    Some((w, _)) => w.status == crate::core::domain::worker::WorkerStatus::Terminated,
                    None => true,
                };
                if worker_gone && !instance.state.is_terminal() {
                    if let Err(e) = pipeline::terminate_and_release(&self.state, instance.id, "worker_lost").await {
                        warn!(instance_id = %instance.id, error = %e, "failed to terminate instance with lost worker");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_trailing_wildcard() {
        assert!(glob_match("cml-*", "cml-2024"));
        assert!(!glob_match("cml-*", "other-2024"));
    }

    #[test]
    fn glob_matches_exact() {
        assert!(glob_match("cml-2024", "cml-2024"));
        assert!(!glob_match("cml-2024", "cml-2025"));
    }
}
