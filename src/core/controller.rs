// src/core/controller.rs

//! The resource controller (C11, spec §4.7): singleton-by-lease, drives
//! Worker lifecycle against the `CloudAdapter` — scale-up when the
//! scheduler signals unmet demand, scale-down of idle workers down to each
//! template's warm floor, and the PROVISIONING -> RUNNING health poll.
//! Same `tokio::select!` tick-or-shutdown shape as `core::scheduler`.

use crate::config::Config;
use crate::core::adapters::cloud::CreateVmRequest;
use crate::core::domain::instance::{InstanceStatus, LabletInstance};
use crate::core::domain::worker::{Worker, WorkerStatus};
use crate::core::events::DomainEvent;
use crate::core::leader::LeaderHandle;
use crate::core::scheduler::is_eligible;
use crate::core::state::EngineState;
use crate::core::store::load_mutate_save;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct ResourceController {
    state: Arc<EngineState>,
    leader: LeaderHandle,
    interval: std::time::Duration,
    scale_up_events: broadcast::Receiver<DomainEvent>,
}

impl ResourceController {
    pub fn new(state: Arc<EngineState>, leader: LeaderHandle, config: &Config) -> Self {
        let scale_up_events = state.event_bus.subscribe();
        Self { state, leader, interval: config.controller.interval, scale_up_events }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.leader.is_leader() {
                        self.run_cycle().await;
                    } else {
                        self.drain_scale_up_hints();
                    }
                }
                _ = self.leader.changed() => {}
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn run_cycle(&mut self) {
        let hints = self.drain_scale_up_hints();
        self.scale_up(hints).await;
        self.poll_provisioning().await;
        self.scale_down().await;
        self.enforce_warm_floor().await;
    }

    /// Drains every `ScaleUpRequested` event published since the last call,
    /// deduplicating by `(template, region)` (spec §4.7: "collects scale-up
    /// hints since the last cycle"). Must be called every cycle regardless
    /// of leadership so the channel doesn't lag and drop events once this
    /// process does become leader.
    fn drain_scale_up_hints(&mut self) -> HashSet<(String, String)> {
        let mut hints = HashSet::new();
        loop {
            match self.scale_up_events.try_recv() {
                Ok(DomainEvent::ScaleUpRequested { template, region, .. }) => {
                    hints.insert((template, region));
                }
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            }
        }
        hints
    }

    /// Counts workers per template currently PENDING or PROVISIONING, used
    /// to deduplicate scale-up hints (spec §4.7: "deduplicate by counting
    /// PENDING/PROVISIONING workers of the same template before requesting
    /// another").
    fn in_flight_counts_by_template(&self) -> HashMap<String, u32> {
        let mut counts = HashMap::new();
        for (_, w, _) in self.state.workers.snapshot() {
            if matches!(w.status, WorkerStatus::Pending | WorkerStatus::Provisioning) {
                *counts.entry(w.template_name).or_insert(0) += 1;
            }
        }
        counts
    }

    async fn scale_up(&self, hints: HashSet<(String, String)>) {
        let mut in_flight = self.in_flight_counts_by_template();
        for (template_name, region) in hints {
            let Some(template) = self.state.template_by_name(&template_name) else {
                warn!(template = %template_name, "scale-up hint for unknown template");
                continue;
            };
            if in_flight.get(&template_name).copied().unwrap_or(0) >= 1 {
                info!(template = %template_name, "scale-up hint skipped, a worker for this template is already pending or provisioning");
                continue;
            }
            let region = if template.regions.contains(&region) {
                region
            } else {
                template.regions.first().cloned().unwrap_or(region)
            };
            self.create_worker(&template_name, &region, "scale_up_hint").await;
            *in_flight.entry(template_name).or_insert(0) += 1;
        }
    }

    async fn create_worker(&self, template_name: &str, region: &str, reason: &str) {
        let Some(template) = self.state.template_by_name(template_name).cloned() else {
            return;
        };
        let create_result = self
            .state
            .cloud
            .create(CreateVmRequest {
                instance_type: template.instance_type.clone(),
                region: region.to_string(),
                ami_pattern: template.ami_pattern.clone(),
                tags: template.default_tags.clone(),
            })
            .await;
        let handle = match create_result {
            Ok(h) => h,
            Err(e) => {
                warn!(template = %template_name, error = %e, "cloud adapter failed to create worker");
                return;
            }
        };

        let (worker, kind) = Worker::new_pending(
            template_name.to_string(),
            region.to_string(),
            template.instance_type.clone(),
            template.capacity,
            template.port_range,
            template.license_type.clone(),
            template.default_tags.clone(),
        );
        if let Err(e) = self.state.workers.create(
            worker.id.to_string(),
            worker.clone(),
            DomainEvent::Worker { id: worker.id, version: 0, at: Utc::now(), event: kind },
        ) {
            warn!(worker_id = %worker.id, error = %e, "failed to persist newly created worker");
            return;
        }

        let provisioned = load_mutate_save(&self.state.workers, &worker.id.to_string(), |w, version| {
            let (next, kind) = w.mark_provisioning(handle.provider_instance_id.clone())?;
            Ok((next.clone(), DomainEvent::Worker { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
        });
        if let Err(e) = provisioned {
            warn!(worker_id = %worker.id, error = %e, "failed to mark worker provisioning");
            return;
        }

        self.state.stats.record_scale_up();
        self.state.event_bus.publish(DomainEvent::ScalingAction {
            action: "scale_up".into(),
            worker_id: Some(worker.id),
            template: template_name.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.state.audit.record("scale_up", Some(worker.id), template_name, reason, "controller");
        info!(worker_id = %worker.id, template = %template_name, region = %region, "created worker");
    }

    /// Polls every PROVISIONING worker's cloud description; once the VM is
    /// running and has endpoints, the worker moves to RUNNING (spec §4.4).
    /// Not a literal spec step, but the controller is the only component
    /// that owns `CloudAdapter` calls against a worker's lifecycle, so the
    /// poll belongs here (see DESIGN.md).
    async fn poll_provisioning(&self) {
        let provisioning: Vec<Worker> = self
            .state
            .workers
            .snapshot()
            .into_iter()
            .map(|(_, w, _)| w)
            .filter(|w| w.status == WorkerStatus::Provisioning)
            .collect();
        for worker in provisioning {
            let Some(provider_instance_id) = worker.provider_instance_id.clone() else { continue };
            match self.state.cloud.describe(&provider_instance_id).await {
                Ok(desc) if desc.status == crate::core::adapters::cloud::CloudVmStatus::Running => {
                    let result = load_mutate_save(&self.state.workers, &worker.id.to_string(), |w, version| {
                        let (next, kind) = w.mark_running(desc.public_endpoint.clone(), desc.private_endpoint.clone())?;
                        Ok((next.clone(), DomainEvent::Worker { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
                    });
                    if result.is_ok() {
                        info!(worker_id = %worker.id, "worker reachable, now running");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(worker_id = %worker.id, error = %e, "failed to describe provisioning worker"),
            }
        }
    }

    /// Scale-down pass (spec §4.7): a RUNNING worker with no active
    /// reservations, above its template's warm floor, and with no imminent
    /// PENDING work that only it could serve, starts draining; a DRAINING
    /// worker past `drain_timeout` is force-stopped, terminating any
    /// instances still bound to it.
    async fn scale_down(&self) {
        let workers: Vec<Worker> = self.state.workers.snapshot().into_iter().map(|(_, w, _)| w).collect();
        let mut warm_counts: HashMap<String, u32> = HashMap::new();
        for w in &workers {
            if matches!(w.status, WorkerStatus::Running | WorkerStatus::Stopped) {
                *warm_counts.entry(w.template_name.clone()).or_insert(0) += 1;
            }
        }

        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.state.config.controller.scale_down_grace).unwrap_or_default();

        for worker in &workers {
            if worker.status == WorkerStatus::Running
                && worker.instance_ids.is_empty()
                && self.above_warm_floor(&worker.template_name, &warm_counts)
                && !self.is_sole_candidate_for_imminent_work(worker, &workers, now, grace)
            {
                let started = load_mutate_save(&self.state.workers, &worker.id.to_string(), |w, version| {
                    let (next, kind) = w.start_draining()?;
                    Ok((next.clone(), DomainEvent::Worker { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
                });
                if started.is_ok() {
                    *warm_counts.entry(worker.template_name.clone()).or_insert(1) -= 1;
                    self.state.stats.record_scale_down();
                    self.state.event_bus.publish(DomainEvent::ScalingAction {
                        action: "drain_started".into(),
                        worker_id: Some(worker.id),
                        template: worker.template_name.clone(),
                        reason: "no_active_instances".into(),
                        at: Utc::now(),
                    });
                    self.state.audit.record("drain_started", Some(worker.id), &worker.template_name, "no_active_instances", "controller");
                    info!(worker_id = %worker.id, "draining idle worker");
                }
            }

            if worker.status == WorkerStatus::Draining {
                self.advance_draining(worker).await;
            }

            if worker.status == WorkerStatus::Stopping {
                self.finish_stopping(worker).await;
            }
        }
    }

    fn above_warm_floor(&self, template_name: &str, warm_counts: &HashMap<String, u32>) -> bool {
        let floor = self.state.config.controller.min_warm.get(template_name).copied().unwrap_or(0);
        warm_counts.get(template_name).copied().unwrap_or(0) > floor
    }

    /// Whether `worker` is the only RUNNING worker that could host some
    /// PENDING instance starting within `grace` of `now` (spec §4.7 scale-down:
    /// "no SCHEDULED/PENDING work whose timeslot_start <= now + grace can
    /// only fit on it"). Work already bound to `worker` is covered by the
    /// `instance_ids.is_empty()` check in `scale_down` and doesn't need to be
    /// considered again here.
    fn is_sole_candidate_for_imminent_work(
        &self,
        worker: &Worker,
        workers: &[Worker],
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> bool {
        let imminent: Vec<LabletInstance> = self
            .state
            .instances
            .snapshot()
            .into_iter()
            .map(|(_, i, _)| i)
            .filter(|i| i.state == InstanceStatus::Pending)
            .filter(|i| i.timeslot_start.map(|start| start - now <= grace).unwrap_or(true))
            .collect();

        for instance in &imminent {
            let Ok((definition, _)) = self.state.definitions.load(&instance.definition_id.to_string()) else {
                continue;
            };
            let mut eligible = workers.iter().filter(|w| {
                w.status == WorkerStatus::Running
                    && {
                        let ami = self.state.template_by_name(&w.template_name).map(|t| t.ami_pattern.as_str()).unwrap_or("");
                        is_eligible(w, &definition, ami)
                    }
            });
            let only_candidate = match eligible.next() {
                Some(first) => first.id == worker.id && eligible.next().is_none(),
                None => false,
            };
            if only_candidate {
                return true;
            }
        }
        false
    }

    /// A draining worker with no instances left moves to STOPPING
    /// immediately; one past `drain_timeout` is force-stopped, terminating
    /// whatever instances remain (spec §4.7: "drain_timeout... any
    /// remaining instances are force-terminated, tagged `drain_forced`").
    async fn advance_draining(&self, worker: &Worker) {
        let Some(template) = self.state.template_by_name(&worker.template_name) else { return };
        let drain_started = worker.drain_started_at.unwrap_or_else(Utc::now);
        let timed_out = Utc::now() - drain_started
            > chrono::Duration::from_std(template.drain_timeout).unwrap_or_default();

        if worker.instance_ids.is_empty() || timed_out {
            if timed_out && !worker.instance_ids.is_empty() {
                for instance_id in worker.instance_ids.clone() {
                    if let Err(e) = crate::core::pipeline::terminate_and_release(&self.state, instance_id, "drain_forced").await {
                        warn!(instance_id = %instance_id, error = %e, "failed to force-terminate instance during drain timeout");
                    }
                }
            }
            let stopped = load_mutate_save(&self.state.workers, &worker.id.to_string(), |w, version| {
                let (next, kind) = w.begin_stopping()?;
                Ok((next.clone(), DomainEvent::Worker { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
            });
            if stopped.is_ok() {
                let reason = if timed_out { "drain_timeout" } else { "drain_complete" };
                self.state.audit.record("stopping", Some(worker.id), &worker.template_name, reason, "controller");
            }
        }
    }

    async fn finish_stopping(&self, worker: &Worker) {
        let Some(provider_instance_id) = worker.provider_instance_id.clone() else { return };
        if let Err(e) = self.state.cloud.stop(&provider_instance_id).await {
            warn!(worker_id = %worker.id, error = %e, "cloud adapter failed to stop worker");
            return;
        }
        let _ = load_mutate_save(&self.state.workers, &worker.id.to_string(), |w, version| {
            let (next, kind) = w.mark_stopped()?;
            Ok((next.clone(), DomainEvent::Worker { id: next.id, version: version + 1, at: Utc::now(), event: kind }))
        });
    }

    /// Creates new workers for any template whose warm (RUNNING+STOPPED)
    /// count has fallen below `controller.min_warm` (spec §4.7 warm floor).
    /// Resolves the spec's open question on resurrecting STOPPED workers:
    /// this engine never transitions STOPPED back to RUNNING (no such
    /// transition exists in the Worker state machine), so the warm floor is
    /// maintained purely by creating fresh workers, never by un-stopping one.
    async fn enforce_warm_floor(&self) {
        let workers: Vec<Worker> = self.state.workers.snapshot().into_iter().map(|(_, w, _)| w).collect();
        let mut warm_counts: HashMap<String, u32> = HashMap::new();
        for w in &workers {
            if matches!(w.status, WorkerStatus::Running | WorkerStatus::Stopped) {
                *warm_counts.entry(w.template_name.clone()).or_insert(0) += 1;
            }
        }
        let min_warm = self.state.config.controller.min_warm.clone();
        for (template_name, floor) in min_warm {
            let current = warm_counts.get(&template_name).copied().unwrap_or(0);
            if current < floor {
                let Some(template) = self.state.template_by_name(&template_name) else { continue };
                let region = template.regions.first().cloned().unwrap_or_default();
                self.create_worker(&template_name, &region, "warm_floor").await;
            }
        }
    }
}
