// src/core/domain/worker.rs

//! The `Worker` aggregate (C5): state machine, capacity accounting, and
//! port-allocation bookkeeping for one cloud VM hosting labs (spec §3, §4.4).
//!
//! Like `spineldb`'s value objects (`CapacityConfig`, port ranges), capacity
//! and port range are small `Copy` structs; `Worker` itself is a plain
//! `Clone` record mutated only through the command methods below, each of
//! which returns a new `Worker` plus the events that occurred rather than
//! mutating `self` in place — callers thread the result through
//! `AggregateStore::save` (see `core::store`).

use crate::core::domain::definition::ResourceRequirements;
use crate::core::errors::OrchestratorError;
use crate::core::events::WorkerEventKind;
use crate::core::ids::{InstanceId, WorkerId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Pending,
    Provisioning,
    Running,
    Draining,
    Stopping,
    Stopped,
    Terminated,
}

impl WorkerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerStatus::Terminated)
    }
}

/// Componentwise capacity vector shared by `declared_capacity` and
/// `allocated_capacity` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Capacity {
    pub cpu: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    pub max_nodes: u32,
}

impl Capacity {
    pub fn fits(&self, requirement: &ResourceRequirements) -> bool {
        self.cpu >= requirement.cpu
            && self.memory_gb >= requirement.memory_gb
            && self.storage_gb >= requirement.storage_gb
            && self.max_nodes >= requirement.node_count
    }

    pub fn saturating_add(&self, requirement: &ResourceRequirements) -> Self {
        Self {
            cpu: self.cpu + requirement.cpu,
            memory_gb: self.memory_gb + requirement.memory_gb,
            storage_gb: self.storage_gb + requirement.storage_gb,
            max_nodes: self.max_nodes + requirement.node_count,
        }
    }

    pub fn saturating_sub(&self, requirement: &ResourceRequirements) -> Self {
        Self {
            cpu: self.cpu.saturating_sub(requirement.cpu),
            memory_gb: self.memory_gb.saturating_sub(requirement.memory_gb),
            storage_gb: self.storage_gb.saturating_sub(requirement.storage_gb),
            max_nodes: self.max_nodes.saturating_sub(requirement.node_count),
        }
    }

    /// `allocated/declared`, averaged across dimensions — the bin-packing
    /// utility score the scheduler maximizes (spec §4.6 step 1).
    pub fn utilization_against(&self, declared: &Capacity) -> f64 {
        let ratio = |used: u32, total: u32| {
            if total == 0 { 0.0 } else { used as f64 / total as f64 }
        };
        (ratio(self.cpu, declared.cpu)
            + ratio(self.memory_gb, declared.memory_gb)
            + ratio(self.storage_gb, declared.storage_gb)
            + ratio(self.max_nodes, declared.max_nodes))
            / 4.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.lo && port <= self.hi
    }

    pub fn capacity(&self) -> usize {
        (self.hi - self.lo) as usize + 1
    }
}

/// A placeholder name to concrete port mapping, bound to one instance.
pub type PortMap = BTreeMap<String, u16>;

/// One entry in `Worker::port_allocations` (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortAllocation {
    pub instance_id: InstanceId,
    pub ports: PortMap,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub template_name: String,
    pub region: String,
    pub instance_type: String,
    pub provider_instance_id: Option<String>,
    pub status: WorkerStatus,
    pub public_endpoint: Option<String>,
    pub private_endpoint: Option<String>,
    pub declared_capacity: Capacity,
    pub allocated_capacity: Capacity,
    pub port_range: PortRange,
    pub port_allocations: Vec<PortAllocation>,
    pub instance_ids: BTreeSet<InstanceId>,
    pub drain_started_at: Option<DateTime<Utc>>,
    pub license_state: String,
    pub last_health_at: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
}

impl Worker {
    pub fn new_pending(
        template_name: String,
        region: String,
        instance_type: String,
        declared_capacity: Capacity,
        port_range: PortRange,
        license_state: String,
        tags: BTreeMap<String, String>,
    ) -> (Self, WorkerEventKind) {
        let worker = Self {
            id: WorkerId::new(),
            template_name,
            region,
            instance_type,
            provider_instance_id: None,
            status: WorkerStatus::Pending,
            public_endpoint: None,
            private_endpoint: None,
            declared_capacity,
            allocated_capacity: Capacity::default(),
            port_range,
            port_allocations: Vec::new(),
            instance_ids: BTreeSet::new(),
            drain_started_at: None,
            license_state,
            last_health_at: None,
            tags,
        };
        (worker, WorkerEventKind::Created)
    }

    fn require_status(&self, expected: WorkerStatus) -> Result<(), OrchestratorError> {
        if self.status != expected {
            return Err(OrchestratorError::InvalidTransition(format!(
                "worker {} is {} not {}",
                self.id, self.status, expected
            )));
        }
        Ok(())
    }

    /// PENDING -> PROVISIONING once the cloud adapter has accepted the create call.
    pub fn mark_provisioning(&self, provider_instance_id: String) -> Result<(Self, WorkerEventKind), OrchestratorError> {
        self.require_status(WorkerStatus::Pending)?;
        let mut next = self.clone();
        next.status = WorkerStatus::Provisioning;
        next.provider_instance_id = Some(provider_instance_id);
        Ok((next, WorkerEventKind::Provisioning))
    }

    /// PROVISIONING -> RUNNING once the lab host endpoint is reachable.
    pub fn mark_running(
        &self,
        public_endpoint: String,
        private_endpoint: String,
    ) -> Result<(Self, WorkerEventKind), OrchestratorError> {
        self.require_status(WorkerStatus::Provisioning)?;
        let mut next = self.clone();
        next.status = WorkerStatus::Running;
        next.public_endpoint = Some(public_endpoint);
        next.private_endpoint = Some(private_endpoint);
        next.last_health_at = Some(Utc::now());
        Ok((next, WorkerEventKind::Running))
    }

    /// Reserves capacity for a scheduled instance (spec §4.6 step 1: "reserving
    /// capacity atomically in the same save" as the scheduling decision).
    pub fn reserve_capacity(
        &self,
        instance_id: InstanceId,
        requirement: &ResourceRequirements,
    ) -> Result<(Self, WorkerEventKind), OrchestratorError> {
        if self.status != WorkerStatus::Running {
            return Err(OrchestratorError::InvalidTransition(format!(
                "cannot reserve capacity on worker {} in state {}",
                self.id, self.status
            )));
        }
        if !self
            .declared_capacity
            .saturating_sub(&ResourceRequirements {
                cpu: self.allocated_capacity.cpu,
                memory_gb: self.allocated_capacity.memory_gb,
                storage_gb: self.allocated_capacity.storage_gb,
                node_count: self.allocated_capacity.max_nodes,
            })
            .fits(requirement)
        {
            return Err(OrchestratorError::CapacityExhausted(self.id.to_string()));
        }
        let mut next = self.clone();
        next.allocated_capacity = next.allocated_capacity.saturating_add(requirement);
        next.instance_ids.insert(instance_id);
        Ok((next, WorkerEventKind::CapacityReserved { instance_id }))
    }

    /// Releases capacity previously reserved for `instance_id`. Idempotent:
    /// releasing an instance that holds no reservation is a no-op, matching
    /// the port allocator's idempotent-release law (spec §8).
    pub fn release_capacity(
        &self,
        instance_id: InstanceId,
        requirement: &ResourceRequirements,
    ) -> (Self, Option<WorkerEventKind>) {
        if !self.instance_ids.contains(&instance_id) {
            return (self.clone(), None);
        }
        let mut next = self.clone();
        next.allocated_capacity = next.allocated_capacity.saturating_sub(requirement);
        next.instance_ids.remove(&instance_id);
        (next, Some(WorkerEventKind::CapacityReleased { instance_id }))
    }

    /// Records a port allocation produced by `core::ports::allocate` (spec §4.5).
    /// Validates the worker-side invariants (disjointness, range) defensively;
    /// the allocator is expected to have already guaranteed them.
    pub fn bind_ports(
        &self,
        instance_id: InstanceId,
        ports: PortMap,
    ) -> Result<(Self, WorkerEventKind), OrchestratorError> {
        if self.port_allocations.iter().any(|a| a.instance_id == instance_id) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "worker {} already holds a port allocation for instance {}",
                self.id, instance_id
            )));
        }
        let mut used: BTreeSet<u16> = self
            .port_allocations
            .iter()
            .flat_map(|a| a.ports.values().copied())
            .collect();
        for &port in ports.values() {
            if !self.port_range.contains(port) {
                return Err(OrchestratorError::PortAllocationFailed(self.id.to_string()));
            }
            if !used.insert(port) {
                return Err(OrchestratorError::PortAllocationFailed(self.id.to_string()));
            }
        }
        let count = ports.len();
        let mut next = self.clone();
        next.port_allocations.push(PortAllocation {
            instance_id,
            ports,
            allocated_at: Utc::now(),
        });
        Ok((next, WorkerEventKind::PortsBound { instance_id, count }))
    }

    /// Idempotent release (spec §8 law): releasing twice, or an instance with
    /// no allocation, is a no-op on the second call.
    pub fn release_ports(&self, instance_id: InstanceId) -> (Self, Option<WorkerEventKind>) {
        if !self.port_allocations.iter().any(|a| a.instance_id == instance_id) {
            return (self.clone(), None);
        }
        let mut next = self.clone();
        next.port_allocations.retain(|a| a.instance_id != instance_id);
        (next, Some(WorkerEventKind::PortsReleased { instance_id }))
    }

    /// The free port set, used by the first-fit allocator (spec §4.5).
    pub fn free_ports(&self) -> BTreeSet<u16> {
        let used: BTreeSet<u16> = self
            .port_allocations
            .iter()
            .flat_map(|a| a.ports.values().copied())
            .collect();
        (self.port_range.lo..=self.port_range.hi)
            .filter(|p| !used.contains(p))
            .collect()
    }

    pub fn free_port_count(&self) -> usize {
        let used: usize = self.port_allocations.iter().map(|a| a.ports.len()).sum();
        self.port_range.capacity().saturating_sub(used)
    }

    pub fn is_eligible_for_scheduling(&self) -> bool {
        self.status == WorkerStatus::Running
    }

    /// RUNNING -> DRAINING (spec §4.4, §4.7 scale-down).
    pub fn start_draining(&self) -> Result<(Self, WorkerEventKind), OrchestratorError> {
        self.require_status(WorkerStatus::Running)?;
        let mut next = self.clone();
        next.status = WorkerStatus::Draining;
        next.drain_started_at = Some(Utc::now());
        Ok((next, WorkerEventKind::DrainStarted))
    }

    /// DRAINING -> RUNNING, an operator cancelling a drain in progress.
    /// Resolves the spec's open question: the caller is responsible for
    /// using an `expected_version` CAS so a cancel racing a force-stop loses
    /// if the force-stop's save already landed (see `core::controller`).
    pub fn cancel_draining(&self) -> Result<(Self, WorkerEventKind), OrchestratorError> {
        self.require_status(WorkerStatus::Draining)?;
        let mut next = self.clone();
        next.status = WorkerStatus::Running;
        next.drain_started_at = None;
        Ok((next, WorkerEventKind::DrainCancelled))
    }

    /// DRAINING -> STOPPING, either because draining finished emptying the
    /// worker or because `drain_timeout` elapsed (spec §4.7).
    pub fn begin_stopping(&self) -> Result<(Self, WorkerEventKind), OrchestratorError> {
        self.require_status(WorkerStatus::Draining)?;
        let mut next = self.clone();
        next.status = WorkerStatus::Stopping;
        Ok((next, WorkerEventKind::Stopping))
    }

    /// STOPPING -> STOPPED, once the cloud adapter confirms the VM stopped.
    pub fn mark_stopped(&self) -> Result<(Self, WorkerEventKind), OrchestratorError> {
        self.require_status(WorkerStatus::Stopping)?;
        let mut next = self.clone();
        next.status = WorkerStatus::Stopped;
        Ok((next, WorkerEventKind::Stopped))
    }

    /// Admin termination, only reachable from RUNNING or STOPPED (spec §4.4).
    pub fn terminate(&self, reason: impl Into<String>) -> Result<(Self, WorkerEventKind), OrchestratorError> {
        if !matches!(self.status, WorkerStatus::Running | WorkerStatus::Stopped) {
            return Err(OrchestratorError::InvalidTransition(format!(
                "worker {} cannot be terminated from state {}",
                self.id, self.status
            )));
        }
        let mut next = self.clone();
        next.status = WorkerStatus::Terminated;
        Ok((next, WorkerEventKind::Terminated { reason: reason.into() }))
    }

    /// Invariants 1-3 and the port/instance_id consistency from spec §8
    /// invariant 6, exposed for property tests and defensive assertions
    /// after a save. Every instance holding a port allocation must also
    /// hold a capacity reservation (`reserve_capacity` always precedes
    /// `bind_ports` in the instantiation pipeline), but the reverse doesn't
    /// hold: a just-SCHEDULED instance has reserved capacity without having
    /// had ports bound yet, so `port_allocations`' instance set is a subset
    /// of `instance_ids`, never required to equal it.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        let mut total_ports = 0usize;
        for alloc in &self.port_allocations {
            for &port in alloc.ports.values() {
                total_ports += 1;
                if !self.port_range.contains(port) {
                    return Err(format!("port {port} outside range {:?}", self.port_range));
                }
                if !seen.insert(port) {
                    return Err(format!("duplicate port {port} across allocations"));
                }
            }
        }
        if total_ports != seen.len() {
            return Err("reserved port count mismatch".into());
        }
        if self.allocated_capacity.cpu > self.declared_capacity.cpu
            || self.allocated_capacity.memory_gb > self.declared_capacity.memory_gb
            || self.allocated_capacity.storage_gb > self.declared_capacity.storage_gb
            || self.allocated_capacity.max_nodes > self.declared_capacity.max_nodes
        {
            return Err("allocated capacity exceeds declared capacity".into());
        }
        let alloc_ids: BTreeSet<InstanceId> =
            self.port_allocations.iter().map(|a| a.instance_id).collect();
        if !alloc_ids.is_subset(&self.instance_ids) {
            return Err("port_allocations references an instance not in instance_ids".into());
        }
        Ok(())
    }
}
