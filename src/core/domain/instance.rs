// src/core/domain/instance.rs

//! The `LabletInstance` aggregate (C6): the reservation state machine
//! (spec §3, §4.3). Same shape as `Worker`: every command method takes
//! `&self` and returns a new value plus the event(s) produced, leaving
//! persistence and event publication to `core::store::AggregateStore`.

use crate::core::errors::OrchestratorError;
use crate::core::events::InstanceEventKind;
use crate::core::ids::{DefinitionId, InstanceId, WorkerId};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Pending,
    Scheduled,
    Instantiating,
    Running,
    Collecting,
    Grading,
    Stopping,
    Stopped,
    Archived,
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Terminated | InstanceStatus::Archived)
    }

    /// True once the state carries a bound `worker_id` per the worker-id
    /// invariant (spec §8 invariant 5): every state from SCHEDULED onward.
    pub fn requires_worker(self) -> bool {
        !matches!(self, InstanceStatus::Pending | InstanceStatus::Terminated)
    }
}

/// One entry in the append-only `state_history` (spec §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StateTransitionRecord {
    pub state: InstanceStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LabletInstance {
    pub id: InstanceId,
    pub definition_id: DefinitionId,
    pub definition_version: semver::Version,
    pub owner_id: String,
    pub timeslot_start: Option<DateTime<Utc>>,
    pub timeslot_end: Option<DateTime<Utc>>,
    pub state: InstanceStatus,
    pub worker_id: Option<WorkerId>,
    pub allocated_ports: Option<BTreeMap<String, u16>>,
    pub lab_id: Option<String>,
    pub grading_score: Option<f64>,
    pub state_history: Vec<StateTransitionRecord>,
}

impl LabletInstance {
    pub fn new(
        definition_id: DefinitionId,
        definition_version: semver::Version,
        owner_id: String,
        timeslot_start: Option<DateTime<Utc>>,
        timeslot_end: Option<DateTime<Utc>>,
    ) -> Result<(Self, InstanceEventKind), OrchestratorError> {
        if let (Some(start), Some(end)) = (timeslot_start, timeslot_end)
            && end <= start
        {
            return Err(OrchestratorError::InvalidArgument(
                "timeslot_end must be after timeslot_start".into(),
            ));
        }
        let now = Utc::now();
        let instance = Self {
            id: InstanceId::new(),
            definition_id,
            definition_version,
            owner_id,
            timeslot_start,
            timeslot_end,
            state: InstanceStatus::Pending,
            worker_id: None,
            allocated_ports: None,
            lab_id: None,
            grading_score: None,
            state_history: vec![StateTransitionRecord {
                state: InstanceStatus::Pending,
                at: now,
                reason: None,
            }],
        };
        Ok((instance, InstanceEventKind::Created))
    }

    fn require_state(&self, expected: InstanceStatus) -> Result<(), OrchestratorError> {
        if self.state != expected {
            return Err(OrchestratorError::InvalidTransition(format!(
                "instance {} is {} not {}",
                self.id, self.state, expected
            )));
        }
        Ok(())
    }

    fn push_history(&mut self, state: InstanceStatus, reason: Option<String>) {
        self.state = state;
        self.state_history.push(StateTransitionRecord {
            state,
            at: Utc::now(),
            reason,
        });
    }

    /// PENDING -> SCHEDULED (spec §4.6 step 1): binds `worker_id`. Capacity
    /// reservation itself happens on the `Worker` aggregate in the same
    /// scheduler-cycle save (see `core::scheduler`).
    pub fn schedule(&self, worker_id: WorkerId) -> Result<(Self, InstanceEventKind), OrchestratorError> {
        self.require_state(InstanceStatus::Pending)?;
        let mut next = self.clone();
        next.worker_id = Some(worker_id);
        next.push_history(InstanceStatus::Scheduled, None);
        Ok((next, InstanceEventKind::Scheduled { worker_id }))
    }

    /// SCHEDULED -> INSTANTIATING (spec §4.6 step 2 / §4.8 step 1): records
    /// the port allocation and flips the state so the pipeline can proceed.
    /// `allocated_ports`, once set, is immutable until STOPPING or later
    /// (spec §3 invariant), so this is the only place it is ever assigned.
    pub fn begin_instantiating(
        &self,
        allocated_ports: BTreeMap<String, u16>,
    ) -> Result<(Self, InstanceEventKind), OrchestratorError> {
        self.require_state(InstanceStatus::Scheduled)?;
        if self.worker_id.is_none() {
            return Err(OrchestratorError::Internal(format!(
                "instance {} has no worker_id while SCHEDULED",
                self.id
            )));
        }
        let mut next = self.clone();
        next.allocated_ports = Some(allocated_ports);
        next.push_history(InstanceStatus::Instantiating, None);
        Ok((next, InstanceEventKind::PortsAllocated))
    }

    /// INSTANTIATING -> RUNNING (spec §4.8 step 5).
    pub fn mark_running(&self, lab_id: String) -> Result<(Self, InstanceEventKind), OrchestratorError> {
        self.require_state(InstanceStatus::Instantiating)?;
        let mut next = self.clone();
        next.lab_id = Some(lab_id.clone());
        next.push_history(InstanceStatus::Running, None);
        Ok((next, InstanceEventKind::Running { lab_id }))
    }

    /// RUNNING -> COLLECTING, a manual/API collection trigger (spec §4.3).
    pub fn begin_collecting(&self) -> Result<(Self, InstanceEventKind), OrchestratorError> {
        self.require_state(InstanceStatus::Running)?;
        let mut next = self.clone();
        next.push_history(InstanceStatus::Collecting, None);
        Ok((next, InstanceEventKind::Collecting))
    }

    /// COLLECTING -> GRADING, triggered by an inbound
    /// `assessment.collection.completed` CloudEvent (spec §4.10).
    pub fn begin_grading(&self) -> Result<(Self, InstanceEventKind), OrchestratorError> {
        self.require_state(InstanceStatus::Collecting)?;
        let mut next = self.clone();
        next.push_history(InstanceStatus::Grading, None);
        Ok((next, InstanceEventKind::Grading))
    }

    /// GRADING -> STOPPING, triggered by `assessment.grading.completed`;
    /// stores the score (spec §4.3, §4.10).
    pub fn complete_grading(&self, score: f64) -> Result<(Self, InstanceEventKind), OrchestratorError> {
        self.require_state(InstanceStatus::Grading)?;
        let mut next = self.clone();
        next.grading_score = Some(score);
        next.push_history(InstanceStatus::Stopping, None);
        Ok((next, InstanceEventKind::GradingCompleted { score }))
    }

    /// A direct request to stop (e.g. the scheduler's reconcile step
    /// detecting `timeslot_end` passed while RUNNING/COLLECTING, spec
    /// §4.6 step 3).
    pub fn request_stopping(&self) -> Result<(Self, InstanceEventKind), OrchestratorError> {
        if !matches!(
            self.state,
            InstanceStatus::Running | InstanceStatus::Collecting | InstanceStatus::Grading
        ) {
            return Err(OrchestratorError::InvalidTransition(format!(
                "instance {} cannot move to STOPPING from {}",
                self.id, self.state
            )));
        }
        let mut next = self.clone();
        next.push_history(InstanceStatus::Stopping, None);
        Ok((next, InstanceEventKind::StoppingRequested))
    }

    /// STOPPING -> STOPPED, once the lab host confirms the lab stopped.
    pub fn mark_stopped(&self) -> Result<(Self, InstanceEventKind), OrchestratorError> {
        self.require_state(InstanceStatus::Stopping)?;
        let mut next = self.clone();
        next.push_history(InstanceStatus::Stopped, None);
        Ok((next, InstanceEventKind::Stopped))
    }

    /// STOPPED -> ARCHIVED, post-grading or on a retention TTL.
    pub fn archive(&self) -> Result<(Self, InstanceEventKind), OrchestratorError> {
        self.require_state(InstanceStatus::Stopped)?;
        let mut next = self.clone();
        next.push_history(InstanceStatus::Archived, None);
        Ok((next, InstanceEventKind::Archived))
    }

    /// Terminal failure path, reachable from any non-terminal state (spec
    /// §4.3). Ports and capacity release are the caller's responsibility in
    /// the same save (see `core::pipeline`, `core::scheduler`), so that a
    /// failed transition never leaves orphaned allocations (spec §7).
    pub fn terminate(&self, reason: impl Into<String>) -> Result<(Self, InstanceEventKind), OrchestratorError> {
        if self.state.is_terminal() {
            return Err(OrchestratorError::InvalidTransition(format!(
                "instance {} is already {}",
                self.id, self.state
            )));
        }
        let reason = reason.into();
        let mut next = self.clone();
        next.push_history(InstanceStatus::Terminated, Some(reason.clone()));
        Ok((next, InstanceEventKind::Terminated { reason }))
    }

    /// Invariant 4 and the ports/worker_id immutability rules from spec §8.
    pub fn check_invariants(&self) -> Result<(), String> {
        let first = self
            .state_history
            .first()
            .ok_or("state_history must not be empty")?;
        if first.state != InstanceStatus::Pending {
            return Err("state_history[0] must be PENDING".into());
        }
        let last = self.state_history.last().ok_or("state_history must not be empty")?;
        if last.state != self.state {
            return Err("state_history[-1] must match current state".into());
        }
        if self.state.requires_worker() && self.worker_id.is_none() {
            return Err(format!("instance {} in {} has no worker_id", self.id, self.state));
        }
        if let (Some(start), Some(end)) = (self.timeslot_start, self.timeslot_end)
            && end <= start
        {
            return Err("timeslot_end must be after timeslot_start".into());
        }
        Ok(())
    }
}
