// src/core/audit.rs

//! Append-only audit log for scaling actions (spec §4.7, §6: "Audit log:
//! append-only collection... retention >= 3 months"). Retention itself is a
//! persistence-layer concern out of scope (spec §1); this in-memory log
//! keeps every entry for the life of the process, which is enough for the
//! demonstration binary and for tests asserting on scaling decisions.

use crate::core::ids::WorkerId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub worker_id: Option<WorkerId>,
    pub template: String,
    pub reason: String,
    pub triggered_by: String,
}

pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }

    pub fn record(
        &self,
        action: impl Into<String>,
        worker_id: Option<WorkerId>,
        template: impl Into<String>,
        reason: impl Into<String>,
        triggered_by: impl Into<String>,
    ) {
        self.entries.lock().push(AuditEntry {
            timestamp: Utc::now(),
            action: action.into(),
            worker_id,
            template: template.into(),
            reason: reason.into(),
            triggered_by: triggered_by.into(),
        });
    }

    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
