// src/core/errors.rs

//! Defines the primary error type for the orchestration engine.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all failures the core distinguishes
/// and surfaces (spec §7). Using `thiserror` gives clean `Display` impls
/// and automatic `From` conversions at the boundaries that produce them.
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    /// Rejected before any side effect; schema/validation failures.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// State machine violation; no mutation was applied.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The referenced aggregate does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure, surfaced after bounded internal retries.
    #[error("conflict updating {aggregate_id}: expected version {expected}, found {actual}")]
    Conflict {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },

    /// No eligible worker for a pending instance. Not a user-facing error on
    /// its own; the scheduler records it and leaves the instance PENDING.
    #[error("capacity exhausted for {0}")]
    CapacityExhausted(String),

    /// The port allocator could not produce a collision-free mapping.
    #[error("port allocation failed on worker {0}")]
    PortAllocationFailed(String),

    /// Retryable network/5xx/rate-limit error from an external collaborator.
    #[error("transient error calling {system} (attempt {attempt}): {message}")]
    ExternalTransient {
        system: String,
        attempt: u32,
        message: String,
    },

    /// 4xx or schema error from an external system; fails fast, never retried.
    #[error("permanent error calling {system}: {message}")]
    ExternalPermanent { system: String, message: String },

    /// Surfaced from the transport boundary; the core never generates these itself.
    #[error("unauthorized")]
    Unauthorized,

    /// Surfaced from the transport boundary; the core never generates these itself.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A bounded wait was exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// An SSE subscriber's bounded queue overflowed and was disconnected.
    #[error("queue overflow for subscriber {0}")]
    QueueOverflow(String),

    /// A lease-holding loop attempted a mutation with a stale epoch.
    #[error("stale lease epoch for {lease}: held {current}, attempted {attempted}")]
    StaleLeaseEpoch {
        lease: String,
        current: u64,
        attempted: u64,
    },

    /// Wraps an I/O failure from a collaborator (artifact fetch, file-backed config, ...).
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// Catch-all for unexpected internal failures that don't fit another kind.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// True for error kinds the pipeline's retry loop (§4.8) should retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ExternalTransient { .. } | OrchestratorError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        OrchestratorError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(e: reqwest::Error) -> Self {
        let system = e
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "cloudevents-sink".into());
        if e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error()) {
            OrchestratorError::ExternalTransient {
                system,
                attempt: 1,
                message: e.to_string(),
            }
        } else {
            OrchestratorError::ExternalPermanent {
                system,
                message: e.to_string(),
            }
        }
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(e: serde_yaml::Error) -> Self {
        OrchestratorError::InvalidArgument(format!("invalid topology document: {e}"))
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::InvalidArgument(format!("invalid JSON payload: {e}"))
    }
}
