// src/core/adapters/lab_host.rs

//! The lab-host client (C8): import/start/stop/wipe/delete labs on a
//! worker's endpoint, abstracted the same way `CloudAdapter` is.

use crate::core::errors::OrchestratorError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[async_trait]
pub trait LabHostClient: Send + Sync {
    /// Imports a rewritten topology document, returning the host's `lab_id`.
    async fn import_topology(&self, endpoint: &str, topology_yaml: &str) -> Result<String, OrchestratorError>;
    async fn start_lab(&self, endpoint: &str, lab_id: &str) -> Result<(), OrchestratorError>;
    async fn stop_lab(&self, endpoint: &str, lab_id: &str) -> Result<(), OrchestratorError>;
    async fn wipe_lab(&self, endpoint: &str, lab_id: &str) -> Result<(), OrchestratorError>;
    async fn delete_lab(&self, endpoint: &str, lab_id: &str) -> Result<(), OrchestratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabState {
    Imported,
    Started,
    Stopped,
}

/// In-memory stand-in; `endpoint` is accepted but not dialed anywhere.
pub struct InMemoryLabHostClient {
    next_id: AtomicU64,
    labs: DashMap<String, LabState>,
}

impl InMemoryLabHostClient {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), labs: DashMap::new() }
    }
}

impl Default for InMemoryLabHostClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LabHostClient for InMemoryLabHostClient {
    async fn import_topology(&self, _endpoint: &str, _topology_yaml: &str) -> Result<String, OrchestratorError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let lab_id = format!("lab-{n:08x}");
        self.labs.insert(lab_id.clone(), LabState::Imported);
        Ok(lab_id)
    }

    async fn start_lab(&self, _endpoint: &str, lab_id: &str) -> Result<(), OrchestratorError> {
        let mut state = self
            .labs
            .get_mut(lab_id)
            .ok_or_else(|| OrchestratorError::NotFound(lab_id.to_string()))?;
        *state = LabState::Started;
        Ok(())
    }

    async fn stop_lab(&self, _endpoint: &str, lab_id: &str) -> Result<(), OrchestratorError> {
        let mut state = self
            .labs
            .get_mut(lab_id)
            .ok_or_else(|| OrchestratorError::NotFound(lab_id.to_string()))?;
        *state = LabState::Stopped;
        Ok(())
    }

    async fn wipe_lab(&self, _endpoint: &str, lab_id: &str) -> Result<(), OrchestratorError> {
        if !self.labs.contains_key(lab_id) {
            return Err(OrchestratorError::NotFound(lab_id.to_string()));
        }
        Ok(())
    }

    async fn delete_lab(&self, _endpoint: &str, lab_id: &str) -> Result<(), OrchestratorError> {
        self.labs.remove(lab_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn import_start_stop_delete_round_trips() {
        let client = InMemoryLabHostClient::new();
        let lab_id = client.import_topology("https://worker", "nodes: []").await.unwrap();
        client.start_lab("https://worker", &lab_id).await.unwrap();
        client.stop_lab("https://worker", &lab_id).await.unwrap();
        client.delete_lab("https://worker", &lab_id).await.unwrap();
        assert!(client.stop_lab("https://worker", &lab_id).await.is_err());
    }
}
