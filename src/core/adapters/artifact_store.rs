// src/core/adapters/artifact_store.rs

//! The object-store collaborator the instantiation pipeline fetches lab
//! artifacts from (spec §4.8 step 2). Out of scope per spec §1 ("the
//! artifact object store"); only an in-memory reference implementation
//! lives here.

use crate::core::errors::OrchestratorError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetches the raw topology document text for `artifact_uri`.
    async fn fetch_topology(&self, artifact_uri: &str) -> Result<String, OrchestratorError>;
}

/// Computes the integrity digest compared against `LabletDefinition::topology_hash`
/// (spec §4.8 step 2: "verify `topology_hash`"). Not a cryptographic hash —
/// the spec only requires detecting accidental corruption of the fetched
/// artifact, not resisting a malicious object store.
pub fn compute_topology_hash(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// In-memory stand-in, pre-seeded with `(artifact_uri -> document)` pairs.
pub struct InMemoryArtifactStore {
    documents: DashMap<String, String>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self { documents: DashMap::new() }
    }

    pub fn seed(&self, artifact_uri: impl Into<String>, document: impl Into<String>) {
        self.documents.insert(artifact_uri.into(), document.into());
    }
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn fetch_topology(&self, artifact_uri: &str) -> Result<String, OrchestratorError> {
        self.documents
            .get(artifact_uri)
            .map(|r| r.value().clone())
            .ok_or_else(|| OrchestratorError::ExternalPermanent {
                system: "artifact-store".into(),
                message: format!("no such artifact: {artifact_uri}"),
            })
    }
}
