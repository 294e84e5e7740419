// src/core/domain/definition.rs

//! `LabletDefinition`: the immutable-once-published template a `LabletInstance`
//! reserves (spec §3). Mutated only by administrative commands, never by the
//! scheduler/controller/pipeline.

use crate::core::errors::OrchestratorError;
use crate::core::ids::{DefinitionId, PortPlaceholder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefinitionStatus {
    Draft,
    Published,
    Deprecated,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum LicenseAffinity {
    Personal,
    Enterprise,
    Evaluation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    pub node_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabletDefinition {
    pub id: DefinitionId,
    pub name: String,
    pub version: semver::Version,
    pub artifact_uri: String,
    pub topology_hash: String,
    pub resource_requirements: ResourceRequirements,
    pub license_affinity: Vec<LicenseAffinity>,
    pub port_template: Vec<PortPlaceholder>,
    pub ami_pattern: String,
    pub status: DefinitionStatus,
}

impl LabletDefinition {
    /// Creates a new definition in the `DRAFT` state (spec §3 lifecycle:
    /// "created DRAFT").
    pub fn draft(
        name: String,
        version: semver::Version,
        artifact_uri: String,
        topology_hash: String,
        resource_requirements: ResourceRequirements,
        license_affinity: Vec<LicenseAffinity>,
        port_template: Vec<PortPlaceholder>,
        ami_pattern: String,
    ) -> Self {
        Self {
            id: DefinitionId::new(),
            name,
            version,
            artifact_uri,
            topology_hash,
            resource_requirements,
            license_affinity,
            port_template,
            ami_pattern,
            status: DefinitionStatus::Draft,
        }
    }

    /// DRAFT -> PUBLISHED once the artifact is synced to the object store.
    pub fn publish(&self) -> Result<Self, OrchestratorError> {
        if self.status != DefinitionStatus::Draft {
            return Err(OrchestratorError::InvalidTransition(format!(
                "cannot publish definition {} from {:?}",
                self.id, self.status
            )));
        }
        Ok(Self {
            status: DefinitionStatus::Published,
            ..self.clone()
        })
    }

    /// PUBLISHED -> DEPRECATED, terminal.
    pub fn deprecate(&self) -> Result<Self, OrchestratorError> {
        if self.status != DefinitionStatus::Published {
            return Err(OrchestratorError::InvalidTransition(format!(
                "cannot deprecate definition {} from {:?}",
                self.id, self.status
            )));
        }
        Ok(Self {
            status: DefinitionStatus::Deprecated,
            ..self.clone()
        })
    }

    pub fn is_eligible_for_scheduling(&self) -> bool {
        self.status == DefinitionStatus::Published
    }
}
