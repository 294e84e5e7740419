// src/core/adapters/cloud.rs

//! The cloud adapter (C7): create/start/stop/terminate/describe for VMs.
//! Abstracted behind a trait so the engine never links a provider SDK,
//! mirroring how `spineldb`'s cluster/replication code is written against
//! its own transport traits rather than a concrete socket type.

use crate::core::errors::OrchestratorError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct CreateVmRequest {
    pub instance_type: String,
    pub region: String,
    pub ami_pattern: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ProviderVmHandle {
    pub provider_instance_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudVmStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct VmDescription {
    pub status: CloudVmStatus,
    pub public_endpoint: String,
    pub private_endpoint: String,
}

#[async_trait]
pub trait CloudAdapter: Send + Sync {
    async fn create(&self, req: CreateVmRequest) -> Result<ProviderVmHandle, OrchestratorError>;
    async fn start(&self, provider_instance_id: &str) -> Result<(), OrchestratorError>;
    async fn stop(&self, provider_instance_id: &str) -> Result<(), OrchestratorError>;
    async fn terminate(&self, provider_instance_id: &str) -> Result<(), OrchestratorError>;
    async fn describe(&self, provider_instance_id: &str) -> Result<VmDescription, OrchestratorError>;
}

/// A deterministic in-memory stand-in used by tests and the demonstration
/// binary. VMs boot instantly and are reachable at a synthesized loopback
/// endpoint — there is no real network behind this.
pub struct InMemoryCloudAdapter {
    next_id: AtomicU64,
    vms: DashMap<String, VmDescription>,
}

impl InMemoryCloudAdapter {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), vms: DashMap::new() }
    }
}

impl Default for InMemoryCloudAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudAdapter for InMemoryCloudAdapter {
    async fn create(&self, req: CreateVmRequest) -> Result<ProviderVmHandle, OrchestratorError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let provider_instance_id = format!("i-{n:08x}");
        self.vms.insert(
            provider_instance_id.clone(),
            VmDescription {
                // This double boots instantly rather than modeling a real
                // provisioning delay; the worker still passes through
                // Worker::Provisioning before the controller observes this.
                status: CloudVmStatus::Running,
                public_endpoint: format!("https://{provider_instance_id}.{}.example.invalid", req.region),
                private_endpoint: format!("https://{provider_instance_id}.internal.invalid"),
            },
        );
        Ok(ProviderVmHandle { provider_instance_id })
    }

    async fn start(&self, provider_instance_id: &str) -> Result<(), OrchestratorError> {
        let mut vm = self
            .vms
            .get_mut(provider_instance_id)
            .ok_or_else(|| OrchestratorError::NotFound(provider_instance_id.to_string()))?;
        vm.status = CloudVmStatus::Running;
        Ok(())
    }

    async fn stop(&self, provider_instance_id: &str) -> Result<(), OrchestratorError> {
        let mut vm = self
            .vms
            .get_mut(provider_instance_id)
            .ok_or_else(|| OrchestratorError::NotFound(provider_instance_id.to_string()))?;
        vm.status = CloudVmStatus::Stopped;
        Ok(())
    }

    async fn terminate(&self, provider_instance_id: &str) -> Result<(), OrchestratorError> {
        let mut vm = self
            .vms
            .get_mut(provider_instance_id)
            .ok_or_else(|| OrchestratorError::NotFound(provider_instance_id.to_string()))?;
        vm.status = CloudVmStatus::Terminated;
        Ok(())
    }

    async fn describe(&self, provider_instance_id: &str) -> Result<VmDescription, OrchestratorError> {
        self.vms
            .get(provider_instance_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| OrchestratorError::NotFound(provider_instance_id.to_string()))
    }
}
