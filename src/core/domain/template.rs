// src/core/domain/template.rs

//! `WorkerTemplate` (spec §3): the seeded blueprint the controller creates
//! workers from. Plain value object, not an aggregate — templates are
//! loaded once at startup from `config.toml` (`worker_templates[]`, spec
//! §6) and never mutated.

use crate::core::domain::worker::{Capacity, PortRange};
use crate::config::{PortRangeConfig, WorkerTemplateConfig};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerTemplate {
    pub name: String,
    pub instance_type: String,
    pub capacity: Capacity,
    pub license_type: String,
    pub ami_pattern: String,
    pub regions: Vec<String>,
    /// Resolved at load time: per-template range if set in config, else the
    /// global default (spec §9 open question: precedence is per-template ->
    /// per-worker -> default; this spec's external interfaces define no
    /// separate per-worker override, so that middle tier collapses into the
    /// global default here).
    pub port_range: PortRange,
    pub drain_timeout: Duration,
    pub default_tags: BTreeMap<String, String>,
}

impl From<(WorkerTemplateConfig, PortRangeConfig)> for WorkerTemplate {
    fn from((cfg, global_default): (WorkerTemplateConfig, PortRangeConfig)) -> Self {
        let port_range = cfg
            .port_range
            .map(|r| PortRange { lo: r.start, hi: r.end })
            .unwrap_or(PortRange { lo: global_default.start, hi: global_default.end });
        Self {
            name: cfg.name,
            instance_type: cfg.instance_type,
            capacity: Capacity {
                cpu: cfg.capacity.cpu_cores,
                memory_gb: cfg.capacity.memory_gb,
                storage_gb: cfg.capacity.storage_gb,
                max_nodes: cfg.capacity.max_nodes,
            },
            license_type: cfg.license_type,
            ami_pattern: cfg.ami_pattern,
            regions: cfg.regions,
            port_range,
            drain_timeout: cfg.drain_timeout,
            default_tags: cfg.tags,
        }
    }
}
