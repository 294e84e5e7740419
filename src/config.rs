// src/config.rs

//! Loads and validates `config.toml` (SPEC_FULL §A1), the way
//! `spineldb::config::Config::from_file` parses a `RawConfig` with
//! `#[serde(default = "...")]` fallbacks and then runs a `validate` pass.

use crate::core::domain::definition::ResourceRequirements;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(with = "humantime_serde", default = "default_scheduler_interval")]
    pub interval: Duration,
    #[serde(with = "humantime_serde", default = "default_lead_time")]
    pub lead_time: Duration,
    #[serde(with = "humantime_serde", default = "default_instantiation_timeout")]
    pub instantiation_timeout: Duration,
}

fn default_scheduler_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_lead_time() -> Duration {
    Duration::from_secs(35 * 60)
}
fn default_instantiation_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: default_scheduler_interval(),
            lead_time: default_lead_time(),
            instantiation_timeout: default_instantiation_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(with = "humantime_serde", default = "default_controller_interval")]
    pub interval: Duration,
    #[serde(with = "humantime_serde", default = "default_scale_down_grace")]
    pub scale_down_grace: Duration,
    #[serde(with = "humantime_serde", default = "default_scale_up_safety")]
    pub scale_up_safety: Duration,
    /// Per-template minimum warm (RUNNING+STOPPED) worker count (spec §4.7).
    #[serde(default)]
    pub min_warm: BTreeMap<String, u32>,
}

fn default_controller_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_scale_down_grace() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_scale_up_safety() -> Duration {
    Duration::from_secs(15 * 60)
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval: default_controller_interval(),
            scale_down_grace: default_scale_down_grace(),
            scale_up_safety: default_scale_up_safety(),
            min_warm: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    #[serde(default = "default_sse_queue_depth")]
    pub queue_depth: usize,
    #[serde(with = "humantime_serde", default = "default_sse_heartbeat_interval")]
    pub heartbeat_interval: Duration,
}

fn default_sse_queue_depth() -> usize {
    1024
}
fn default_sse_heartbeat_interval() -> Duration {
    Duration::from_secs(15)
}

impl Default for SseConfig {
    fn default() -> Self {
        Self { queue_depth: default_sse_queue_depth(), heartbeat_interval: default_sse_heartbeat_interval() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEventsConfig {
    pub sink_url: Option<String>,
    #[serde(default = "default_cloudevents_source")]
    pub source: String,
    #[serde(with = "humantime_serde", default = "default_dedup_ttl")]
    pub dedup_ttl: Duration,
}

fn default_cloudevents_source() -> String {
    "https://cml-orchestrator.internal/engine".to_string()
}
fn default_dedup_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for CloudEventsConfig {
    fn default() -> Self {
        Self { sink_url: None, source: default_cloudevents_source(), dedup_ttl: default_dedup_ttl() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    #[serde(with = "humantime_serde", default = "default_lease_ttl")]
    pub lease_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_lease_renew")]
    pub lease_renew: Duration,
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(15)
}
fn default_lease_renew() -> Duration {
    Duration::from_secs(5)
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self { lease_ttl: default_lease_ttl(), lease_renew: default_lease_renew() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_retry_base")]
    pub base: Duration,
    #[serde(with = "humantime_serde", default = "default_retry_cap")]
    pub cap: Duration,
}

fn default_retry_max_attempts() -> u32 {
    5
}
fn default_retry_base() -> Duration {
    Duration::from_secs(1)
}
fn default_retry_cap() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base: default_retry_base(),
            cap: default_retry_cap(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRangeConfig {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self { start: 2000, end: 9999 }
    }
}

/// Seed entry for a `WorkerTemplate` (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTemplateConfig {
    pub name: String,
    pub instance_type: String,
    pub capacity: TemplateCapacity,
    pub license_type: String,
    pub ami_pattern: String,
    pub regions: Vec<String>,
    #[serde(default)]
    pub port_range: Option<PortRangeConfig>,
    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    pub drain_timeout: Duration,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(4 * 60 * 60)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TemplateCapacity {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    pub max_nodes: u32,
}

impl From<TemplateCapacity> for ResourceRequirements {
    fn from(c: TemplateCapacity) -> Self {
        ResourceRequirements { cpu: c.cpu_cores, memory_gb: c.memory_gb, storage_gb: c.storage_gb, node_count: c.max_nodes }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    scheduler: SchedulerConfig,
    #[serde(default)]
    controller: ControllerConfig,
    #[serde(default)]
    sse: SseConfig,
    #[serde(default)]
    cloudevents: CloudEventsConfig,
    #[serde(default)]
    leader: LeaderConfig,
    #[serde(default)]
    retry: RetryConfig,
    #[serde(default)]
    port_range: PortRangeConfig,
    #[serde(default)]
    worker_templates: Vec<WorkerTemplateConfig>,
    #[serde(default = "default_log_level")]
    log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            controller: ControllerConfig::default(),
            sse: SseConfig::default(),
            cloudevents: CloudEventsConfig::default(),
            leader: LeaderConfig::default(),
            retry: RetryConfig::default(),
            port_range: PortRangeConfig::default(),
            worker_templates: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

/// The resolved, validated configuration surface from spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub controller: ControllerConfig,
    pub sse: SseConfig,
    pub cloudevents: CloudEventsConfig,
    pub leader: LeaderConfig,
    pub retry: RetryConfig,
    pub port_range: PortRangeConfig,
    pub worker_templates: Vec<WorkerTemplateConfig>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let raw = RawConfig::default();
        Self {
            scheduler: raw.scheduler,
            controller: raw.controller,
            sse: raw.sse,
            cloudevents: raw.cloudevents,
            leader: raw.leader,
            retry: raw.retry,
            port_range: raw.port_range,
            worker_templates: raw.worker_templates,
            log_level: raw.log_level,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;
        let config = Config {
            scheduler: raw.scheduler,
            controller: raw.controller,
            sse: raw.sse,
            cloudevents: raw.cloudevents,
            leader: raw.leader,
            retry: raw.retry,
            port_range: raw.port_range,
            worker_templates: raw.worker_templates,
            log_level: raw.log_level,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.port_range.start >= self.port_range.end {
            return Err(anyhow!("port_range.start must be less than port_range.end"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts cannot be 0"));
        }
        for template in &self.worker_templates {
            if template.regions.is_empty() {
                return Err(anyhow!("worker template '{}' declares no regions", template.name));
            }
            if let Some(range) = template.port_range
                && range.start >= range.end
            {
                return Err(anyhow!("worker template '{}' has an invalid port_range", template.name));
            }
        }
        Ok(())
    }
}
