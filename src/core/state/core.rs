// src/core/state/core.rs

//! `EngineState`: the shared, `Arc`-wrapped struct holding every component
//! C1-C14 depends on. Every command function and background loop takes
//! `&EngineState` (or a clone of the `Arc`), the same shape
//! `spineldb::core::state::ServerState` is threaded through that teacher's
//! command handlers and background tasks.

use crate::config::Config;
use crate::core::adapters::{ArtifactStore, CloudAdapter, LabHostClient};
use crate::core::audit::AuditLog;
use crate::core::cloudevents::CloudEventsPublisher;
use crate::core::coordination::CoordinationStore;
use crate::core::domain::template::WorkerTemplate;
use crate::core::domain::{LabletDefinition, LabletInstance, Worker};
use crate::core::events::EventBus;
use crate::core::sse::SseRelay;
use crate::core::stats::EngineStats;
use crate::core::store::AggregateStore;
use std::sync::Arc;

/// Everything the scheduler, controller, pipeline, and CloudEvents tasks
/// need. Constructed once in `EngineState::initialize` and shared via
/// `Arc` with every long-running loop (spec §9: "no other globals are
/// permitted").
pub struct EngineState {
    pub config: Config,
    pub templates: Vec<WorkerTemplate>,
    pub event_bus: Arc<EventBus>,
    pub coordination: Arc<CoordinationStore>,
    pub definitions: AggregateStore<LabletDefinition>,
    pub instances: AggregateStore<LabletInstance>,
    pub workers: AggregateStore<Worker>,
    pub cloud: Arc<dyn CloudAdapter>,
    pub lab_host: Arc<dyn LabHostClient>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub audit: AuditLog,
    pub stats: Arc<EngineStats>,
    pub sse: Arc<SseRelay>,
    pub cloudevents: Arc<CloudEventsPublisher>,
}

impl EngineState {
    /// Builds a fresh engine around the given collaborators. Real
    /// deployments pass real `CloudAdapter`/`LabHostClient`/`ArtifactStore`
    /// implementations; the demonstration binary and tests pass the
    /// in-memory ones from `core::adapters`.
    pub fn initialize(
        config: Config,
        cloud: Arc<dyn CloudAdapter>,
        lab_host: Arc<dyn LabHostClient>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Arc<Self> {
        let event_bus = Arc::new(EventBus::new());
        let templates = config
            .worker_templates
            .iter()
            .cloned()
            .map(|t| WorkerTemplate::from((t, config.port_range)))
            .collect();
        let sse = Arc::new(SseRelay::new(config.sse.queue_depth));
        let cloudevents = Arc::new(CloudEventsPublisher::new(config.cloudevents.clone()));

        Arc::new(Self {
            definitions: AggregateStore::new(event_bus.clone()),
            instances: AggregateStore::new(event_bus.clone()),
            workers: AggregateStore::new(event_bus.clone()),
            coordination: Arc::new(CoordinationStore::new()),
            event_bus,
            templates,
            cloud,
            lab_host,
            artifacts,
            audit: AuditLog::new(),
            stats: Arc::new(EngineStats::new()),
            sse,
            cloudevents,
            config,
        })
    }

    pub fn template_by_name(&self, name: &str) -> Option<&WorkerTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }
}
