// tests/integration/test_helpers.rs

//! Shared scaffolding for the integration suite: a running `EngineState`
//! with its own elected-leader `Scheduler` and `ResourceController` tick
//! loops, the same role `TestContext` plays around `ServerState` in the
//! teacher's own `tests/integration/test_helpers.rs`.

use cml_orchestrator::config::{Config, ControllerConfig, SchedulerConfig, WorkerTemplateConfig};
use cml_orchestrator::core::adapters::{InMemoryArtifactStore, InMemoryCloudAdapter, InMemoryLabHostClient};
use cml_orchestrator::core::controller::ResourceController;
use cml_orchestrator::core::domain::definition::{LabletDefinition, LicenseAffinity, ResourceRequirements};
use cml_orchestrator::core::domain::instance::LabletInstance;
use cml_orchestrator::core::events::DomainEvent;
use cml_orchestrator::core::ids::{DefinitionId, InstanceId, PortKind, PortPlaceholder};
use cml_orchestrator::core::leader::LeaderElector;
use cml_orchestrator::core::scheduler::Scheduler;
use cml_orchestrator::EngineState;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// A template named `"t1"` with generous capacity, a PERSONAL license, and
/// a small port range, fast enough intervals to observe several scheduler
/// and controller cycles within a test's wall-clock budget.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.worker_templates = vec![WorkerTemplateConfig {
        name: "t1".into(),
        instance_type: "m5.large".into(),
        capacity: cml_orchestrator::config::TemplateCapacity {
            cpu_cores: 8,
            memory_gb: 32,
            storage_gb: 100,
            max_nodes: 4,
        },
        license_type: "PERSONAL".into(),
        ami_pattern: "cml-*".into(),
        regions: vec!["us-east".into()],
        port_range: Some(cml_orchestrator::config::PortRangeConfig { start: 20000, end: 20019 }),
        drain_timeout: Duration::from_millis(200),
        tags: Default::default(),
    }];
    config.scheduler = SchedulerConfig {
        interval: Duration::from_millis(20),
        lead_time: Duration::from_secs(35 * 60),
        instantiation_timeout: Duration::from_secs(10 * 60),
    };
    config.controller = ControllerConfig { interval: Duration::from_millis(20), ..ControllerConfig::default() };
    config
}

pub struct Harness {
    pub state: Arc<EngineState>,
    pub artifacts: Arc<InMemoryArtifactStore>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Harness {
    /// Builds the engine and spawns its leader elections plus the
    /// scheduler and controller tick loops, all against fast intervals.
    /// Callers that also need the SSE relay or CloudEvents publisher
    /// running should spawn those themselves against `state.sse`/
    /// `state.cloudevents`.
    pub async fn new(config: Config) -> Self {
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let state = EngineState::initialize(
            config,
            Arc::new(InMemoryCloudAdapter::new()),
            Arc::new(InMemoryLabHostClient::new()),
            artifacts.clone(),
        );
        let (shutdown_tx, _) = broadcast::channel(4);

        let (scheduler_elector, scheduler_leader) = LeaderElector::new(
            state.coordination.clone(),
            "scheduler",
            "test-node",
            Duration::from_secs(30),
            Duration::from_millis(5),
        );
        let (controller_elector, controller_leader) = LeaderElector::new(
            state.coordination.clone(),
            "controller",
            "test-node",
            Duration::from_secs(30),
            Duration::from_millis(5),
        );
        tokio::spawn(scheduler_elector.run(shutdown_tx.subscribe()));
        tokio::spawn(controller_elector.run(shutdown_tx.subscribe()));

        let scheduler = Scheduler::new(state.clone(), scheduler_leader, &state.config);
        let controller = ResourceController::new(state.clone(), controller_leader, &state.config);
        tokio::spawn(scheduler.run(shutdown_tx.subscribe()));
        tokio::spawn(controller.run(shutdown_tx.subscribe()));

        // Let both leases settle before the caller starts seeding aggregates.
        tokio::time::sleep(Duration::from_millis(30)).await;

        Self { state, artifacts, shutdown_tx }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Seeds a PUBLISHED `LabletDefinition` with one CONSOLE port placeholder
/// and the given resource requirement, its topology artifact registered
/// under `s3://<name>` in `harness.artifacts`.
pub fn seed_published_definition(
    harness: &Harness,
    name: &str,
    requirement: ResourceRequirements,
    topology: &str,
) -> DefinitionId {
    let artifact_uri = format!("s3://{name}");
    harness.artifacts.seed(&artifact_uri, topology);
    let hash = cml_orchestrator::core::adapters::artifact_store::compute_topology_hash(topology);

    let draft = LabletDefinition::draft(
        name.into(),
        semver::Version::new(1, 0, 0),
        artifact_uri,
        hash,
        requirement,
        vec![LicenseAffinity::Personal],
        vec![PortPlaceholder { name: "CONSOLE1".into(), kind: PortKind::Console }],
        "cml-*".into(),
    );
    harness
        .state
        .definitions
        .create(draft.id.to_string(), draft.clone(), DomainEvent::SystemShutdown { at: Utc::now() })
        .unwrap();
    let published = draft.publish().unwrap();
    harness
        .state
        .definitions
        .save(&published.id.to_string(), 0, published.clone(), DomainEvent::SystemShutdown { at: Utc::now() })
        .unwrap();
    published.id
}

/// Creates a PENDING `LabletInstance` against `definition_id` and persists it.
pub fn seed_pending_instance(harness: &Harness, definition_id: DefinitionId) -> InstanceId {
    let (definition, _) = harness.state.definitions.load(&definition_id.to_string()).unwrap();
    let (instance, kind) =
        LabletInstance::new(definition.id, definition.version, "owner".into(), None, None).unwrap();
    harness
        .state
        .instances
        .create(
            instance.id.to_string(),
            instance.clone(),
            DomainEvent::Instance { id: instance.id, version: 0, at: Utc::now(), event: kind },
        )
        .unwrap();
    instance.id
}

/// Polls `state.instances` for `id` to reach `target`, failing the test if
/// it doesn't happen within `timeout`.
pub async fn wait_for_instance_state(
    harness: &Harness,
    id: InstanceId,
    target: cml_orchestrator::core::domain::instance::InstanceStatus,
    timeout: Duration,
) -> cml_orchestrator::core::domain::instance::LabletInstance {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some((instance, _)) = harness.state.instances.try_load(&id.to_string())
            && instance.state == target
        {
            return instance;
        }
        if tokio::time::Instant::now() >= deadline {
            let current = harness.state.instances.try_load(&id.to_string()).map(|(i, _)| i.state);
            panic!("instance {id} did not reach {target:?} within {timeout:?}, last seen state: {current:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
