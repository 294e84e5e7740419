// tests/integration/instantiation_timeout_test.rs
//
// S6 (spec §8): an instance stuck in INSTANTIATING past
// `scheduler.instantiation_timeout` is detected by the scheduler's
// reconcile step and terminated, releasing whatever it held on its
// worker, rather than being left to instantiate forever.

use super::test_helpers::*;
use chrono::Utc;
use cml_orchestrator::core::domain::definition::{LabletDefinition, LicenseAffinity, ResourceRequirements};
use cml_orchestrator::core::domain::instance::{InstanceStatus, LabletInstance};
use cml_orchestrator::core::domain::worker::{Capacity, PortRange, Worker};
use cml_orchestrator::core::events::DomainEvent;
use std::time::Duration;

#[tokio::test]
async fn stuck_instantiating_instance_is_terminated_after_timeout() {
    let mut config = test_config();
    config.scheduler.instantiation_timeout = Duration::from_millis(80);
    let harness = Harness::new(config).await;

    let definition = LabletDefinition::draft(
        "demo".into(),
        semver::Version::new(1, 0, 0),
        "s3://demo".into(),
        "hash".into(),
        ResourceRequirements { cpu: 1, memory_gb: 1, storage_gb: 1, node_count: 1 },
        vec![LicenseAffinity::Personal],
        vec![],
        "cml-*".into(),
    );
    harness
        .state
        .definitions
        .create(definition.id.to_string(), definition.clone(), DomainEvent::SystemShutdown { at: Utc::now() })
        .unwrap();

    let (worker, k1) = Worker::new_pending(
        "t1".into(),
        "us-east".into(),
        "m5.large".into(),
        Capacity { cpu: 8, memory_gb: 32, storage_gb: 100, max_nodes: 4 },
        PortRange { lo: 20000, hi: 20019 },
        "PERSONAL".into(),
        Default::default(),
    );
    harness
        .state
        .workers
        .create(worker.id.to_string(), worker.clone(), DomainEvent::Worker { id: worker.id, version: 0, at: Utc::now(), event: k1 })
        .unwrap();
    let (provisioning, k2) = worker.mark_provisioning("i-1".into()).unwrap();
    harness
        .state
        .workers
        .save(&provisioning.id.to_string(), 0, provisioning.clone(), DomainEvent::Worker { id: provisioning.id, version: 1, at: Utc::now(), event: k2 })
        .unwrap();
    let (running_worker, k3) = provisioning.mark_running("https://pub".into(), "https://priv".into()).unwrap();
    harness
        .state
        .workers
        .save(&running_worker.id.to_string(), 1, running_worker.clone(), DomainEvent::Worker { id: running_worker.id, version: 2, at: Utc::now(), event: k3 })
        .unwrap();

    let (instance, k4) = LabletInstance::new(definition.id, definition.version, "owner".into(), None, None).unwrap();
    harness
        .state
        .instances
        .create(instance.id.to_string(), instance.clone(), DomainEvent::Instance { id: instance.id, version: 0, at: Utc::now(), event: k4 })
        .unwrap();
    let (scheduled, k5) = instance.schedule(running_worker.id).unwrap();
    harness
        .state
        .instances
        .save(&scheduled.id.to_string(), 0, scheduled.clone(), DomainEvent::Instance { id: scheduled.id, version: 1, at: Utc::now(), event: k5 })
        .unwrap();
    let (reserved_worker, k6) = running_worker.reserve_capacity(scheduled.id, &definition.resource_requirements).unwrap();
    harness
        .state
        .workers
        .save(&reserved_worker.id.to_string(), 2, reserved_worker.clone(), DomainEvent::Worker { id: reserved_worker.id, version: 3, at: Utc::now(), event: k6 })
        .unwrap();
    let (instantiating, k7) = scheduled.begin_instantiating(Default::default()).unwrap();
    harness
        .state
        .instances
        .save(&instantiating.id.to_string(), 1, instantiating.clone(), DomainEvent::Instance { id: instantiating.id, version: 2, at: Utc::now(), event: k7 })
        .unwrap();

    let instance_id = instantiating.id;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let (current, _) = harness.state.instances.load(&instance_id.to_string()).unwrap();
        if current.state == InstanceStatus::Terminated {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("instance did not reach Terminated, last seen {:?}", current.state);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (terminated, _) = harness.state.instances.load(&instance_id.to_string()).unwrap();
    let last = terminated.state_history.last().unwrap();
    assert_eq!(last.reason.as_deref(), Some("instantiation_timeout"));

    let (worker_after, _) = harness.state.workers.load(&running_worker.id.to_string()).unwrap();
    assert!(!worker_after.instance_ids.contains(&instance_id));

    harness.shutdown().await;
}
