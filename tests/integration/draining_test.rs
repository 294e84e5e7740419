// tests/integration/draining_test.rs
//
// S3 (spec §8): a worker mid-drain whose last instance releases its
// reservation before `drain_timeout` elapses is stopped gracefully
// (no `drain_forced` tag). S4: a worker mid-drain whose instance is still
// attached once `drain_timeout` elapses is force-stopped, and the
// attached instance is terminated and tagged `drain_forced`.

use super::test_helpers::*;
use chrono::Utc;
use cml_orchestrator::core::domain::definition::{LabletDefinition, LicenseAffinity, ResourceRequirements};
use cml_orchestrator::core::domain::instance::{InstanceStatus, LabletInstance};
use cml_orchestrator::core::domain::worker::{Capacity, PortRange, Worker, WorkerStatus};
use cml_orchestrator::core::events::DomainEvent;
use cml_orchestrator::core::ids::InstanceId;
use cml_orchestrator::core::pipeline;
use cml_orchestrator::EngineState;
use std::sync::Arc;
use std::time::Duration;

/// Seeds a RUNNING worker with one SCHEDULED instance reserved onto it
/// (capacity only, no ports bound — a drain test only cares about
/// `instance_ids` bookkeeping), then puts the worker into DRAINING.
fn seed_draining_worker_with_instance(state: &Arc<EngineState>) -> InstanceId {
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
    state.definitions.create(definition.id.to_string(), definition.clone(), DomainEvent::SystemShutdown { at: Utc::now() }).unwrap();

    let (worker, k1) = Worker::new_pending(
        "t1".into(),
        "us-east".into(),
        "m5.large".into(),
        Capacity { cpu: 8, memory_gb: 32, storage_gb: 100, max_nodes: 4 },
        PortRange { lo: 20000, hi: 20019 },
        "PERSONAL".into(),
        Default::default(),
    );
    state.workers.create(worker.id.to_string(), worker.clone(), DomainEvent::Worker { id: worker.id, version: 0, at: Utc::now(), event: k1 }).unwrap();
    let (provisioning, k2) = worker.mark_provisioning("i-1".into()).unwrap();
    state.workers.save(&provisioning.id.to_string(), 0, provisioning.clone(), DomainEvent::Worker { id: provisioning.id, version: 1, at: Utc::now(), event: k2 }).unwrap();
    let (running, k3) = provisioning.mark_running("https://pub".into(), "https://priv".into()).unwrap();
    state.workers.save(&running.id.to_string(), 1, running.clone(), DomainEvent::Worker { id: running.id, version: 2, at: Utc::now(), event: k3 }).unwrap();

    let (instance, k4) = LabletInstance::new(definition.id, definition.version, "owner".into(), None, None).unwrap();
    state.instances.create(instance.id.to_string(), instance.clone(), DomainEvent::Instance { id: instance.id, version: 0, at: Utc::now(), event: k4 }).unwrap();
    let (scheduled, k5) = instance.schedule(running.id).unwrap();
    state.instances.save(&scheduled.id.to_string(), 0, scheduled.clone(), DomainEvent::Instance { id: scheduled.id, version: 1, at: Utc::now(), event: k5 }).unwrap();
    let (reserved, k6) = running.reserve_capacity(scheduled.id, &definition.resource_requirements).unwrap();
    state.workers.save(&reserved.id.to_string(), 2, reserved.clone(), DomainEvent::Worker { id: reserved.id, version: 3, at: Utc::now(), event: k6 }).unwrap();

    let (draining, k7) = reserved.start_draining().unwrap();
    state.workers.save(&draining.id.to_string(), 3, draining, DomainEvent::Worker { id: reserved.id, version: 4, at: Utc::now(), event: k7 }).unwrap();

    scheduled.id
}

#[tokio::test]
async fn instance_release_before_timeout_stops_worker_gracefully() {
    let mut config = test_config();
    config.worker_templates[0].drain_timeout = Duration::from_secs(5);
    let harness = Harness::new(config).await;

    let instance_id = seed_draining_worker_with_instance(&harness.state);
    let worker_id = harness.state.instances.load(&instance_id.to_string()).unwrap().0.worker_id.unwrap();

    // Simulate the instance finishing its run and releasing the worker's
    // reservation well inside the 5s drain_timeout.
    pipeline::terminate_and_release(&harness.state, instance_id, "run_complete").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let (worker, _) = harness.state.workers.load(&worker_id.to_string()).unwrap();
        if worker.status == WorkerStatus::Stopped {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("worker did not reach STOPPED, last seen {:?}", worker.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let audit = harness.state.audit.snapshot();
    assert!(audit.iter().any(|e| e.action == "stopping" && e.reason == "drain_complete"));
    assert!(!audit.iter().any(|e| e.reason == "drain_timeout"));

    let (instance, _) = harness.state.instances.load(&instance_id.to_string()).unwrap();
    assert_eq!(instance.state, InstanceStatus::Terminated);

    harness.shutdown().await;
}

#[tokio::test]
async fn drain_timeout_force_terminates_remaining_instance() {
    let mut config = test_config();
    config.worker_templates[0].drain_timeout = Duration::from_millis(80);
    let harness = Harness::new(config).await;

    let instance_id = seed_draining_worker_with_instance(&harness.state);
    let worker_id = harness.state.instances.load(&instance_id.to_string()).unwrap().0.worker_id.unwrap();

    // Never release the instance: let drain_timeout force the issue.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let (worker, _) = harness.state.workers.load(&worker_id.to_string()).unwrap();
        if worker.status == WorkerStatus::Stopped {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("worker did not reach STOPPED, last seen {:?}", worker.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (instance, _) = harness.state.instances.load(&instance_id.to_string()).unwrap();
    assert_eq!(instance.state, InstanceStatus::Terminated);
    let last = instance.state_history.last().unwrap();
    assert_eq!(last.reason.as_deref(), Some("drain_forced"));

    let audit = harness.state.audit.snapshot();
    assert!(audit.iter().any(|e| e.action == "stopping" && e.reason == "drain_timeout"));

    harness.shutdown().await;
}
