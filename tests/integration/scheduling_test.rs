// tests/integration/scheduling_test.rs
//
// S1 (spec §8): a PENDING instance against a PUBLISHED definition, with one
// eligible RUNNING worker already available, reaches RUNNING end to end
// through the scheduler's place/dispatch cycle and the instantiation
// pipeline it hands off to.

use super::test_helpers::*;
use chrono::Utc;
use cml_orchestrator::core::domain::definition::ResourceRequirements;
use cml_orchestrator::core::domain::instance::InstanceStatus;
use cml_orchestrator::core::domain::worker::{Capacity, PortRange, Worker};
use cml_orchestrator::core::events::DomainEvent;
use cml_orchestrator::EngineState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Persists a RUNNING worker for template `t1` directly, the same
/// create -> mark_provisioning -> mark_running sequence
/// `core::pipeline`'s own tests drive, so placement tests don't depend on
/// the controller's scale-up path.
fn seed_running_worker(state: &Arc<EngineState>) {
    let (worker, kind) = Worker::new_pending(
        "t1".into(),
        "us-east".into(),
        "m5.large".into(),
        Capacity { cpu: 8, memory_gb: 32, storage_gb: 100, max_nodes: 4 },
        PortRange { lo: 20000, hi: 20019 },
        "PERSONAL".into(),
        BTreeMap::new(),
    );
    state
        .workers
        .create(worker.id.to_string(), worker.clone(), DomainEvent::Worker { id: worker.id, version: 0, at: Utc::now(), event: kind })
        .unwrap();
    let (provisioning, k2) = worker.mark_provisioning("i-1".into()).unwrap();
    state
        .workers
        .save(&provisioning.id.to_string(), 0, provisioning.clone(), DomainEvent::Worker { id: provisioning.id, version: 1, at: Utc::now(), event: k2 })
        .unwrap();
    let (running, k3) = provisioning.mark_running("https://pub".into(), "https://priv".into()).unwrap();
    state
        .workers
        .save(&running.id.to_string(), 1, running, DomainEvent::Worker { id: provisioning.id, version: 2, at: Utc::now(), event: k3 })
        .unwrap();
}

#[tokio::test]
async fn pending_instance_reaches_running_on_an_already_running_worker() {
    let harness = Harness::new(test_config()).await;
    seed_running_worker(&harness.state);
    let definition_id = seed_published_definition(
        &harness,
        "demo",
        ResourceRequirements { cpu: 1, memory_gb: 1, storage_gb: 1, node_count: 1 },
        "nodes:\n  - name: r1\n    console: ${CONSOLE1}\n",
    );
    let instance_id = seed_pending_instance(&harness, definition_id);

    let instance = wait_for_instance_state(&harness, instance_id, InstanceStatus::Running, Duration::from_secs(2)).await;
    assert!(instance.lab_id.is_some());
    assert!(instance.allocated_ports.is_some());
    assert!(instance.worker_id.is_some());

    let (worker, _) = harness.state.workers.snapshot().into_iter().next().map(|(_, w, v)| (w, v)).unwrap();
    assert!(worker.instance_ids.contains(&instance_id));
    assert_eq!(worker.allocated_capacity.cpu, 1);

    harness.shutdown().await;
}

/// A definition whose resource requirements exceed every configured
/// template's capacity never gets a scale-up hint and stays PENDING
/// indefinitely rather than causing a panic or crash loop (spec §4.6 step
/// 1: "no eligible worker exists").
#[tokio::test]
async fn definition_with_no_satisfiable_template_stays_pending() {
    let harness = Harness::new(test_config()).await;
    let definition_id = seed_published_definition(
        &harness,
        "enterprise-only",
        ResourceRequirements { cpu: 64, memory_gb: 256, storage_gb: 1000, node_count: 16 },
        "nodes: []\n",
    );
    let instance_id = seed_pending_instance(&harness, definition_id);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (instance, _) = harness.state.instances.load(&instance_id.to_string()).unwrap();
    assert_eq!(instance.state, InstanceStatus::Pending);

    harness.shutdown().await;
}
