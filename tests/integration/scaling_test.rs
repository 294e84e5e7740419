// tests/integration/scaling_test.rs
//
// S2 (spec §8): a PENDING instance with no eligible worker yet causes the
// scheduler to emit a scale-up hint, the controller to create and
// provision a worker off it, and the instance to eventually be placed
// and run on that new worker, with no worker seeded up front.

use super::test_helpers::*;
use cml_orchestrator::core::domain::definition::ResourceRequirements;
use cml_orchestrator::core::domain::instance::InstanceStatus;
use cml_orchestrator::core::domain::worker::WorkerStatus;
use std::time::Duration;

#[tokio::test]
async fn scale_up_hint_provisions_a_worker_and_then_schedules_the_instance() {
    let harness = Harness::new(test_config()).await;
    let definition_id = seed_published_definition(
        &harness,
        "demo",
        ResourceRequirements { cpu: 1, memory_gb: 1, storage_gb: 1, node_count: 1 },
        "nodes:\n  - name: r1\n    console: ${CONSOLE1}\n",
    );
    let instance_id = seed_pending_instance(&harness, definition_id);

    assert!(harness.state.workers.is_empty());

    let instance = wait_for_instance_state(&harness, instance_id, InstanceStatus::Running, Duration::from_secs(3)).await;
    let worker_id = instance.worker_id.unwrap();
    let (worker, _) = harness.state.workers.load(&worker_id.to_string()).unwrap();
    assert_eq!(worker.status, WorkerStatus::Running);
    assert_eq!(worker.template_name, "t1");
    assert_eq!(harness.state.stats.snapshot().scale_up_actions, 1);

    harness.shutdown().await;
}
