// tests/integration/assessment_test.rs
//
// S5 (spec §8): a RUNNING instance moved into COLLECTING by an operator,
// then driven through GRADING and STOPPING by two inbound CloudEvents
// (`assessment.collection.completed`, `assessment.grading.completed`),
// retains its grading score through to STOPPED/ARCHIVED.

use super::test_helpers::*;
use chrono::Utc;
use cml_orchestrator::core::cloudevents::{handle_inbound, CloudEventEnvelope};
use cml_orchestrator::core::domain::definition::ResourceRequirements;
use cml_orchestrator::core::domain::instance::InstanceStatus;
use cml_orchestrator::core::domain::worker::{Capacity, PortRange, Worker};
use cml_orchestrator::core::events::DomainEvent;
use cml_orchestrator::core::ids::InstanceId;

fn collection_completed(instance_id: InstanceId, event_id: &str) -> CloudEventEnvelope {
    CloudEventEnvelope {
        id: event_id.into(),
        source: "test".into(),
        ty: "assessment.collection.completed".into(),
        specversion: "1.0".into(),
        subject: Some(instance_id.to_string()),
        time: Utc::now(),
        data: serde_json::json!({}),
    }
}

fn grading_completed(instance_id: InstanceId, event_id: &str, score: f64) -> CloudEventEnvelope {
    CloudEventEnvelope {
        id: event_id.into(),
        source: "test".into(),
        ty: "assessment.grading.completed".into(),
        specversion: "1.0".into(),
        subject: Some(instance_id.to_string()),
        time: Utc::now(),
        data: serde_json::json!({ "score": score }),
    }
}

#[tokio::test]
async fn collection_then_grading_round_trip_preserves_score_to_archived() {
    let harness = Harness::new(test_config()).await;

    let (worker, k1) = Worker::new_pending(
        "t1".into(),
        "us-east".into(),
        "m5.large".into(),
        Capacity { cpu: 8, memory_gb: 32, storage_gb: 100, max_nodes: 4 },
        PortRange { lo: 20000, hi: 20019 },
        "PERSONAL".into(),
        Default::default(),
    );
    harness.state.workers.create(worker.id.to_string(), worker.clone(), DomainEvent::Worker { id: worker.id, version: 0, at: Utc::now(), event: k1 }).unwrap();

    let definition_id = seed_published_definition(
        &harness,
        "demo",
        ResourceRequirements { cpu: 1, memory_gb: 1, storage_gb: 1, node_count: 1 },
        "nodes: []\n",
    );
    let instance_id = seed_pending_instance(&harness, definition_id);

    // Drive PENDING -> ... -> RUNNING -> COLLECTING directly, standing in
    // for the scheduler/pipeline path already covered by scheduling_test.rs.
    let (instance, _) = harness.state.instances.load(&instance_id.to_string()).unwrap();
    let (scheduled, k2) = instance.schedule(worker.id).unwrap();
    harness.state.instances.save(&scheduled.id.to_string(), 0, scheduled.clone(), DomainEvent::Instance { id: scheduled.id, version: 1, at: Utc::now(), event: k2 }).unwrap();
    let (instantiating, k3) = scheduled.begin_instantiating(Default::default()).unwrap();
    harness.state.instances.save(&instantiating.id.to_string(), 1, instantiating.clone(), DomainEvent::Instance { id: instantiating.id, version: 2, at: Utc::now(), event: k3 }).unwrap();
    let (running, k4) = instantiating.mark_running("lab-1".into()).unwrap();
    harness.state.instances.save(&running.id.to_string(), 2, running.clone(), DomainEvent::Instance { id: running.id, version: 3, at: Utc::now(), event: k4 }).unwrap();
    let (collecting, k5) = running.begin_collecting().unwrap();
    harness.state.instances.save(&collecting.id.to_string(), 3, collecting.clone(), DomainEvent::Instance { id: collecting.id, version: 4, at: Utc::now(), event: k5 }).unwrap();

    handle_inbound(&harness.state, collection_completed(instance_id, "evt-collection")).await.unwrap();
    let (graded, _) = harness.state.instances.load(&instance_id.to_string()).unwrap();
    assert_eq!(graded.state, InstanceStatus::Grading);

    handle_inbound(&harness.state, grading_completed(instance_id, "evt-grading", 87.5)).await.unwrap();
    let (stopping, version) = harness.state.instances.load(&instance_id.to_string()).unwrap();
    assert_eq!(stopping.state, InstanceStatus::Stopping);
    assert_eq!(stopping.grading_score, Some(87.5));

    // Duplicate delivery of the already-seen grading event is a no-op
    // (spec §4.10 dedup-by-id), not a second transition attempt.
    handle_inbound(&harness.state, grading_completed(instance_id, "evt-grading", 87.5)).await.unwrap();
    let (still_stopping, version_again) = harness.state.instances.load(&instance_id.to_string()).unwrap();
    assert_eq!(still_stopping.state, InstanceStatus::Stopping);
    assert_eq!(version_again, version);

    let (stopped, k6) = stopping.mark_stopped().unwrap();
    harness.state.instances.save(&stopped.id.to_string(), version, stopped.clone(), DomainEvent::Instance { id: stopped.id, version: version + 1, at: Utc::now(), event: k6 }).unwrap();
    let (archived, k7) = stopped.archive().unwrap();
    harness.state.instances.save(&archived.id.to_string(), version + 1, archived.clone(), DomainEvent::Instance { id: archived.id, version: version + 2, at: Utc::now(), event: k7 }).unwrap();

    let (final_state, _) = harness.state.instances.load(&instance_id.to_string()).unwrap();
    assert_eq!(final_state.state, InstanceStatus::Archived);
    assert_eq!(final_state.grading_score, Some(87.5));

    harness.shutdown().await;
}

/// An inbound CloudEvent of an unrecognized type is rejected outright
/// rather than silently ignored (spec §4.10: routes by `type`).
#[tokio::test]
async fn unrecognized_event_type_is_rejected() {
    let harness = Harness::new(test_config()).await;
    let err = handle_inbound(
        &harness.state,
        CloudEventEnvelope {
            id: "evt-unknown".into(),
            source: "test".into(),
            ty: "something.else".into(),
            specversion: "1.0".into(),
            subject: Some(InstanceId::new().to_string()),
            time: Utc::now(),
            data: serde_json::json!({}),
        },
    )
    .await;
    assert!(err.is_err());

    harness.shutdown().await;
}
