// src/core/cloudevents.rs

//! External CloudEvents publisher/consumer (C14, spec §4.10). Outbound:
//! every Worker/Instance state transition and scaling action is published
//! as a CloudEvent 1.0 structured-mode JSON document over HTTP, with the
//! same retry helper the instantiation pipeline uses (`core::retry`).
//! Inbound: a plain async function an out-of-scope HTTP layer would call
//! per request, routing by `type` and deduplicating by `id` via the
//! coordination store's TTL set.

use crate::config::CloudEventsConfig;
use crate::core::domain::instance::InstanceStatus;
use crate::core::errors::OrchestratorError;
use crate::core::events::{DomainEvent, EventBus};
use crate::core::ids::InstanceId;
use crate::core::retry::{retry_async, RetryPolicy};
use crate::core::state::EngineState;
use crate::core::stats::EngineStats;
use crate::core::store::load_mutate_save;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// A CloudEvents 1.0 envelope in structured JSON encoding (spec §6: "Wire
/// protocols... structured JSON encoding").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEventEnvelope {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub specversion: String,
    pub subject: Option<String>,
    pub time: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Maps a `DomainEvent` to the outbound CloudEvent it produces, or `None`
/// for events that are purely internal (spec §4.10 only requires Worker,
/// Instance, and scaling-action transitions to cross the wire).
fn to_envelope(source: &str, event: &DomainEvent) -> Option<CloudEventEnvelope> {
    let subject = event
        .worker_id()
        .map(|id| id.to_string())
        .or_else(|| event.instance_id().map(|id| id.to_string()));
    match event {
        DomainEvent::Worker { .. } | DomainEvent::Instance { .. } | DomainEvent::ScalingAction { .. } => {
            Some(CloudEventEnvelope {
                id: Uuid::new_v4().to_string(),
                source: source.to_string(),
                ty: event.type_name().to_string(),
                specversion: "1.0".to_string(),
                subject,
                time: Utc::now(),
                data: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
            })
        }
        DomainEvent::ScaleUpRequested { .. } | DomainEvent::SystemShutdown { .. } => None,
    }
}

pub struct CloudEventsPublisher {
    config: CloudEventsConfig,
    http: reqwest::Client,
}

impl CloudEventsPublisher {
    pub fn new(config: CloudEventsConfig) -> Self {
        Self { config, http: reqwest::Client::new() }
    }

    /// Subscribes to the bus and forwards every mappable event to the
    /// configured sink until `shutdown` fires. Publishing is non-blocking
    /// relative to aggregate saves (spec §4.10) because it runs in its own
    /// task, entirely decoupled from the `AggregateStore::save` call that
    /// produced the event.
    pub async fn run(
        self: Arc<Self>,
        bus: Arc<EventBus>,
        stats: Arc<EngineStats>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let Some(_) = &self.config.sink_url else {
            debug!("cloudevents.sink_url not configured, outbound publishing disabled");
            return;
        };
        let mut events = bus.subscribe();
        loop {
            tokio::select! {
                result = events.recv() => {
                    match result {
                        Ok(event) => {
                            if let Some(envelope) = to_envelope(&self.config.source, &event) {
                                self.publish_with_retry(envelope).await;
                                stats.record_cloudevent_outbound();
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn publish_with_retry(&self, envelope: CloudEventEnvelope) {
        let Some(sink_url) = self.config.sink_url.clone() else { return };
        let policy = RetryPolicy::for_external_call();
        let result = retry_async(
            policy,
            |_attempt| {
                let http = self.http.clone();
                let sink_url = sink_url.clone();
                let envelope = envelope.clone();
                async move {
                    http.post(&sink_url)
                        .json(&envelope)
                        .send()
                        .await
                        .map_err(OrchestratorError::from)?
                        .error_for_status()
                        .map_err(OrchestratorError::from)?;
                    Ok::<(), OrchestratorError>(())
                }
            },
            |e| e.is_transient(),
        )
        .await;
        if let Err(e) = result {
            warn!(event_id = %envelope.id, error = %e, "failed to publish outbound CloudEvent");
        }
    }
}

/// Inbound handler (spec §4.10): routes by `type`, deduplicating by `id`
/// via the coordination store's TTL set (default 24h, spec §6). Returns
/// `Ok(())` for a duplicate (a no-op, not an error) so a caller HTTP layer
/// can still reply 202.
pub async fn handle_inbound(
    state: &EngineState,
    envelope: CloudEventEnvelope,
) -> Result<(), OrchestratorError> {
    state.stats.record_cloudevent_inbound();
    if !state.coordination.dedup_check(&envelope.id, state.config.cloudevents.dedup_ttl) {
        debug!(event_id = %envelope.id, "duplicate inbound CloudEvent, ignoring");
        return Ok(());
    }

    let instance_id: InstanceId = envelope
        .subject
        .as_deref()
        .ok_or_else(|| OrchestratorError::InvalidArgument("CloudEvent missing subject".into()))?
        .parse()
        .map_err(|_| OrchestratorError::InvalidArgument("subject is not a valid instance id".into()))?;

    match envelope.ty.as_str() {
        "assessment.collection.completed" => {
            load_mutate_save(&state.instances, &instance_id.to_string(), |instance, _version| {
                let (next, kind) = instance.begin_grading()?;
                Ok((
                    next.clone(),
                    DomainEvent::Instance { id: next.id, version: 0, at: Utc::now(), event: kind },
                ))
            })?;
            Ok(())
        }
        "assessment.grading.completed" => {
            let score = envelope
                .data
                .get("score")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| OrchestratorError::InvalidArgument("grading event missing score".into()))?;
            load_mutate_save(&state.instances, &instance_id.to_string(), |instance, _version| {
                let (next, kind) = instance.complete_grading(score)?;
                Ok((
                    next.clone(),
                    DomainEvent::Instance { id: next.id, version: 0, at: Utc::now(), event: kind },
                ))
            })?;
            Ok(())
        }
        other => Err(OrchestratorError::InvalidArgument(format!("unrecognized CloudEvent type: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adapters::{InMemoryArtifactStore, InMemoryCloudAdapter, InMemoryLabHostClient};
    use crate::config::Config;
    use crate::core::domain::definition::{LabletDefinition, LicenseAffinity, ResourceRequirements};
    use crate::core::domain::instance::LabletInstance;
    use crate::core::events::InstanceEventKind;
    use semver::Version;

    fn state() -> Arc<EngineState> {
        EngineState::initialize(
            Config::default(),
            Arc::new(InMemoryCloudAdapter::new()),
            Arc::new(InMemoryLabHostClient::new()),
            Arc::new(InMemoryArtifactStore::new()),
        )
    }

    fn seed_running_instance(state: &Arc<EngineState>) -> InstanceId {
        let definition = LabletDefinition::draft(
            "d".into(),
            Version::new(1, 0, 0),
            "s3://x".into(),
            "hash".into(),
            ResourceRequirements { cpu: 1, memory_gb: 1, storage_gb: 1, node_count: 1 },
            vec![LicenseAffinity::Personal],
            vec![],
            "cml-*".into(),
        );
        state.definitions.create(definition.id.to_string(), definition.clone(), DomainEvent::SystemShutdown { at: Utc::now() }).unwrap();
        let (instance, kind) = LabletInstance::new(definition.id, definition.version, "owner".into(), None, None).unwrap();
        state
            .instances
            .create(
                instance.id.to_string(),
                instance.clone(),
                DomainEvent::Instance { id: instance.id, version: 0, at: Utc::now(), event: kind },
            )
            .unwrap();
        // Drive PENDING -> ... -> RUNNING -> COLLECTING manually for the test fixture.
        let (scheduled, k1) = instance.schedule(crate::core::ids::WorkerId::new()).unwrap();
        state.instances.save(&scheduled.id.to_string(), 0, scheduled.clone(), DomainEvent::Instance { id: scheduled.id, version: 1, at: Utc::now(), event: k1 }).unwrap();
        let (instantiating, k2) = scheduled.begin_instantiating(Default::default()).unwrap();
        state.instances.save(&instantiating.id.to_string(), 1, instantiating.clone(), DomainEvent::Instance { id: instantiating.id, version: 2, at: Utc::now(), event: k2 }).unwrap();
        let (running, k3) = instantiating.mark_running("lab-1".into()).unwrap();
        state.instances.save(&running.id.to_string(), 2, running.clone(), DomainEvent::Instance { id: running.id, version: 3, at: Utc::now(), event: k3 }).unwrap();
        let (collecting, k4) = running.begin_collecting().unwrap();
        state.instances.save(&collecting.id.to_string(), 3, collecting.clone(), DomainEvent::Instance { id: collecting.id, version: 4, at: Utc::now(), event: k4 }).unwrap();
        collecting.id
    }

    #[tokio::test]
    async fn collection_completed_moves_collecting_to_grading() {
        let state = state();
        let instance_id = seed_running_instance(&state);
        let envelope = CloudEventEnvelope {
            id: "evt-1".into(),
            source: "test".into(),
            ty: "assessment.collection.completed".into(),
            specversion: "1.0".into(),
            subject: Some(instance_id.to_string()),
            time: Utc::now(),
            data: serde_json::json!({}),
        };
        handle_inbound(&state, envelope.clone()).await.unwrap();
        let (loaded, _) = state.instances.load(&instance_id.to_string()).unwrap();
        assert_eq!(loaded.state, InstanceStatus::Grading);

        // Duplicate delivery within the TTL is a no-op.
        handle_inbound(&state, envelope).await.unwrap();
        let (loaded_again, version_again) = state.instances.load(&instance_id.to_string()).unwrap();
        assert_eq!(loaded_again.state, InstanceStatus::Grading);
        assert_eq!(version_again, 5);
    }

    #[tokio::test]
    async fn grading_completed_stores_score_and_moves_to_stopping() {
        let state = state();
        let instance_id = seed_running_instance(&state);
        handle_inbound(
            &state,
            CloudEventEnvelope {
                id: "evt-2".into(),
                source: "test".into(),
                ty: "assessment.collection.completed".into(),
                specversion: "1.0".into(),
                subject: Some(instance_id.to_string()),
                time: Utc::now(),
                data: serde_json::json!({}),
            },
        )
        .await
        .unwrap();
        handle_inbound(
            &state,
            CloudEventEnvelope {
                id: "evt-3".into(),
                source: "test".into(),
                ty: "assessment.grading.completed".into(),
                specversion: "1.0".into(),
                subject: Some(instance_id.to_string()),
                time: Utc::now(),
                data: serde_json::json!({"score": 92.5}),
            },
        )
        .await
        .unwrap();
        let (loaded, _) = state.instances.load(&instance_id.to_string()).unwrap();
        assert_eq!(loaded.state, InstanceStatus::Stopping);
        assert_eq!(loaded.grading_score, Some(92.5));
    }
}
