//! # Observability Events
//!
//! Kubernetes Events attached to `SecretIntent` resources so operators can
//! see what the controller did (or refused to do) without reading logs.
//!
//! Emitted events:
//! - `Normal/CreatedSecret` - a managed Secret was created
//! - `Normal/UpdatedSecret` - a managed Secret was updated
//! - `Warning/OwnershipConflict` - a Secret exists at the intent's identity
//!   but is not owned by it; the controller will not touch it

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::crd::{SecretIntent, API_GROUP, API_VERSION, INTENT_KIND};

/// Event reason for a created managed Secret.
pub const REASON_CREATED: &str = "CreatedSecret";
/// Event reason for an updated managed Secret.
pub const REASON_UPDATED: &str = "UpdatedSecret";
/// Event reason for a Secret that exists but is not owned by the intent.
pub const REASON_CONFLICT: &str = "OwnershipConflict";

/// Sink for observability events. Publishing is best-effort; failures are
/// logged and never fail a reconcile pass.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, intent: &SecretIntent, type_: EventType, reason: &str, note: String);
}

/// Event sink that records Events through the cluster API.
pub struct ClusterEventSink {
    recorder: Recorder,
}

impl std::fmt::Debug for ClusterEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterEventSink").finish_non_exhaustive()
    }
}

impl ClusterEventSink {
    #[must_use]
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_owned(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn intent_reference(intent: &SecretIntent) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!("{API_GROUP}/{API_VERSION}")),
        kind: Some(INTENT_KIND.to_owned()),
        name: intent.metadata.name.clone(),
        namespace: intent.metadata.namespace.clone(),
        uid: intent.metadata.uid.clone(),
        ..ObjectReference::default()
    }
}

#[async_trait]
impl EventSink for ClusterEventSink {
    async fn publish(&self, intent: &SecretIntent, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_owned(),
            note: Some(note),
            action: "Reconcile".to_owned(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &intent_reference(intent)).await {
            warn!(
                reason,
                intent = intent.metadata.name.as_deref().unwrap_or("unknown"),
                "could not publish event: {e}"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory event sink used by reconciler and router tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedEvent {
        pub intent: String,
        pub type_: String,
        pub reason: String,
        pub note: String,
    }

    #[derive(Default)]
    pub struct MemoryEventSink {
        pub events: Mutex<Vec<RecordedEvent>>,
    }

    impl MemoryEventSink {
        pub fn reasons(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.reason.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for MemoryEventSink {
        async fn publish(
            &self,
            intent: &SecretIntent,
            type_: EventType,
            reason: &str,
            note: String,
        ) {
            self.events.lock().unwrap().push(RecordedEvent {
                intent: intent.metadata.name.clone().unwrap_or_default(),
                type_: match type_ {
                    EventType::Normal => "Normal".to_owned(),
                    EventType::Warning => "Warning".to_owned(),
                },
                reason: reason.to_owned(),
                note,
            });
        }
    }
}
