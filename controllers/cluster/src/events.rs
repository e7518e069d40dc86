//! Kubernetes event emission.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails a
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Controller name reported on events
pub const REPORTER_NAME: &str = "aws-cluster-controller";

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Progress worth surfacing to the operator
    Normal,
    /// Hard failure
    Warning,
}

/// Sink for operator-visible notifications
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish an event about `object`
    async fn publish(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: &str);
}

/// `EventSink` backed by the Kubernetes events API
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    /// Create a sink reporting as this controller
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: REPORTER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, object: &ObjectReference, kind: EventKind, reason: &str, message: &str) {
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(
                "Failed to publish {} event for {}: {}",
                reason,
                object.name.as_deref().unwrap_or("<unknown>"),
                e
            );
        }
    }
}
