//! Kubernetes Events attached to the resources the operator manages.
//!
//! Publishing is fire-and-forget: a failed event is logged and never fails
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use log::warn;

pub const REASON_ISSUE_SUCCESSFUL: &str = "IssueSuccessful";
pub const REASON_RENEW_SUCCESSFUL: &str = "RenewSuccessful";
pub const REASON_ISSUE_FAILED: &str = "IssueFailed";
pub const REASON_BACKEND_INVALID: &str = "BackendInvalid";
pub const REASON_CONFIG_RENDERED: &str = "ConfigRendered";
pub const REASON_RENDER_FAILED: &str = "RenderFailed";

pub const ACTION_RECONCILE: &str = "Reconcile";
pub const ACTION_ISSUE: &str = "Issue";
pub const ACTION_RENEW: &str = "Renew";

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    );

    async fn normal(&self, object: &ObjectReference, reason: &str, action: &str, note: String) {
        self.publish(object, EventType::Normal, reason, action, note)
            .await
    }

    async fn warning(&self, object: &ObjectReference, reason: &str, action: &str, note: String) {
        self.publish(object, EventType::Warning, reason, action, note)
            .await
    }
}

/// Publishes through the events API as `reporter`.
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(
                "failed to publish {reason} event for {}/{}: {e}",
                object.namespace.as_deref().unwrap_or_default(),
                object.name.as_deref().unwrap_or_default()
            );
        }
    }
}
