//! Kubernetes event emission for stage transitions. Events are best effort:
//! failures are logged and swallowed.

use k8s_openapi::api::core::v1::Node;
use kube::runtime::{
    events::{Event, EventType, Recorder},
    reflector::ObjectRef,
};
use strum::Display;

use crate::crd::Skyhook;

#[derive(Clone, Copy, Debug, Display)]
pub enum Reason {
    Apply,
    Interrupt,
    Drain,
    State,
    Reboot,
}

#[derive(Clone)]
pub struct EventPublisher {
    recorder: Recorder,
}

impl EventPublisher {
    pub fn new(recorder: Recorder) -> Self {
        EventPublisher { recorder }
    }

    pub async fn skyhook(&self, skyhook: &Skyhook, reason: Reason, note: String) {
        self.publish(ObjectRef::from_obj(skyhook).into(), reason, note)
            .await;
    }

    pub async fn node(&self, node: &Node, reason: Reason, note: String) {
        self.publish(ObjectRef::from_obj(node).into(), reason, note)
            .await;
    }

    /// Records the event on the Skyhook and on the node it concerns.
    pub async fn skyhook_and_node(
        &self,
        skyhook: &Skyhook,
        node: &Node,
        reason: Reason,
        note: String,
    ) {
        self.skyhook(skyhook, reason, note.clone()).await;
        self.node(node, reason, note).await;
    }

    async fn publish(
        &self,
        reference: k8s_openapi::api::core::v1::ObjectReference,
        reason: Reason,
        note: String,
    ) {
        let event = Event {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &reference).await {
            tracing::warn!(error = %err, reason = %reason, "failed to publish event");
        }
    }
}
