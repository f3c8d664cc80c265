//! The drain gate around interrupts. Draining is a gate, not a step: the
//! state machine asks whether the node is drained, evicts what is evictable,
//! and reports "waiting" until the answer is yes.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::{
    dal::{self, Dal},
    picker::TAINT_NODE_UNSCHEDULABLE,
};

/// Namespaces never drained.
const PROTECTED_NAMESPACES: [&str; 1] = ["kube-system"];

fn tolerates_unschedulable(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.tolerations.as_deref())
        .unwrap_or_default()
        .iter()
        .any(|toleration| {
            let key = toleration.key.as_deref();
            key == Some(TAINT_NODE_UNSCHEDULABLE)
                || (key.is_none() && toleration.operator.as_deref() == Some("Exists"))
        })
}

fn owned_by_daemonset(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|owner| owner.kind == "DaemonSet")
}

/// A pod blocks the interrupt and must be evicted: it is running or pending,
/// not DaemonSet-managed, not in a protected namespace, and does not already
/// tolerate unschedulable nodes.
pub fn is_evictable(pod: &Pod) -> bool {
    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or("Pending");
    if phase != "Running" && phase != "Pending" {
        return false;
    }
    if PROTECTED_NAMESPACES.contains(&pod.namespace().unwrap_or_default().as_str()) {
        return false;
    }
    if owned_by_daemonset(pod) {
        return false;
    }
    !tolerates_unschedulable(pod)
}

pub fn evictable(pods: &[Pod]) -> Vec<&Pod> {
    pods.iter().filter(|pod| is_evictable(pod)).collect()
}

/// Issues evictions for every evictable pod. Callers requeue; the gate opens
/// once a later tick sees nothing left to evict.
pub async fn evict_all(dal: &Dal, pods: &[&Pod]) -> Result<(), dal::Error> {
    for pod in pods {
        let namespace = pod.namespace().unwrap_or_default();
        tracing::info!(pod = %pod.name_any(), namespace = %namespace, "evicting pod for drain");
        dal.evict_pod(&pod.name_any(), &namespace).await?;
    }
    Ok(())
}
