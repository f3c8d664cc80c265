//! Maps watch notifications on non-owned resources to the Skyhooks that must
//! reconcile because of them.

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    runtime::reflector::{ObjectRef, Store},
    ResourceExt,
};

use crate::{
    cluster_state::skyhook_selects_node,
    crd::{deployment_policy::DeploymentPolicy, Skyhook, LABEL_NAME},
};

/// A node change concerns every Skyhook whose selector matches it.
pub fn node_to_skyhooks(store: &Store<Skyhook>, node: &Node) -> Vec<ObjectRef<Skyhook>> {
    store
        .state()
        .iter()
        .filter(|skyhook| skyhook_selects_node(skyhook, node))
        .map(|skyhook| ObjectRef::from_obj(&**skyhook))
        .collect()
}

/// Package pods carry their Skyhook's name as a label.
pub fn pod_to_skyhook(pod: &Pod) -> Option<ObjectRef<Skyhook>> {
    pod.labels()
        .get(LABEL_NAME)
        .map(|name| ObjectRef::new(name))
}

/// A policy change concerns the Skyhooks referencing it.
pub fn policy_to_skyhooks(
    store: &Store<Skyhook>,
    policy: &DeploymentPolicy,
) -> Vec<ObjectRef<Skyhook>> {
    let name = policy.name_any();
    store
        .state()
        .iter()
        .filter(|skyhook| skyhook.spec.deployment_policy.as_deref() == Some(name.as_str()))
        .map(|skyhook| ObjectRef::from_obj(&**skyhook))
        .collect()
}

/// Any Skyhook change can move the priority winner, so every Skyhook gets a
/// tick.
pub fn skyhook_fanout(store: &Store<Skyhook>) -> Vec<ObjectRef<Skyhook>> {
    store
        .state()
        .iter()
        .map(|skyhook| ObjectRef::from_obj(&**skyhook))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_pod_to_skyhook_reads_the_name_label() {
        let mut pod = Pod::default();
        assert!(pod_to_skyhook(&pod).is_none());

        pod.metadata.labels = Some(BTreeMap::from([(
            LABEL_NAME.to_string(),
            "simple-skyhook".to_string(),
        )]));
        let reference = pod_to_skyhook(&pod).unwrap();
        assert_eq!(reference.name, "simple-skyhook");
    }
}
