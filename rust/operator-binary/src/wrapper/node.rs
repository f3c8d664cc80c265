//! Per-(node, skyhook) projection. All package state a node carries for one
//! Skyhook lives in a single JSON annotation plus one status label; this
//! wrapper is the only code that touches them.

use k8s_openapi::api::core::v1::{Node, Taint};
use kube::ResourceExt;

use crate::crd::{
    node_state_annotation, node_status_label, package_key, NodeState, Package, PackageState,
    PackageStatus, SkyhookState, Stage, TAINT_UNSCHEDULABLE,
};

pub const NO_SCHEDULE: &str = "NoSchedule";

pub struct NodeWrapper {
    pub node: Node,
    skyhook: String,
}

impl NodeWrapper {
    pub fn new(node: Node, skyhook: impl Into<String>) -> Self {
        NodeWrapper {
            node,
            skyhook: skyhook.into(),
        }
    }

    pub fn name(&self) -> String {
        self.node.name_any()
    }

    pub fn skyhook(&self) -> &str {
        &self.skyhook
    }

    /// The per-package state recorded on the node for this Skyhook. A corrupt
    /// annotation is treated as empty so the state machine starts over
    /// instead of wedging.
    pub fn state(&self) -> NodeState {
        let key = node_state_annotation(&self.skyhook);
        match self.node.annotations().get(&key) {
            None => NodeState::new(),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|err| {
                tracing::warn!(
                    node = %self.name(),
                    skyhook = %self.skyhook,
                    error = %err,
                    "corrupt node state annotation, starting over"
                );
                NodeState::new()
            }),
        }
    }

    fn write_state(&mut self, state: &NodeState) {
        let key = node_state_annotation(&self.skyhook);
        let annotations = self.node.annotations_mut();
        if state.is_empty() {
            annotations.remove(&key);
        } else {
            annotations.insert(
                key,
                serde_json::to_string(state).expect("node state serializes"),
            );
        }
    }

    pub fn package_status(&self, name: &str, version: &str) -> Option<PackageStatus> {
        self.state().get(&package_key(name, version)).cloned()
    }

    pub fn set_package_status(&mut self, status: PackageStatus) {
        let mut state = self.state();
        state.insert(package_key(&status.name, &status.version), status);
        self.write_state(&state);
    }

    pub fn remove_package(&mut self, name: &str, version: &str) {
        let mut state = self.state();
        state.remove(&package_key(name, version));
        self.write_state(&state);
    }

    /// Furthest-progressed stage `name` has completed on this node, across
    /// versions, ranked by [`Stage::progress`]. Dependency gating cares
    /// about the package, not the exact version.
    pub fn completed_stage(&self, name: &str) -> Option<Stage> {
        self.state()
            .values()
            .filter(|status| status.name == name && status.state == PackageState::Complete)
            .map(|status| status.stage)
            .max_by_key(|stage| stage.progress())
    }

    /// The stage a package must complete for the node to count as done with
    /// it.
    pub fn terminal_stage(package: &Package) -> Stage {
        if package.interrupt.is_some() {
            Stage::PostInterrupt
        } else {
            Stage::Config
        }
    }

    /// Complete for the Skyhook: every spec package complete at (or past) its
    /// terminal stage, by progress level.
    pub fn is_complete(&self, packages: &[Package]) -> bool {
        let state = self.state();
        packages.iter().all(|package| {
            state
                .get(&package_key(&package.name, &package.version))
                .is_some_and(|status| {
                    status.state == PackageState::Complete
                        && status.stage.progress() >= Self::terminal_stage(package).progress()
                })
        })
    }

    pub fn has_erroring_package(&self) -> bool {
        self.state()
            .values()
            .any(|status| status.state == PackageState::Erroring)
    }

    /// Aggregated per-node status, read from the status label.
    pub fn status(&self) -> SkyhookState {
        self.node
            .labels()
            .get(&node_status_label(&self.skyhook))
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_status(&mut self, status: SkyhookState) {
        self.node
            .labels_mut()
            .insert(node_status_label(&self.skyhook), status.to_string());
    }

    /// Wipes everything this Skyhook recorded on the node.
    pub fn reset(&mut self) {
        let state_key = node_state_annotation(&self.skyhook);
        let status_key = node_status_label(&self.skyhook);
        self.node.annotations_mut().remove(&state_key);
        self.node.labels_mut().remove(&status_key);
    }

    pub fn boot_id(&self) -> Option<String> {
        self.node
            .status
            .as_ref()
            .and_then(|status| status.node_info.as_ref())
            .map(|info| info.boot_id.clone())
            .filter(|id| !id.is_empty())
    }

    pub fn taints(&self) -> &[Taint] {
        self.node
            .spec
            .as_ref()
            .and_then(|spec| spec.taints.as_deref())
            .unwrap_or_default()
    }

    pub fn add_taint(&mut self, taint: Taint) {
        let spec = self.node.spec.get_or_insert_with(Default::default);
        let taints = spec.taints.get_or_insert_with(Vec::new);
        if !taints
            .iter()
            .any(|existing| existing.key == taint.key && existing.effect == taint.effect)
        {
            taints.push(taint);
        }
    }

    /// Cordoned for this Skyhook: the per-Skyhook unschedulable taint is on
    /// the node.
    pub fn is_cordoned(&self) -> bool {
        self.taints()
            .iter()
            .any(|taint| taint.key == TAINT_UNSCHEDULABLE)
    }

    pub fn cordon(&mut self) {
        let skyhook = self.skyhook.clone();
        self.add_taint(Taint {
            key: TAINT_UNSCHEDULABLE.to_string(),
            value: Some(skyhook),
            effect: NO_SCHEDULE.to_string(),
            time_added: None,
        });
    }

    /// Removes the cordon taint, but only if this Skyhook owns it.
    pub fn uncordon(&mut self) {
        let skyhook = self.skyhook.clone();
        if let Some(taints) = self.node.spec.as_mut().and_then(|spec| spec.taints.as_mut()) {
            taints.retain(|taint| {
                taint.key != TAINT_UNSCHEDULABLE || taint.value.as_deref() != Some(skyhook.as_str())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapper() -> NodeWrapper {
        let mut node = Node::default();
        node.metadata.name = Some("node-1".to_string());
        NodeWrapper::new(node, "simple-skyhook")
    }

    fn status(name: &str, version: &str, stage: Stage, state: PackageState) -> PackageStatus {
        PackageStatus {
            name: name.to_string(),
            version: version.to_string(),
            image: format!("example/{name}"),
            stage,
            state,
            restarts: 0,
        }
    }

    fn package(name: &str, version: &str, interrupt: bool) -> Package {
        Package {
            name: name.to_string(),
            version: version.to_string(),
            image: format!("example/{name}"),
            interrupt: interrupt.then(|| crate::crd::Interrupt {
                kind: crate::crd::InterruptType::Reboot,
                services: None,
            }),
            ..Package::default()
        }
    }

    #[test]
    fn test_state_round_trips_through_annotation() {
        let mut node = wrapper();
        node.set_package_status(status("spencer", "3.2.3", Stage::Config, PackageState::Complete));

        let raw = node
            .node
            .annotations()
            .get("skyhook.nvidia.com/nodeState_simple-skyhook")
            .cloned()
            .unwrap();
        let parsed: NodeState = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed.contains_key("spencer|3.2.3"));

        assert_eq!(
            node.package_status("spencer", "3.2.3").unwrap().stage,
            Stage::Config
        );
    }

    #[test]
    fn test_corrupt_annotation_reads_as_empty() {
        let mut node = wrapper();
        node.node.annotations_mut().insert(
            "skyhook.nvidia.com/nodeState_simple-skyhook".to_string(),
            "not json".to_string(),
        );
        assert!(node.state().is_empty());
    }

    #[test]
    fn test_is_complete_requires_terminal_stage() {
        let mut node = wrapper();
        let packages = vec![package("spencer", "3.2.3", false), package("foobar", "1.2", true)];

        node.set_package_status(status("spencer", "3.2.3", Stage::Config, PackageState::Complete));
        node.set_package_status(status("foobar", "1.2", Stage::Config, PackageState::Complete));
        // foobar has an interrupt, so config-complete is not enough
        assert!(!node.is_complete(&packages));

        node.set_package_status(status(
            "foobar",
            "1.2",
            Stage::PostInterrupt,
            PackageState::Complete,
        ));
        assert!(node.is_complete(&packages));
    }

    #[test]
    fn test_is_complete_checks_exact_version() {
        let mut node = wrapper();
        let packages = vec![package("spencer", "3.2.4", false)];
        node.set_package_status(status("spencer", "3.2.3", Stage::Config, PackageState::Complete));
        assert!(!node.is_complete(&packages));
    }

    #[test]
    fn test_upgrade_complete_is_not_terminal() {
        let mut node = wrapper();
        let packages = vec![package("spencer", "3.2.3", false)];
        // the upgrade stage ran, but config has not
        node.set_package_status(status(
            "spencer",
            "3.2.3",
            Stage::Upgrade,
            PackageState::Complete,
        ));
        assert!(!node.is_complete(&packages));

        node.set_package_status(status("spencer", "3.2.3", Stage::Config, PackageState::Complete));
        assert!(node.is_complete(&packages));
    }

    #[test]
    fn test_cordon_uncordon_owns_taint() {
        let mut node = wrapper();
        node.cordon();
        assert!(node.is_cordoned());

        // another skyhook's cordon is left alone
        let mut other = NodeWrapper::new(node.node.clone(), "other");
        other.uncordon();
        assert!(other.is_cordoned());

        node.node = other.node;
        node.uncordon();
        assert!(!node.is_cordoned());
    }

    #[test]
    fn test_status_label_round_trip() {
        let mut node = wrapper();
        assert_eq!(node.status(), SkyhookState::Unknown);
        node.set_status(SkyhookState::Complete);
        assert_eq!(node.status(), SkyhookState::Complete);
        assert_eq!(
            node.node.labels().get("skyhook.nvidia.com/status_simple-skyhook"),
            Some(&"complete".to_string())
        );
    }

    #[test]
    fn test_reset_clears_skyhook_keys_only() {
        let mut node = wrapper();
        node.node
            .labels_mut()
            .insert("unrelated".to_string(), "label".to_string());
        node.set_status(SkyhookState::InProgress);
        node.set_package_status(status("spencer", "3.2.3", Stage::Apply, PackageState::InProgress));

        node.reset();
        assert!(node.state().is_empty());
        assert_eq!(node.status(), SkyhookState::Unknown);
        assert!(node.node.labels().contains_key("unrelated"));
    }

    #[test]
    fn test_completed_stage_takes_furthest_progress() {
        let mut node = wrapper();
        node.set_package_status(status("dep", "1.0.0", Stage::Apply, PackageState::Complete));
        node.set_package_status(status("dep", "2.0.0", Stage::Config, PackageState::Complete));
        assert_eq!(node.completed_stage("dep"), Some(Stage::Config));
        assert_eq!(node.completed_stage("ghost"), None);

        // a completed upgrade ranks at apply level, below config
        let mut upgrading = wrapper();
        upgrading.set_package_status(status("dep", "1.0.0", Stage::Config, PackageState::Complete));
        upgrading.set_package_status(status("dep", "2.0.0", Stage::Upgrade, PackageState::Complete));
        assert_eq!(upgrading.completed_stage("dep"), Some(Stage::Config));

        // in-progress entries carry nothing
        let mut midflight = wrapper();
        midflight.set_package_status(status(
            "dep",
            "2.0.0",
            Stage::Upgrade,
            PackageState::InProgress,
        ));
        assert_eq!(midflight.completed_stage("dep"), None);
    }

    #[test]
    fn test_add_taint_is_idempotent_by_key_and_effect() {
        let mut node = wrapper();
        node.cordon();
        node.cordon();
        assert_eq!(node.taints().len(), 1);
    }

    #[test]
    fn test_boot_id_absent_on_bare_node() {
        let node = wrapper();
        assert_eq!(node.boot_id(), None);
    }

    #[test]
    fn test_write_state_removes_empty_annotation() {
        let mut node = wrapper();
        node.set_package_status(status("spencer", "3.2.3", Stage::Apply, PackageState::InProgress));
        node.remove_package("spencer", "3.2.3");
        assert!(node.node.annotations().is_empty());
    }
}
