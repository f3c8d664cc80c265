//! Per-Skyhook projection: status fields, conditions, config-update and
//! priority-pick bookkeeping, and the legacy-format migrations that run at
//! the top of every tick.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::ResourceExt;

use crate::crd::{package_key, Skyhook, SkyhookState, SkyhookStatus, FINALIZER};
use crate::wrapper::NodeWrapper;

pub struct SkyhookWrapper {
    pub skyhook: Skyhook,
    /// Status before the last [`set_status`](Self::set_status), for event
    /// emission.
    pub prior_status: Option<SkyhookState>,
}

impl SkyhookWrapper {
    pub fn new(skyhook: Skyhook) -> Self {
        SkyhookWrapper {
            skyhook,
            prior_status: None,
        }
    }

    pub fn name(&self) -> String {
        self.skyhook.name_any()
    }

    pub fn status(&self) -> SkyhookState {
        self.skyhook
            .status
            .as_ref()
            .map(|status| status.status)
            .unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut SkyhookStatus {
        self.skyhook.status.get_or_insert_with(Default::default)
    }

    /// Sets the aggregated status, remembering the previous value once per
    /// tick.
    pub fn set_status(&mut self, status: SkyhookState) {
        let current = self.status();
        if current == status {
            return;
        }
        if self.prior_status.is_none() {
            self.prior_status = Some(current);
        }
        self.status_mut().status = status;
    }

    pub fn is_deleting(&self) -> bool {
        self.skyhook.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.skyhook
            .metadata
            .finalizers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|finalizer| finalizer == FINALIZER)
    }

    pub fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.skyhook
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(FINALIZER.to_string());
        }
    }

    pub fn remove_finalizer(&mut self) {
        if let Some(finalizers) = self.skyhook.metadata.finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != FINALIZER);
        }
    }

    pub fn set_observed_generation(&mut self) {
        let generation = self.skyhook.metadata.generation.unwrap_or_default();
        let status = self.status_mut();
        if status.observed_generation < generation {
            status.observed_generation = generation;
        }
    }

    /// Finalizer removal bumps the generation; recording generation+1
    /// suppresses the immediate self-triggered tick.
    pub fn bump_observed_generation(&mut self) {
        self.status_mut().observed_generation += 1;
    }

    /// Adds or updates a condition. The transition time only moves when the
    /// condition's boolean status actually changes.
    pub fn upsert_condition(&mut self, type_: &str, status: bool, reason: &str, message: &str) {
        let generation = self.skyhook.metadata.generation;
        let status_text = if status { "True" } else { "False" };
        let conditions = &mut self.status_mut().conditions;

        match conditions
            .iter_mut()
            .find(|condition| condition.type_ == type_)
        {
            Some(condition) => {
                if condition.status != status_text {
                    condition.last_transition_time = Time(chrono::Utc::now());
                }
                condition.status = status_text.to_string();
                condition.reason = reason.to_string();
                condition.message = message.to_string();
                condition.observed_generation = generation;
            }
            None => conditions.push(Condition {
                type_: type_.to_string(),
                status: status_text.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                observed_generation: generation,
                last_transition_time: Time(chrono::Utc::now()),
            }),
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.skyhook
            .status
            .as_ref()?
            .conditions
            .iter()
            .find(|condition| condition.type_ == type_)
    }

    // priority-pick bookkeeping

    /// Drops picks for nodes that are complete or no longer selected. The
    /// rest stay picked, which is what keeps the picker sticky.
    pub fn prune_priority_picks(&mut self, nodes: &[NodeWrapper]) {
        let packages = self.skyhook.packages();
        let keep: Vec<String> = nodes
            .iter()
            .filter(|node| !node.is_complete(&packages))
            .map(|node| node.name())
            .collect();
        self.status_mut()
            .node_priority
            .retain(|node, _| keep.iter().any(|name| name == node));
    }

    pub fn record_priority_pick(&mut self, node: &str) {
        self.status_mut()
            .node_priority
            .entry(node.to_string())
            .or_insert_with(|| Time(chrono::Utc::now()));
    }

    pub fn priority_picks(&self) -> Vec<String> {
        self.skyhook
            .status
            .as_ref()
            .map(|status| status.node_priority.keys().cloned().collect())
            .unwrap_or_default()
    }

    // config-update bookkeeping

    pub fn config_updates(&self, package: &str) -> Vec<String> {
        self.skyhook
            .status
            .as_ref()
            .and_then(|status| status.config_updates.get(package).cloned())
            .unwrap_or_default()
    }

    pub fn set_config_updates(&mut self, package: &str, keys: Vec<String>) {
        self.status_mut()
            .config_updates
            .insert(package.to_string(), keys);
    }

    pub fn clear_config_updates(&mut self, package: &str) {
        self.status_mut().config_updates.remove(package);
    }

    /// Legacy-format upgrades; must be idempotent. Node-state entries were
    /// once keyed by bare package name, now by `name|version`.
    pub fn migrate(&mut self) {
        let Some(status) = self.skyhook.status.as_mut() else {
            return;
        };
        for state in status.node_state.values_mut() {
            let legacy: Vec<String> = state
                .keys()
                .filter(|key| !key.contains('|'))
                .cloned()
                .collect();
            for key in legacy {
                if let Some(package) = state.remove(&key) {
                    state.insert(package_key(&package.name, &package.version), package);
                }
            }
        }
    }

    /// Drops node-keyed status entries for nodes outside the current
    /// selection. Package-keyed maps are preserved.
    pub fn prune_node_maps(&mut self, nodes: &[NodeWrapper]) {
        let names: Vec<String> = nodes.iter().map(|node| node.name()).collect();
        let status = self.status_mut();
        let selected = |node: &String| names.iter().any(|name| name == node);
        status.node_state.retain(|node, _| selected(node));
        status.node_boot_ids.retain(|node, _| selected(node));
        status.node_priority.retain(|node, _| selected(node));
    }

    /// Refreshes the printer-column summaries and the status mirror of the
    /// node states.
    pub fn update_summaries(&mut self, nodes: &[NodeWrapper]) {
        let packages = self.skyhook.packages();
        let complete = nodes
            .iter()
            .filter(|node| node.is_complete(&packages))
            .count();
        let in_progress: Vec<String> = nodes
            .iter()
            .filter(|node| node.status() == SkyhookState::InProgress)
            .map(|node| node.name())
            .collect();
        let package_list = packages
            .iter()
            .map(|package| format!("{}:{}", package.name, package.version))
            .collect::<Vec<_>>()
            .join(",");

        let node_state = nodes
            .iter()
            .map(|node| (node.name(), node.state()))
            .filter(|(_, state)| !state.is_empty())
            .collect();

        let status = self.status_mut();
        status.complete_nodes = format!("{complete}/{}", nodes.len());
        status.package_list = package_list;
        status.nodes_in_progress = in_progress.join(",");
        status.node_state = node_state;
    }
}

/// Derives a Skyhook's aggregated status from its node projections.
pub fn collect_node_status(nodes: &[NodeWrapper]) -> SkyhookState {
    if nodes.is_empty() {
        return SkyhookState::Unknown;
    }
    let statuses: Vec<SkyhookState> = nodes.iter().map(|node| node.status()).collect();
    if statuses.iter().any(|s| *s == SkyhookState::Unknown) {
        return SkyhookState::Unknown;
    }
    if statuses.iter().any(|s| *s == SkyhookState::InProgress) {
        return SkyhookState::InProgress;
    }
    if statuses.iter().any(|s| *s == SkyhookState::Erroring) {
        return SkyhookState::Erroring;
    }
    if statuses.iter().all(|s| *s == SkyhookState::Complete) {
        return SkyhookState::Complete;
    }
    SkyhookState::Unknown
}
