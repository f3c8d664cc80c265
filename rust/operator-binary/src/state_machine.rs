//! The per-(node, package) state machine: stage progression through the
//! dependency graph, version-change handling, and the cordon/drain/interrupt
//! protocol around disruptive stages.

use std::cmp::Ordering;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::{ResultExt, Snafu};

use crate::{
    cluster_state::labels_match,
    config::OperatorConfig,
    crd::{
        glob_matches, parse_version, Interrupt, InterruptType, Package, PackageState,
        PackageStatus, SkyhookState, Stage, LABEL_INTERRUPT, LABEL_NAME,
    },
    dal::{self, Dal},
    drain,
    events::{EventPublisher, Reason},
    graph::DependencyGraph,
    metrics,
    pods::{self, PodOutcome},
    wrapper::{NodeWrapper, SkyhookWrapper},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster api call failed"))]
    Api { source: dal::Error },

    #[snafu(display("package {package}: recorded version {version:?} is unparseable"))]
    BadRecordedVersion {
        package: String,
        version: String,
        source: semver::Error,
    },

    #[snafu(display("package {package}: spec version {version:?} is unparseable"))]
    BadSpecVersion {
        package: String,
        version: String,
        source: semver::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VersionDelta {
    Unchanged,
    /// Spec version is newer than the recorded one.
    Upgrade,
    /// Spec version is older; the recorded one must be uninstalled first.
    Downgrade,
}

pub fn version_delta(package: &str, spec: &str, recorded: &str) -> Result<VersionDelta> {
    let spec_version = parse_version(spec).context(BadSpecVersionSnafu {
        package,
        version: spec,
    })?;
    let recorded_version = parse_version(recorded).context(BadRecordedVersionSnafu {
        package,
        version: recorded,
    })?;
    Ok(match spec_version.cmp(&recorded_version) {
        Ordering::Equal => VersionDelta::Unchanged,
        Ordering::Greater => VersionDelta::Upgrade,
        Ordering::Less => VersionDelta::Downgrade,
    })
}

/// The stage that follows a completed `current`. `None` means the package is
/// done. Uninstall completion is handled by entry removal, not by this
/// table.
pub fn next_stage(current: Stage, needs_interrupt: bool) -> Option<Stage> {
    match current {
        Stage::Apply | Stage::Upgrade => Some(Stage::Config),
        Stage::Config => needs_interrupt.then_some(Stage::Interrupt),
        Stage::Interrupt => Some(Stage::PostInterrupt),
        Stage::PostInterrupt => None,
        Stage::Uninstall => None,
    }
}

/// The interrupts a package brings to the merge: its own when no config
/// update is pending, otherwise the interrupts registered under each matched
/// changed key.
pub fn interrupt_candidates(
    packages: &[Package],
    pending: impl Fn(&str) -> Vec<String>,
) -> Vec<(String, Interrupt)> {
    let mut candidates = Vec::new();
    for package in packages {
        let changed_keys = pending(&package.name);
        if changed_keys.is_empty() {
            if let Some(interrupt) = &package.interrupt {
                candidates.push((package.name.clone(), interrupt.clone()));
            }
        } else if let Some(config_interrupts) = &package.config_interrupts {
            for (pattern, interrupt) in config_interrupts {
                if changed_keys.iter().any(|key| glob_matches(pattern, key)) {
                    candidates.push((package.name.clone(), interrupt.clone()));
                }
            }
        }
    }
    candidates
}

pub fn needs_interrupt(package: &Package, pending_keys: &[String]) -> bool {
    if pending_keys.is_empty() {
        return package.interrupt.is_some();
    }
    package
        .config_interrupts
        .as_ref()
        .is_some_and(|config_interrupts| {
            config_interrupts
                .keys()
                .any(|pattern| pending_keys.iter().any(|key| glob_matches(pattern, key)))
        })
}

/// Merges the interrupts of one batch into the single interrupt that runs.
/// Packages are considered in ascending name order; the highest priority
/// wins, `service` ties merge their service lists, and a `reboot` short-
/// circuits. Returns the merged interrupt and the owning package.
pub fn merge_interrupts(mut candidates: Vec<(String, Interrupt)>) -> Option<(Interrupt, String)> {
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    let mut merged: Option<(Interrupt, String)> = None;
    for (package, interrupt) in candidates {
        match &mut merged {
            None => merged = Some((interrupt, package)),
            Some((current, _)) => {
                if interrupt.kind.priority() < current.kind.priority() {
                    merged = Some((interrupt, package));
                } else if interrupt.kind == current.kind
                    && current.kind == InterruptType::Service
                {
                    current
                        .services
                        .get_or_insert_with(Vec::new)
                        .extend(interrupt.services.unwrap_or_default());
                }
            }
        }
        if merged
            .as_ref()
            .is_some_and(|(interrupt, _)| interrupt.kind == InterruptType::Reboot)
        {
            break;
        }
    }

    if let Some((interrupt, _)) = &mut merged {
        match interrupt.kind {
            InterruptType::Service => {
                if let Some(services) = &mut interrupt.services {
                    services.sort();
                    services.dedup();
                }
            }
            _ => interrupt.services = None,
        }
    }
    merged
}

/// Strips the version-derived tag off a recorded image reference.
fn untag(image: &str) -> String {
    match image.rsplit_once(':') {
        Some((head, tail)) if !tail.contains('/') => head.to_string(),
        _ => image.to_string(),
    }
}

/// Applies version deltas between the spec and the node's recorded state:
/// upgrades restart the chain at `upgrade`, downgrades uninstall the old
/// version first with the new one parked as `skipped`, removed packages
/// begin `uninstall`. Any delta clears the package's pending config-update
/// keys. Returns true when something changed.
pub fn resolve_version_changes(
    skyhook: &mut SkyhookWrapper,
    node: &mut NodeWrapper,
) -> Result<bool> {
    let spec_packages = skyhook.skyhook.packages();
    let state = node.state();
    let mut changed = false;

    for status in state.values() {
        let spec = spec_packages
            .iter()
            .find(|package| package.name == status.name);

        match spec {
            None => {
                // removed from spec entirely
                if status.stage != Stage::Uninstall {
                    node.set_package_status(PackageStatus {
                        stage: Stage::Uninstall,
                        state: PackageState::InProgress,
                        restarts: 0,
                        ..status.clone()
                    });
                    skyhook.clear_config_updates(&status.name);
                    changed = true;
                }
            }
            Some(package) if package.version == status.version => {}
            Some(package) => {
                match version_delta(&package.name, &package.version, &status.version)? {
                    VersionDelta::Unchanged => {}
                    VersionDelta::Upgrade => {
                        node.remove_package(&status.name, &status.version);
                        node.set_package_status(PackageStatus {
                            name: package.name.clone(),
                            version: package.version.clone(),
                            image: package.tagged_image(),
                            stage: Stage::Upgrade,
                            state: PackageState::InProgress,
                            restarts: 0,
                        });
                        skyhook.clear_config_updates(&package.name);
                        changed = true;
                    }
                    VersionDelta::Downgrade => {
                        if status.stage != Stage::Uninstall {
                            node.set_package_status(PackageStatus {
                                stage: Stage::Uninstall,
                                state: PackageState::InProgress,
                                restarts: 0,
                                ..status.clone()
                            });
                            // the new, lower version waits for the uninstall
                            node.set_package_status(PackageStatus {
                                name: package.name.clone(),
                                version: package.version.clone(),
                                image: package.tagged_image(),
                                stage: Stage::Uninstall,
                                state: PackageState::Skipped,
                                restarts: 0,
                            });
                            skyhook.clear_config_updates(&package.name);
                            changed = true;
                        }
                    }
                }
            }
        }
    }

    // a parked (skipped) version whose predecessor finished uninstalling
    // starts fresh
    let state = node.state();
    for (key, status) in &state {
        if status.state != PackageState::Skipped {
            continue;
        }
        let predecessor_active = state.values().any(|other| {
            other.name == status.name && other.version != status.version
        });
        if !predecessor_active {
            let (name, version) = (status.name.clone(), status.version.clone());
            node.remove_package(&name, &version);
            changed = true;
            tracing::debug!(package = %key, "parked version unblocked, restarting chain");
        }
    }

    Ok(changed)
}

/// What to do for one package on one node this tick.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PackageAction {
    /// Create the pod for this stage and mark the package in progress at it.
    CreatePod(Stage),
    /// A pod for the current stage is still running.
    AwaitPod(Stage),
    /// The current stage's pod succeeded.
    StageComplete(Stage),
    /// The current stage's pod failed.
    StageFailed(Stage),
    /// The next stage is `interrupt`; node-level gating applies.
    NeedsInterrupt,
    /// Dependencies are not far enough along.
    Blocked,
    /// Nothing to do.
    Done,
}

/// The per-package transition function. Total over
/// (status, pod outcome, dependency readiness, interrupt presence).
///
/// Dependency gates: the apply-level stages (apply, upgrade) may not start
/// until every dependency is apply-complete, advancing into config requires
/// the same, and the interrupt transition requires config-complete
/// dependencies. An upgrade entered through a version change re-enters the
/// apply gate here, since its pod is only created from this table.
pub fn package_action(
    status: Option<&PackageStatus>,
    pod: Option<PodOutcome>,
    deps_applied: bool,
    deps_configured: bool,
    pending_interrupt: bool,
) -> PackageAction {
    let Some(status) = status else {
        return if deps_applied {
            PackageAction::CreatePod(Stage::Apply)
        } else {
            PackageAction::Blocked
        };
    };

    match status.state {
        PackageState::Skipped => PackageAction::Done,
        PackageState::InProgress | PackageState::Erroring => match pod {
            None => {
                if matches!(status.stage, Stage::Apply | Stage::Upgrade) && !deps_applied {
                    PackageAction::Blocked
                } else {
                    PackageAction::CreatePod(status.stage)
                }
            }
            Some(PodOutcome::Running) => PackageAction::AwaitPod(status.stage),
            Some(PodOutcome::Succeeded) => PackageAction::StageComplete(status.stage),
            Some(PodOutcome::Failed) => PackageAction::StageFailed(status.stage),
        },
        PackageState::Complete => match next_stage(status.stage, pending_interrupt) {
            None => PackageAction::Done,
            Some(Stage::Interrupt) => {
                if deps_configured {
                    PackageAction::NeedsInterrupt
                } else {
                    PackageAction::Blocked
                }
            }
            // past apply only once every dependency is apply-complete; a
            // dependency regressing into an upgrade closes this gate again
            Some(Stage::Config) => {
                if deps_applied {
                    PackageAction::CreatePod(Stage::Config)
                } else {
                    PackageAction::Blocked
                }
            }
            Some(stage) => PackageAction::CreatePod(stage),
        },
    }
}

/// Did this tick move, wait, or find nothing to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeProgress {
    Idle,
    Progressed,
    Waiting,
}

struct WorkItem {
    package: Package,
    status: Option<PackageStatus>,
    /// Not in the spec anymore; manufactured from recorded state for the
    /// in-flight uninstall.
    synthetic: bool,
}

fn work_items(skyhook: &SkyhookWrapper, node: &NodeWrapper) -> Vec<WorkItem> {
    let spec_packages = skyhook.skyhook.packages();
    let state = node.state();

    let mut items: Vec<WorkItem> = spec_packages
        .iter()
        .map(|package| WorkItem {
            status: state
                .get(&crate::crd::package_key(&package.name, &package.version))
                .cloned(),
            package: package.clone(),
            synthetic: false,
        })
        .collect();

    for status in state.values() {
        let in_spec = spec_packages
            .iter()
            .any(|package| package.name == status.name && package.version == status.version);
        if !in_spec {
            items.push(WorkItem {
                package: Package {
                    name: status.name.clone(),
                    version: status.version.clone(),
                    image: untag(&status.image),
                    ..Package::default()
                },
                status: Some(status.clone()),
                synthetic: true,
            });
        }
    }

    items.sort_by(|a, b| {
        a.package
            .name
            .cmp(&b.package.name)
            .then_with(|| a.package.version.cmp(&b.package.version))
    });
    items
}

pub struct Advance<'a> {
    pub dal: &'a Dal,
    pub config: &'a OperatorConfig,
    pub events: &'a EventPublisher,
}

impl Advance<'_> {
    /// Drives one node one step forward. Stage completions are folded in
    /// first, then either the interrupt protocol or plain pod creation runs,
    /// bounded by the serial flag.
    pub async fn process_node(
        &self,
        skyhook: &mut SkyhookWrapper,
        node: &mut NodeWrapper,
        graph: &DependencyGraph,
        skyhook_pods: &[Pod],
    ) -> Result<NodeProgress> {
        let skyhook_name = skyhook.name();
        let node_name = node.name();

        resolve_version_changes(skyhook, node)?;

        let pods_on_node: Vec<&Pod> = skyhook_pods
            .iter()
            .filter(|pod| {
                pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref())
                    == Some(node_name.as_str())
            })
            .collect();
        let interrupt_pod = pods_on_node
            .iter()
            .find(|pod| pod.labels().contains_key(LABEL_INTERRUPT))
            .copied();

        let mut progress = NodeProgress::Idle;
        let mut created = 0usize;
        let mut interrupt_wanted: Vec<Package> = Vec::new();

        let completed = |name: &str| node.completed_stage(name);
        let items = work_items(skyhook, node);
        let mut actions: Vec<(WorkItem, PackageAction)> = Vec::with_capacity(items.len());
        for item in items {
            let stage_pod = |stage: Stage| -> Option<PodOutcome> {
                if stage == Stage::Interrupt {
                    return interrupt_pod.map(pods::pod_outcome);
                }
                let name = pods::pod_name(&skyhook_name, &item.package, stage, &node_name);
                pods_on_node
                    .iter()
                    .find(|pod| pod.name_any() == name)
                    .copied()
                    .map(pods::pod_outcome)
            };

            let pod = item.status.as_ref().and_then(|status| stage_pod(status.stage));
            let pending_keys = skyhook.config_updates(&item.package.name);
            let action = package_action(
                item.status.as_ref(),
                pod,
                item.synthetic || graph.ready_at(&item.package.name, Stage::Apply, completed),
                item.synthetic || graph.ready_at(&item.package.name, Stage::Config, completed),
                needs_interrupt(&item.package, &pending_keys),
            );
            actions.push((item, action));
        }

        for (item, action) in actions {
            let package = &item.package;
            match action {
                PackageAction::Done | PackageAction::Blocked => {}
                PackageAction::AwaitPod(_) => {
                    progress = NodeProgress::Waiting;
                }
                PackageAction::StageComplete(stage) => {
                    self.complete_stage(skyhook, node, &item, stage).await?;
                    progress = NodeProgress::Progressed;
                }
                PackageAction::StageFailed(stage) => {
                    self.fail_stage(skyhook, node, &item, stage).await?;
                    progress = NodeProgress::Progressed;
                }
                PackageAction::NeedsInterrupt => {
                    interrupt_wanted.push(package.clone());
                }
                PackageAction::CreatePod(stage) => {
                    if skyhook.skyhook.spec.serial && created >= 1 {
                        continue;
                    }
                    self.create_stage_pod(skyhook, node, &item, stage).await?;
                    created += 1;
                    progress = NodeProgress::Progressed;
                }
            }
        }

        if !interrupt_wanted.is_empty() {
            let gate = self
                .run_interrupt_protocol(skyhook, node, &interrupt_wanted, interrupt_pod)
                .await?;
            if gate != NodeProgress::Idle {
                progress = gate;
            }
        }

        let packages = skyhook.skyhook.packages();
        if node.is_complete(&packages) {
            if node.status() != SkyhookState::Complete {
                node.set_status(SkyhookState::Complete);
                node.uncordon();
                self.events
                    .skyhook_and_node(
                        &skyhook.skyhook,
                        &node.node,
                        Reason::State,
                        format!("node {node_name} complete"),
                    )
                    .await;
                progress = NodeProgress::Progressed;
            }
        } else if node.has_erroring_package() {
            node.set_status(SkyhookState::Erroring);
        } else if !node.state().is_empty() {
            node.set_status(SkyhookState::InProgress);
        }

        Ok(progress)
    }

    async fn complete_stage(
        &self,
        skyhook: &mut SkyhookWrapper,
        node: &mut NodeWrapper,
        item: &WorkItem,
        stage: Stage,
    ) -> Result<()> {
        let package = &item.package;
        let status = item.status.clone().expect("completed stages have status");

        if stage == Stage::Interrupt {
            // the merged interrupt covered every package waiting on it
            let state = node.state();
            for other in state.values() {
                if other.stage == Stage::Interrupt && other.state != PackageState::Complete {
                    node.set_package_status(PackageStatus {
                        state: PackageState::Complete,
                        ..other.clone()
                    });
                }
            }
            if let Some(pod) = self.find_interrupt_pod_name(skyhook, node).await? {
                self.dal.delete_pod(&pod).await.context(ApiSnafu)?;
            }
        } else {
            node.set_package_status(PackageStatus {
                state: PackageState::Complete,
                ..status.clone()
            });
            let name = pods::pod_name(&skyhook.name(), package, stage, &node.name());
            self.dal.delete_pod(&name).await.context(ApiSnafu)?;
        }

        if stage == Stage::Uninstall {
            node.remove_package(&status.name, &status.version);
        }

        // terminal for this chain: the pending config keys have been applied.
        // A config completion with an interrupt still owed must keep its keys
        // so the interrupt merge can see them.
        let pending = skyhook.config_updates(&package.name);
        if next_stage(stage, needs_interrupt(package, &pending)).is_none() && !item.synthetic {
            skyhook.clear_config_updates(&package.name);
        }

        self.events
            .skyhook_and_node(
                &skyhook.skyhook,
                &node.node,
                Reason::State,
                format!(
                    "package {}-{} completed {stage} on {}",
                    status.name,
                    status.version,
                    node.name()
                ),
            )
            .await;
        Ok(())
    }

    async fn fail_stage(
        &self,
        skyhook: &mut SkyhookWrapper,
        node: &mut NodeWrapper,
        item: &WorkItem,
        stage: Stage,
    ) -> Result<()> {
        let status = item.status.clone().expect("failed stages have status");
        node.set_package_status(PackageStatus {
            state: PackageState::Erroring,
            restarts: status.restarts + 1,
            ..status.clone()
        });

        let pod_name = if stage == Stage::Interrupt {
            self.find_interrupt_pod_name(skyhook, node).await?
        } else {
            Some(pods::pod_name(
                &skyhook.name(),
                &item.package,
                stage,
                &node.name(),
            ))
        };
        if let Some(pod_name) = pod_name {
            self.dal.delete_pod(&pod_name).await.context(ApiSnafu)?;
        }

        self.events
            .skyhook_and_node(
                &skyhook.skyhook,
                &node.node,
                Reason::State,
                format!(
                    "package {}-{} failed {stage} on {} (restarts: {})",
                    status.name,
                    status.version,
                    node.name(),
                    status.restarts + 1,
                ),
            )
            .await;
        Ok(())
    }

    async fn create_stage_pod(
        &self,
        skyhook: &mut SkyhookWrapper,
        node: &mut NodeWrapper,
        item: &WorkItem,
        stage: Stage,
    ) -> Result<()> {
        let package = &item.package;
        let pod = pods::build_package_pod(
            &skyhook.skyhook,
            package,
            stage,
            &node.name(),
            self.config,
        );
        self.dal.create_pod(&pod).await.context(ApiSnafu)?;

        let restarts = item.status.as_ref().map(|status| status.restarts).unwrap_or(0);
        node.set_package_status(PackageStatus {
            name: package.name.clone(),
            version: package.version.clone(),
            image: package.tagged_image(),
            stage,
            state: PackageState::InProgress,
            restarts,
        });

        metrics::count_stage(&skyhook.name(), &package.name, stage);
        self.events
            .skyhook_and_node(
                &skyhook.skyhook,
                &node.node,
                Reason::Apply,
                format!(
                    "running {stage} for package {}-{} on {}",
                    package.name,
                    package.version,
                    node.name()
                ),
            )
            .await;
        Ok(())
    }

    /// The gate sequence in front of an interrupt: cordon, wait for
    /// non-interrupt work, wait for other package pods, drain, then create
    /// the merged interrupt pod.
    async fn run_interrupt_protocol(
        &self,
        skyhook: &mut SkyhookWrapper,
        node: &mut NodeWrapper,
        wanting: &[Package],
        interrupt_pod: Option<&Pod>,
    ) -> Result<NodeProgress> {
        let node_name = node.name();

        if interrupt_pod.is_some() {
            // already in flight; outcome handling advances it
            return Ok(NodeProgress::Waiting);
        }

        if !node.is_cordoned() {
            node.cordon();
            self.events
                .skyhook_and_node(
                    &skyhook.skyhook,
                    &node.node,
                    Reason::Drain,
                    format!("cordoned {node_name} ahead of interrupt"),
                )
                .await;
            return Ok(NodeProgress::Waiting);
        }

        let all_pods = self
            .dal
            .list_pods_on_node(&node_name)
            .await
            .context(ApiSnafu)?;

        // non-interrupt work must have drained to zero
        if let Some(selector) = skyhook.skyhook.spec.pod_non_interrupt_labels.as_ref() {
            let blocking = all_pods
                .iter()
                .filter(|pod| labels_match(Some(selector), pod.labels()))
                .filter(|pod| drain::is_evictable(pod))
                .count();
            if blocking > 0 {
                tracing::debug!(
                    node = %node_name,
                    blocking,
                    "waiting for non-interrupt work to drain"
                );
                return Ok(NodeProgress::Waiting);
            }
        }

        // other skyhook-owned package pods must have completed
        let busy_package_pods = all_pods
            .iter()
            .filter(|pod| pod.labels().contains_key(LABEL_NAME))
            .filter(|pod| !pod.labels().contains_key(LABEL_INTERRUPT))
            .any(|pod| pods::pod_outcome(pod) == PodOutcome::Running);
        if busy_package_pods {
            return Ok(NodeProgress::Waiting);
        }

        // drain is a gate: evict and come back
        let evictable = drain::evictable(&all_pods);
        if !evictable.is_empty() {
            self.events
                .skyhook_and_node(
                    &skyhook.skyhook,
                    &node.node,
                    Reason::Drain,
                    format!("draining {} pods from {node_name}", evictable.len()),
                )
                .await;
            drain::evict_all(self.dal, &evictable)
                .await
                .context(ApiSnafu)?;
            return Ok(NodeProgress::Waiting);
        }

        let candidates = interrupt_candidates(wanting, |package| skyhook.config_updates(package));
        let Some((merged, owner)) = merge_interrupts(candidates) else {
            return Ok(NodeProgress::Idle);
        };
        let owner_package = wanting
            .iter()
            .find(|package| package.name == owner)
            .expect("owner comes from the candidate set")
            .clone();

        let pod = pods::build_interrupt_pod(
            &skyhook.skyhook,
            &owner_package,
            &merged,
            &node_name,
            self.config,
        );
        self.dal.create_pod(&pod).await.context(ApiSnafu)?;
        metrics::count_stage(&skyhook.name(), &owner_package.name, Stage::Interrupt);

        for package in wanting {
            if let Some(status) = node.package_status(&package.name, &package.version) {
                node.set_package_status(PackageStatus {
                    stage: Stage::Interrupt,
                    state: PackageState::InProgress,
                    ..status
                });
            }
        }

        self.events
            .skyhook_and_node(
                &skyhook.skyhook,
                &node.node,
                Reason::Interrupt,
                format!(
                    "running {} interrupt on {node_name} (owner {owner})",
                    merged.kind
                ),
            )
            .await;
        Ok(NodeProgress::Progressed)
    }

    async fn find_interrupt_pod_name(
        &self,
        skyhook: &SkyhookWrapper,
        node: &NodeWrapper,
    ) -> Result<Option<String>> {
        let pods = self
            .dal
            .list_skyhook_pods(&skyhook.name())
            .await
            .context(ApiSnafu)?;
        Ok(pods
            .iter()
            .filter(|pod| pod.labels().contains_key(LABEL_INTERRUPT))
            .find(|pod| {
                pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref())
                    == Some(node.name().as_str())
            })
            .map(|pod| pod.name_any()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Node;
    use rstest::rstest;

    use super::*;
    use crate::crd::{Skyhook, SkyhookSpec};

    fn interrupt(kind: InterruptType, services: &[&str]) -> Interrupt {
        Interrupt {
            kind,
            services: (!services.is_empty())
                .then(|| services.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn package(name: &str, version: &str) -> Package {
        Package {
            name: name.to_string(),
            version: version.to_string(),
            image: format!("ghcr.io/example/{name}"),
            ..Package::default()
        }
    }

    fn status(name: &str, version: &str, stage: Stage, state: PackageState) -> PackageStatus {
        PackageStatus {
            name: name.to_string(),
            version: version.to_string(),
            image: format!("ghcr.io/example/{name}:{version}"),
            stage,
            state,
            restarts: 0,
        }
    }

    fn wrappers(packages: &[Package]) -> (SkyhookWrapper, NodeWrapper) {
        let spec = SkyhookSpec {
            packages: packages
                .iter()
                .map(|package| (package.name.clone(), package.clone()))
                .collect(),
            ..Default::default()
        };
        let skyhook = SkyhookWrapper::new(Skyhook::new("test", spec));
        let mut node = Node::default();
        node.metadata.name = Some("node-1".to_string());
        (skyhook, NodeWrapper::new(node, "test"))
    }

    #[rstest]
    #[case("1.2.3", "1.2.3", VersionDelta::Unchanged)]
    #[case("1.2", "1.2.0", VersionDelta::Unchanged)]
    #[case("2.0.0", "1.9.9", VersionDelta::Upgrade)]
    #[case("v3.3", "3.2.3", VersionDelta::Upgrade)]
    #[case("1.0.0", "1.0.1", VersionDelta::Downgrade)]
    fn test_version_delta(#[case] spec: &str, #[case] recorded: &str, #[case] expected: VersionDelta) {
        assert_eq!(version_delta("pkg", spec, recorded).unwrap(), expected);
    }

    #[test]
    fn test_version_delta_is_a_hard_error_on_garbage() {
        assert!(matches!(
            version_delta("pkg", "1.0.0", "not-a-version"),
            Err(Error::BadRecordedVersion { .. })
        ));
        assert!(matches!(
            version_delta("pkg", "garbage", "1.0.0"),
            Err(Error::BadSpecVersion { .. })
        ));
    }

    #[rstest]
    #[case(Stage::Apply, false, Some(Stage::Config))]
    #[case(Stage::Upgrade, false, Some(Stage::Config))]
    #[case(Stage::Config, true, Some(Stage::Interrupt))]
    #[case(Stage::Config, false, None)]
    #[case(Stage::Interrupt, false, Some(Stage::PostInterrupt))]
    #[case(Stage::PostInterrupt, true, None)]
    #[case(Stage::Uninstall, false, None)]
    fn test_next_stage(
        #[case] current: Stage,
        #[case] needs_interrupt: bool,
        #[case] expected: Option<Stage>,
    ) {
        assert_eq!(next_stage(current, needs_interrupt), expected);
    }

    #[test]
    fn test_merge_reboot_wins_and_owner_is_the_reboot_package() {
        let candidates = vec![
            ("bar".to_string(), interrupt(InterruptType::Service, &["foo", "bar"])),
            ("ducks".to_string(), interrupt(InterruptType::Service, &["ducks", "kittens"])),
            ("log".to_string(), interrupt(InterruptType::Service, &["foo", "log"])),
            ("omg".to_string(), interrupt(InterruptType::Reboot, &[])),
        ];
        let (merged, owner) = merge_interrupts(candidates).unwrap();
        assert_eq!(merged.kind, InterruptType::Reboot);
        assert_eq!(merged.services, None);
        assert_eq!(owner, "omg");
    }

    #[test]
    fn test_merge_service_lists_union_sorted_deduped() {
        let candidates = vec![
            ("bar".to_string(), interrupt(InterruptType::Service, &["foo", "bar"])),
            ("ducks".to_string(), interrupt(InterruptType::Service, &["ducks", "kittens"])),
            ("log".to_string(), interrupt(InterruptType::Service, &["foo", "log"])),
        ];
        let (merged, owner) = merge_interrupts(candidates).unwrap();
        assert_eq!(merged.kind, InterruptType::Service);
        assert_eq!(
            merged.services,
            Some(vec![
                "bar".to_string(),
                "ducks".to_string(),
                "foo".to_string(),
                "kittens".to_string(),
                "log".to_string(),
            ])
        );
        assert_eq!(owner, "bar");
    }

    #[test]
    fn test_merge_restart_all_services_tie_keeps_services_empty() {
        let candidates = vec![
            ("a".to_string(), interrupt(InterruptType::RestartAllServices, &[])),
            ("b".to_string(), interrupt(InterruptType::RestartAllServices, &[])),
            ("c".to_string(), interrupt(InterruptType::Service, &["nginx"])),
        ];
        let (merged, owner) = merge_interrupts(candidates).unwrap();
        assert_eq!(merged.kind, InterruptType::RestartAllServices);
        assert_eq!(merged.services, None);
        assert_eq!(owner, "a");
    }

    #[test]
    fn test_merge_empty_is_none() {
        assert_eq!(merge_interrupts(Vec::new()), None);
    }

    #[test]
    fn test_interrupt_candidates_prefer_config_interrupts_when_keys_pending() {
        let mut with_config = package("cfg", "1.0.0");
        with_config.interrupt = Some(interrupt(InterruptType::Reboot, &[]));
        with_config.config_map = Some(BTreeMap::from([
            ("nginx.conf".to_string(), "data".to_string()),
        ]));
        with_config.config_interrupts = Some(BTreeMap::from([(
            "*.conf".to_string(),
            interrupt(InterruptType::Service, &["nginx"]),
        )]));

        // no pending keys: the package's own interrupt applies
        let candidates = interrupt_candidates(std::slice::from_ref(&with_config), |_| Vec::new());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].1.kind, InterruptType::Reboot);

        // pending key: the matched config interrupt applies instead
        let candidates = interrupt_candidates(std::slice::from_ref(&with_config), |_| {
            vec!["nginx.conf".to_string()]
        });
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].1.kind, InterruptType::Service);

        // pending key that matches no pattern: nothing
        let candidates = interrupt_candidates(std::slice::from_ref(&with_config), |_| {
            vec!["other.json".to_string()]
        });
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_package_action_table() {
        use PackageAction::*;

        // fresh package, gated on dependencies
        assert_eq!(package_action(None, None, true, true, false), CreatePod(Stage::Apply));
        assert_eq!(package_action(None, None, false, false, false), Blocked);

        let in_progress = status("pkg", "1.0.0", Stage::Apply, PackageState::InProgress);
        assert_eq!(
            package_action(Some(&in_progress), None, true, true, false),
            CreatePod(Stage::Apply)
        );
        assert_eq!(
            package_action(Some(&in_progress), Some(PodOutcome::Running), true, true, false),
            AwaitPod(Stage::Apply)
        );
        assert_eq!(
            package_action(Some(&in_progress), Some(PodOutcome::Succeeded), true, true, false),
            StageComplete(Stage::Apply)
        );
        assert_eq!(
            package_action(Some(&in_progress), Some(PodOutcome::Failed), true, true, false),
            StageFailed(Stage::Apply)
        );

        // erroring retries the same stage
        let erroring = status("pkg", "1.0.0", Stage::Config, PackageState::Erroring);
        assert_eq!(
            package_action(Some(&erroring), None, true, true, false),
            CreatePod(Stage::Config)
        );

        // apply-level pod creation re-checks the apply gate
        let upgrading = status("pkg", "2.0.0", Stage::Upgrade, PackageState::InProgress);
        assert_eq!(
            package_action(Some(&upgrading), None, true, true, false),
            CreatePod(Stage::Upgrade)
        );
        assert_eq!(package_action(Some(&upgrading), None, false, false, false), Blocked);

        // complete advances through the table
        let applied = status("pkg", "1.0.0", Stage::Apply, PackageState::Complete);
        assert_eq!(
            package_action(Some(&applied), None, true, true, false),
            CreatePod(Stage::Config)
        );
        // entering config waits for apply-complete dependencies
        assert_eq!(package_action(Some(&applied), None, false, false, false), Blocked);
        let upgraded = status("pkg", "2.0.0", Stage::Upgrade, PackageState::Complete);
        assert_eq!(
            package_action(Some(&upgraded), None, true, true, false),
            CreatePod(Stage::Config)
        );
        assert_eq!(package_action(Some(&upgraded), None, false, false, false), Blocked);
        let configured = status("pkg", "1.0.0", Stage::Config, PackageState::Complete);
        assert_eq!(package_action(Some(&configured), None, true, true, false), Done);
        assert_eq!(
            package_action(Some(&configured), None, true, true, true),
            NeedsInterrupt
        );
        // interrupt gated on dependencies having configured
        assert_eq!(
            package_action(Some(&configured), None, true, false, true),
            Blocked
        );

        // parked versions wait
        let parked = status("pkg", "1.0.0", Stage::Uninstall, PackageState::Skipped);
        assert_eq!(package_action(Some(&parked), None, true, true, false), Done);
    }

    #[test]
    fn test_resolve_upgrade_restarts_chain_at_upgrade() {
        let (mut skyhook, mut node) = wrappers(&[package("pkg", "2.0.0")]);
        skyhook.set_config_updates("pkg", vec!["stale.conf".to_string()]);
        node.set_package_status(status("pkg", "1.0.0", Stage::Config, PackageState::Complete));

        assert!(resolve_version_changes(&mut skyhook, &mut node).unwrap());

        assert!(node.package_status("pkg", "1.0.0").is_none());
        let new = node.package_status("pkg", "2.0.0").unwrap();
        assert_eq!(new.stage, Stage::Upgrade);
        assert_eq!(new.state, PackageState::InProgress);
        // stale config interrupts must not leak into the new version
        assert!(skyhook.config_updates("pkg").is_empty());
    }

    #[test]
    fn test_resolve_downgrade_parks_new_version() {
        let (mut skyhook, mut node) = wrappers(&[package("pkg", "1.0.0")]);
        node.set_package_status(status("pkg", "2.0.0", Stage::PostInterrupt, PackageState::Complete));

        assert!(resolve_version_changes(&mut skyhook, &mut node).unwrap());

        let old = node.package_status("pkg", "2.0.0").unwrap();
        assert_eq!(old.stage, Stage::Uninstall);
        assert_eq!(old.state, PackageState::InProgress);
        let new = node.package_status("pkg", "1.0.0").unwrap();
        assert_eq!(new.stage, Stage::Uninstall);
        assert_eq!(new.state, PackageState::Skipped);
    }

    #[test]
    fn test_resolve_removed_package_begins_uninstall() {
        let (mut skyhook, mut node) = wrappers(&[]);
        node.set_package_status(status("gone", "1.0.0", Stage::Config, PackageState::Complete));

        assert!(resolve_version_changes(&mut skyhook, &mut node).unwrap());
        let entry = node.package_status("gone", "1.0.0").unwrap();
        assert_eq!(entry.stage, Stage::Uninstall);
        assert_eq!(entry.state, PackageState::InProgress);

        // a second pass leaves the in-flight uninstall alone
        assert!(!resolve_version_changes(&mut skyhook, &mut node).unwrap());
    }

    #[test]
    fn test_resolve_unparks_once_predecessor_is_gone() {
        let (mut skyhook, mut node) = wrappers(&[package("pkg", "1.0.0")]);
        node.set_package_status(status("pkg", "1.0.0", Stage::Uninstall, PackageState::Skipped));

        assert!(resolve_version_changes(&mut skyhook, &mut node).unwrap());
        // entry removed entirely: the normal fresh-install path takes over
        assert!(node.package_status("pkg", "1.0.0").is_none());
    }

    #[test]
    fn test_dependent_blocked_while_dependency_upgrades() {
        let mut top = package("top", "1.0.0");
        top.depends_on = vec!["dep".to_string()];
        let (mut skyhook, mut node) = wrappers(&[package("dep", "2.0.0"), top]);
        let graph = DependencyGraph::build(&skyhook.skyhook.spec.packages).unwrap();

        // dep was config-complete at 1.0.0, top finished apply against it
        node.set_package_status(status("dep", "1.0.0", Stage::Config, PackageState::Complete));
        node.set_package_status(status("top", "1.0.0", Stage::Apply, PackageState::Complete));

        // the version bump regresses dep into an in-flight upgrade
        assert!(resolve_version_changes(&mut skyhook, &mut node).unwrap());
        assert_eq!(
            node.package_status("dep", "2.0.0").unwrap().stage,
            Stage::Upgrade
        );

        // top may not advance into config while dep is mid-upgrade
        let deps_applied = graph.ready_at("top", Stage::Apply, |name| node.completed_stage(name));
        assert!(!deps_applied);
        let top_status = node.package_status("top", "1.0.0");
        assert_eq!(
            package_action(top_status.as_ref(), None, deps_applied, false, false),
            PackageAction::Blocked
        );

        // the completed upgrade restores apply-level progress, not config
        node.set_package_status(status("dep", "2.0.0", Stage::Upgrade, PackageState::Complete));
        assert!(graph.ready_at("top", Stage::Apply, |name| node.completed_stage(name)));
        assert!(!graph.ready_at("top", Stage::Config, |name| node.completed_stage(name)));

        // so a config-complete dependent still cannot enter its interrupt
        let deps_configured =
            graph.ready_at("top", Stage::Config, |name| node.completed_stage(name));
        let top_configured = status("top", "1.0.0", Stage::Config, PackageState::Complete);
        assert_eq!(
            package_action(Some(&top_configured), None, true, deps_configured, true),
            PackageAction::Blocked
        );
    }

    #[test]
    fn test_work_items_include_synthetic_uninstalls() {
        let (mut skyhook, mut node) = wrappers(&[package("kept", "1.0.0")]);
        node.set_package_status(status("gone", "2.0.0", Stage::Uninstall, PackageState::InProgress));
        resolve_version_changes(&mut skyhook, &mut node).unwrap();

        let items = work_items(&skyhook, &node);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].package.name, "gone");
        assert!(items[0].synthetic);
        assert_eq!(items[0].package.image, "ghcr.io/example/gone");
        assert_eq!(items[1].package.name, "kept");
        assert!(!items[1].synthetic);
    }

    #[rstest]
    #[case("ghcr.io/example/pkg:1.2.3", "ghcr.io/example/pkg")]
    #[case("registry:5000/example/pkg", "registry:5000/example/pkg")]
    #[case("registry:5000/example/pkg:1.2.3", "registry:5000/example/pkg")]
    #[case("plain", "plain")]
    fn test_untag(#[case] image: &str, #[case] expected: &str) {
        assert_eq!(untag(image), expected);
    }

    #[test]
    fn test_needs_interrupt() {
        let mut pkg = package("pkg", "1.0.0");
        assert!(!needs_interrupt(&pkg, &[]));

        pkg.interrupt = Some(interrupt(InterruptType::Reboot, &[]));
        assert!(needs_interrupt(&pkg, &[]));

        // pending keys switch the decision to config interrupts
        assert!(!needs_interrupt(&pkg, &["changed.conf".to_string()]));
        pkg.config_interrupts = Some(BTreeMap::from([(
            "*.conf".to_string(),
            interrupt(InterruptType::Service, &["svc"]),
        )]));
        assert!(needs_interrupt(&pkg, &["changed.conf".to_string()]));
    }
}
