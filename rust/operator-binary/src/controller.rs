//! The top-level tick. Every reconcile rebuilds the full cluster snapshot,
//! runs migrations, reboot tracking, validation, configmap and status
//! reconciliation for the keyed Skyhook, and advances package work only when
//! that Skyhook is the cluster-wide winner by priority. Runtime-required
//! taint cleanup runs last; all mutations flush as merge patches diffed
//! against the snapshot.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use k8s_openapi::api::core::v1::Taint;
use kube::{runtime::controller::Action, ResourceExt};
use serde_json::json;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};

use crate::{
    cluster_state::{self, ClusterState, ObjectTracker, SkyhookNodes},
    compartments,
    config::OperatorConfig,
    configmaps,
    crd::{
        Interrupt, InterruptType, Skyhook, SkyhookState, Stage, ANNOTATION_PACKAGE,
        CONDITION_APPLY_PACKAGE, CONDITION_NOT_READY, CONDITION_TRANSITION, LABEL_INTERRUPT,
    },
    dal::{self, Dal},
    events::{EventPublisher, Reason},
    graph::{self, DependencyGraph},
    metrics, picker, pods,
    state_machine::{self, NodeProgress},
    wrapper::{skyhook::collect_node_status, NodeWrapper},
};

const SHORT_REQUEUE: Duration = Duration::from_secs(2);

pub struct Ctx {
    pub dal: Dal,
    pub config: OperatorConfig,
    pub events: EventPublisher,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build cluster state"))]
    BuildClusterState { source: cluster_state::Error },

    #[snafu(display("cluster api call failed"))]
    Api { source: dal::Error },

    #[snafu(display("package state machine failed"))]
    Advance { source: state_machine::Error },

    #[snafu(display("configmap reconciliation failed"))]
    ConfigMaps { source: configmaps::Error },

    #[snafu(display("invalid package dependency graph"))]
    Graph { source: graph::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub async fn reconcile(skyhook: Arc<Skyhook>, ctx: Arc<Ctx>) -> Result<Action> {
    let name = skyhook.name_any();
    info!(skyhook = %name, "starting reconcile");
    let dal = &ctx.dal;

    let skyhooks = dal.list_skyhooks().await.context(ApiSnafu)?;
    let nodes = dal.list_nodes().await.context(ApiSnafu)?;
    let mut policies = HashMap::new();
    for entry in &skyhooks {
        if let Some(policy_name) = &entry.spec.deployment_policy {
            if !policies.contains_key(policy_name) {
                match dal
                    .get_deployment_policy(policy_name)
                    .await
                    .context(ApiSnafu)?
                {
                    Some(policy) => {
                        policies.insert(policy_name.clone(), policy);
                    }
                    None => warn!(
                        skyhook = %entry.name_any(),
                        policy = %policy_name,
                        "referenced deployment policy does not exist"
                    ),
                }
            }
        }
    }

    let mut state =
        ClusterState::build(skyhooks, nodes, policies).context(BuildClusterStateSnafu)?;
    let winner = state.next_skyhook().map(|entry| entry.skyhook.name());
    let taint_cleanup =
        runtime_required_cleanup_plan(&state, &ctx.config.runtime_required_taint);

    let ClusterState {
        skyhooks: entries,
        tracker,
    } = &mut state;
    let Some(entry) = entries
        .iter_mut()
        .find(|entry| entry.skyhook.name() == name)
    else {
        // gone between enqueue and now
        metrics::zero_for(&name);
        return Ok(Action::await_change());
    };

    if entry.skyhook.is_deleting() {
        if entry.skyhook.has_finalizer() {
            finalize(&ctx, entry, tracker).await?;
        }
        return Ok(Action::await_change());
    }

    entry.skyhook.add_finalizer();
    entry.skyhook.migrate();
    track_reboots(&ctx, entry).await;

    if let Err(err) = entry.skyhook.skyhook.spec.validate() {
        warn!(skyhook = %name, error = %err, "skyhook spec is invalid, not reconciling packages");
        entry.skyhook.set_status(SkyhookState::Erroring);
        ctx.events
            .skyhook(
                &entry.skyhook.skyhook,
                Reason::State,
                format!("invalid spec: {err}"),
            )
            .await;
        flush(&ctx, entry, tracker).await?;
        return Ok(Action::requeue(ctx.config.max_interval));
    }

    let gated = entry.skyhook.skyhook.is_paused() || entry.skyhook.skyhook.is_disabled();
    let mut progressed = false;
    let mut waiting = false;

    if !gated {
        progressed |= configmaps::reconcile_package_config_maps(dal, entry, &ctx.config)
            .await
            .context(ConfigMapsSnafu)?;
        configmaps::reconcile_node_metadata(dal, entry, &ctx.config)
            .await
            .context(ConfigMapsSnafu)?;
        enforce_pod_validity(&ctx, entry).await?;

        if winner.as_deref() == Some(name.as_str()) {
            let (advanced, still_waiting) = advance_packages(&ctx, entry).await?;
            progressed |= advanced;
            waiting |= still_waiting;
        } else {
            debug!(skyhook = %name, winner = ?winner, "not the priority winner this tick");
        }
    }

    report_status(&ctx, entry).await;

    // runs last so a node completed this tick is picked up next tick
    for (node_name, taints) in taint_cleanup {
        info!(node = %node_name, "removing runtime-required taint");
        dal.patch_node(&node_name, &json!({ "spec": { "taints": taints } }))
            .await
            .context(ApiSnafu)?;
    }

    flush(&ctx, entry, tracker).await?;

    if progressed || waiting {
        Ok(Action::requeue(SHORT_REQUEUE))
    } else {
        Ok(Action::requeue(ctx.config.max_interval))
    }
}

pub fn error_policy(_skyhook: Arc<Skyhook>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    warn!(error = %error, "reconcile failed, requeueing");
    Action::requeue(Duration::from_secs(5))
}

/// Records boot ids and, when configured, resets a rebooted node's state so
/// packages re-apply. The recorded id moves forward either way.
async fn track_reboots(ctx: &Ctx, entry: &mut SkyhookNodes) {
    let SkyhookNodes { skyhook, nodes, .. } = entry;
    for node in nodes.iter_mut() {
        let Some(boot_id) = node.boot_id() else {
            continue;
        };
        let node_name = node.name();
        let recorded = skyhook
            .skyhook
            .status
            .as_ref()
            .and_then(|status| status.node_boot_ids.get(&node_name))
            .cloned();
        if let Some(recorded) = recorded {
            if recorded != boot_id {
                if ctx.config.reapply_on_reboot {
                    info!(node = %node_name, "boot id changed, resetting node state");
                    node.reset();
                    ctx.events
                        .skyhook_and_node(
                            &skyhook.skyhook,
                            &node.node,
                            Reason::Reboot,
                            format!("node {node_name} rebooted, reapplying packages"),
                        )
                        .await;
                } else {
                    debug!(node = %node_name, "boot id changed, reapply on reboot disabled");
                }
            }
        }
        skyhook
            .status_mut()
            .node_boot_ids
            .insert(node_name, boot_id);
    }
}

/// Lists this Skyhook's pods and deletes any whose spec has drifted from
/// what the current generation would create. Uninstall pods are exempt; the
/// spec no longer describes them.
async fn enforce_pod_validity(ctx: &Ctx, entry: &SkyhookNodes) -> Result<()> {
    let skyhook = &entry.skyhook.skyhook;
    let pods = ctx
        .dal
        .list_skyhook_pods(&entry.skyhook.name())
        .await
        .context(ApiSnafu)?;

    for pod in &pods {
        let Some(record) = pods::get_package(pod) else {
            continue;
        };
        if record.stage == Stage::Uninstall {
            continue;
        }
        let Some(node) = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.as_deref())
        else {
            continue;
        };

        let expected = skyhook
            .package(&record.name)
            .filter(|package| package.version == record.version)
            .map(|package| {
                if pod.labels().contains_key(LABEL_INTERRUPT) {
                    let noop = Interrupt {
                        kind: InterruptType::Noop,
                        services: None,
                    };
                    let interrupt = package.interrupt.clone().unwrap_or(noop);
                    pods::build_interrupt_pod(skyhook, &package, &interrupt, node, &ctx.config)
                } else {
                    pods::build_package_pod(skyhook, &package, record.stage, node, &ctx.config)
                }
            });

        let valid = expected
            .as_ref()
            .is_some_and(|expected| pods::pod_matches_expected(pod, expected));
        if !valid {
            warn!(pod = %pod.name_any(), "pod drifted from spec, deleting");
            let invalid = pods::PackageRecord {
                invalid: Some(true),
                ..record
            };
            ctx.dal
                .annotate_pod(
                    &pod.name_any(),
                    ANNOTATION_PACKAGE,
                    &serde_json::to_string(&invalid).expect("package record serializes"),
                )
                .await
                .context(ApiSnafu)?;
            ctx.dal.delete_pod(&pod.name_any()).await.context(ApiSnafu)?;
        }
    }
    Ok(())
}

fn version_change_pending(entry: &SkyhookNodes) -> bool {
    let packages = entry.skyhook.skyhook.packages();
    entry.nodes.iter().any(|node| {
        node.state().values().any(|status| {
            match packages.iter().find(|package| package.name == status.name) {
                None => true,
                Some(package) => package.version != status.version,
            }
        })
    })
}

/// Picks nodes (directly or per compartment) and runs the package state
/// machine on each. Per-node failures mark the node erroring and do not
/// abort the tick.
async fn advance_packages(ctx: &Ctx, entry: &mut SkyhookNodes) -> Result<(bool, bool)> {
    let name = entry.skyhook.name();
    let graph =
        DependencyGraph::build(&entry.skyhook.skyhook.spec.packages).context(GraphSnafu)?;
    let skyhook_pods = ctx.dal.list_skyhook_pods(&name).await.context(ApiSnafu)?;

    if let Some(policy) = entry.policy.clone() {
        let skyhook_option = entry
            .skyhook
            .skyhook
            .spec
            .deployment_policy_options
            .as_ref()
            .and_then(|options| options.reset_batch_state_on_completion);
        if version_change_pending(entry)
            && compartments::reset_on_version_change(&policy, skyhook_option)
        {
            debug!(skyhook = %name, "version change detected, resetting compartment batch state");
            entry.skyhook.status_mut().compartment_statuses.clear();
        }
    }

    let picked: Vec<String> = {
        let SkyhookNodes {
            skyhook,
            nodes,
            policy,
        } = entry;

        match policy {
            None => {
                let budget = skyhook
                    .skyhook
                    .spec
                    .interruption_budget
                    .effective(nodes.len());
                let candidates: Vec<&NodeWrapper> = nodes.iter().collect();
                picker::pick_nodes(
                    skyhook,
                    nodes,
                    &candidates,
                    budget,
                    &ctx.config.runtime_required_taint,
                )
                .picked
            }
            Some(policy) => {
                let assignment = compartments::assign(policy, nodes);
                let packages = skyhook.skyhook.packages();
                let mut picked = Vec::new();

                for (compartment_name, members) in assignment {
                    let compartment = policy
                        .spec
                        .compartments
                        .iter()
                        .find(|compartment| compartment.name == compartment_name);

                    let member_nodes: Vec<&NodeWrapper> = nodes
                        .iter()
                        .filter(|node| members.contains(&node.name()))
                        .collect();

                    let allowed = match compartment {
                        Some(compartment) => {
                            let complete = member_nodes
                                .iter()
                                .filter(|node| node.is_complete(&packages))
                                .count();
                            let erroring = member_nodes
                                .iter()
                                .filter(|node| node.status() == SkyhookState::Erroring)
                                .count();
                            let in_flight = member_nodes
                                .iter()
                                .filter(|node| {
                                    !node.is_complete(&packages)
                                        && node.status() != SkyhookState::Unknown
                                })
                                .count();
                            let batch = compartments::batch_size(
                                &compartment.strategy,
                                skyhook
                                    .skyhook
                                    .status
                                    .as_ref()
                                    .and_then(|status| {
                                        status.compartment_statuses.get(&compartment_name)
                                    })
                                    .map(|status| status.current_batch)
                                    .unwrap_or(0),
                            );
                            let status = skyhook
                                .status_mut()
                                .compartment_statuses
                                .entry(compartment_name.clone())
                                .or_default();
                            compartments::update_batch_state(
                                status, complete, erroring, in_flight, batch,
                            );
                            compartments::allowed_in_flight(compartment, status, members.len())
                        }
                        // the implicit default compartment rolls with the
                        // skyhook budget
                        None => skyhook
                            .skyhook
                            .spec
                            .interruption_budget
                            .effective(members.len()),
                    };

                    picked.extend(
                        picker::pick_nodes(
                            skyhook,
                            nodes,
                            &member_nodes,
                            allowed,
                            &ctx.config.runtime_required_taint,
                        )
                        .picked,
                    );
                }
                picked
            }
        }
    };

    let advance = state_machine::Advance {
        dal: &ctx.dal,
        config: &ctx.config,
        events: &ctx.events,
    };
    let mut progressed = false;
    let mut waiting = false;

    for node_name in picked {
        let SkyhookNodes { skyhook, nodes, .. } = entry;
        let Some(node) = nodes.iter_mut().find(|node| node.name() == node_name) else {
            continue;
        };
        match advance
            .process_node(skyhook, node, &graph, &skyhook_pods)
            .await
        {
            Ok(NodeProgress::Progressed) => progressed = true,
            Ok(NodeProgress::Waiting) => waiting = true,
            Ok(NodeProgress::Idle) => {}
            // api hiccups stay per-node; anything else (unparseable
            // versions) is a bug the admission webhook should have caught
            Err(err @ state_machine::Error::Api { .. }) => {
                warn!(skyhook = %name, node = %node_name, error = %err, "node advance failed");
                node.set_status(SkyhookState::Erroring);
            }
            Err(fatal) => return Err(Error::Advance { source: fatal }),
        }
    }

    Ok((progressed, waiting))
}

/// Status reconciliation: node statuses are corrected against their package
/// states, the aggregate is derived and recorded with its transition
/// condition, summaries and metrics refresh.
async fn report_status(ctx: &Ctx, entry: &mut SkyhookNodes) {
    let packages = entry.skyhook.skyhook.packages();

    {
        let SkyhookNodes { nodes, .. } = entry;
        for node in nodes.iter_mut() {
            let complete = node.is_complete(&packages);
            match (complete, node.status()) {
                (true, status) if status != SkyhookState::Complete => {
                    node.set_status(SkyhookState::Complete);
                }
                (false, SkyhookState::Complete) => node.set_status(SkyhookState::Unknown),
                _ => {}
            }
        }
    }

    let derived = if entry.skyhook.skyhook.is_disabled() {
        SkyhookState::Disabled
    } else if entry.skyhook.skyhook.is_paused() {
        SkyhookState::Paused
    } else {
        collect_node_status(&entry.nodes)
    };

    let current = entry.skyhook.status();
    if current != derived {
        entry.skyhook.set_status(derived);
        let prior = entry.skyhook.prior_status.unwrap_or(current);
        entry.skyhook.upsert_condition(
            CONDITION_TRANSITION,
            true,
            &derived.to_string(),
            &format!("{prior} -> {derived}"),
        );
        ctx.events
            .skyhook(
                &entry.skyhook.skyhook,
                Reason::State,
                format!("status {prior} -> {derived}"),
            )
            .await;
    }

    if derived == SkyhookState::Complete {
        entry
            .skyhook
            .upsert_condition(CONDITION_NOT_READY, false, "Complete", "all nodes complete");
    } else {
        entry.skyhook.upsert_condition(
            CONDITION_NOT_READY,
            true,
            &derived.to_string(),
            &format!("skyhook is {derived}"),
        );
    }

    let erroring: Vec<String> = entry
        .nodes
        .iter()
        .filter(|node| node.has_erroring_package())
        .map(|node| node.name())
        .collect();
    if erroring.is_empty() {
        entry.skyhook.upsert_condition(
            CONDITION_APPLY_PACKAGE,
            false,
            "NoErrors",
            "no package errors",
        );
    } else {
        entry.skyhook.upsert_condition(
            CONDITION_APPLY_PACKAGE,
            true,
            "PackageError",
            &format!("packages erroring on: {}", erroring.join(", ")),
        );
    }

    // nodes that left the selection keep nothing of ours; best effort, the
    // node may be gone entirely
    let selected: HashSet<String> = entry.nodes.iter().map(|node| node.name()).collect();
    let deselected: Vec<String> = entry
        .skyhook
        .skyhook
        .status
        .as_ref()
        .map(|status| {
            status
                .node_state
                .keys()
                .filter(|node| !selected.contains(*node))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    let name = entry.skyhook.name();
    let state_key = crate::crd::node_state_annotation(&name);
    let status_key = crate::crd::node_status_label(&name);
    for node_name in deselected {
        let patch = json!({
            "metadata": {
                "annotations": { state_key.clone(): null },
                "labels": { status_key.clone(): null },
            }
        });
        if let Err(err) = ctx.dal.patch_node(&node_name, &patch).await {
            debug!(node = %node_name, error = %err, "could not clean deselected node");
        }
    }

    {
        let SkyhookNodes { skyhook, nodes, .. } = entry;
        skyhook.prune_node_maps(nodes);
        // completion releases a node's priority pick even on ticks that do
        // not pick
        skyhook.prune_priority_picks(nodes);
        skyhook.update_summaries(nodes);
        skyhook.set_observed_generation();
    }

    let name = entry.skyhook.name();
    metrics::report_status(&name, derived);
    metrics::report_node_counts(
        &name,
        entry.nodes.len() as i64,
        entry
            .nodes
            .iter()
            .filter(|node| node.is_complete(&packages))
            .count() as i64,
        entry
            .nodes
            .iter()
            .filter(|node| node.status() == SkyhookState::InProgress)
            .count() as i64,
        erroring.len() as i64,
    );
}

/// Which nodes may lose the runtime-required taint: those carrying it whose
/// every runtime-required Skyhook is complete. Per node; other nodes keep
/// theirs.
fn runtime_required_cleanup_plan(
    state: &ClusterState,
    taint: &Taint,
) -> Vec<(String, Vec<Taint>)> {
    let mut plan = Vec::new();
    let mut seen = HashSet::new();

    for entry in &state.skyhooks {
        for node in &entry.nodes {
            let node_name = node.name();
            if !seen.insert(node_name.clone()) {
                continue;
            }
            if !node.taints().iter().any(|t| t.key == taint.key) {
                continue;
            }

            let required: Vec<&SkyhookNodes> = state
                .skyhooks
                .iter()
                .filter(|other| other.skyhook.skyhook.spec.runtime_required)
                .filter(|other| other.node(&node_name).is_some())
                .collect();
            if required.is_empty() {
                continue;
            }
            let all_complete = required.iter().all(|other| {
                let packages = other.skyhook.skyhook.packages();
                other
                    .node(&node_name)
                    .is_some_and(|projection| projection.is_complete(&packages))
            });
            if all_complete {
                let remaining: Vec<Taint> = node
                    .taints()
                    .iter()
                    .filter(|t| t.key != taint.key)
                    .cloned()
                    .collect();
                plan.push((node_name, remaining));
            }
        }
    }
    plan
}

/// Finalizer: uncordon and wipe every selected node, zero metrics, drop the
/// finalizer, and bump observedGeneration so the removal itself does not
/// retrigger a tick.
async fn finalize(ctx: &Ctx, entry: &mut SkyhookNodes, tracker: &ObjectTracker) -> Result<()> {
    let name = entry.skyhook.name();
    info!(skyhook = %name, "finalizing");

    for node in entry.nodes.iter_mut() {
        node.uncordon();
        node.reset();
    }
    metrics::zero_for(&name);
    entry.skyhook.remove_finalizer();
    entry.skyhook.bump_observed_generation();

    ctx.events
        .skyhook(
            &entry.skyhook.skyhook,
            Reason::State,
            "skyhook deleted, nodes released".to_string(),
        )
        .await;
    flush(ctx, entry, tracker).await
}

/// Writes every dirty object back as a merge patch against its snapshot.
/// Skyhook spec/metadata and status go through separate subresources.
async fn flush(ctx: &Ctx, entry: &SkyhookNodes, tracker: &ObjectTracker) -> Result<()> {
    for node in &entry.nodes {
        if let Some(patch) = tracker.diff(&node.node) {
            ctx.dal
                .patch_node(&node.name(), &patch)
                .await
                .context(ApiSnafu)?;
        }
    }

    if let Some(serde_json::Value::Object(mut patch)) = tracker.diff(&entry.skyhook.skyhook) {
        let status = patch.remove("status");
        if !patch.is_empty() {
            ctx.dal
                .patch_skyhook(&entry.skyhook.name(), &serde_json::Value::Object(patch))
                .await
                .context(ApiSnafu)?;
        }
        if let Some(status) = status {
            ctx.dal
                .patch_skyhook_status(&entry.skyhook.name(), &json!({ "status": status }))
                .await
                .context(ApiSnafu)?;
        }
    }
    Ok(())
}
