//! Compartmentalized rollouts: assigns each node to exactly one compartment
//! of a DeploymentPolicy and tracks per-compartment batch state.

use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::{
    cluster_state::labels_match,
    crd::{
        deployment_policy::{
            Compartment, DeploymentPolicy, RolloutStrategy, StrategyKind, DEFAULT_COMPARTMENT,
        },
        CompartmentStatus, InterruptionBudget,
    },
    wrapper::NodeWrapper,
};

/// Capacity used for ranking: percent budgets floor plainly, count budgets
/// never go below one.
pub fn effective_capacity(budget: &InterruptionBudget, matched: usize) -> usize {
    match (budget.percent, budget.count) {
        (Some(percent), _) => matched * percent as usize / 100,
        (None, Some(count)) => 1.max(matched.min(count as usize)),
        (None, None) => matched,
    }
}

/// Nodes in batch `batch` (0-based) under a strategy, before budget
/// clamping.
pub fn batch_size(strategy: &RolloutStrategy, batch: u32) -> u32 {
    let initial = strategy.initial_batch.max(1);
    match strategy.kind {
        StrategyKind::Fixed => initial,
        StrategyKind::Linear => initial.saturating_mul(batch + 1),
        StrategyKind::Exponential => initial.saturating_mul(1u32.checked_shl(batch).unwrap_or(u32::MAX)),
    }
}

/// How many nodes the compartment may have in flight right now.
pub fn allowed_in_flight(
    compartment: &Compartment,
    status: &CompartmentStatus,
    matched: usize,
) -> usize {
    if status.should_stop {
        return 0;
    }
    let batch = batch_size(&compartment.strategy, status.current_batch) as usize;
    batch.min(compartment.budget.effective(matched))
}

/// Ranking for assignment when several compartments select the same node:
/// safer strategy first (`fixed` < `linear` < `exponential`), then smaller
/// effective capacity, then name.
fn rank<'a>(compartment: &'a Compartment, matched: usize) -> (StrategyKind, usize, &'a str) {
    (
        compartment.strategy.kind,
        effective_capacity(&compartment.budget, matched),
        compartment.name.as_str(),
    )
}

/// Assigns every node to exactly one compartment. Nodes matching none land
/// in [`DEFAULT_COMPARTMENT`].
pub fn assign(policy: &DeploymentPolicy, nodes: &[NodeWrapper]) -> BTreeMap<String, Vec<String>> {
    // capacity ranking needs per-compartment match counts first
    let mut matched_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for compartment in &policy.spec.compartments {
        let count = nodes
            .iter()
            .filter(|node| labels_match(compartment.selector.as_ref(), node.node.labels()))
            .count();
        matched_counts.insert(compartment.name.as_str(), count);
    }

    let mut assignment: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in nodes {
        let chosen = policy
            .spec
            .compartments
            .iter()
            .filter(|compartment| labels_match(compartment.selector.as_ref(), node.node.labels()))
            .min_by_key(|compartment| rank(compartment, matched_counts[compartment.name.as_str()]));
        let name = chosen
            .map(|compartment| compartment.name.clone())
            .unwrap_or_else(|| DEFAULT_COMPARTMENT.to_string());
        assignment.entry(name).or_default().push(node.name());
    }
    assignment
}

/// Tick-idempotent batch bookkeeping. A batch succeeds once the compartment's
/// complete count reaches its target; it fails once every in-flight node is
/// erroring. Three consecutive failures stop the compartment.
pub fn update_batch_state(
    status: &mut CompartmentStatus,
    complete: usize,
    erroring: usize,
    in_flight: usize,
    batch: u32,
) {
    let target = status.completed.saturating_add(batch);
    if complete as u32 >= target {
        status.current_batch += 1;
        status.completed = complete as u32;
        status.last_batch_size = batch;
        status.last_batch_failed = false;
        status.consecutive_failures = 0;
        return;
    }

    let batch_failed = in_flight > 0 && erroring >= in_flight;
    if batch_failed && !status.last_batch_failed {
        status.last_batch_failed = true;
        status.last_batch_size = batch;
        status.consecutive_failures += 1;
        if status.consecutive_failures >= 3 {
            status.should_stop = true;
        }
    } else if !batch_failed && status.last_batch_failed && erroring == 0 {
        status.last_batch_failed = false;
    }
}

/// Whether a version change resets batch state, per Skyhook option with the
/// policy default as fallback.
pub fn reset_on_version_change(
    policy: &DeploymentPolicy,
    skyhook_option: Option<bool>,
) -> bool {
    skyhook_option
        .or(policy.spec.reset_batch_state_on_completion)
        .unwrap_or(false)
}
