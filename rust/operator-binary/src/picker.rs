//! Chooses which nodes a Skyhook works on this tick: prior picks stay picked
//! (stickiness), the remainder is filled by status priority, and everything
//! is bounded by the effective interruption budget and taint tolerability.

use k8s_openapi::api::core::v1::{Taint, Toleration};

use crate::{
    crd::{SkyhookSpec, SkyhookState, CONDITION_TAINT_NOT_TOLERABLE, TAINT_UNSCHEDULABLE},
    wrapper::{NodeWrapper, SkyhookWrapper},
};

/// Taint the scheduler puts on cordoned nodes.
pub const TAINT_NODE_UNSCHEDULABLE: &str = "node.kubernetes.io/unschedulable";

#[derive(Debug, Default)]
pub struct PickOutcome {
    /// Node names to work on, at most the effective budget.
    pub picked: Vec<String>,
    /// Candidates dropped because a taint on them is not tolerated.
    pub not_tolerable: Vec<String>,
}

/// The full toleration set pods for this Skyhook carry, and against which
/// node taints are checked during picking.
pub fn toleration_set(
    spec: &SkyhookSpec,
    runtime_required_taint: &Taint,
) -> Vec<Toleration> {
    let mut tolerations = vec![
        exists_toleration(TAINT_NODE_UNSCHEDULABLE),
        exists_toleration(TAINT_UNSCHEDULABLE),
    ];
    tolerations.extend(spec.additional_tolerations.iter().cloned());
    if spec.runtime_required {
        tolerations.push(Toleration {
            key: Some(runtime_required_taint.key.clone()),
            operator: Some("Exists".to_string()),
            effect: Some(runtime_required_taint.effect.clone()),
            ..Toleration::default()
        });
    }
    tolerations
}

fn exists_toleration(key: &str) -> Toleration {
    Toleration {
        key: Some(key.to_string()),
        operator: Some("Exists".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Toleration::default()
    }
}

/// Kubernetes toleration matching: an empty effect tolerates every effect,
/// `Exists` with an empty key tolerates every taint.
fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    let key = toleration.key.as_deref().unwrap_or("");
    match toleration.operator.as_deref() {
        Some("Exists") => key.is_empty() || key == taint.key,
        // Equal is the default operator
        _ => {
            key == taint.key
                && toleration.value.as_deref().unwrap_or("")
                    == taint.value.as_deref().unwrap_or("")
        }
    }
}

fn all_tolerated(tolerations: &[Toleration], taints: &[Taint]) -> bool {
    taints
        .iter()
        .all(|taint| tolerations.iter().any(|toleration| tolerates(toleration, taint)))
}

/// Fill order within a tick: in-flight nodes first, untouched ones next,
/// erroring ones last.
fn status_rank(status: SkyhookState) -> u8 {
    match status {
        SkyhookState::InProgress => 0,
        SkyhookState::Unknown => 1,
        SkyhookState::Erroring => 2,
        _ => 3,
    }
}

/// Picks nodes for this Skyhook out of `candidates` (a subset of
/// `all_nodes`, both in cluster order), bounded by `budget`. Prior picks are
/// pruned against the full selection and re-recorded; intolerable nodes land
/// in the `TaintNotTolerable` condition. Compartmentalized rollouts pass one
/// compartment's nodes as `candidates` at a time.
pub fn pick_nodes(
    skyhook: &mut SkyhookWrapper,
    all_nodes: &[NodeWrapper],
    candidates: &[&NodeWrapper],
    budget: usize,
    runtime_required_taint: &Taint,
) -> PickOutcome {
    skyhook.prune_priority_picks(all_nodes);

    let packages = skyhook.skyhook.packages();
    let candidates: Vec<&NodeWrapper> = candidates
        .iter()
        .filter(|node| !node.is_complete(&packages))
        .copied()
        .collect();

    let mut picked: Vec<&NodeWrapper> = Vec::new();

    // prior picks first, so consecutive ticks keep working the same set
    let prior = skyhook.priority_picks();
    for node in &candidates {
        if picked.len() >= budget {
            break;
        }
        if prior.iter().any(|name| *name == node.name()) {
            picked.push(*node);
        }
    }

    // fill the rest by status priority, stable on cluster order
    let mut rest: Vec<&NodeWrapper> = candidates
        .iter()
        .filter(|node| !picked.iter().any(|p| p.name() == node.name()))
        .copied()
        .collect();
    rest.sort_by_key(|node| status_rank(node.status()));
    for node in rest {
        if picked.len() >= budget {
            break;
        }
        picked.push(node);
    }

    // taint tolerability gate
    let tolerations = toleration_set(&skyhook.skyhook.spec, runtime_required_taint);
    let (tolerable, not_tolerable): (Vec<&NodeWrapper>, Vec<&NodeWrapper>) = picked
        .into_iter()
        .partition(|node| all_tolerated(&tolerations, node.taints()));

    let not_tolerable: Vec<String> = not_tolerable.iter().map(|node| node.name()).collect();
    if not_tolerable.is_empty() {
        skyhook.upsert_condition(
            CONDITION_TAINT_NOT_TOLERABLE,
            false,
            "Tolerable",
            "all selected nodes are tolerable",
        );
    } else {
        skyhook.upsert_condition(
            CONDITION_TAINT_NOT_TOLERABLE,
            true,
            "TaintNotTolerable",
            &format!(
                "nodes with taints the skyhook does not tolerate: {}",
                not_tolerable.join(", ")
            ),
        );
    }

    let picked: Vec<String> = tolerable.iter().map(|node| node.name()).collect();
    for node in &picked {
        skyhook.record_priority_pick(node);
    }

    PickOutcome {
        picked,
        not_tolerable,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Node;

    use super::*;
    use crate::crd::{PackageState, PackageStatus, Skyhook, Stage};

    fn runtime_taint() -> Taint {
        crate::config::parse_taint("skyhook.nvidia.com=uninitialized:NoSchedule").unwrap()
    }

    /// Picks with every node as a candidate, the non-compartment path.
    fn pick(
        skyhook: &mut SkyhookWrapper,
        nodes: &[NodeWrapper],
        budget: usize,
        taint: &Taint,
    ) -> PickOutcome {
        let candidates: Vec<&NodeWrapper> = nodes.iter().collect();
        pick_nodes(skyhook, nodes, &candidates, budget, taint)
    }

    fn skyhook_with_package() -> SkyhookWrapper {
        let mut spec = SkyhookSpec::default();
        spec.packages.insert(
            "pkg".to_string(),
            crate::crd::Package {
                name: "pkg".to_string(),
                version: "1.0.0".to_string(),
                image: "example/pkg".to_string(),
                ..Default::default()
            },
        );
        SkyhookWrapper::new(Skyhook::new("test", spec))
    }

    fn node(name: &str, status: SkyhookState) -> NodeWrapper {
        let mut inner = Node::default();
        inner.metadata.name = Some(name.to_string());
        let mut wrapper = NodeWrapper::new(inner, "test");
        if status != SkyhookState::Unknown {
            wrapper.set_status(status);
        }
        wrapper
    }

    fn complete_node(name: &str) -> NodeWrapper {
        let mut wrapper = node(name, SkyhookState::Complete);
        wrapper.set_package_status(PackageStatus {
            name: "pkg".to_string(),
            version: "1.0.0".to_string(),
            image: "example/pkg".to_string(),
            stage: Stage::Config,
            state: PackageState::Complete,
            restarts: 0,
        });
        wrapper
    }

    fn tainted_node(name: &str, key: &str) -> NodeWrapper {
        let mut wrapper = node(name, SkyhookState::Unknown);
        wrapper.add_taint(Taint {
            key: key.to_string(),
            value: None,
            effect: "NoSchedule".to_string(),
            time_added: None,
        });
        wrapper
    }

    #[test]
    fn test_budget_bounds_and_no_complete_nodes() {
        let mut skyhook = skyhook_with_package();
        let nodes = vec![
            complete_node("done"),
            node("a", SkyhookState::Unknown),
            node("b", SkyhookState::Unknown),
            node("c", SkyhookState::Unknown),
        ];
        let outcome = pick(&mut skyhook, &nodes, 2, &runtime_taint());
        assert_eq!(outcome.picked.len(), 2);
        assert!(!outcome.picked.contains(&"done".to_string()));
    }

    #[test]
    fn test_prior_picks_are_sticky() {
        let mut skyhook = skyhook_with_package();
        let nodes = vec![
            node("a", SkyhookState::Unknown),
            node("b", SkyhookState::Unknown),
            node("c", SkyhookState::Unknown),
        ];
        skyhook.record_priority_pick("c");
        let outcome = pick(&mut skyhook, &nodes, 1, &runtime_taint());
        assert_eq!(outcome.picked, vec!["c"]);

        // and the pick survives to the next tick
        let outcome = pick(&mut skyhook, &nodes, 1, &runtime_taint());
        assert_eq!(outcome.picked, vec!["c"]);
    }

    #[test]
    fn test_fill_prefers_in_progress_over_unknown_over_erroring() {
        let mut skyhook = skyhook_with_package();
        let nodes = vec![
            node("erroring", SkyhookState::Erroring),
            node("unknown", SkyhookState::Unknown),
            node("working", SkyhookState::InProgress),
        ];
        let outcome = pick(&mut skyhook, &nodes, 2, &runtime_taint());
        assert_eq!(outcome.picked, vec!["working", "unknown"]);
    }

    #[test]
    fn test_intolerable_nodes_are_dropped_and_reported() {
        let mut skyhook = skyhook_with_package();
        let nodes = vec![
            tainted_node("gpu", "nvidia.com/gpu"),
            node("plain", SkyhookState::Unknown),
        ];
        let outcome = pick(&mut skyhook, &nodes, 2, &runtime_taint());
        assert_eq!(outcome.picked, vec!["plain"]);
        assert_eq!(outcome.not_tolerable, vec!["gpu"]);

        let condition = skyhook.condition(CONDITION_TAINT_NOT_TOLERABLE).unwrap();
        assert_eq!(condition.status, "True");
        assert!(condition.message.contains("gpu"));
    }

    #[test]
    fn test_additional_tolerations_admit_tainted_node() {
        let mut skyhook = skyhook_with_package();
        skyhook.skyhook.spec.additional_tolerations = vec![Toleration {
            key: Some("nvidia.com/gpu".to_string()),
            operator: Some("Exists".to_string()),
            ..Toleration::default()
        }];
        let nodes = vec![tainted_node("gpu", "nvidia.com/gpu")];
        let outcome = pick(&mut skyhook, &nodes, 1, &runtime_taint());
        assert_eq!(outcome.picked, vec!["gpu"]);
        assert_eq!(
            skyhook
                .condition(CONDITION_TAINT_NOT_TOLERABLE)
                .unwrap()
                .status,
            "False"
        );
    }

    #[test]
    fn test_runtime_required_tolerates_runtime_taint() {
        let mut skyhook = skyhook_with_package();
        let nodes = vec![tainted_node("fresh", "skyhook.nvidia.com")];

        let outcome = pick(&mut skyhook, &nodes, 1, &runtime_taint());
        assert!(outcome.picked.is_empty());

        skyhook.skyhook.spec.runtime_required = true;
        let outcome = pick(&mut skyhook, &nodes, 1, &runtime_taint());
        assert_eq!(outcome.picked, vec!["fresh"]);
    }

    #[test]
    fn test_cordon_taint_is_always_tolerated() {
        let mut skyhook = skyhook_with_package();
        let mut cordoned = node("cordoned", SkyhookState::InProgress);
        cordoned.cordon();
        let outcome = pick(&mut skyhook, &[cordoned], 1, &runtime_taint());
        assert_eq!(outcome.picked, vec!["cordoned"]);
    }

    #[test]
    fn test_completion_removes_priority_pick() {
        let mut skyhook = skyhook_with_package();
        skyhook.record_priority_pick("done");
        let nodes = vec![complete_node("done")];
        let outcome = pick(&mut skyhook, &nodes, 1, &runtime_taint());
        assert!(outcome.picked.is_empty());
        assert!(skyhook.priority_picks().is_empty());
    }
}
