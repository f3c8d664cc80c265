//! Builds the per-tick snapshot: each Skyhook paired with the nodes its
//! selector matches, plus deep-copies of every observed object so later
//! mutations can be written back as minimal merge patches.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::{
    api::core::v1::Node,
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;
use snafu::Snafu;

use crate::{
    crd::{deployment_policy::DeploymentPolicy, Skyhook},
    wrapper::{NodeWrapper, SkyhookWrapper},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "skyhook {skyhook}: selector expression on key {key:?} is malformed: {problem}"
    ))]
    MalformedSelector {
        skyhook: String,
        key: String,
        problem: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// One Skyhook together with its selected nodes, ordered by node creation
/// time.
pub struct SkyhookNodes {
    pub skyhook: SkyhookWrapper,
    pub nodes: Vec<NodeWrapper>,
    pub policy: Option<DeploymentPolicy>,
}

impl SkyhookNodes {
    pub fn is_complete(&self) -> bool {
        let packages = self.skyhook.skyhook.packages();
        self.nodes.iter().all(|node| node.is_complete(&packages))
    }

    pub fn node(&self, name: &str) -> Option<&NodeWrapper> {
        self.nodes.iter().find(|node| node.name() == name)
    }
}

pub struct ClusterState {
    /// Ordered by ascending priority, then name.
    pub skyhooks: Vec<SkyhookNodes>,
    pub tracker: ObjectTracker,
}

impl ClusterState {
    pub fn build(
        skyhooks: Vec<Skyhook>,
        nodes: Vec<Node>,
        policies: HashMap<String, DeploymentPolicy>,
    ) -> Result<Self> {
        let mut tracker = ObjectTracker::default();
        let mut skyhooks = skyhooks;
        skyhooks.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name_any().cmp(&b.name_any()))
        });

        let mut entries = Vec::with_capacity(skyhooks.len());
        for skyhook in skyhooks {
            let name = skyhook.name_any();
            let selector = skyhook.spec.node_selectors.as_ref();
            let mut selected = Vec::new();
            for node in &nodes {
                if selector_matches(selector, node.labels())
                    .map_err(|problem| problem.for_skyhook(&name))?
                {
                    selected.push(node.clone());
                }
            }
            selected.sort_by(|a, b| {
                a.metadata
                    .creation_timestamp
                    .cmp(&b.metadata.creation_timestamp)
                    .then_with(|| a.name_any().cmp(&b.name_any()))
            });

            tracker.observe(&skyhook);
            for node in &selected {
                tracker.observe(node);
            }

            let policy = skyhook
                .spec
                .deployment_policy
                .as_ref()
                .and_then(|policy| policies.get(policy).cloned());

            entries.push(SkyhookNodes {
                nodes: selected
                    .into_iter()
                    .map(|node| NodeWrapper::new(node, name.clone()))
                    .collect(),
                skyhook: SkyhookWrapper::new(skyhook),
                policy,
            });
        }

        Ok(ClusterState {
            skyhooks: entries,
            tracker,
        })
    }

    /// The single Skyhook allowed to advance package work this tick: first
    /// non-complete, non-paused, non-disabled in priority order.
    pub fn next_skyhook(&self) -> Option<&SkyhookNodes> {
        self.skyhooks.iter().find(|entry| {
            !entry.skyhook.skyhook.is_paused()
                && !entry.skyhook.skyhook.is_disabled()
                && !entry.skyhook.is_deleting()
                && !entry.is_complete()
        })
    }
}

#[derive(Debug)]
struct SelectorProblem {
    key: String,
    problem: String,
}

impl SelectorProblem {
    fn for_skyhook(self, skyhook: &str) -> Error {
        Error::MalformedSelector {
            skyhook: skyhook.to_string(),
            key: self.key,
            problem: self.problem,
        }
    }
}

/// Kubernetes label-selector semantics. `None` and the empty selector match
/// everything.
fn selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> std::result::Result<bool, SelectorProblem> {
    let Some(selector) = selector else {
        return Ok(true);
    };

    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    for requirement in selector.match_expressions.as_deref().unwrap_or_default() {
        let values = requirement.values.as_deref().unwrap_or_default();
        let actual = labels.get(&requirement.key);
        let matched = match requirement.operator.as_str() {
            "In" => {
                if values.is_empty() {
                    return Err(SelectorProblem {
                        key: requirement.key.clone(),
                        problem: "operator In requires values".to_string(),
                    });
                }
                actual.is_some_and(|actual| values.iter().any(|value| value == actual))
            }
            "NotIn" => {
                if values.is_empty() {
                    return Err(SelectorProblem {
                        key: requirement.key.clone(),
                        problem: "operator NotIn requires values".to_string(),
                    });
                }
                !actual.is_some_and(|actual| values.iter().any(|value| value == actual))
            }
            "Exists" => actual.is_some(),
            "DoesNotExist" => actual.is_none(),
            other => {
                return Err(SelectorProblem {
                    key: requirement.key.clone(),
                    problem: format!("unknown operator {other:?}"),
                });
            }
        };
        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Re-export for the event handler, which maps node changes to the Skyhooks
/// selecting them.
pub fn skyhook_selects_node(skyhook: &Skyhook, node: &Node) -> bool {
    selector_matches(skyhook.spec.node_selectors.as_ref(), node.labels()).unwrap_or(false)
}

/// Selector matching against arbitrary labels; malformed selectors match
/// nothing. Used where a selector gates pods rather than nodes.
pub fn labels_match(selector: Option<&LabelSelector>, labels: &BTreeMap<String, String>) -> bool {
    selector_matches(selector, labels).unwrap_or(false)
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
}

fn object_key<K>(obj: &K) -> ObjectKey
where
    K: Resource<DynamicType = ()>,
{
    ObjectKey {
        kind: K::kind(&()).into_owned(),
        namespace: obj.namespace(),
        name: obj.name_any(),
        uid: obj.uid().unwrap_or_default(),
    }
}

/// Holds the original serialization of every object seen this tick. A
/// mutation is written back as the merge patch between the original and the
/// mutated copy, which keeps concurrent writers off each other's fields.
#[derive(Default)]
pub struct ObjectTracker {
    originals: HashMap<ObjectKey, Value>,
}

impl ObjectTracker {
    pub fn observe<K>(&mut self, obj: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        self.originals
            .entry(object_key(obj))
            .or_insert_with(|| serde_json::to_value(obj).expect("kubernetes object serializes"));
    }

    /// Merge patch from the observed original to `current`, or `None` when
    /// nothing changed (or the object was never observed).
    pub fn diff<K>(&self, current: &K) -> Option<Value>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let original = self.originals.get(&object_key(current))?;
        let current = serde_json::to_value(current).expect("kubernetes object serializes");
        merge_patch(original, &current)
    }
}

/// RFC 7386 style diff: objects recurse, removed keys become `null`, arrays
/// and scalars are replaced wholesale.
pub fn merge_patch(original: &Value, current: &Value) -> Option<Value> {
    if original == current {
        return None;
    }
    match (original, current) {
        (Value::Object(original), Value::Object(current)) => {
            let mut patch = serde_json::Map::new();
            for (key, original_value) in original {
                match current.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(current_value) => {
                        if let Some(inner) = merge_patch(original_value, current_value) {
                            patch.insert(key.clone(), inner);
                        }
                    }
                }
            }
            for (key, current_value) in current {
                if !original.contains_key(key) {
                    patch.insert(key.clone(), current_value.clone());
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        _ => Some(current.clone()),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use serde_json::json;

    use super::*;
    use crate::crd::SkyhookSpec;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn node(name: &str, labels_in: &[(&str, &str)], created: i64) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.metadata.labels = Some(labels(labels_in));
        node.metadata.creation_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::DateTime::from_timestamp(created, 0).unwrap(),
            ));
        node
    }

    fn skyhook(name: &str, priority: i32) -> Skyhook {
        let mut skyhook = Skyhook::new(
            name,
            SkyhookSpec {
                priority,
                ..Default::default()
            },
        );
        skyhook.metadata.uid = Some(format!("uid-{name}"));
        skyhook
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        assert!(selector_matches(None, &labels(&[("a", "b")])).unwrap());
        assert!(selector_matches(Some(&LabelSelector::default()), &labels(&[])).unwrap());
    }

    #[test]
    fn test_match_labels_and_expressions() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("test-node", "skyhooke2e")])),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "zone".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["a".to_string(), "b".to_string()]),
            }]),
        };
        assert!(selector_matches(
            Some(&selector),
            &labels(&[("test-node", "skyhooke2e"), ("zone", "a")])
        )
        .unwrap());
        assert!(!selector_matches(
            Some(&selector),
            &labels(&[("test-node", "skyhooke2e"), ("zone", "c")])
        )
        .unwrap());
        assert!(!selector_matches(Some(&selector), &labels(&[("zone", "a")])).unwrap());
    }

    #[test]
    fn test_not_in_matches_missing_key() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "NotIn".to_string(),
                values: Some(vec!["gold".to_string()]),
            }]),
        };
        assert!(selector_matches(Some(&selector), &labels(&[])).unwrap());
        assert!(!selector_matches(Some(&selector), &labels(&[("tier", "gold")])).unwrap());
    }

    #[test]
    fn test_malformed_selector_errors() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "Near".to_string(),
                values: None,
            }]),
        };
        assert!(selector_matches(Some(&selector), &labels(&[])).is_err());
    }

    #[test]
    fn test_build_orders_by_priority_then_name() {
        let state = ClusterState::build(
            vec![skyhook("b", 2), skyhook("c", 2), skyhook("a", 1)],
            vec![],
            HashMap::new(),
        )
        .unwrap();
        let order: Vec<String> = state
            .skyhooks
            .iter()
            .map(|entry| entry.skyhook.name())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_build_orders_nodes_by_creation() {
        let state = ClusterState::build(
            vec![skyhook("a", 0)],
            vec![node("young", &[], 200), node("old", &[], 100)],
            HashMap::new(),
        )
        .unwrap();
        let order: Vec<String> = state.skyhooks[0]
            .nodes
            .iter()
            .map(|node| node.name())
            .collect();
        assert_eq!(order, vec!["old", "young"]);
    }

    #[test]
    fn test_next_skyhook_skips_paused_and_complete() {
        let mut paused = skyhook("a", 0);
        paused.spec.pause = true;
        let state = ClusterState::build(
            vec![paused, skyhook("b", 1)],
            vec![node("n", &[], 1)],
            HashMap::new(),
        )
        .unwrap();
        assert_eq!(state.next_skyhook().unwrap().skyhook.name(), "b");
    }

    #[test]
    fn test_merge_patch_diffs() {
        let original = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});

        assert_eq!(merge_patch(&original, &original), None);

        let changed = json!({"a": 1, "b": {"c": 9, "d": 3}, "e": [1, 2]});
        assert_eq!(merge_patch(&original, &changed), Some(json!({"b": {"c": 9}})));

        let removed = json!({"a": 1, "b": {"d": 3}, "e": [1, 2]});
        assert_eq!(
            merge_patch(&original, &removed),
            Some(json!({"b": {"c": null}}))
        );

        let added = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2], "f": "new"});
        assert_eq!(merge_patch(&original, &added), Some(json!({"f": "new"})));

        // arrays replace wholesale
        let array = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1]});
        assert_eq!(merge_patch(&original, &array), Some(json!({"e": [1]})));
    }

    #[test]
    fn test_tracker_diffs_only_observed_changes() {
        let mut tracker = ObjectTracker::default();
        let mut observed = node("tracked", &[], 1);
        observed.metadata.uid = Some("uid-1".to_string());
        tracker.observe(&observed);

        assert_eq!(tracker.diff(&observed), None);

        let mut changed = observed.clone();
        changed
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("added".to_string(), "label".to_string());
        let patch = tracker.diff(&changed).unwrap();
        assert_eq!(
            patch,
            json!({"metadata": {"labels": {"added": "label"}}})
        );

        // never observed: nothing to diff against
        let stranger = node("stranger", &[], 1);
        assert_eq!(tracker.diff(&stranger), None);
    }
}
