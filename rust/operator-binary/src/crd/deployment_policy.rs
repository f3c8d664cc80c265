//! The `DeploymentPolicy` custom resource: named compartments that partition
//! a Skyhook's nodes into independently-gated rollouts.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::InterruptionBudget;

/// Name of the implicit compartment holding nodes no compartment selects.
pub const DEFAULT_COMPARTMENT: &str = "__default__";

#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "skyhook.nvidia.com",
    version = "v1alpha1",
    kind = "DeploymentPolicy",
    plural = "deploymentpolicies"
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPolicySpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compartments: Vec<Compartment>,

    /// Default for Skyhooks that do not set
    /// `deploymentPolicyOptions.resetBatchStateOnCompletion`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_batch_state_on_completion: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Compartment {
    pub name: String,

    /// Selects the nodes belonging to this compartment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    #[serde(default)]
    pub strategy: RolloutStrategy,

    /// Bounds concurrency within this compartment only.
    #[serde(default)]
    pub budget: InterruptionBudget,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    #[serde(default)]
    pub kind: StrategyKind,

    /// Nodes in the first batch; growth from there is set by `kind`.
    #[serde(default = "default_initial_batch")]
    pub initial_batch: u32,
}

fn default_initial_batch() -> u32 {
    1
}

/// Batch growth law. `fixed` stays at the initial size, `linear` grows by the
/// initial size each batch, `exponential` doubles.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumString,
    Eq,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_parses() {
        let input = indoc::indoc! {r#"
            apiVersion: skyhook.nvidia.com/v1alpha1
            kind: DeploymentPolicy
            metadata:
              name: canary-then-fleet
            spec:
              resetBatchStateOnCompletion: true
              compartments:
                - name: canary
                  selector:
                    matchLabels:
                      tier: canary
                  strategy:
                    kind: fixed
                    initialBatch: 1
                  budget:
                    count: 1
                - name: fleet
                  strategy:
                    kind: exponential
                    initialBatch: 2
                  budget:
                    percent: 25
        "#};
        let policy: DeploymentPolicy = serde_yaml::from_str(input).expect("illegal test input");
        assert_eq!(policy.spec.reset_batch_state_on_completion, Some(true));
        assert_eq!(policy.spec.compartments.len(), 2);
        assert_eq!(policy.spec.compartments[0].strategy.kind, StrategyKind::Fixed);
        assert_eq!(policy.spec.compartments[1].strategy.initial_batch, 2);
        assert_eq!(policy.spec.compartments[1].budget.percent, Some(25));
    }

    #[test]
    fn test_strategy_safety_ordering() {
        assert!(StrategyKind::Fixed < StrategyKind::Linear);
        assert!(StrategyKind::Linear < StrategyKind::Exponential);
    }
}
