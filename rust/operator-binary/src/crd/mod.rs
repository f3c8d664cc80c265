//! The `Skyhook` custom resource and the invariants the admission webhook
//! enforces on it.

use std::collections::BTreeMap;

use const_format::concatcp;
use k8s_openapi::{
    api::core::v1::{EnvVar, Toleration},
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{Condition, LabelSelector, Time},
    },
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use semver::Version;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{Display, EnumIter, EnumString};

use crate::graph;

pub mod deployment_policy;

/// Prefix for every label, annotation, taint and condition owned by the
/// operator.
pub const DOMAIN: &str = "skyhook.nvidia.com";

pub const FINALIZER: &str = concatcp!(DOMAIN, "/skyhook");

// Pod labels
pub const LABEL_NAME: &str = concatcp!(DOMAIN, "/name");
pub const LABEL_PACKAGE: &str = concatcp!(DOMAIN, "/package");
pub const LABEL_INTERRUPT: &str = concatcp!(DOMAIN, "/interrupt");

// ConfigMap labels
pub const LABEL_NODE_META: &str = concatcp!(DOMAIN, "/skyhook-node-meta");

// Pod annotations
pub const ANNOTATION_PACKAGE: &str = concatcp!(DOMAIN, "/package");

// Skyhook annotations
pub const ANNOTATION_PAUSE: &str = concatcp!(DOMAIN, "/pause");
pub const ANNOTATION_DISABLE: &str = concatcp!(DOMAIN, "/disable");
pub const ANNOTATION_PRIORITY: &str = concatcp!(DOMAIN, "/priority");

// Node keys are per-Skyhook, see [`node_state_annotation`] and
// [`node_status_label`].
pub const NODE_STATE_PREFIX: &str = concatcp!(DOMAIN, "/nodeState_");
pub const NODE_STATUS_PREFIX: &str = concatcp!(DOMAIN, "/status_");

/// Taint added while a node is cordoned for a Skyhook. The taint value is the
/// Skyhook name.
pub const TAINT_UNSCHEDULABLE: &str = concatcp!(DOMAIN, "/unschedulable");

// Condition types
pub const CONDITION_TRANSITION: &str = concatcp!(DOMAIN, "/Transition");
pub const CONDITION_TAINT_NOT_TOLERABLE: &str = concatcp!(DOMAIN, "/TaintNotTolerable");
pub const CONDITION_APPLY_PACKAGE: &str = concatcp!(DOMAIN, "/ApplyPackage");
pub const CONDITION_NOT_READY: &str = concatcp!(DOMAIN, "/NotReady");

/// Annotation on a node holding the JSON per-package state for one Skyhook.
pub fn node_state_annotation(skyhook: &str) -> String {
    format!("{NODE_STATE_PREFIX}{skyhook}")
}

/// Label on a node holding the aggregated status for one Skyhook.
pub fn node_status_label(skyhook: &str) -> String {
    format!("{NODE_STATUS_PREFIX}{skyhook}")
}

/// Key of a package inside a node's state map.
pub fn package_key(name: &str, version: &str) -> String {
    format!("{name}|{version}")
}

/// A Skyhook describes a set of versioned packages to be driven to completion
/// on every node matched by its selector, within an interruption budget.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "skyhook.nvidia.com",
    version = "v1alpha1",
    kind = "Skyhook",
    plural = "skyhooks",
    shortname = "sh",
    status = "SkyhookStatus",
    printcolumn = r#"{"name":"Status","jsonPath":".status.status","type":"string"}"#,
    printcolumn = r#"{"name":"Complete","jsonPath":".status.completeNodes","type":"string"}"#,
    printcolumn = r#"{"name":"Packages","jsonPath":".status.packageList","type":"string"}"#,
    printcolumn = r#"{"name":"InProgress","jsonPath":".status.nodesInProgress","type":"string"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SkyhookSpec {
    /// Selects the nodes this Skyhook applies to. An empty selector matches
    /// every node in the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selectors: Option<LabelSelector>,

    /// Bounds how many matched nodes may be in flight concurrently.
    #[serde(default)]
    pub interruption_budget: InterruptionBudget,

    /// The packages to run, keyed by package name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, Package>,

    /// Tolerations added to every pod this Skyhook creates, on top of the
    /// built-in unschedulable tolerations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_tolerations: Vec<Toleration>,

    /// Pods matching this selector must have drained from a node before an
    /// interrupt may run on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_non_interrupt_labels: Option<LabelSelector>,

    /// While true, at most one package pod is created per node per tick.
    #[serde(default)]
    pub serial: bool,

    /// While true, no package work is performed; status is still reported.
    #[serde(default)]
    pub pause: bool,

    /// Marks this Skyhook as required before a node's runtime-required taint
    /// is removed.
    #[serde(default)]
    pub runtime_required: bool,

    /// Skyhooks are worked in ascending priority order, ties broken by name.
    #[serde(default)]
    pub priority: i32,

    /// Name of a DeploymentPolicy partitioning the matched nodes into
    /// compartments with their own rollout strategies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_policy_options: Option<DeploymentPolicyOptions>,
}

/// Either an absolute node count or a percentage of the matched nodes; never
/// both. Unset means all matched nodes.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionBudget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

impl InterruptionBudget {
    /// Effective budget for `node_count` matched nodes. Percent floors but
    /// never below one; count is capped at the node count.
    pub fn effective(&self, node_count: usize) -> usize {
        if node_count == 0 {
            return 0;
        }
        match (self.percent, self.count) {
            (Some(percent), _) => 1.max(node_count * percent as usize / 100),
            (None, Some(count)) => 1.max(node_count.min(count as usize)),
            (None, None) => node_count,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPolicyOptions {
    /// Reset every compartment's batch state when a package version change is
    /// detected. Falls back to the policy-level default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_batch_state_on_completion: Option<bool>,
}

/// A versioned unit of node work: an image with lifecycle stages, optional
/// inline configuration and an optional interrupt between stages.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    /// Defaulted to the map key by the mutating webhook; must match it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Package version, semver with an optional `v` prefix. Also used as the
    /// image tag.
    pub version: String,

    /// Package image without a tag; the tag is derived from `version`.
    pub image: String,

    /// Overrides the operator-wide agent image for this package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_image_override: Option<String>,

    /// Names of packages that must reach the same stage before this one may
    /// advance past it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Inline data for a ConfigMap owned by the Skyhook and mounted into the
    /// package pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<BTreeMap<String, String>>,

    /// Interrupts to run when specific configmap keys change, keyed by exact
    /// key or `*`-glob over keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_interrupts: Option<BTreeMap<String, Interrupt>>,

    /// Disruptive action required between the config and post-interrupt
    /// stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<Interrupt>,

    /// Resource requests and limits for the package containers. All four
    /// values must be set together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceOverrides>,

    /// Extra environment variables for the package containers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Time the package pods get to shut down gracefully, e.g. `30s` or `5m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_shutdown: Option<String>,
}

impl Package {
    /// Image reference with the version-derived tag.
    pub fn tagged_image(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Interrupt {
    #[serde(rename = "type")]
    pub kind: InterruptType,

    /// Units to restart; only meaningful for `service` interrupts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InterruptType {
    Noop,
    Service,
    RestartAllServices,
    Reboot,
}

impl InterruptType {
    /// Merge priority, lower wins.
    pub fn priority(&self) -> u8 {
        match self {
            InterruptType::Reboot => 0,
            InterruptType::RestartAllServices => 1,
            InterruptType::Service => 2,
            InterruptType::Noop => 3,
        }
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverrides {
    pub cpu_request: Option<Quantity>,
    pub cpu_limit: Option<Quantity>,
    pub memory_request: Option<Quantity>,
    pub memory_limit: Option<Quantity>,
}

/// One step of a package's lifecycle on a node.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumIter, EnumString, Eq, JsonSchema, PartialEq,
    Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    Apply,
    Config,
    Interrupt,
    PostInterrupt,
    Upgrade,
    Uninstall,
}

impl Stage {
    /// How far along the install chain a completed stage has taken the
    /// package. Upgrade substitutes for apply, so it carries apply-level
    /// progress; uninstall carries none. Declaration order deliberately does
    /// not define this, so stages must never be compared with `<`/`>`.
    pub fn progress(&self) -> u8 {
        match self {
            Stage::Uninstall => 0,
            Stage::Apply | Stage::Upgrade => 1,
            Stage::Config => 2,
            Stage::Interrupt => 3,
            Stage::PostInterrupt => 4,
        }
    }
}

/// Liveness of a package at its current stage.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PackageState {
    InProgress,
    Complete,
    Erroring,
    Skipped,
}

/// Aggregated status of a Skyhook, and of each of its nodes.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SkyhookState {
    #[default]
    Unknown,
    InProgress,
    Erroring,
    Complete,
    Paused,
    Disabled,
    Blocked,
    Waiting,
}

/// Status of one package on one node, keyed by [`package_key`] in the node
/// state map.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    pub name: String,
    pub version: String,
    pub image: String,
    pub stage: Stage,
    pub state: PackageState,
    #[serde(default)]
    pub restarts: i32,
}

pub type NodeState = BTreeMap<String, PackageStatus>;

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkyhookStatus {
    #[serde(default)]
    pub status: SkyhookState,

    #[serde(default)]
    pub observed_generation: i64,

    /// Per-node package state, mirrored from the node annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_state: BTreeMap<String, NodeState>,

    /// Last seen boot id per node, for reboot detection.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_boot_ids: BTreeMap<String, String>,

    /// When each non-complete node was last picked; picked nodes stay picked.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_priority: BTreeMap<String, Time>,

    /// Configmap keys whose change still needs a config re-run, per package.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_updates: BTreeMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub compartment_statuses: BTreeMap<String, CompartmentStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Printer column, `<complete>/<matched>`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub complete_nodes: String,

    /// Printer column, comma-joined `name:version`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub package_list: String,

    /// Printer column, comma-joined names of nodes currently in progress.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nodes_in_progress: String,
}

/// Rollout bookkeeping for one compartment of a DeploymentPolicy.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompartmentStatus {
    #[serde(default)]
    pub current_batch: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub last_batch_size: u32,
    #[serde(default)]
    pub last_batch_failed: bool,
    #[serde(default)]
    pub should_stop: bool,
}

impl Skyhook {
    /// Packages with their `name` defaulted from the map key, in map (name)
    /// order. The mutating webhook does the same defaulting at admission.
    pub fn packages(&self) -> Vec<Package> {
        self.spec
            .packages
            .iter()
            .map(|(key, package)| {
                let mut package = package.clone();
                if package.name.is_empty() {
                    package.name = key.clone();
                }
                package
            })
            .collect()
    }

    pub fn package(&self, name: &str) -> Option<Package> {
        self.spec.packages.get(name).map(|package| {
            let mut package = package.clone();
            if package.name.is_empty() {
                package.name = name.to_string();
            }
            package
        })
    }

    /// Paused via spec or the pause annotation.
    pub fn is_paused(&self) -> bool {
        self.spec.pause
            || self.annotations().get(ANNOTATION_PAUSE).map(String::as_str) == Some("true")
    }

    pub fn is_disabled(&self) -> bool {
        self.annotations().get(ANNOTATION_DISABLE).map(String::as_str) == Some("true")
    }

    /// Spec priority, overridable through the priority annotation.
    pub fn priority(&self) -> i32 {
        self.annotations()
            .get(ANNOTATION_PRIORITY)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(self.spec.priority)
    }

    /// Stable identifier for everything this generation of the Skyhook puts
    /// on a node.
    pub fn resource_id(&self) -> String {
        format!(
            "{}-{}",
            self.metadata.uid.as_deref().unwrap_or_default(),
            self.metadata.generation.unwrap_or_default()
        )
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("package key {key:?} does not match package name {name:?}"))]
    PackageNameMismatch { key: String, name: String },

    #[snafu(display(
        "package name {name:?} is not a valid name (lowercase alphanumeric and dashes, 2 to 43 chars, must start and end with a letter)"
    ))]
    InvalidPackageName { name: String },

    #[snafu(display("package {package}: image {image:?} must not carry a tag"))]
    ImageHasTag { package: String, image: String },

    #[snafu(display("package {package}: version {version:?} is not valid semver"))]
    InvalidVersion {
        package: String,
        version: String,
        source: semver::Error,
    },

    #[snafu(display("package {package}: config interrupt key {key:?} matches no configmap key"))]
    UnmatchedConfigInterruptKey { package: String, key: String },

    #[snafu(display("package {package}: config interrupts defined without a configmap"))]
    ConfigInterruptsWithoutConfigMap { package: String },

    #[snafu(display(
        "package {package}: resource overrides must set all of cpuRequest, cpuLimit, memoryRequest and memoryLimit"
    ))]
    IncompleteResourceOverrides { package: String },

    #[snafu(display("package {package}: could not parse resource quantity {value:?}"))]
    InvalidQuantity { package: String, value: String },

    #[snafu(display(
        "package {package}: resource {resource} limit {limit:?} is below request {request:?}"
    ))]
    LimitBelowRequest {
        package: String,
        resource: String,
        request: String,
        limit: String,
    },

    #[snafu(display("package {package}: resource {resource} value {value:?} must be positive"))]
    NonPositiveQuantity {
        package: String,
        resource: String,
        value: String,
    },

    #[snafu(display("package {package}: invalid gracefulShutdown {value:?}"))]
    InvalidGracefulShutdown {
        package: String,
        value: String,
        source: humantime::DurationError,
    },

    #[snafu(display("interruption budget must not set both count and percent"))]
    BudgetCountAndPercent,

    #[snafu(display("interruption budget percent {percent} is not within 0..=100"))]
    BudgetPercentOutOfRange { percent: u32 },

    #[snafu(display("invalid package dependency graph"))]
    InvalidGraph { source: graph::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Lenient semver parse: an optional `v` prefix is stripped and a missing
/// minor or patch component is treated as zero, so `v1.2` parses as `1.2.0`.
pub fn parse_version(raw: &str) -> std::result::Result<Version, semver::Error> {
    let raw = raw.strip_prefix('v').unwrap_or(raw);
    match Version::parse(raw) {
        Ok(version) => Ok(version),
        Err(err) => {
            let (core, rest) = match raw.find(['-', '+']) {
                Some(at) => raw.split_at(at),
                None => (raw, ""),
            };
            let padded = match core.matches('.').count() {
                0 => format!("{core}.0.0{rest}"),
                1 => format!("{core}.0{rest}"),
                _ => return Err(err),
            };
            Version::parse(&padded)
        }
    }
}

/// Matches `value` against `pattern`, where `*` matches any run of
/// characters. Anything else matches literally.
pub fn glob_matches(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    let (mut p, mut v) = (0, 0);
    let (mut star, mut mark) = (None, 0);
    while v < value.len() {
        if p < pattern.len() && pattern[p] != '*' && pattern[p] == value[v] {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = v;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            v = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

fn valid_package_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() < 2 || bytes.len() > 43 {
        return false;
    }
    bytes[0].is_ascii_lowercase()
        && bytes[bytes.len() - 1].is_ascii_lowercase()
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

/// Parses a Kubernetes resource quantity into a plain number of base units.
fn parse_quantity(quantity: &Quantity) -> Option<f64> {
    let raw = quantity.0.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-' && c != '+')
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;
    let scale: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return None,
    };
    Some(number * scale)
}

impl ResourceOverrides {
    fn validate(&self, package: &str) -> Result<()> {
        let all = [
            ("cpu", &self.cpu_request, &self.cpu_limit),
            ("memory", &self.memory_request, &self.memory_limit),
        ];
        if all
            .iter()
            .any(|(_, request, limit)| request.is_none() || limit.is_none())
        {
            return IncompleteResourceOverridesSnafu { package }.fail();
        }
        for (resource, request, limit) in all {
            let request = request.as_ref().expect("presence checked above");
            let limit = limit.as_ref().expect("presence checked above");
            let request_value = parse_quantity(request).context(InvalidQuantitySnafu {
                package,
                value: request.0.clone(),
            })?;
            let limit_value = parse_quantity(limit).context(InvalidQuantitySnafu {
                package,
                value: limit.0.clone(),
            })?;
            for (value, raw) in [(request_value, request), (limit_value, limit)] {
                if value <= 0.0 {
                    return NonPositiveQuantitySnafu {
                        package,
                        resource,
                        value: raw.0.clone(),
                    }
                    .fail();
                }
            }
            if limit_value < request_value {
                return LimitBelowRequestSnafu {
                    package,
                    resource,
                    request: request.0.clone(),
                    limit: limit.0.clone(),
                }
                .fail();
            }
        }
        Ok(())
    }
}

/// A colon after the last `/` means the image reference carries a tag.
fn image_has_tag(image: &str) -> bool {
    image
        .rsplit('/')
        .next()
        .is_some_and(|name| name.contains(':'))
}

impl SkyhookSpec {
    /// The validating webhook's rule set. The reconciler re-runs it each tick
    /// so a Skyhook created while the webhook was unavailable still fails
    /// loudly instead of half-running.
    pub fn validate(&self) -> Result<()> {
        if self.interruption_budget.count.is_some() && self.interruption_budget.percent.is_some() {
            return BudgetCountAndPercentSnafu.fail();
        }
        if let Some(percent) = self.interruption_budget.percent {
            snafu::ensure!(percent <= 100, BudgetPercentOutOfRangeSnafu { percent });
        }

        for (key, package) in &self.packages {
            let name = if package.name.is_empty() {
                key.as_str()
            } else {
                package.name.as_str()
            };
            snafu::ensure!(
                name == key,
                PackageNameMismatchSnafu {
                    key,
                    name: package.name.clone(),
                }
            );
            snafu::ensure!(valid_package_name(name), InvalidPackageNameSnafu { name });
            snafu::ensure!(
                !image_has_tag(&package.image),
                ImageHasTagSnafu {
                    package: name,
                    image: package.image.clone(),
                }
            );
            parse_version(&package.version).context(InvalidVersionSnafu {
                package: name,
                version: package.version.clone(),
            })?;

            if let Some(config_interrupts) = &package.config_interrupts {
                let config_map = package
                    .config_map
                    .as_ref()
                    .context(ConfigInterruptsWithoutConfigMapSnafu { package: name })?;
                for key in config_interrupts.keys() {
                    let matched = config_map.contains_key(key)
                        || (key.contains('*')
                            && config_map.keys().any(|data_key| glob_matches(key, data_key)));
                    snafu::ensure!(
                        matched,
                        UnmatchedConfigInterruptKeySnafu { package: name, key }
                    );
                }
            }

            if let Some(resources) = &package.resources {
                resources.validate(name)?;
            }

            if let Some(graceful_shutdown) = &package.graceful_shutdown {
                humantime::parse_duration(graceful_shutdown).context(
                    InvalidGracefulShutdownSnafu {
                        package: name,
                        value: graceful_shutdown.clone(),
                    },
                )?;
            }
        }

        // acyclic and closed under dependencies
        graph::DependencyGraph::build(&self.packages).context(InvalidGraphSnafu)?;

        Ok(())
    }
}
