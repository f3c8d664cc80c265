//! Builds the short-lived pods that run package stages on nodes, and checks
//! running pods against the spec they were built from.
//!
//! Every stage pod has the same shape: an init container copying the package
//! payload out of the package image, an agent init container running the
//! stage, another running the stage check, and a pause container keeping the
//! pod alive until the operator has read the outcome and deletes it.

use std::collections::BTreeMap;

use base64::Engine;
use k8s_openapi::{
    api::core::v1::{
        Container, EnvVar, HostPathVolumeSource, LocalObjectReference, Pod, PodSpec,
        ResourceRequirements, SecurityContext, Volume, VolumeMount,
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::OperatorConfig,
    crd::{
        Interrupt, Package, ResourceOverrides, Skyhook, Stage, ANNOTATION_PACKAGE,
        LABEL_INTERRUPT, LABEL_NAME, LABEL_PACKAGE,
    },
    picker,
};

pub const CONTAINER_COPY: &str = "package-copy";
pub const CONTAINER_PAUSE: &str = "pause";

/// Env vars the operator injects into every agent container. These are
/// exempt from drift detection.
pub const INJECTED_ENV: [&str; 4] = [
    "SKYHOOK_LOG_DIR",
    "SKYHOOK_ROOT_DIR",
    "COPY_RESOLV",
    "SKYHOOK_RESOURCE_ID",
];

/// The JSON record stored in the pod's package annotation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
    pub skyhook: String,
    pub stage: Stage,
    pub image: String,
    #[serde(rename = "containerSHA", skip_serializing_if = "Option::is_none", default)]
    pub container_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub invalid: Option<bool>,
}

pub fn set_package(pod: &mut Pod, record: &PackageRecord) {
    pod.annotations_mut().insert(
        ANNOTATION_PACKAGE.to_string(),
        serde_json::to_string(record).expect("package record serializes"),
    );
}

pub fn get_package(pod: &Pod) -> Option<PackageRecord> {
    let raw = pod.annotations().get(ANNOTATION_PACKAGE)?;
    serde_json::from_str(raw).ok()
}

/// Deterministic RFC-1123 name: parts joined with dashes, dots flattened,
/// lowercased, truncated to fit, and suffixed with 8 hex chars of the
/// SHA-256 of the untruncated join so distinct inputs stay distinct.
pub fn generate_safe_name(max_len: usize, parts: &[&str]) -> String {
    let joined = parts
        .join("-")
        .to_lowercase()
        .replace(['.', '_'], "-");
    let digest = Sha256::digest(joined.as_bytes());
    let suffix = format!("{:02x}{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2], digest[3]);

    let budget = max_len.saturating_sub(suffix.len() + 1);
    let mut body: String = joined.chars().take(budget).collect();
    while body.ends_with('-') {
        body.pop();
    }
    format!("{body}-{suffix}")
}

pub fn pod_name(skyhook: &str, package: &Package, stage: Stage, node: &str) -> String {
    generate_safe_name(
        63,
        &[skyhook, &package.name, &package.version, &stage.to_string(), node],
    )
}

/// Package configmaps are plainly named; versions contain dots, which are
/// legal in configmap names.
pub fn package_config_map_name(skyhook: &str, package: &Package) -> String {
    format!("{skyhook}-{}-{}", package.name, package.version).to_lowercase()
}

pub fn node_metadata_config_map_name(skyhook: &str, node: &str) -> String {
    format!("{skyhook}-{node}-metadata").to_lowercase()
}

fn package_label_value(package: &Package) -> String {
    format!("{}-{}", package.name, package.version)
}

/// Host directory the package payload is copied into, unique per Skyhook
/// generation so stale payloads are never reused.
fn copy_dir(skyhook: &Skyhook, package: &Package, config: &OperatorConfig) -> String {
    format!(
        "{}/{}/{}-{}-{}",
        config.copy_dir_root,
        skyhook.name_any(),
        package.name,
        package.version,
        skyhook.resource_id(),
    )
}

fn agent_env(skyhook: &Skyhook, package: &Package, config: &OperatorConfig) -> Vec<EnvVar> {
    let name = skyhook.name_any();
    let mut env = vec![
        env_var("SKYHOOK_LOG_DIR", format!("{}/{name}", config.agent_log_root)),
        env_var("SKYHOOK_ROOT_DIR", format!("{}/{name}", config.copy_dir_root)),
        env_var("COPY_RESOLV", "false".to_string()),
        env_var(
            "SKYHOOK_RESOURCE_ID",
            format!(
                "{}_{}_{}",
                skyhook.resource_id(),
                package.name,
                package.version
            ),
        ),
    ];
    env.extend(package.env.iter().cloned());
    env
}

fn env_var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    }
}

fn resources_of(overrides: &Option<ResourceOverrides>) -> Option<ResourceRequirements> {
    let overrides = overrides.as_ref()?;
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
    if let Some(cpu) = &overrides.cpu_request {
        requests.insert("cpu".to_string(), cpu.clone());
    }
    if let Some(cpu) = &overrides.cpu_limit {
        limits.insert("cpu".to_string(), cpu.clone());
    }
    if let Some(memory) = &overrides.memory_request {
        requests.insert("memory".to_string(), memory.clone());
    }
    if let Some(memory) = &overrides.memory_limit {
        limits.insert("memory".to_string(), memory.clone());
    }
    Some(ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    })
}

fn skyhook_volume(skyhook: &Skyhook, config: &OperatorConfig) -> (Volume, VolumeMount) {
    let path = format!("{}/{}", config.copy_dir_root, skyhook.name_any());
    (
        Volume {
            name: "skyhook-dir".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: path.clone(),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Volume::default()
        },
        VolumeMount {
            name: "skyhook-dir".to_string(),
            mount_path: path,
            ..VolumeMount::default()
        },
    )
}

pub(crate) fn owner_reference(skyhook: &Skyhook) -> OwnerReference {
    OwnerReference {
        api_version: Skyhook::api_version(&()).into_owned(),
        kind: Skyhook::kind(&()).into_owned(),
        name: skyhook.name_any(),
        uid: skyhook.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn agent_image(package: &Package, config: &OperatorConfig) -> String {
    package
        .agent_image_override
        .clone()
        .unwrap_or_else(|| config.agent_image.clone())
}

fn base_pod(
    skyhook: &Skyhook,
    package: &Package,
    stage: Stage,
    node: &str,
    config: &OperatorConfig,
) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(pod_name(&skyhook.name_any(), package, stage, node));
    pod.metadata.namespace = Some(config.namespace.clone());
    pod.metadata.labels = Some(BTreeMap::from([
        (LABEL_NAME.to_string(), skyhook.name_any()),
        (LABEL_PACKAGE.to_string(), package_label_value(package)),
    ]));
    pod.metadata.owner_references = Some(vec![owner_reference(skyhook)]);
    set_package(
        &mut pod,
        &PackageRecord {
            name: package.name.clone(),
            version: package.version.clone(),
            skyhook: skyhook.name_any(),
            stage,
            image: package.tagged_image(),
            container_sha: None,
            invalid: None,
        },
    );

    let (volume, _) = skyhook_volume(skyhook, config);
    let graceful = package
        .graceful_shutdown
        .as_deref()
        .and_then(|raw| humantime::parse_duration(raw).ok())
        .map(|duration| duration.as_secs() as i64);

    pod.spec = Some(PodSpec {
        node_name: Some(node.to_string()),
        restart_policy: Some("Never".to_string()),
        tolerations: Some(picker::toleration_set(
            &skyhook.spec,
            &config.runtime_required_taint,
        )),
        termination_grace_period_seconds: graceful,
        image_pull_secrets: config.image_pull_secret.as_ref().map(|secret| {
            vec![LocalObjectReference {
                name: secret.clone(),
            }]
        }),
        volumes: Some(vec![volume]),
        containers: vec![Container {
            name: CONTAINER_PAUSE.to_string(),
            image: Some(config.pause_image.clone()),
            ..Container::default()
        }],
        init_containers: Some(Vec::new()),
        ..PodSpec::default()
    });

    pod
}

fn copy_container(
    package: &Package,
    mount: &VolumeMount,
    copy_dir: &str,
) -> Container {
    Container {
        name: CONTAINER_COPY.to_string(),
        image: Some(package.tagged_image()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("mkdir -p {copy_dir} && cp -r /skyhook-package/. {copy_dir}"),
        ]),
        volume_mounts: Some(vec![mount.clone()]),
        resources: resources_of(&package.resources),
        ..Container::default()
    }
}

fn agent_container(
    name: &str,
    args: Vec<String>,
    skyhook: &Skyhook,
    package: &Package,
    config: &OperatorConfig,
    mount: &VolumeMount,
    privileged: bool,
) -> Container {
    Container {
        name: name.to_string(),
        image: Some(agent_image(package, config)),
        args: Some(args),
        env: Some(agent_env(skyhook, package, config)),
        volume_mounts: Some(vec![mount.clone()]),
        resources: resources_of(&package.resources),
        security_context: privileged.then(|| SecurityContext {
            privileged: Some(true),
            ..SecurityContext::default()
        }),
        ..Container::default()
    }
}

/// A stage pod: copy the payload, run the stage, run the stage check.
pub fn build_package_pod(
    skyhook: &Skyhook,
    package: &Package,
    stage: Stage,
    node: &str,
    config: &OperatorConfig,
) -> Pod {
    let mut pod = base_pod(skyhook, package, stage, node, config);
    let (_, mount) = skyhook_volume(skyhook, config);
    let dir = copy_dir(skyhook, package, config);

    let stage_name = stage.to_string();
    let init_containers = vec![
        copy_container(package, &mount, &dir),
        agent_container(
            &stage_name,
            vec![stage_name.clone(), "/root".to_string(), dir.clone()],
            skyhook,
            package,
            config,
            &mount,
            false,
        ),
        agent_container(
            &format!("{stage_name}-check"),
            vec![format!("{stage_name}-check"), "/root".to_string(), dir],
            skyhook,
            package,
            config,
            &mount,
            false,
        ),
    ];
    pod.spec
        .as_mut()
        .expect("base pod has a spec")
        .init_containers = Some(init_containers);
    pod
}

/// An interrupt pod: a single privileged agent container carrying the merged
/// interrupt, labeled so the event handler and the validity sweep can tell
/// it apart.
pub fn build_interrupt_pod(
    skyhook: &Skyhook,
    package: &Package,
    interrupt: &Interrupt,
    node: &str,
    config: &OperatorConfig,
) -> Pod {
    let mut pod = base_pod(skyhook, package, Stage::Interrupt, node, config);
    pod.labels_mut()
        .insert(LABEL_INTERRUPT.to_string(), "True".to_string());

    let (_, mount) = skyhook_volume(skyhook, config);
    let dir = copy_dir(skyhook, package, config);
    let encoded = base64::engine::general_purpose::STANDARD
        .encode(serde_json::to_vec(interrupt).expect("interrupt serializes"));

    let spec = pod.spec.as_mut().expect("base pod has a spec");
    spec.init_containers = Some(vec![agent_container(
        "interrupt",
        vec!["interrupt".to_string(), "/root".to_string(), dir, encoded],
        skyhook,
        package,
        config,
        &mount,
        true,
    )]);
    spec.host_pid = Some(true);
    pod
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PodOutcome {
    Running,
    Succeeded,
    Failed,
}

/// The work happens in init containers while a pause container keeps the pod
/// alive, so success is "every init container exited zero", not phase
/// `Succeeded`.
pub fn pod_outcome(pod: &Pod) -> PodOutcome {
    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or("");
    if phase == "Succeeded" {
        return PodOutcome::Succeeded;
    }
    if phase == "Failed" {
        return PodOutcome::Failed;
    }

    let statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.init_container_statuses.as_deref())
        .unwrap_or_default();
    let expected = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.init_containers.as_deref())
        .map(|containers| containers.len())
        .unwrap_or(0);

    let mut finished = 0;
    for status in statuses {
        if let Some(terminated) = status.state.as_ref().and_then(|state| state.terminated.as_ref())
        {
            if terminated.exit_code != 0 {
                return PodOutcome::Failed;
            }
            finished += 1;
        }
    }
    if expected > 0 && finished == expected {
        PodOutcome::Succeeded
    } else {
        PodOutcome::Running
    }
}

fn container_env_drifted(expected: &Container, actual: &Container) -> bool {
    let filter = |container: &Container| -> BTreeMap<String, Option<String>> {
        container
            .env
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|env| !INJECTED_ENV.contains(&env.name.as_str()))
            .map(|env| (env.name.clone(), env.value.clone()))
            .collect()
    };
    filter(expected) != filter(actual)
}

fn container_drifted(expected: &Container, actual: &Container) -> bool {
    if expected.name != actual.name || expected.image != actual.image {
        return true;
    }
    if container_env_drifted(expected, actual) {
        return true;
    }
    // resources only count when explicitly configured; otherwise an external
    // LimitRange fills them in
    if let Some(resources) = &expected.resources {
        if actual.resources.as_ref() != Some(resources) {
            return true;
        }
    }
    false
}

/// Drift check between a live pod and the pod the current spec would
/// produce. Only the contract fields participate: the package label,
/// container names, images, non-injected env and explicitly configured
/// resources.
pub fn pod_matches_expected(actual: &Pod, expected: &Pod) -> bool {
    if actual.labels().get(LABEL_PACKAGE) != expected.labels().get(LABEL_PACKAGE) {
        return false;
    }

    let containers = |pod: &Pod| -> Vec<Container> {
        let spec = pod.spec.clone().unwrap_or_default();
        let mut all = spec.init_containers.unwrap_or_default();
        all.extend(spec.containers);
        all
    };

    let expected_containers = containers(expected);
    let actual_containers = containers(actual);
    if expected_containers.len() != actual_containers.len() {
        return false;
    }
    expected_containers
        .iter()
        .zip(actual_containers.iter())
        .all(|(expected, actual)| !container_drifted(expected, actual))
}
