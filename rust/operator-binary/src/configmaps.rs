//! Configmap reconciliation: the per-package configmaps built from inline
//! spec data, and the per-node metadata configmaps agents read.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde_json::json;
use snafu::{ResultExt, Snafu};

use crate::{
    cluster_state::SkyhookNodes,
    config::OperatorConfig,
    crd::{Package, PackageState, PackageStatus, Stage, LABEL_NAME, LABEL_NODE_META, LABEL_PACKAGE},
    dal::{self, Dal},
    pods,
    wrapper::NodeWrapper,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster api call failed"))]
    Api { source: dal::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Keys whose value differs between the stored and desired data, including
/// keys only one side has.
pub fn changed_keys(
    stored: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut keys: Vec<String> = stored
        .iter()
        .filter(|(key, value)| desired.get(*key) != Some(value))
        .map(|(key, _)| key.clone())
        .collect();
    for key in desired.keys() {
        if !stored.contains_key(key) && !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    keys.sort();
    keys
}

fn erroring_mid_config(status: &PackageStatus) -> bool {
    status.state == PackageState::Erroring
        && matches!(
            status.stage,
            Stage::Config | Stage::Interrupt | Stage::PostInterrupt
        )
}

/// A config change may only land while no node is mid-flight on the package:
/// every node must be complete for it, or erroring somewhere in the config
/// cycle.
pub fn quiescent_for_update(nodes: &[NodeWrapper], package: &Package) -> bool {
    nodes.iter().all(|node| {
        match node.package_status(&package.name, &package.version) {
            None => false,
            Some(status) => {
                (status.state == PackageState::Complete
                    && status.stage.progress()
                        >= NodeWrapper::terminal_stage(package).progress())
                    || erroring_mid_config(&status)
            }
        }
    })
}

fn desired_config_map(
    entry: &SkyhookNodes,
    package: &Package,
    data: &BTreeMap<String, String>,
    config: &OperatorConfig,
) -> ConfigMap {
    let mut config_map = ConfigMap::default();
    config_map.metadata.name = Some(pods::package_config_map_name(
        &entry.skyhook.name(),
        package,
    ));
    config_map.metadata.namespace = Some(config.namespace.clone());
    config_map.metadata.labels = Some(BTreeMap::from([
        (LABEL_NAME.to_string(), entry.skyhook.name()),
        (
            LABEL_PACKAGE.to_string(),
            format!("{}-{}", package.name, package.version),
        ),
    ]));
    config_map.metadata.owner_references =
        Some(vec![pods::owner_reference(&entry.skyhook.skyhook)]);
    config_map.data = Some(data.clone());
    config_map
}

/// Reconciles the configmaps for every package carrying inline data. Changes
/// are deferred until the package is quiescent;
/// landing one records the changed keys, resets the package to
/// `config/in_progress` on every node, and deletes erroring pods so the
/// cycle restarts cleanly.
pub async fn reconcile_package_config_maps(
    dal: &Dal,
    entry: &mut SkyhookNodes,
    config: &OperatorConfig,
) -> Result<bool> {
    let mut changed = false;
    let skyhook_name = entry.skyhook.name();

    for package in entry.skyhook.skyhook.packages() {
        let Some(desired) = package.config_map.clone() else {
            continue;
        };
        let name = pods::package_config_map_name(&skyhook_name, &package);

        let Some(stored) = dal.get_config_map(&name).await.context(ApiSnafu)? else {
            let config_map = desired_config_map(entry, &package, &desired, config);
            tracing::info!(skyhook = %skyhook_name, configmap = %name, "creating package configmap");
            dal.create_config_map(&config_map).await.context(ApiSnafu)?;
            changed = true;
            continue;
        };

        let stored_data = stored.data.clone().unwrap_or_default();
        let keys = changed_keys(&stored_data, &desired);
        if keys.is_empty() {
            continue;
        }

        if !quiescent_for_update(&entry.nodes, &package) {
            tracing::debug!(
                skyhook = %skyhook_name,
                package = %package.name,
                "deferring configmap change until the package is quiescent"
            );
            continue;
        }

        // restart the config cycle everywhere, remembering why
        entry
            .skyhook
            .set_config_updates(&package.name, keys.clone());
        for node in &mut entry.nodes {
            if let Some(status) = node.package_status(&package.name, &package.version) {
                node.set_package_status(PackageStatus {
                    stage: Stage::Config,
                    state: PackageState::InProgress,
                    ..status
                });
            }
        }

        // erroring pods hold the old config; drop them
        let package_label = format!("{}-{}", package.name, package.version);
        for pod in dal
            .list_skyhook_pods(&skyhook_name)
            .await
            .context(ApiSnafu)?
        {
            if pod.labels().get(LABEL_PACKAGE) == Some(&package_label)
                && pods::pod_outcome(&pod) == pods::PodOutcome::Failed
            {
                dal.delete_pod(&pod.name_any()).await.context(ApiSnafu)?;
            }
        }

        // write the new data, explicitly nulling removed keys
        let mut patch_data = serde_json::Map::new();
        for key in stored_data.keys() {
            if !desired.contains_key(key) {
                patch_data.insert(key.clone(), serde_json::Value::Null);
            }
        }
        for (key, value) in &desired {
            patch_data.insert(key.clone(), json!(value));
        }
        dal.patch_config_map(&name, &json!({ "data": patch_data }))
            .await
            .context(ApiSnafu)?;

        tracing::info!(
            skyhook = %skyhook_name,
            package = %package.name,
            changed = ?keys,
            "applied configmap change"
        );
        changed = true;
    }

    Ok(changed)
}

fn agent_version(config: &OperatorConfig) -> String {
    config
        .agent_image
        .rsplit_once(':')
        .map(|(_, tag)| tag.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn node_metadata_data(
    entry: &SkyhookNodes,
    node: &NodeWrapper,
    config: &OperatorConfig,
) -> BTreeMap<String, String> {
    let packages: Vec<serde_json::Value> = entry
        .skyhook
        .skyhook
        .packages()
        .iter()
        .map(|package| {
            json!({
                "name": package.name,
                "version": package.version,
                "image": package.tagged_image(),
            })
        })
        .collect();

    BTreeMap::from([
        (
            "labels.json".to_string(),
            serde_json::to_string(node.node.labels()).expect("labels serialize"),
        ),
        (
            "annotations.json".to_string(),
            serde_json::to_string(node.node.annotations()).expect("annotations serialize"),
        ),
        (
            "packages.json".to_string(),
            serde_json::to_string(&json!({
                "agentVersion": agent_version(config),
                "packages": packages,
            }))
            .expect("package list serializes"),
        ),
    ])
}

/// Upserts the `<skyhook>-<node>-metadata` configmap for every selected node
/// and garbage-collects the ones whose node left the selection.
pub async fn reconcile_node_metadata(
    dal: &Dal,
    entry: &SkyhookNodes,
    config: &OperatorConfig,
) -> Result<()> {
    let skyhook_name = entry.skyhook.name();

    for node in &entry.nodes {
        let name = pods::node_metadata_config_map_name(&skyhook_name, &node.name());
        let data = node_metadata_data(entry, node, config);

        match dal.get_config_map(&name).await.context(ApiSnafu)? {
            None => {
                let mut config_map = ConfigMap::default();
                config_map.metadata.name = Some(name.clone());
                config_map.metadata.namespace = Some(config.namespace.clone());
                config_map.metadata.labels = Some(BTreeMap::from([
                    (LABEL_NAME.to_string(), skyhook_name.clone()),
                    (LABEL_NODE_META.to_string(), "true".to_string()),
                ]));
                config_map.metadata.owner_references =
                    Some(vec![pods::owner_reference(&entry.skyhook.skyhook)]);
                config_map.data = Some(data);
                dal.create_config_map(&config_map).await.context(ApiSnafu)?;
            }
            Some(stored) => {
                if stored.data.as_ref() != Some(&data) {
                    dal.patch_config_map(&name, &json!({ "data": data }))
                        .await
                        .context(ApiSnafu)?;
                }
            }
        }
    }

    // orphans: metadata configmaps for nodes no longer selected
    let selector = format!("{LABEL_NODE_META}=true,{LABEL_NAME}={skyhook_name}");
    for stored in dal.list_config_maps(&selector).await.context(ApiSnafu)? {
        let expected = entry.nodes.iter().any(|node| {
            stored.name_any() == pods::node_metadata_config_map_name(&skyhook_name, &node.name())
        });
        if !expected {
            tracing::info!(configmap = %stored.name_any(), "removing orphaned node metadata");
            dal.delete_config_map(&stored.name_any())
                .await
                .context(ApiSnafu)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Node;

    use super::*;
    use crate::crd::Interrupt;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_changed_keys() {
        let stored = map(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let desired = map(&[("a", "1"), ("b", "changed"), ("d", "new")]);
        assert_eq!(changed_keys(&stored, &desired), vec!["b", "c", "d"]);
        assert!(changed_keys(&stored, &stored).is_empty());
    }

    fn package(interrupt: bool) -> Package {
        Package {
            name: "pkg".to_string(),
            version: "1.0.0".to_string(),
            image: "example/pkg".to_string(),
            interrupt: interrupt.then(|| Interrupt {
                kind: crate::crd::InterruptType::Reboot,
                services: None,
            }),
            ..Package::default()
        }
    }

    fn node_with(stage: Stage, state: PackageState) -> NodeWrapper {
        let mut inner = Node::default();
        inner.metadata.name = Some("node-1".to_string());
        let mut node = NodeWrapper::new(inner, "test");
        node.set_package_status(PackageStatus {
            name: "pkg".to_string(),
            version: "1.0.0".to_string(),
            image: "example/pkg:1.0.0".to_string(),
            stage,
            state,
            restarts: 0,
        });
        node
    }

    #[test]
    fn test_quiescent_when_all_nodes_complete() {
        let nodes = vec![node_with(Stage::Config, PackageState::Complete)];
        assert!(quiescent_for_update(&nodes, &package(false)));
    }

    #[test]
    fn test_quiescent_with_erroring_config_cycle() {
        let nodes = vec![
            node_with(Stage::Config, PackageState::Complete),
            node_with(Stage::Interrupt, PackageState::Erroring),
        ];
        assert!(quiescent_for_update(&nodes, &package(false)));
    }

    #[test]
    fn test_not_quiescent_while_in_progress() {
        let nodes = vec![node_with(Stage::Config, PackageState::InProgress)];
        assert!(!quiescent_for_update(&nodes, &package(false)));
    }

    #[test]
    fn test_not_quiescent_while_erroring_at_apply() {
        let nodes = vec![node_with(Stage::Apply, PackageState::Erroring)];
        assert!(!quiescent_for_update(&nodes, &package(false)));
    }

    #[test]
    fn test_not_quiescent_while_upgrade_complete_only() {
        // upgrade carries apply-level progress, short of the config terminal
        let nodes = vec![node_with(Stage::Upgrade, PackageState::Complete)];
        assert!(!quiescent_for_update(&nodes, &package(false)));
    }

    #[test]
    fn test_not_quiescent_before_terminal_stage_with_interrupt() {
        // complete at config, but the package has an interrupt so the cycle
        // is not done
        let nodes = vec![node_with(Stage::Config, PackageState::Complete)];
        assert!(!quiescent_for_update(&nodes, &package(true)));
    }

    #[test]
    fn test_fresh_node_defers_update() {
        let mut inner = Node::default();
        inner.metadata.name = Some("fresh".to_string());
        let nodes = vec![NodeWrapper::new(inner, "test")];
        assert!(!quiescent_for_update(&nodes, &package(false)));
    }
}
