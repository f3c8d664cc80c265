//! Thin typed adapter over the cluster API. Every mutation the reconciler
//! performs goes through here, so call sites stay free of `Api` plumbing.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::{
    api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use snafu::{ResultExt, Snafu};

use crate::crd::{deployment_policy::DeploymentPolicy, Skyhook, LABEL_NAME};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{verb} {what} failed"))]
    Api {
        verb: &'static str,
        what: String,
        source: kube::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone)]
pub struct Dal {
    client: Client,
    namespace: String,
}

impl Dal {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Dal {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn skyhooks(&self) -> Api<Skyhook> {
        Api::all(self.client.clone())
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn policies(&self) -> Api<DeploymentPolicy> {
        Api::all(self.client.clone())
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub async fn list_skyhooks(&self) -> Result<Vec<Skyhook>> {
        let list = self
            .skyhooks()
            .list(&ListParams::default())
            .await
            .context(ApiSnafu {
                verb: "list",
                what: "skyhooks".to_string(),
            })?;
        Ok(list.items)
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let list = self
            .nodes()
            .list(&ListParams::default())
            .await
            .context(ApiSnafu {
                verb: "list",
                what: "nodes".to_string(),
            })?;
        Ok(list.items)
    }

    pub async fn get_deployment_policy(&self, name: &str) -> Result<Option<DeploymentPolicy>> {
        self.policies()
            .get_opt(name)
            .await
            .context(ApiSnafu {
                verb: "get",
                what: format!("deploymentpolicy {name}"),
            })
    }

    /// Pods created for one Skyhook, across all of its packages and nodes.
    pub async fn list_skyhook_pods(&self, skyhook: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&format!("{LABEL_NAME}={skyhook}"));
        let list = self.pods().list(&params).await.context(ApiSnafu {
            verb: "list",
            what: format!("pods of skyhook {skyhook}"),
        })?;
        Ok(list.items)
    }

    /// Every pod scheduled to a node, across all namespaces. Used by the
    /// drain gate.
    pub async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = Api::<Pod>::all(self.client.clone())
            .list(&params)
            .await
            .context(ApiSnafu {
                verb: "list",
                what: format!("pods on node {node}"),
            })?;
        Ok(list.items)
    }

    pub async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        self.pods()
            .create(&PostParams::default(), pod)
            .await
            .context(ApiSnafu {
                verb: "create",
                what: format!("pod {}", pod.name_any()),
            })
    }

    pub async fn delete_pod(&self, name: &str) -> Result<()> {
        self.pods()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .or_else(ignore_not_found)
            .context(ApiSnafu {
                verb: "delete",
                what: format!("pod {name}"),
            })
    }

    /// Evicts through the eviction subresource so pod disruption budgets are
    /// honored.
    pub async fn evict_pod(&self, name: &str, namespace: &str) -> Result<()> {
        Api::<Pod>::namespaced(self.client.clone(), namespace)
            .evict(name, &EvictParams::default())
            .await
            .map(|_| ())
            .or_else(ignore_not_found)
            .context(ApiSnafu {
                verb: "evict",
                what: format!("pod {namespace}/{name}"),
            })
    }

    pub async fn annotate_pod(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let patch = serde_json::json!({ "metadata": { "annotations": { key: value } } });
        self.pods()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .context(ApiSnafu {
                verb: "patch",
                what: format!("pod {name}"),
            })
    }

    pub async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>> {
        self.config_maps().get_opt(name).await.context(ApiSnafu {
            verb: "get",
            what: format!("configmap {name}"),
        })
    }

    pub async fn list_config_maps(&self, label_selector: &str) -> Result<Vec<ConfigMap>> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .config_maps()
            .list(&params)
            .await
            .context(ApiSnafu {
                verb: "list",
                what: format!("configmaps {label_selector}"),
            })?;
        Ok(list.items)
    }

    pub async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        self.config_maps()
            .create(&PostParams::default(), config_map)
            .await
            .map(|_| ())
            .context(ApiSnafu {
                verb: "create",
                what: format!("configmap {}", config_map.name_any()),
            })
    }

    pub async fn patch_config_map(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        self.config_maps()
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .context(ApiSnafu {
                verb: "patch",
                what: format!("configmap {name}"),
            })
    }

    pub async fn delete_config_map(&self, name: &str) -> Result<()> {
        self.config_maps()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .or_else(ignore_not_found)
            .context(ApiSnafu {
                verb: "delete",
                what: format!("configmap {name}"),
            })
    }

    pub async fn patch_node(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .context(ApiSnafu {
                verb: "patch",
                what: format!("node {name}"),
            })
    }

    pub async fn patch_skyhook(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        self.skyhooks()
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .context(ApiSnafu {
                verb: "patch",
                what: format!("skyhook {name}"),
            })
    }

    pub async fn patch_skyhook_status(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        self.skyhooks()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .context(ApiSnafu {
                verb: "patch status of",
                what: format!("skyhook {name}"),
            })
    }
}

fn ignore_not_found(err: kube::Error) -> std::result::Result<(), kube::Error> {
    match err {
        kube::Error::Api(ref response) if response.code == 404 => Ok(()),
        other => Err(other),
    }
}

/// Indexes pods by the node they are scheduled to. Unscheduled pods are
/// dropped.
pub fn pods_by_node(pods: &[Pod]) -> HashMap<&str, Vec<&Pod>> {
    let mut index: HashMap<&str, Vec<&Pod>> = HashMap::new();
    for pod in pods {
        if let Some(node) = pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) {
            index.entry(node).or_default().push(pod);
        }
    }
    index
}
