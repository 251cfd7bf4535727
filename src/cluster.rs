//! Kubernetes API access: node name to Azure provider ID.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use tokio::sync::OnceCell;

use crate::error::{Result, VmssError};
use crate::vmss::{parse_resource_id, MachineCoordinate, AZURE_PROVIDER_PREFIX};

/// Resolves a Kubernetes node name to the provider ID stored on the node.
#[async_trait]
pub trait NodeLookup: Send + Sync {
    /// `Ok(None)` when the node exists but carries no provider ID.
    async fn provider_id(&self, node: &str) -> Result<Option<String>>;
}

/// [`NodeLookup`] backed by the cluster of the current kubeconfig context.
///
/// The client is created on first use, so commands that never need the
/// cluster work without a kubeconfig.
#[derive(Default)]
pub struct KubeNodeLookup {
    client: OnceCell<kube::Client>,
}

impl KubeNodeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: kube::Client) -> Self {
        Self {
            client: OnceCell::new_with(Some(client)),
        }
    }

    /// Connect using `KUBECONFIG`, `~/.kube/config` or the in-cluster environment.
    async fn client(&self) -> Result<kube::Client> {
        let client = self
            .client
            .get_or_try_init(|| async {
                kube::Client::try_default()
                    .await
                    .map_err(|e| VmssError::Config(format!("creating Kubernetes client: {e}")))
            })
            .await?;
        Ok(client.clone())
    }

    /// Coordinates of every node in the cluster, keyed by node name.
    ///
    /// Fails if any node is not an Azure VMSS instance.
    pub async fn list_coordinates(&self) -> Result<BTreeMap<String, MachineCoordinate>> {
        let api: Api<Node> = Api::all(self.client().await?);
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| VmssError::Config(format!("listing nodes: {e}")))?;

        let mut coordinates = BTreeMap::new();
        for node in nodes.items {
            let name = node.metadata.name.unwrap_or_default();
            let provider_id = node
                .spec
                .and_then(|spec| spec.provider_id)
                .unwrap_or_default();
            let id = provider_id
                .strip_prefix(AZURE_PROVIDER_PREFIX)
                .ok_or_else(|| VmssError::NodeLookupFailed {
                    node: name.clone(),
                    reason: "doesn't seem to be an Azure VMSS VM".to_string(),
                })?;
            coordinates.insert(name, parse_resource_id(id)?);
        }
        tracing::debug!(count = coordinates.len(), "listed cluster nodes");
        Ok(coordinates)
    }
}

#[async_trait]
impl NodeLookup for KubeNodeLookup {
    async fn provider_id(&self, node: &str) -> Result<Option<String>> {
        let api: Api<Node> = Api::all(self.client().await?);
        let found = api.get_opt(node).await.map_err(|e| VmssError::NodeLookupFailed {
            node: node.to_string(),
            reason: e.to_string(),
        })?;
        match found {
            Some(n) => Ok(n.spec.and_then(|spec| spec.provider_id)),
            None => Err(VmssError::NodeLookupFailed {
                node: node.to_string(),
                reason: "node not found".to_string(),
            }),
        }
    }
}
