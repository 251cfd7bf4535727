use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{Result, VmssError};
use crate::vmss::MachineCoordinate;

use super::compute::COMPUTE_API_VERSION;
use super::{ArmHttp, TokenCredential};

pub const CONTAINER_SERVICE_API_VERSION: &str = "2024-02-01";

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(default, rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct ManagedCluster {
    properties: ManagedClusterProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManagedClusterProperties {
    node_resource_group: Option<String>,
}

#[derive(Deserialize)]
struct ScaleSet {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScaleSetVm {
    name: Option<String>,
    instance_id: Option<String>,
    #[serde(default)]
    properties: Option<ScaleSetVmProperties>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScaleSetVmProperties {
    os_profile: Option<OsProfile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OsProfile {
    computer_name: Option<String>,
}

impl ScaleSetVm {
    /// Kubernetes node name of the instance: its lower-cased computer name,
    /// or the VM name when the OS profile is not reported.
    fn node_name(&self) -> String {
        self.properties
            .as_ref()
            .and_then(|p| p.os_profile.as_ref())
            .and_then(|os| os.computer_name.as_deref())
            .map(str::to_lowercase)
            .or_else(|| self.name.clone())
            .unwrap_or_default()
    }
}

/// Lists the VMSS instances of an AKS cluster through ARM.
pub struct ArmInventory {
    arm: ArmHttp,
}

impl ArmInventory {
    pub fn new(credential: Arc<dyn TokenCredential>) -> Result<Self> {
        Ok(Self {
            arm: ArmHttp::new(credential)?,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.arm.set_endpoint(endpoint);
        self
    }

    /// Coordinates of every instance in every scale set of the cluster's node
    /// resource group, keyed by node name.
    pub async fn list_coordinates(
        &self,
        subscription: &str,
        resource_group: &str,
        cluster: &str,
    ) -> Result<BTreeMap<String, MachineCoordinate>> {
        let cluster_url = self.arm.url(&format!(
            "/subscriptions/{subscription}/resourceGroups/{resource_group}/providers/Microsoft.ContainerService/managedClusters/{cluster}?api-version={CONTAINER_SERVICE_API_VERSION}"
        ));
        let managed: ManagedCluster = self.arm.get_json(&cluster_url).await?;
        let node_resource_group = managed
            .properties
            .node_resource_group
            .ok_or_else(|| VmssError::Arm(format!("cluster {cluster} has no node resource group")))?
            .to_lowercase();

        let scale_sets_url = self.arm.url(&format!(
            "/subscriptions/{subscription}/resourceGroups/{node_resource_group}/providers/Microsoft.Compute/virtualMachineScaleSets?api-version={COMPUTE_API_VERSION}"
        ));
        let scale_sets: Vec<ScaleSet> = self.list_all(scale_sets_url).await?;

        let mut coordinates = BTreeMap::new();
        for scale_set in scale_sets {
            let vms_url = self.arm.url(&format!(
                "/subscriptions/{subscription}/resourceGroups/{node_resource_group}/providers/Microsoft.Compute/virtualMachineScaleSets/{}/virtualMachines?api-version={COMPUTE_API_VERSION}",
                scale_set.name
            ));
            let instances: Vec<ScaleSetVm> = self.list_all(vms_url).await?;
            tracing::debug!(vmss = %scale_set.name, count = instances.len(), "listed instances");

            for vm in instances {
                let Some(instance_id) = vm.instance_id.clone() else {
                    tracing::warn!(vm = ?vm.name, "skipping instance without instance ID");
                    continue;
                };
                let coordinate = MachineCoordinate::new(
                    subscription,
                    node_resource_group.as_str(),
                    scale_set.name.as_str(),
                    instance_id,
                )?;
                coordinates.insert(vm.node_name(), coordinate);
            }
        }
        Ok(coordinates)
    }

    /// Follow `nextLink` until the listing is exhausted.
    async fn list_all<T: DeserializeOwned>(&self, first: String) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next {
            let page: Page<T> = self.arm.get_json(&url).await?;
            items.extend(page.value);
            next = page.next_link.filter(|link| !link.is_empty());
        }
        Ok(items)
    }
}
