use crate::cluster::NodeLookup;
use crate::config::ConfigFile;
use crate::error::{Result, VmssError};
use crate::vmss::{parse_resource_id, MachineCoordinate, AZURE_PROVIDER_PREFIX};

use super::NodeTarget;

/// Turns a [`NodeTarget`] into the coordinates of its scale set instance.
pub struct NodeIdentityResolver<'a> {
    config: &'a ConfigFile,
    lookup: &'a dyn NodeLookup,
}

impl<'a> NodeIdentityResolver<'a> {
    pub fn new(config: &'a ConfigFile, lookup: &'a dyn NodeLookup) -> Self {
        Self { config, lookup }
    }

    pub async fn resolve(&self, target: &NodeTarget) -> Result<MachineCoordinate> {
        match target {
            NodeTarget::Name(name) => self.resolve_name(name).await,
            NodeTarget::ResourceId(id) => parse_resource_id(id),
            NodeTarget::ScaleSet(vm) => Ok(vm.clone()),
        }
    }

    async fn resolve_name(&self, name: &str) -> Result<MachineCoordinate> {
        // Entries may alias another node name; follow them until one carries
        // coordinates or the chain ends.
        let mut name = name.to_string();
        let mut visited: Vec<String> = Vec::new();
        while let Some(entry) = self.config.node(&name) {
            if let Some(vm) = entry.coordinate() {
                tracing::debug!(node = %name, "using VMSS information from config");
                return Ok(vm);
            }
            if let Some(id) = entry.id.as_deref().filter(|id| !id.is_empty()) {
                tracing::debug!(node = %name, "using resource ID from config");
                return parse_resource_id(id);
            }
            let alias = match entry.node.as_deref() {
                Some(alias) if !alias.is_empty() && alias != name => alias,
                _ => break,
            };
            if visited.iter().any(|seen| seen.as_str() == alias) {
                break;
            }
            tracing::debug!(node = %name, alias = %alias, "following node alias from config");
            visited.push(std::mem::replace(&mut name, alias.to_string()));
        }
        let name = name.as_str();

        let lookup_failed = |reason: String| VmssError::NodeLookupFailed {
            node: name.to_string(),
            reason,
        };

        let provider_id = match self.lookup.provider_id(name).await {
            Ok(Some(id)) => id,
            Ok(None) => return Err(lookup_failed("node has no provider ID".to_string())),
            Err(e @ VmssError::NodeLookupFailed { .. }) => return Err(e),
            Err(e) => return Err(lookup_failed(e.to_string())),
        };
        tracing::debug!(node = %name, provider_id = %provider_id, "retrieved provider ID");

        let id = provider_id.strip_prefix(AZURE_PROVIDER_PREFIX).ok_or_else(|| {
            lookup_failed(format!(
                "provider ID {provider_id:?} doesn't start with {AZURE_PROVIDER_PREFIX}"
            ))
        })?;
        parse_resource_id(id)
    }
}
