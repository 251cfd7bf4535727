use std::collections::HashMap;

use crate::config::NodeEntry;

/// Prefix for environment variables that mirror node flags.
pub const ENV_PREFIX: &str = "VMSS_EXEC_";

/// One of the six node-selection flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeField {
    Node,
    Subscription,
    NodeResourceGroup,
    Vmss,
    InstanceId,
    Id,
}

impl NodeField {
    pub const ALL: [NodeField; 6] = [
        NodeField::Node,
        NodeField::Subscription,
        NodeField::NodeResourceGroup,
        NodeField::Vmss,
        NodeField::InstanceId,
        NodeField::Id,
    ];

    /// The four fields that together address a scale set instance.
    pub const SCALE_SET: [NodeField; 4] = [
        NodeField::Subscription,
        NodeField::NodeResourceGroup,
        NodeField::Vmss,
        NodeField::InstanceId,
    ];

    /// Flag name without dashes, also the config key.
    pub fn name(self) -> &'static str {
        match self {
            NodeField::Node => "node",
            NodeField::Subscription => "subscription",
            NodeField::NodeResourceGroup => "node-resource-group",
            NodeField::Vmss => "vmss",
            NodeField::InstanceId => "instance-id",
            NodeField::Id => "id",
        }
    }

    pub fn flag(self) -> &'static str {
        match self {
            NodeField::Node => "--node",
            NodeField::Subscription => "--subscription",
            NodeField::NodeResourceGroup => "--node-resource-group",
            NodeField::Vmss => "--vmss",
            NodeField::InstanceId => "--instance-id",
            NodeField::Id => "--id",
        }
    }

    pub fn env_var(self) -> String {
        env_var_name(self.name())
    }
}

/// `node-resource-group` -> `VMSS_EXEC_NODE_RESOURCE_GROUP`.
pub fn env_var_name(flag: &str) -> String {
    let suffix: String = flag
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{ENV_PREFIX}{suffix}")
}

/// Raw node-selection values from one source. Empty strings count as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFlags {
    pub node: Option<String>,
    pub subscription: Option<String>,
    pub node_resource_group: Option<String>,
    pub vmss: Option<String>,
    pub instance_id: Option<String>,
    pub id: Option<String>,
}

impl NodeFlags {
    pub fn get(&self, field: NodeField) -> Option<&str> {
        let value = match field {
            NodeField::Node => &self.node,
            NodeField::Subscription => &self.subscription,
            NodeField::NodeResourceGroup => &self.node_resource_group,
            NodeField::Vmss => &self.vmss,
            NodeField::InstanceId => &self.instance_id,
            NodeField::Id => &self.id,
        };
        value.as_deref().filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, field: NodeField, value: Option<String>) {
        let slot = match field {
            NodeField::Node => &mut self.node,
            NodeField::Subscription => &mut self.subscription,
            NodeField::NodeResourceGroup => &mut self.node_resource_group,
            NodeField::Vmss => &mut self.vmss,
            NodeField::InstanceId => &mut self.instance_id,
            NodeField::Id => &mut self.id,
        };
        *slot = value.filter(|v| !v.is_empty());
    }

    pub fn is_set(&self, field: NodeField) -> bool {
        self.get(field).is_some()
    }
}

impl From<&NodeEntry> for NodeFlags {
    fn from(entry: &NodeEntry) -> Self {
        NodeFlags {
            node: entry.node.clone(),
            subscription: entry.subscription.clone(),
            node_resource_group: entry.node_resource_group.clone(),
            vmss: entry.vmss.clone(),
            instance_id: entry.instance_id.clone(),
            id: entry.id.clone(),
        }
    }
}

/// Source of environment variables, so resolution can be tested without
/// touching the process environment.
pub trait EnvSource {
    fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}
