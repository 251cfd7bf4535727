//! Node selection.
//!
//! A node can be given by Kubernetes name, by resource ID, or by explicit
//! scale set coordinates. [`precedence`] merges flags, environment and config
//! into one [`NodeTarget`]; [`identity`] turns that into a
//! [`MachineCoordinate`](crate::vmss::MachineCoordinate).

pub mod flags;
pub mod identity;
pub mod precedence;

pub use flags::{env_var_name, EnvSource, NodeField, NodeFlags, ProcessEnv};
pub use identity::NodeIdentityResolver;
pub use precedence::resolve_fields;

use crate::vmss::MachineCoordinate;

/// Exactly one way of naming the target node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTarget {
    /// Kubernetes node name.
    Name(String),
    /// Full VMSS instance resource ID, not yet parsed.
    ResourceId(String),
    /// Explicit coordinates.
    ScaleSet(MachineCoordinate),
}

impl std::fmt::Display for NodeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeTarget::Name(name) => write!(f, "node {name}"),
            NodeTarget::ResourceId(id) => write!(f, "resource {id}"),
            NodeTarget::ScaleSet(vm) => write!(f, "instance {vm}"),
        }
    }
}
