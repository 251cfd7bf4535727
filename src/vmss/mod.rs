//! VM scale set instance addressing.
//!
//! A Kubernetes node on AKS is a VMSS instance; [`MachineCoordinate`] is the
//! (subscription, resource group, scale set, instance) tuple the compute API
//! needs to reach it.

pub mod coordinate;

pub use coordinate::{parse_resource_id, MachineCoordinate};

/// Prefix of the provider ID Kubernetes stores on Azure nodes.
pub const AZURE_PROVIDER_PREFIX: &str = "azure://";
