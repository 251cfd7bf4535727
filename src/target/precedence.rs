use crate::config::ConfigFile;
use crate::error::{Result, VmssError};
use crate::vmss::MachineCoordinate;

use super::flags::{EnvSource, NodeField, NodeFlags};
use super::NodeTarget;

const SCALE_SET_FORM: &str = "VMSS instance flags";

/// Merge the three sources field by field: flag, then environment variable,
/// then the active config scope.
///
/// When the flags name the node by `--node` or `--id`, they are taken as they
/// are and neither the environment nor the config is consulted.
pub fn resolve_fields(flags: &NodeFlags, env: &dyn EnvSource, config: &ConfigFile) -> NodeFlags {
    if flags.is_set(NodeField::Node) || flags.is_set(NodeField::Id) {
        tracing::debug!("node given by flag, skipping environment and config");
        return flags.clone();
    }

    let scope = NodeFlags::from(config.active_scope());
    let mut resolved = NodeFlags::default();
    for field in NodeField::ALL {
        let value = flags
            .get(field)
            .map(str::to_string)
            .or_else(|| env.var(&field.env_var()).filter(|v| !v.is_empty()))
            .or_else(|| scope.get(field).map(str::to_string));
        resolved.set(field, value);
    }
    resolved
}

impl NodeFlags {
    /// Validate that exactly one node form is present.
    ///
    /// Any non-empty scale set field counts as that form being present, so
    /// `--node` together with `--vmss` is ambiguous rather than incomplete.
    pub fn into_target(self) -> Result<NodeTarget> {
        let scale_set_given = NodeField::SCALE_SET.iter().any(|f| self.is_set(*f));

        let mut forms = Vec::new();
        if self.is_set(NodeField::Node) {
            forms.push(NodeField::Node.flag());
        }
        if self.is_set(NodeField::Id) {
            forms.push(NodeField::Id.flag());
        }
        if scale_set_given {
            forms.push(SCALE_SET_FORM);
        }

        match forms.len() {
            0 => return Err(VmssError::MissingNodeTarget),
            1 => {}
            _ => return Err(VmssError::AmbiguousNodeTarget { forms }),
        }

        let NodeFlags {
            node,
            subscription,
            node_resource_group,
            vmss,
            instance_id,
            id,
        } = self;

        if let Some(node) = node.filter(|v| !v.is_empty()) {
            return Ok(NodeTarget::Name(node));
        }
        if let Some(id) = id.filter(|v| !v.is_empty()) {
            return Ok(NodeTarget::ResourceId(id));
        }
        let vm = MachineCoordinate::new(
            subscription.unwrap_or_default(),
            node_resource_group.unwrap_or_default(),
            vmss.unwrap_or_default(),
            instance_id.unwrap_or_default(),
        )?;
        Ok(NodeTarget::ScaleSet(vm))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn scale_set_flags() -> NodeFlags {
        NodeFlags {
            subscription: Some("sub".to_string()),
            node_resource_group: Some("rg".to_string()),
            vmss: Some("vmss".to_string()),
            instance_id: Some("0".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn nothing_given_is_missing() {
        let err = NodeFlags::default().into_target().unwrap_err();
        assert!(matches!(err, VmssError::MissingNodeTarget));
    }

    #[test]
    fn single_forms_resolve() {
        let flags = NodeFlags {
            node: Some("aks-0".to_string()),
            ..Default::default()
        };
        assert_eq!(
            flags.into_target().unwrap(),
            NodeTarget::Name("aks-0".to_string())
        );

        let target = scale_set_flags().into_target().unwrap();
        match target {
            NodeTarget::ScaleSet(vm) => assert_eq!(vm.scale_set(), "vmss"),
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn partial_scale_set_is_incomplete() {
        let flags = NodeFlags {
            subscription: Some("sub".to_string()),
            vmss: Some("vmss".to_string()),
            ..Default::default()
        };
        match flags.into_target().unwrap_err() {
            VmssError::IncompleteScaleSetCoordinates { missing } => {
                assert_eq!(missing, vec!["--node-resource-group", "--instance-id"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn two_forms_are_ambiguous() {
        let mut flags = scale_set_flags();
        flags.id = Some("/subscriptions/x".to_string());
        match flags.into_target().unwrap_err() {
            VmssError::AmbiguousNodeTarget { forms } => {
                assert_eq!(forms, vec!["--id", SCALE_SET_FORM]);
            }
            other => panic!("unexpected error {other:?}"),
        }

        let flags = NodeFlags {
            node: Some("aks-0".to_string()),
            vmss: Some("vmss".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            flags.into_target().unwrap_err(),
            VmssError::AmbiguousNodeTarget { .. }
        ));
    }

    #[test]
    fn node_flag_skips_other_sources() {
        let flags = NodeFlags {
            node: Some("aks-0".to_string()),
            ..Default::default()
        };
        let env: HashMap<String, String> =
            HashMap::from([("VMSS_EXEC_VMSS".to_string(), "from-env".to_string())]);
        let resolved = resolve_fields(&flags, &env, &ConfigFile::default());
        assert_eq!(resolved, flags);
    }
}
