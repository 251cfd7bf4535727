use serde::Serialize;

use crate::error::{Result, VmssError};

/// Provider segment used when rendering a coordinate back into a resource ID.
const COMPUTE_PROVIDER: &str = "Microsoft.Compute";

/// Location of a single VM scale set instance.
///
/// All four fields are non-empty; the constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineCoordinate {
    subscription_id: String,
    resource_group: String,
    scale_set: String,
    instance_id: String,
}

impl MachineCoordinate {
    /// Build a coordinate from its four parts. Fails if any part is empty.
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        scale_set: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Result<Self> {
        let coordinate = Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            scale_set: scale_set.into(),
            instance_id: instance_id.into(),
        };

        let missing: Vec<&'static str> = [
            ("--subscription", &coordinate.subscription_id),
            ("--node-resource-group", &coordinate.resource_group),
            ("--vmss", &coordinate.scale_set),
            ("--instance-id", &coordinate.instance_id),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(flag, _)| flag)
        .collect();

        if !missing.is_empty() {
            return Err(VmssError::IncompleteScaleSetCoordinates { missing });
        }
        Ok(coordinate)
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn scale_set(&self) -> &str {
        &self.scale_set
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Canonical resource ID of this instance.
    pub fn to_resource_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/virtualMachineScaleSets/{}/virtualMachines/{}",
            self.subscription_id,
            self.resource_group,
            COMPUTE_PROVIDER,
            self.scale_set,
            self.instance_id
        )
    }
}

impl std::fmt::Display for MachineCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_resource_id())
    }
}

impl std::str::FromStr for MachineCoordinate {
    type Err = VmssError;

    fn from_str(s: &str) -> Result<Self> {
        parse_resource_id(s)
    }
}

/// Parse a VMSS instance resource ID of the form
/// `/subscriptions/<sub>/resourceGroups/<rg>/providers/<provider>/virtualMachineScaleSets/<vmss>/virtualMachines/<instance>`.
///
/// Matching is case-insensitive; the returned fields are lower-cased.
pub fn parse_resource_id(id: &str) -> Result<MachineCoordinate> {
    const KEYWORDS: [&str; 5] = [
        "subscriptions",
        "resourcegroups",
        "providers",
        "virtualmachinescalesets",
        "virtualmachines",
    ];

    let malformed = || VmssError::MalformedResourceId(id.to_string());

    let lowered = id.trim().to_lowercase();
    let rest = lowered.strip_prefix('/').ok_or_else(malformed)?;
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.len() != KEYWORDS.len() * 2 {
        return Err(malformed());
    }

    let mut values = Vec::with_capacity(KEYWORDS.len());
    for (pair, keyword) in segments.chunks(2).zip(KEYWORDS) {
        let (key, value) = (pair[0], pair[1]);
        if key != keyword || value.is_empty() {
            return Err(malformed());
        }
        values.push(value);
    }

    // values[2] is the provider, which is not part of the coordinate.
    MachineCoordinate::new(values[0], values[1], values[3], values[4]).map_err(|_| malformed())
}
