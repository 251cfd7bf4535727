use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmssError {
    #[error("malformed resource ID {0:?}: expected /subscriptions/<sub>/resourceGroups/<rg>/providers/<provider>/virtualMachineScaleSets/<vmss>/virtualMachines/<instance>")]
    MalformedResourceId(String),

    #[error("no node specified: use --node, --id or the VMSS instance flags (--subscription, --node-resource-group, --vmss and --instance-id)")]
    MissingNodeTarget,

    #[error("incomplete VMSS instance information, missing: {}", .missing.join(", "))]
    IncompleteScaleSetCoordinates { missing: Vec<&'static str> },

    #[error("node specified more than once, use only one of: {}", .forms.join(", "))]
    AmbiguousNodeTarget { forms: Vec<&'static str> },

    #[error("retrieving Azure resource ID of node {node}: {reason}")]
    NodeLookupFailed { node: String, reason: String },

    #[error("begin running command: {0}")]
    SubmissionFailed(String),

    #[error("polling command response: {0}")]
    PollingFailed(String),

    #[error("couldn't parse response message:\n{0}")]
    UnparseableResponse(String),

    #[error("command execution didn't succeed:\n{0}")]
    RemoteCommandFailed(String),

    #[error("waiting for the command was canceled")]
    Canceled,

    #[error("authenticating: {0}")]
    Credential(String),

    #[error("Azure API: {0}")]
    Arm(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VmssError {
    /// Process exit code used by the CLI when this error ends the invocation.
    pub fn exit_code(&self) -> i32 {
        match self {
            VmssError::MalformedResourceId(_)
            | VmssError::MissingNodeTarget
            | VmssError::IncompleteScaleSetCoordinates { .. }
            | VmssError::AmbiguousNodeTarget { .. } => 2,
            VmssError::NodeLookupFailed { .. } => 3,
            VmssError::Credential(_) => 4,
            VmssError::SubmissionFailed(_) | VmssError::PollingFailed(_) | VmssError::Arm(_) => 5,
            VmssError::UnparseableResponse(_) | VmssError::RemoteCommandFailed(_) => 6,
            VmssError::Canceled => 130,
            VmssError::Config(_)
            | VmssError::Io(_)
            | VmssError::Yaml(_)
            | VmssError::Json(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, VmssError>;
