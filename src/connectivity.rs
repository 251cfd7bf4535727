//! Node to API server connectivity check.

use crate::error::{Result, VmssError};
use crate::runcmd::{OutputTruncate, RemoteCommandExecutor, RunCommandRequest};
use crate::vmss::MachineCoordinate;

/// `kubectl version` contacts the API server; only its return value is kept.
pub const CONNECTIVITY_COMMAND: &str =
    "kubectl --kubeconfig /var/lib/kubelet/kubeconfig version > /dev/null; echo $?";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityReport {
    /// Return value of `kubectl version` on the node.
    pub return_value: i32,
    pub stderr: String,
}

impl ConnectivityReport {
    pub fn succeeded(&self) -> bool {
        self.return_value == 0
    }

    pub fn summary(&self) -> String {
        if self.succeeded() {
            "Connectivity check: succeeded".to_string()
        } else {
            format!(
                "Connectivity check: failed with returned value {}: {}",
                self.return_value, self.stderr
            )
        }
    }
}

pub async fn check_apiserver_connectivity(
    executor: &RemoteCommandExecutor<'_>,
    vm: MachineCoordinate,
) -> Result<ConnectivityReport> {
    let request =
        RunCommandRequest::new(vm, CONNECTIVITY_COMMAND).with_truncate(OutputTruncate::Tail);
    let result = executor.run(&request).await?;

    let return_value = result.stdout.trim().parse::<i32>().map_err(|_| {
        VmssError::UnparseableResponse(format!(
            "[stdout]\n{}\n[stderr]\n{}",
            result.stdout, result.stderr
        ))
    })?;
    tracing::debug!(return_value, "connectivity check finished");

    Ok(ConnectivityReport {
        return_value,
        stderr: result.stderr,
    })
}
