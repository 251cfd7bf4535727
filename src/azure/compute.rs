use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VmssError};
use crate::vmss::MachineCoordinate;

use super::{ensure_success, ArmHttp, TokenCredential};

pub const COMPUTE_API_VERSION: &str = "2023-09-01";

/// Command ID for running a Linux shell script.
pub const RUN_SHELL_SCRIPT: &str = "RunShellScript";

const ASYNC_OPERATION: &str = "azure-asyncoperation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCommandInput {
    pub command_id: String,
    pub script: Vec<String>,
}

impl RunCommandInput {
    pub fn shell_script(script: impl Into<String>) -> Self {
        Self {
            command_id: RUN_SHELL_SCRIPT.to_string(),
            script: vec![script.into()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceViewStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

/// Final payload of a runCommand operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandResponse {
    #[serde(default)]
    pub value: Vec<InstanceViewStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    InProgress,
    Done(RunCommandResponse),
}

/// Handle on a submitted runCommand operation.
#[async_trait]
pub trait RunCommandPoller: Send {
    /// Query the operation once.
    async fn poll(&mut self) -> Result<PollStatus>;
}

/// Compute control plane: accepts a runCommand submission.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn begin_run_command(
        &self,
        vm: &MachineCoordinate,
        input: &RunCommandInput,
    ) -> Result<Box<dyn RunCommandPoller>>;
}

/// [`ComputeClient`] talking to the ARM REST API.
#[derive(Clone)]
pub struct ArmComputeClient {
    arm: ArmHttp,
}

impl ArmComputeClient {
    pub fn new(credential: Arc<dyn TokenCredential>) -> Result<Self> {
        Ok(Self {
            arm: ArmHttp::new(credential)?,
        })
    }

    /// Point at another ARM endpoint (sovereign clouds, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.arm.set_endpoint(endpoint);
        self
    }

    fn run_command_url(&self, vm: &MachineCoordinate) -> String {
        self.arm.url(&format!(
            "{}/runCommand?api-version={COMPUTE_API_VERSION}",
            vm.to_resource_id()
        ))
    }
}

#[async_trait]
impl ComputeClient for ArmComputeClient {
    async fn begin_run_command(
        &self,
        vm: &MachineCoordinate,
        input: &RunCommandInput,
    ) -> Result<Box<dyn RunCommandPoller>> {
        let url = self.run_command_url(vm);
        let response = self
            .arm
            .request(Method::POST, &url)
            .await?
            .json(input)
            .send()
            .await
            .map_err(|e| VmssError::SubmissionFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VmssError::SubmissionFailed(format!("{status}: {body}")));
        }

        let operation = if status == StatusCode::OK {
            let result: RunCommandResponse = response
                .json()
                .await
                .map_err(|e| VmssError::SubmissionFailed(format!("decoding response: {e}")))?;
            Operation::Completed(Some(result))
        } else {
            Operation::from_headers(response.headers())?
        };

        tracing::debug!(vm = %vm, status = %status, "runCommand accepted");
        Ok(Box::new(ArmOperationPoller {
            arm: self.arm.clone(),
            operation,
        }))
    }
}

enum Operation {
    Completed(Option<RunCommandResponse>),
    /// `Azure-AsyncOperation` status URL, plus the `Location` URL holding the
    /// result once the operation succeeded.
    AsyncOperation { status_url: String, location: Option<String> },
    /// Only a `Location` URL: 202 while running, 200 with the result when done.
    Location(String),
}

impl Operation {
    fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let location = header(LOCATION.as_str());
        match (header(ASYNC_OPERATION), location) {
            (Some(status_url), location) => Ok(Operation::AsyncOperation {
                status_url,
                location,
            }),
            (None, Some(location)) => Ok(Operation::Location(location)),
            (None, None) => Err(VmssError::SubmissionFailed(
                "accepted operation has neither Azure-AsyncOperation nor Location header"
                    .to_string(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct OperationStatus {
    status: String,
    #[serde(default)]
    properties: Option<OperationProperties>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct OperationProperties {
    #[serde(default)]
    output: Option<RunCommandResponse>,
}

struct ArmOperationPoller {
    arm: ArmHttp,
    operation: Operation,
}

impl ArmOperationPoller {
    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .arm
            .request(Method::GET, url)
            .await?
            .send()
            .await
            .map_err(|e| VmssError::PollingFailed(e.to_string()))?;
        ensure_success(response)
            .await
            .map_err(|e| VmssError::PollingFailed(e.to_string()))
    }

    async fn fetch_result(&self, url: &str) -> Result<RunCommandResponse> {
        self.get(url)
            .await?
            .json()
            .await
            .map_err(|e| VmssError::PollingFailed(format!("decoding result: {e}")))
    }

    /// Poll a `Location` URL: 202 while running, 200 with the result.
    async fn poll_location(&self, url: &str) -> Result<PollStatus> {
        let response = self.get(url).await?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(PollStatus::InProgress);
        }
        let result = response
            .json()
            .await
            .map_err(|e| VmssError::PollingFailed(format!("decoding result: {e}")))?;
        Ok(PollStatus::Done(result))
    }

    async fn poll_async_operation(
        &self,
        status_url: &str,
        location: Option<&str>,
    ) -> Result<PollStatus> {
        let status: OperationStatus = self
            .get(status_url)
            .await?
            .json()
            .await
            .map_err(|e| VmssError::PollingFailed(format!("decoding status: {e}")))?;

        tracing::debug!(status = %status.status, "runCommand operation status");
        match status.status.to_ascii_lowercase().as_str() {
            "succeeded" => {
                if let Some(output) = status.properties.and_then(|p| p.output) {
                    return Ok(PollStatus::Done(output));
                }
                match location {
                    Some(url) => Ok(PollStatus::Done(self.fetch_result(url).await?)),
                    None => Ok(PollStatus::Done(RunCommandResponse::default())),
                }
            }
            "failed" | "canceled" | "cancelled" => {
                let detail = status.error.map(|e| e.to_string()).unwrap_or_default();
                Err(VmssError::PollingFailed(format!(
                    "operation {}: {detail}",
                    status.status
                )))
            }
            _ => Ok(PollStatus::InProgress),
        }
    }
}

#[async_trait]
impl RunCommandPoller for ArmOperationPoller {
    async fn poll(&mut self) -> Result<PollStatus> {
        let (status_url, location) = match &mut self.operation {
            Operation::Completed(result) => {
                return Ok(PollStatus::Done(result.take().unwrap_or_default()))
            }
            Operation::Location(url) => (None, Some(url.clone())),
            Operation::AsyncOperation {
                status_url,
                location,
            } => (Some(status_url.clone()), location.clone()),
        };

        match (status_url, location) {
            (Some(status_url), location) => {
                self.poll_async_operation(&status_url, location.as_deref())
                    .await
            }
            (None, Some(location)) => self.poll_location(&location).await,
            (None, None) => Err(VmssError::PollingFailed(
                "operation has no status URL".to_string(),
            )),
        }
    }
}
