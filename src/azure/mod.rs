//! Azure Resource Manager access: credentials, the VMSS runCommand operation
//! and the cluster inventory used by `config import`.

pub mod compute;
pub mod credential;
pub mod device_code;
pub mod inventory;

use std::sync::Arc;

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::error::{Result, VmssError};

pub use compute::{
    ArmComputeClient, ComputeClient, InstanceViewStatus, PollStatus, RunCommandInput,
    RunCommandPoller, RunCommandResponse,
};
pub use credential::{AccessToken, AzureCliCredential, ChainedCredential, TokenCredential};
pub use device_code::DeviceCodeCredential;
pub use inventory::ArmInventory;

pub const ARM_ENDPOINT: &str = "https://management.azure.com";

const CLIENT_REQUEST_ID: &str = "x-ms-client-request-id";

/// Authenticated HTTP access to an ARM endpoint.
#[derive(Clone)]
pub(crate) struct ArmHttp {
    http: reqwest::Client,
    endpoint: String,
    credential: Arc<dyn TokenCredential>,
}

impl ArmHttp {
    pub(crate) fn new(credential: Arc<dyn TokenCredential>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("vmss-exec/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VmssError::Arm(format!("creating HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: ARM_ENDPOINT.to_string(),
            credential,
        })
    }

    pub(crate) fn set_endpoint(&mut self, endpoint: impl Into<String>) {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
    }

    /// Absolute URL for a path starting with `/subscriptions/...`.
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// Request to an absolute URL, with bearer token and a fresh client request ID.
    pub(crate) async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.credential.token().await?;
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(%method, url, request_id = %request_id, "ARM request");
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token.token)
            .header(CLIENT_REQUEST_ID, request_id))
    }

    /// GET an absolute URL and decode a successful JSON body.
    pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .request(Method::GET, url)
            .await?
            .send()
            .await
            .map_err(|e| VmssError::Arm(format!("GET {url}: {e}")))?;
        let response = ensure_success(response).await?;
        response
            .json()
            .await
            .map_err(|e| VmssError::Arm(format!("decoding response of {url}: {e}")))
    }
}

/// Turn a non-2xx response into an error carrying the status and body.
pub(crate) async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(VmssError::Arm(format!("{url} returned {status}: {body}")))
}
