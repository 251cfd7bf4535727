use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{config_dir, write_private_file};
use crate::error::{Result, VmssError};

use super::credential::{AccessToken, TokenCredential};

pub const AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const TOKEN_CACHE_FILENAME: &str = "token-cache.json";

/// Multi-tenant sign-in for work and school accounts.
const TENANT: &str = "organizations";
/// Public client ID of the Azure CLI.
const CLIENT_ID: &str = "04b07795-8ddb-461a-bbee-02f9e1bf7b46";
const SCOPE: &str = "https://management.azure.com/.default offline_access";
const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_on: DateTime<Utc>,
}

impl CachedToken {
    fn access(&self) -> AccessToken {
        AccessToken {
            token: self.access_token.clone(),
            expires_on: self.expires_on,
        }
    }
}

#[derive(Deserialize)]
struct DeviceCode {
    device_code: String,
    message: String,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

impl TokenResponse {
    /// Refresh tokens are not always rotated; keep the previous one then.
    fn into_cached(self, previous_refresh: Option<&str>) -> CachedToken {
        CachedToken {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_on: Utc::now() + Duration::seconds(self.expires_in),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: String,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.error_description)
    }
}

/// Interactive sign-in through the OAuth device code flow, for users without
/// an Azure CLI session.
///
/// The token and its refresh token are cached in `~/.vmss-exec/token-cache.json`
/// so the user signs in once; later runs refresh silently.
pub struct DeviceCodeCredential {
    http: reqwest::Client,
    authority: String,
    cache_path: PathBuf,
    cached: Mutex<Option<CachedToken>>,
}

impl DeviceCodeCredential {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("vmss-exec/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VmssError::Credential(format!("creating HTTP client: {e}")))?;
        Ok(Self {
            http,
            authority: AUTHORITY_HOST.to_string(),
            cache_path: config_dir().join(TOKEN_CACHE_FILENAME),
            cached: Mutex::new(None),
        })
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = path.into();
        self
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    fn endpoint(&self, leaf: &str) -> String {
        format!("{}/{TENANT}/oauth2/v2.0/{leaf}", self.authority)
    }

    fn load_cache(&self) -> Option<CachedToken> {
        let bytes = match fs::read(&self.cache_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.cache_path.display(), error = %e, "could not read token cache");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(path = %self.cache_path.display(), error = %e, "ignoring unreadable token cache");
                None
            }
        }
    }

    fn store_cache(&self, token: &CachedToken) -> Result<()> {
        let body = serde_json::to_vec_pretty(token)?;
        write_private_file(&self.cache_path, &body)
    }

    /// POST a grant to the token endpoint. OAuth errors come back as the inner
    /// `Err` so callers can react to `authorization_pending`.
    async fn post_token(
        &self,
        form: &[(&str, &str)],
    ) -> Result<std::result::Result<TokenResponse, TokenError>> {
        let response = self
            .http
            .post(self.endpoint("token"))
            .form(form)
            .send()
            .await
            .map_err(|e| VmssError::Credential(format!("requesting token: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let token = response
                .json()
                .await
                .map_err(|e| VmssError::Credential(format!("decoding token: {e}")))?;
            return Ok(Ok(token));
        }
        let body = response.text().await.unwrap_or_default();
        serde_json::from_str::<TokenError>(&body)
            .map(Err)
            .map_err(|_| VmssError::Credential(format!("token endpoint returned {status}: {body}")))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<CachedToken> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", CLIENT_ID),
            ("scope", SCOPE),
            ("refresh_token", refresh_token),
        ];
        match self.post_token(&form).await? {
            Ok(token) => Ok(token.into_cached(Some(refresh_token))),
            Err(e) => Err(VmssError::Credential(format!("refreshing token: {e}"))),
        }
    }

    async fn sign_in(&self) -> Result<CachedToken> {
        let code: DeviceCode = self
            .http
            .post(self.endpoint("devicecode"))
            .form(&[("client_id", CLIENT_ID), ("scope", SCOPE)])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| VmssError::Credential(format!("requesting device code: {e}")))?
            .json()
            .await
            .map_err(|e| VmssError::Credential(format!("decoding device code: {e}")))?;

        eprintln!("{}", code.message);

        let deadline = Instant::now() + StdDuration::from_secs(code.expires_in);
        let mut interval = StdDuration::from_secs(code.interval);
        let form = [
            ("grant_type", DEVICE_CODE_GRANT),
            ("client_id", CLIENT_ID),
            ("device_code", code.device_code.as_str()),
        ];
        loop {
            match self.post_token(&form).await? {
                Ok(token) => return Ok(token.into_cached(None)),
                Err(e) if e.error == "authorization_pending" => {}
                Err(e) if e.error == "slow_down" => interval += StdDuration::from_secs(5),
                Err(e) => {
                    return Err(VmssError::Credential(format!("device code sign-in failed: {e}")))
                }
            }
            if Instant::now() + interval >= deadline {
                return Err(VmssError::Credential(
                    "device code expired before sign-in completed".to_string(),
                ));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl TokenCredential for DeviceCodeCredential {
    async fn token(&self) -> Result<AccessToken> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = self.load_cache();
        }
        if let Some(token) = cached.as_ref().map(CachedToken::access) {
            if token.is_fresh(Utc::now()) {
                return Ok(token);
            }
        }

        let refreshed = match cached.as_ref().and_then(|t| t.refresh_token.clone()) {
            Some(refresh_token) => match self.refresh(&refresh_token).await {
                Ok(token) => Some(token),
                Err(e) => {
                    tracing::debug!(error = %e, "token refresh failed, signing in again");
                    None
                }
            },
            None => None,
        };
        let token = match refreshed {
            Some(token) => token,
            None => self.sign_in().await?,
        };

        if let Err(e) = self.store_cache(&token) {
            tracing::warn!(path = %self.cache_path.display(), error = %e, "could not write token cache");
        }
        tracing::debug!(expires_on = %token.expires_on, "acquired token via device code credential");
        let access = token.access();
        *cached = Some(token);
        Ok(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_previous_refresh_token_when_not_rotated() {
        let response = TokenResponse {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_in: 3600,
        };
        let cached = response.into_cached(Some("r1"));
        assert_eq!(cached.refresh_token.as_deref(), Some("r1"));
        assert!(cached.access().is_fresh(Utc::now()));
    }

    #[test]
    fn unreadable_cache_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(TOKEN_CACHE_FILENAME);
        fs::write(&path, "not json").unwrap();

        let credential = DeviceCodeCredential::new().unwrap().with_cache_path(&path);
        assert!(credential.load_cache().is_none());
    }
}
