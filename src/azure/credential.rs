use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{Result, VmssError};

pub const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub(crate) fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_on - Duration::seconds(EXPIRY_MARGIN_SECS) > now
    }
}

/// Source of ARM bearer tokens.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn token(&self) -> Result<AccessToken>;
}

/// Tries each credential in order and returns the first token obtained.
///
/// A source failing with [`VmssError::Credential`] hands over to the next one;
/// any other error stops the chain.
pub struct ChainedCredential {
    sources: Vec<Arc<dyn TokenCredential>>,
}

impl ChainedCredential {
    pub fn new(sources: Vec<Arc<dyn TokenCredential>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl TokenCredential for ChainedCredential {
    async fn token(&self) -> Result<AccessToken> {
        let mut failures = Vec::new();
        for source in &self.sources {
            match source.token().await {
                Ok(token) => return Ok(token),
                Err(VmssError::Credential(reason)) => {
                    tracing::debug!(%reason, "credential unavailable, trying the next one");
                    failures.push(reason);
                }
                Err(e) => return Err(e),
            }
        }
        if failures.is_empty() {
            return Err(VmssError::Credential("no credentials configured".to_string()));
        }
        Err(VmssError::Credential(failures.join("; ")))
    }
}

/// Borrows the signed-in Azure CLI session (`az login`).
pub struct AzureCliCredential {
    resource: String,
    cached: Mutex<Option<AccessToken>>,
}

impl Default for AzureCliCredential {
    fn default() -> Self {
        Self::new()
    }
}

impl AzureCliCredential {
    pub fn new() -> Self {
        Self {
            resource: MANAGEMENT_RESOURCE.to_string(),
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<AccessToken> {
        let output = Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--resource",
                &self.resource,
                "--output",
                "json",
            ])
            .output()
            .await
            .map_err(|e| VmssError::Credential(format!("running az CLI: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VmssError::Credential(format!(
                "az account get-access-token failed, try 'az login': {}",
                stderr.trim()
            )));
        }
        parse_cli_token(&output.stdout)
    }
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    async fn token(&self) -> Result<AccessToken> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.clone());
        }
        let token = self.fetch().await?;
        tracing::debug!(expires_on = %token.expires_on, "acquired token from Azure CLI");
        *cached = Some(token.clone());
        Ok(token)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    /// Unix timestamp, only printed by recent CLI versions.
    #[serde(default, rename = "expires_on")]
    expires_on_unix: Option<i64>,
    /// Local time without offset, e.g. `2024-01-31 10:15:00.000000`.
    #[serde(default)]
    expires_on: Option<String>,
}

fn parse_cli_token(stdout: &[u8]) -> Result<AccessToken> {
    let raw: CliToken = serde_json::from_slice(stdout)
        .map_err(|e| VmssError::Credential(format!("parsing az CLI output: {e}")))?;

    let expires_on = match (raw.expires_on_unix, raw.expires_on.as_deref()) {
        (Some(ts), _) => Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| VmssError::Credential(format!("invalid expiry timestamp {ts}")))?,
        (None, Some(local)) => parse_local_expiry(local)?,
        (None, None) => {
            return Err(VmssError::Credential(
                "az CLI output has no token expiry".to_string(),
            ))
        }
    };

    Ok(AccessToken {
        token: raw.access_token,
        expires_on,
    })
}

fn parse_local_expiry(value: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| VmssError::Credential(format!("invalid token expiry {value:?}: {e}")))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| VmssError::Credential(format!("invalid local time {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_unix_expiry() {
        let token = parse_cli_token(
            br#"{"accessToken":"abc","expiresOn":"2000-01-01 00:00:00.000000","expires_on":1893456000,"tokenType":"Bearer"}"#,
        )
        .unwrap();
        assert_eq!(token.token, "abc");
        assert_eq!(token.expires_on.timestamp(), 1_893_456_000);
    }

    #[test]
    fn falls_back_to_local_expiry() {
        let token =
            parse_cli_token(br#"{"accessToken":"abc","expiresOn":"2030-01-01 10:00:00.123456"}"#)
                .unwrap();
        assert!(token.is_fresh(Utc::now()));
    }

    #[test]
    fn rejects_output_without_expiry() {
        let err = parse_cli_token(br#"{"accessToken":"abc"}"#).unwrap_err();
        assert!(matches!(err, VmssError::Credential(_)));
    }

    struct Fixed(Result<&'static str>);

    #[async_trait]
    impl TokenCredential for Fixed {
        async fn token(&self) -> Result<AccessToken> {
            match &self.0 {
                Ok(token) => Ok(AccessToken {
                    token: token.to_string(),
                    expires_on: Utc::now() + Duration::hours(1),
                }),
                Err(VmssError::Credential(reason)) => Err(VmssError::Credential(reason.clone())),
                Err(e) => Err(VmssError::Config(e.to_string())),
            }
        }
    }

    fn fixed(result: Result<&'static str>) -> Arc<dyn TokenCredential> {
        Arc::new(Fixed(result))
    }

    fn unavailable(reason: &'static str) -> Arc<dyn TokenCredential> {
        fixed(Err(VmssError::Credential(reason.to_string())))
    }

    #[tokio::test]
    async fn chain_falls_through_unavailable_credentials() {
        let chain = ChainedCredential::new(vec![
            unavailable("try 'az login'"),
            fixed(Ok("fallback")),
        ]);
        assert_eq!(chain.token().await.unwrap().token, "fallback");
    }

    #[tokio::test]
    async fn chain_reports_every_failure() {
        let chain = ChainedCredential::new(vec![unavailable("first"), unavailable("second")]);
        match chain.token().await.unwrap_err() {
            VmssError::Credential(reason) => assert_eq!(reason, "first; second"),
            other => panic!("expected Credential, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chain_stops_on_other_errors() {
        let chain = ChainedCredential::new(vec![
            fixed(Err(VmssError::Config("broken".to_string()))),
            fixed(Ok("never")),
        ]);
        assert!(matches!(chain.token().await.unwrap_err(), VmssError::Config(_)));
    }

    #[test]
    fn token_near_expiry_is_stale() {
        let token = AccessToken {
            token: "t".to_string(),
            expires_on: Utc::now() + Duration::seconds(60),
        };
        assert!(!token.is_fresh(Utc::now()));
    }
}
