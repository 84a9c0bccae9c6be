//! Infisical secret store reached over its REST API.
//!
//! Authentication uses Universal Auth (machine identity client id + secret).
//! The access token is cached until shortly before it expires and refreshed
//! once when the API answers 401. Concurrent requests that see the same
//! rejected token share a single new login.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use secrets_core::{SecretLocator, SecretResult, SecretStore, SecretValue, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::InfisicalConfig;

const LOGIN_PATH: &str = "api/v1/auth/universal-auth/login";
const RAW_SECRETS_PATH: [&str; 4] = ["api", "v3", "secrets", "raw"];
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);
/// Assumed when the login response carries no usable `expiresIn`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct InfisicalStore {
    config: Arc<InfisicalConfig>,
    client: Client,
    token: Arc<RwLock<Option<AccessToken>>>,
}

struct AccessToken {
    value: Zeroizing<String>,
    refresh_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_at
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct RawSecretResponse {
    secret: RawSecret,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSecret {
    secret_value: String,
    #[serde(default)]
    version: Option<u64>,
}

impl InfisicalStore {
    pub fn new(config: InfisicalConfig) -> anyhow::Result<Self> {
        Url::parse(&config.base_url).context("INFISICAL_BASE_URL is not a valid url")?;
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("failed to build Infisical HTTP client")?;
        Ok(Self {
            config: Arc::new(config),
            client,
            token: Arc::new(RwLock::new(None)),
        })
    }

    /// Log in once so that bad credentials surface at startup.
    pub async fn verify_login(&self) -> Result<(), StoreError> {
        let token = self.login().await?;
        *self.token.write().await = Some(token);
        info!(base_url = %self.config.base_url, "authenticated with infisical");
        Ok(())
    }

    async fn access_token(&self) -> Result<Zeroizing<String>, StoreError> {
        if let Some(token) = self.token.read().await.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }
        self.refresh(None).await
    }

    /// Returns the cached token unless it is stale or is the one the API just
    /// rejected; otherwise logs in while holding the write lock.
    async fn refresh(&self, rejected: Option<&str>) -> Result<Zeroizing<String>, StoreError> {
        let mut guard = self.token.write().await;
        if let Some(token) = guard
            .as_ref()
            .filter(|t| t.is_fresh() && rejected != Some(t.value.as_str()))
        {
            return Ok(token.value.clone());
        }
        let token = self.login().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    async fn login(&self) -> Result<AccessToken, StoreError> {
        debug!("requesting infisical access token");
        let url = self.url_for(LOGIN_PATH)?;
        let response = self
            .client
            .post(url)
            .json(&LoginRequest {
                client_id: &self.config.client_id,
                client_secret: &self.config.client_secret,
            })
            .send()
            .await
            .map_err(|err| unavailable("infisical login request failed", err))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "infisical rejected universal auth login");
            return Err(StoreError::Unavailable(format!(
                "infisical login failed with status {status}"
            )));
        }
        let body: LoginResponse = response
            .json()
            .await
            .map_err(|err| unavailable("invalid infisical login response", err))?;

        let lifetime = body
            .expires_in
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        debug!(lifetime_secs = lifetime.as_secs(), "infisical access token issued");
        Ok(AccessToken {
            value: Zeroizing::new(body.access_token),
            refresh_at: Instant::now() + refresh_after(lifetime),
        })
    }

    fn url_for(&self, path: &str) -> Result<Url, StoreError> {
        let base = self.config.base_url.trim_end_matches('/');
        Url::parse(&format!("{base}/{path}"))
            .map_err(|err| StoreError::Unavailable(format!("invalid infisical url: {err}")))
    }

    fn secret_url(&self, locator: &SecretLocator<'_>) -> Result<Url, StoreError> {
        let mut url = self.url_for("")?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Unavailable("infisical base url cannot hold a path".into()))?
            .pop_if_empty()
            .extend(RAW_SECRETS_PATH)
            .push(locator.secret_name);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("workspaceId", locator.project_scope)
                .append_pair("environment", locator.environment)
                .append_pair("secretPath", &self.config.secret_path)
                .append_pair("expandSecretReferences", "true");
            if let Some(version) = locator.version {
                query.append_pair("version", version);
            }
        }
        Ok(url)
    }

    async fn request_secret(
        &self,
        locator: &SecretLocator<'_>,
        token: &str,
    ) -> Result<Response, StoreError> {
        let url = self.secret_url(locator)?;
        self.client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| unavailable("infisical secret request failed", err))
    }
}

#[async_trait]
impl SecretStore for InfisicalStore {
    async fn fetch(&self, locator: &SecretLocator<'_>) -> Result<SecretResult, StoreError> {
        let token = self.access_token().await?;
        let mut response = self.request_secret(locator, &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("infisical token rejected; logging in again");
            let token = self.refresh(Some(token.as_str())).await?;
            response = self.request_secret(locator, &token).await?;
        }

        match response.status() {
            StatusCode::NOT_FOUND => Ok(SecretResult::NotFound),
            StatusCode::FORBIDDEN => Ok(SecretResult::AccessDenied),
            status if status.is_success() => {
                let body: RawSecretResponse = response
                    .json()
                    .await
                    .map_err(|err| unavailable("invalid infisical secret response", err))?;
                let RawSecret {
                    secret_value,
                    version,
                } = body.secret;
                let mut value = SecretValue::new(secret_value.into_bytes());
                if let Some(version) = version {
                    value = value.with_version(version.to_string());
                }
                Ok(SecretResult::Found(value))
            }
            status => {
                warn!(%status, secret = locator.secret_name, "unexpected infisical response");
                Err(StoreError::Unavailable(format!(
                    "infisical answered with status {status}"
                )))
            }
        }
    }
}

/// Short-lived tokens are refreshed at half their lifetime so the margin never
/// swallows them whole.
fn refresh_after(lifetime: Duration) -> Duration {
    if lifetime > TOKEN_REFRESH_MARGIN * 2 {
        lifetime - TOKEN_REFRESH_MARGIN
    } else {
        lifetime / 2
    }
}

fn unavailable(context: &str, err: reqwest::Error) -> StoreError {
    StoreError::Unavailable(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(base_url: &str, secret_path: &str) -> InfisicalStore {
        InfisicalStore::new(InfisicalConfig {
            client_id: "id".into(),
            client_secret: Zeroizing::new("secret".into()),
            base_url: base_url.into(),
            project_id: "proj-1".into(),
            environment: "prod".into(),
            secret_path: secret_path.into(),
            http_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn secret_urls_escape_names_and_carry_scope() {
        let store = store("https://vault.example.com/", "/nats/workspaces/default");
        let url = store
            .secret_url(&SecretLocator {
                environment: "dev",
                project_scope: "proj-9",
                secret_name: "DB PASS",
                version: Some("4"),
            })
            .unwrap();
        assert_eq!(url.path(), "/api/v3/secrets/raw/DB%20PASS");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("workspaceId".into(), "proj-9".into())));
        assert!(pairs.contains(&("environment".into(), "dev".into())));
        assert!(pairs.contains(&("secretPath".into(), "/nats/workspaces/default".into())));
        assert!(pairs.contains(&("version".into(), "4".into())));
    }

    #[test]
    fn base_urls_with_prefixes_keep_them() {
        let store = store("https://proxy.example.com/infisical", "/");
        assert_eq!(
            store.url_for(LOGIN_PATH).unwrap().as_str(),
            "https://proxy.example.com/infisical/api/v1/auth/universal-auth/login"
        );
        let url = store
            .secret_url(&SecretLocator {
                environment: "prod",
                project_scope: "p",
                secret_name: "A",
                version: None,
            })
            .unwrap();
        assert_eq!(url.path(), "/infisical/api/v3/secrets/raw/A");
    }

    #[test]
    fn refresh_leaves_room_before_expiry() {
        assert_eq!(
            refresh_after(Duration::from_secs(7200)),
            Duration::from_secs(7170)
        );
        assert_eq!(refresh_after(Duration::from_secs(60)), Duration::from_secs(30));
        assert_eq!(refresh_after(Duration::from_secs(10)), Duration::from_secs(5));
        assert_eq!(refresh_after(DEFAULT_TOKEN_LIFETIME), Duration::from_secs(270));
    }

    #[test]
    fn invalid_base_urls_fail_construction() {
        let err = InfisicalStore::new(InfisicalConfig {
            client_id: "id".into(),
            client_secret: Zeroizing::new("secret".into()),
            base_url: "not a url".into(),
            project_id: "p".into(),
            environment: "prod".into(),
            secret_path: "/".into(),
            http_timeout: Duration::from_secs(1),
        });
        assert!(err.is_err());
    }
}
