use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrets_core::identity::{self, AnchorError};
use secrets_core::{CallerKind, ScopePolicy, ServiceKeyPair, StoreDefaults, TrustAnchor};
use thiserror::Error;
use zeroize::Zeroizing;

const DEFAULT_INFISICAL_BASE_URL: &str = "https://app.infisical.com";
const DEFAULT_INFISICAL_ENVIRONMENT: &str = "prod";
const DEFAULT_SECRET_PATH: &str = "/";
const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
const DEFAULT_SUBJECT_PREFIX: &str = "wasmcloud.secrets";
const DEFAULT_BACKEND_NAME: &str = "infisical";
const DEFAULT_API_VERSION: &str = "v1alpha1";
const DEFAULT_STORE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
const ANY_PROJECT: &str = "*";

/// Startup configuration problems. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("AUTH_JWT_ED25519_PUB or AUTH_JWT_JWKS_PATH must be configured")]
    NoTrustAnchors,
    #[error("failed to load trust anchors from {origin}: {source}")]
    Anchors {
        origin: String,
        #[source]
        source: AnchorError,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Clone)]
pub struct InfisicalConfig {
    pub client_id: String,
    pub client_secret: Zeroizing<String>,
    pub base_url: String,
    pub project_id: String,
    pub environment: String,
    pub secret_path: String,
    pub http_timeout: Duration,
}

impl fmt::Debug for InfisicalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfisicalConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .field("environment", &self.environment)
            .field("secret_path", &self.secret_path)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub creds_file: Option<PathBuf>,
    pub subject_prefix: String,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub api_version: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub ed25519_keys: Vec<String>,
    pub jwks_path: Option<PathBuf>,
    pub clock_skew: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    pub allowed_kinds: Vec<CallerKind>,
    pub allowed_environments: Vec<String>,
    /// Empty means callers may name any project the machine identity can read.
    pub allowed_projects: Vec<String>,
}

#[derive(Clone)]
pub struct BrokerConfig {
    pub infisical: InfisicalConfig,
    pub nats: NatsConfig,
    pub backend: BackendConfig,
    pub auth: AuthConfig,
    pub policy: PolicyConfig,
    pub store_timeout: Duration,
    server_xkey_secret: Option<Zeroizing<[u8; 32]>>,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("infisical", &self.infisical)
            .field("nats", &self.nats)
            .field("backend", &self.backend)
            .field("auth", &self.auth)
            .field("policy", &self.policy)
            .field("store_timeout", &self.store_timeout)
            .field("server_xkey_pinned", &self.server_xkey_secret.is_some())
            .finish()
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        let or_default = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let infisical = InfisicalConfig {
            client_id: required("INFISICAL_CLIENT_ID")?,
            client_secret: Zeroizing::new(required("INFISICAL_CLIENT_SECRET")?),
            base_url: or_default("INFISICAL_BASE_URL", DEFAULT_INFISICAL_BASE_URL),
            project_id: required("INFISICAL_PROJECT_ID")?,
            environment: or_default("INFISICAL_ENVIRONMENT", DEFAULT_INFISICAL_ENVIRONMENT),
            secret_path: or_default("INFISICAL_SECRET_PATH", DEFAULT_SECRET_PATH),
            http_timeout: Duration::from_secs(parse_secs(
                "INFISICAL_HTTP_TIMEOUT_SECS",
                get("INFISICAL_HTTP_TIMEOUT_SECS"),
                DEFAULT_HTTP_TIMEOUT_SECS,
            )?),
        };

        let nats = NatsConfig {
            url: or_default("NATS_URL", DEFAULT_NATS_URL),
            creds_file: get("NATS_CREDS_FILE").map(PathBuf::from),
            subject_prefix: or_default("NATS_SUBJECT_PREFIX", DEFAULT_SUBJECT_PREFIX),
        };

        let backend = BackendConfig {
            name: or_default("BACKEND_NAME", DEFAULT_BACKEND_NAME),
            api_version: or_default("API_VERSION", DEFAULT_API_VERSION),
        };

        let auth = AuthConfig {
            ed25519_keys: get("AUTH_JWT_ED25519_PUB")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
            jwks_path: get("AUTH_JWT_JWKS_PATH").map(PathBuf::from),
            clock_skew: Duration::from_secs(parse_secs(
                "AUTH_CLOCK_SKEW_SECS",
                get("AUTH_CLOCK_SKEW_SECS"),
                0,
            )?),
        };

        let policy = PolicyConfig {
            allowed_kinds: get("POLICY_ALLOWED_KINDS")
                .map(|value| {
                    split_list(&value)
                        .iter()
                        .map(|kind| {
                            kind.parse::<CallerKind>()
                                .map_err(|err| ConfigError::invalid("POLICY_ALLOWED_KINDS", err))
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
                .transpose()?
                .unwrap_or_default(),
            allowed_environments: get("POLICY_ALLOWED_ENVIRONMENTS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
            allowed_projects: allowed_projects(
                get("POLICY_ALLOWED_PROJECTS"),
                &infisical.project_id,
            )?,
        };

        let store_timeout = parse_secs(
            "STORE_TIMEOUT_SECS",
            get("STORE_TIMEOUT_SECS"),
            DEFAULT_STORE_TIMEOUT_SECS,
        )?;
        if store_timeout == 0 {
            return Err(ConfigError::invalid(
                "STORE_TIMEOUT_SECS",
                "must be greater than zero",
            ));
        }

        let server_xkey_secret = get("SERVER_XKEY_SECRET")
            .map(|value| decode_xkey_secret(&value))
            .transpose()?;

        let config = Self {
            infisical,
            nats,
            backend,
            auth,
            policy,
            store_timeout: Duration::from_secs(store_timeout),
            server_xkey_secret,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_subject_token("NATS_SUBJECT_PREFIX", &self.nats.subject_prefix, true)?;
        validate_subject_token("API_VERSION", &self.backend.api_version, false)?;
        validate_subject_token("BACKEND_NAME", &self.backend.name, false)?;

        let base = &self.infisical.base_url;
        if !(base.starts_with("https://") || base.starts_with("http://")) {
            return Err(ConfigError::invalid(
                "INFISICAL_BASE_URL",
                "must be an http(s) url",
            ));
        }
        if !self.infisical.secret_path.starts_with('/') {
            return Err(ConfigError::invalid(
                "INFISICAL_SECRET_PATH",
                "must start with '/'",
            ));
        }
        if self.auth.ed25519_keys.is_empty() && self.auth.jwks_path.is_none() {
            return Err(ConfigError::NoTrustAnchors);
        }
        Ok(())
    }

    /// `{prefix}.{version}.{backend}.get`
    pub fn get_subject(&self) -> String {
        format!(
            "{}.{}.{}.get",
            self.nats.subject_prefix, self.backend.api_version, self.backend.name
        )
    }

    /// `{prefix}.{version}.{backend}.server_xkey`
    pub fn server_xkey_subject(&self) -> String {
        format!(
            "{}.{}.{}.server_xkey",
            self.nats.subject_prefix, self.backend.api_version, self.backend.name
        )
    }

    /// Load every configured trust anchor. Reads the JWKS file, so call once at startup.
    pub fn trust_anchors(&self) -> Result<Vec<TrustAnchor>, ConfigError> {
        let mut anchors = Vec::new();
        for (idx, key) in self.auth.ed25519_keys.iter().enumerate() {
            let anchor = TrustAnchor::from_encoded(None, key).map_err(|source| {
                ConfigError::Anchors {
                    origin: format!("AUTH_JWT_ED25519_PUB[{idx}]"),
                    source,
                }
            })?;
            anchors.push(anchor);
        }
        if let Some(path) = &self.auth.jwks_path {
            let loaded =
                identity::anchors_from_jwks_file(path).map_err(|source| ConfigError::Anchors {
                    origin: path.display().to_string(),
                    source,
                })?;
            anchors.extend(loaded);
        }
        if anchors.is_empty() {
            return Err(ConfigError::NoTrustAnchors);
        }
        Ok(anchors)
    }

    pub fn service_keys(&self) -> ServiceKeyPair {
        match &self.server_xkey_secret {
            Some(secret) => ServiceKeyPair::from_secret(secret.clone()),
            None => ServiceKeyPair::generate(),
        }
    }

    pub fn store_defaults(&self) -> StoreDefaults {
        StoreDefaults {
            environment: self.infisical.environment.clone(),
            project_scope: self.infisical.project_id.clone(),
        }
    }

    pub fn access_policy(&self) -> ScopePolicy {
        let policy = self
            .policy
            .allowed_kinds
            .iter()
            .fold(ScopePolicy::new(), |policy, kind| policy.allow_kind(*kind));
        let policy = self
            .policy
            .allowed_environments
            .iter()
            .fold(policy, |policy, env| policy.allow_environment(env.clone()));
        self.policy
            .allowed_projects
            .iter()
            .fold(policy, |policy, project| policy.allow_project(project.clone()))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|segment| segment.trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Unset pins callers to `INFISICAL_PROJECT_ID`; `*` lifts the restriction.
fn allowed_projects(value: Option<String>, project_id: &str) -> Result<Vec<String>, ConfigError> {
    let Some(value) = value else {
        return Ok(vec![project_id.to_string()]);
    };
    let projects = split_list(&value);
    if projects.iter().any(|project| project == ANY_PROJECT) {
        if projects.len() > 1 {
            return Err(ConfigError::invalid(
                "POLICY_ALLOWED_PROJECTS",
                "'*' cannot be combined with project ids",
            ));
        }
        return Ok(Vec::new());
    }
    Ok(projects)
}

fn parse_secs(key: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match value {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|err| ConfigError::invalid(key, err.to_string())),
        None => Ok(default),
    }
}

fn decode_xkey_secret(value: &str) -> Result<Zeroizing<[u8; 32]>, ConfigError> {
    let raw = Zeroizing::new(
        STANDARD
            .decode(value.as_bytes())
            .map_err(|err| ConfigError::invalid("SERVER_XKEY_SECRET", err.to_string()))?,
    );
    let mut secret = Zeroizing::new([0u8; 32]);
    if raw.len() != secret.len() {
        return Err(ConfigError::invalid(
            "SERVER_XKEY_SECRET",
            format!("expected 32 bytes, got {}", raw.len()),
        ));
    }
    secret.copy_from_slice(&raw);
    Ok(secret)
}

fn validate_subject_token(
    key: &'static str,
    value: &str,
    allow_dots: bool,
) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Missing(key));
    }
    if value.contains(['*', '>']) || value.chars().any(char::is_whitespace) {
        return Err(ConfigError::invalid(
            key,
            "must not contain wildcards or whitespace",
        ));
    }
    if !allow_dots && value.contains('.') {
        return Err(ConfigError::invalid(key, "must be a single subject token"));
    }
    if value.starts_with('.') || value.ends_with('.') || value.contains("..") {
        return Err(ConfigError::invalid(key, "contains an empty subject token"));
    }
    Ok(())
}
