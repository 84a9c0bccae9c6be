//! One encrypted request cycle, from sealed envelope to sealed response.
//!
//! ```text
//! Received -> Decrypted -> Authenticated -> Resolved -> Encrypted -> Sent
//!     \           \              \             \            \
//!      +-----------+--------------+-------------+------------+--> Errored
//! ```
//!
//! `Encrypted -> Errored` only happens when the transport fails to deliver a
//! sealed reply.
//!
//! Once a shared secret exists every outcome is sealed under it, so callers
//! only ever see a closed error code. Without a shared secret there is nothing
//! to seal a reply with and the request is aborted.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::crypto::plaintext;
use crate::crypto::xkey::{self, ServiceKeyPair, SharedSecret};
use crate::errors::{CryptoError, ErrorCode, RequestError, StoreError};
use crate::identity::IdentityValidator;
use crate::policy::{AccessPolicy, AllowAuthenticated};
use crate::store::{SecretLocator, SecretStore};
use crate::types::{
    RequestEnvelope, ResponseEnvelope, ResponsePayload, SecretBody, SecretQuery, SecretResult,
};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Decrypted,
    Authenticated,
    Resolved,
    Encrypted,
    Sent,
    Errored(ErrorCode),
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Sent | Stage::Errored(_))
    }

    fn successor(self) -> Option<Stage> {
        match self {
            Stage::Received => Some(Stage::Decrypted),
            Stage::Decrypted => Some(Stage::Authenticated),
            Stage::Authenticated => Some(Stage::Resolved),
            Stage::Resolved => Some(Stage::Encrypted),
            Stage::Encrypted => Some(Stage::Sent),
            Stage::Sent | Stage::Errored(_) => None,
        }
    }

    pub fn can_advance_to(self, next: Stage) -> bool {
        match next {
            Stage::Errored(_) => !self.is_terminal(),
            next => self.successor() == Some(next),
        }
    }
}

/// Tracks the stage of a single request and refuses to skip or reorder steps.
#[derive(Debug)]
pub struct RequestCycle {
    stage: Stage,
}

impl RequestCycle {
    pub fn new() -> Self {
        Self {
            stage: Stage::Received,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn advance(&mut self, next: Stage) -> Result<(), InvalidTransition> {
        if !self.stage.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        debug!(from = ?self.stage, to = ?next, "request stage");
        self.stage = next;
        Ok(())
    }
}

impl Default for RequestCycle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("request cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: Stage,
    pub to: Stage,
}

/// Why a request ended without any reply.
///
/// Every variant leaves the transport with nothing to send. Without a shared
/// secret there is no key to seal even an error code under, so a caller whose
/// envelope is not JSON or whose public key is unusable (wrong length or a
/// small-order point) sees its request time out rather than receiving
/// `decryption_failed`. Client libraries should treat a missing reply as a bad
/// envelope or caller key.
#[derive(Debug, thiserror::Error)]
pub enum Abort {
    #[error("request envelope is not valid json: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// A response ready for the transport.
#[derive(Debug)]
pub struct Sealed {
    pub envelope: ResponseEnvelope,
    cycle: RequestCycle,
}

impl Sealed {
    pub fn stage(&self) -> Stage {
        self.cycle.stage()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self.cycle.stage() {
            Stage::Errored(code) => Some(code),
            _ => None,
        }
    }

    /// Record that the transport accepted the response. A cycle that already
    /// errored keeps its error stage; its reply carried the error code.
    pub fn mark_sent(&mut self) -> Result<(), InvalidTransition> {
        match self.cycle.stage() {
            Stage::Errored(_) => Ok(()),
            _ => self.cycle.advance(Stage::Sent),
        }
    }

    /// Record that the transport could not deliver the response.
    pub fn mark_undelivered(&mut self) -> Result<(), InvalidTransition> {
        match self.cycle.stage() {
            Stage::Errored(_) => Ok(()),
            _ => self.cycle.advance(Stage::Errored(ErrorCode::Unavailable)),
        }
    }
}

/// Scope applied when a query leaves environment or project empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreDefaults {
    pub environment: String,
    pub project_scope: String,
}

pub struct Orchestrator<S, P = AllowAuthenticated> {
    keys: Arc<ServiceKeyPair>,
    validator: Arc<IdentityValidator>,
    store: S,
    policy: P,
    defaults: StoreDefaults,
    store_timeout: Duration,
}

impl<S> Orchestrator<S, AllowAuthenticated>
where
    S: SecretStore,
{
    pub fn new(keys: Arc<ServiceKeyPair>, validator: Arc<IdentityValidator>, store: S) -> Self {
        Self::with_policy(keys, validator, store, AllowAuthenticated)
    }
}

impl<S, P> Orchestrator<S, P>
where
    S: SecretStore,
    P: AccessPolicy,
{
    pub fn with_policy(
        keys: Arc<ServiceKeyPair>,
        validator: Arc<IdentityValidator>,
        store: S,
        policy: P,
    ) -> Self {
        Self {
            keys,
            validator,
            store,
            policy,
            defaults: StoreDefaults::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_defaults(mut self, defaults: StoreDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn keys(&self) -> &ServiceKeyPair {
        &self.keys
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reply for the `server_xkey` subject. Touches nothing but the key pair.
    pub fn server_xkey(&self) -> String {
        self.keys.public_key_encoded()
    }

    pub async fn handle_get(&self, payload: &[u8]) -> Result<Sealed, Abort> {
        let envelope = RequestEnvelope::from_slice(payload)?;
        self.handle_envelope(&envelope).await
    }

    pub async fn handle_envelope(&self, envelope: &RequestEnvelope) -> Result<Sealed, Abort> {
        let mut cycle = RequestCycle::new();
        let shared = self
            .keys
            .derive_shared_secret(&envelope.caller_public_key)?;

        let payload = match self.resolve(&shared, envelope, &mut cycle).await {
            Ok(body) => ResponsePayload::Secret(body),
            Err(err) => {
                let code = err.code();
                warn!(error = %err, code = %code, "secret request failed");
                cycle.advance(Stage::Errored(code))?;
                ResponsePayload::Error { code }
            }
        };

        let plaintext = plaintext::to_json(&payload).map_err(|_| CryptoError::EncryptionFailed)?;
        drop(payload);
        let (nonce, ciphertext) = xkey::encrypt(&shared, &plaintext)?;
        if cycle.stage() == Stage::Resolved {
            cycle.advance(Stage::Encrypted)?;
        }

        Ok(Sealed {
            envelope: ResponseEnvelope { nonce, ciphertext },
            cycle,
        })
    }

    async fn resolve(
        &self,
        shared: &SharedSecret,
        envelope: &RequestEnvelope,
        cycle: &mut RequestCycle,
    ) -> Result<SecretBody, RequestError> {
        let query = xkey::decrypt(shared, &envelope.nonce, &envelope.ciphertext)?;
        advance(cycle, Stage::Decrypted)?;

        let caller = self.validator.validate(&envelope.token)?;
        advance(cycle, Stage::Authenticated)?;

        if query.secret_name.trim().is_empty() {
            return Err(StoreError::NotFound.into());
        }
        let locator = self.locate(&query);
        if !self.policy.allows(&caller, &locator) {
            info!(
                subject = %caller.subject_id,
                kind = caller.kind.as_str(),
                secret = locator.secret_name,
                environment = locator.environment,
                project = locator.project_scope,
                "access policy denied secret request"
            );
            return Err(RequestError::PolicyDenied);
        }

        let fetched = tokio::time::timeout(self.store_timeout, self.store.fetch(&locator))
            .await
            .map_err(|_| StoreError::Unavailable("store call timed out".into()))??;
        let value = match fetched {
            SecretResult::Found(value) => value,
            SecretResult::NotFound => return Err(StoreError::NotFound.into()),
            SecretResult::AccessDenied => return Err(StoreError::AccessDenied.into()),
        };
        advance(cycle, Stage::Resolved)?;

        info!(
            subject = %caller.subject_id,
            kind = caller.kind.as_str(),
            secret = locator.secret_name,
            environment = locator.environment,
            project = locator.project_scope,
            "secret resolved"
        );
        Ok(SecretBody::new(&query.secret_name, &value))
    }

    fn locate<'a>(&'a self, query: &'a SecretQuery) -> SecretLocator<'a> {
        SecretLocator {
            environment: non_empty(&query.environment)
                .unwrap_or(self.defaults.environment.as_str()),
            project_scope: non_empty(&query.project_scope)
                .unwrap_or(self.defaults.project_scope.as_str()),
            secret_name: query.secret_name.trim(),
            version: query.version.as_deref().and_then(non_empty),
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

fn advance(cycle: &mut RequestCycle, next: Stage) -> Result<(), RequestError> {
    // Out-of-order steps are programming errors; surface them as an opaque failure.
    cycle
        .advance(next)
        .map_err(|err| StoreError::Unavailable(err.to_string()).into())
}
