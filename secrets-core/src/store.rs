use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::types::{SecretResult, SecretValue};

/// Fully resolved location of a secret inside a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecretLocator<'a> {
    pub environment: &'a str,
    pub project_scope: &'a str,
    pub secret_name: &'a str,
    pub version: Option<&'a str>,
}

/// Read-only capability to look up a secret by name.
///
/// Implementations are shared across concurrent requests and must not hold
/// per-request state. Transport and backend failures are reported as
/// [`StoreError::Unavailable`]; absence and denial are ordinary results.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch(&self, locator: &SecretLocator<'_>) -> Result<SecretResult, StoreError>;
}

#[async_trait]
impl<T> SecretStore for Box<T>
where
    T: SecretStore + ?Sized,
{
    async fn fetch(&self, locator: &SecretLocator<'_>) -> Result<SecretResult, StoreError> {
        (**self).fetch(locator).await
    }
}

#[async_trait]
impl<T> SecretStore for Arc<T>
where
    T: SecretStore + ?Sized,
{
    async fn fetch(&self, locator: &SecretLocator<'_>) -> Result<SecretResult, StoreError> {
        (**self).fetch(locator).await
    }
}

type Key = (String, String, String);

/// In-process store for local development and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    secrets: HashMap<Key, SecretValue>,
    denied: HashSet<Key>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        environment: &str,
        project_scope: &str,
        secret_name: &str,
        value: SecretValue,
    ) {
        if let Ok(mut state) = self.inner.write() {
            state
                .secrets
                .insert(key(environment, project_scope, secret_name), value);
        }
    }

    /// Mark a name as present but off limits.
    pub fn deny(&self, environment: &str, project_scope: &str, secret_name: &str) {
        if let Ok(mut state) = self.inner.write() {
            state
                .denied
                .insert(key(environment, project_scope, secret_name));
        }
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn fetch(&self, locator: &SecretLocator<'_>) -> Result<SecretResult, StoreError> {
        let state = self
            .inner
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        let key = key(locator.environment, locator.project_scope, locator.secret_name);
        if state.denied.contains(&key) {
            return Ok(SecretResult::AccessDenied);
        }
        let found = state.secrets.get(&key).filter(|value| match locator.version {
            Some(version) => value.version() == Some(version),
            None => true,
        });
        Ok(match found {
            Some(value) => SecretResult::Found(value.clone()),
            None => SecretResult::NotFound,
        })
    }
}

fn key(environment: &str, project_scope: &str, secret_name: &str) -> Key {
    (
        environment.to_owned(),
        project_scope.to_owned(),
        secret_name.to_owned(),
    )
}
