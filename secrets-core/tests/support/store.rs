use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrets_core::{MemoryStore, SecretLocator, SecretResult, SecretStore, StoreError};

/// Store wrapper that records every call it receives.
#[derive(Clone, Default)]
pub struct SpyStore {
    inner: MemoryStore,
    calls: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
    failure: Option<String>,
}

impl SpyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, reason: &str) -> Self {
        self.failure = Some(reason.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl SecretStore for SpyStore {
    async fn fetch(&self, locator: &SecretLocator<'_>) -> Result<SecretResult, StoreError> {
        self.calls.lock().expect("calls lock").push(format!(
            "{}/{}/{}",
            locator.environment, locator.project_scope, locator.secret_name
        ));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.failure {
            return Err(StoreError::Unavailable(reason.clone()));
        }
        self.inner.fetch(locator).await
    }
}
