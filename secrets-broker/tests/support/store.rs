use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use secrets_core::{MemoryStore, SecretLocator, SecretResult, SecretStore, StoreError};

/// `MemoryStore` that counts how often it is asked for a secret.
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStore,
    fetches: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for CountingStore {
    async fn fetch(&self, locator: &SecretLocator<'_>) -> Result<SecretResult, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(locator).await
    }
}
