use std::sync::Arc;

use secrets_core::{Orchestrator, ScopePolicy, SecretStore};

pub type SharedStore = Arc<dyn SecretStore>;
pub type SharedOrchestrator = Arc<Orchestrator<SharedStore, ScopePolicy>>;

/// Subjects this backend answers on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    pub get: String,
    pub server_xkey: String,
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SharedOrchestrator,
    pub subjects: Arc<Subjects>,
}

impl AppState {
    pub fn new(orchestrator: SharedOrchestrator, subjects: Subjects) -> Self {
        Self {
            orchestrator,
            subjects: Arc::new(subjects),
        }
    }
}
