use std::collections::HashSet;

use crate::store::SecretLocator;
use crate::types::{CallerIdentity, CallerKind};

/// Authorization hook consulted after authentication and before the store.
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, caller: &CallerIdentity, locator: &SecretLocator<'_>) -> bool;
}

impl<T> AccessPolicy for Box<T>
where
    T: AccessPolicy + ?Sized,
{
    fn allows(&self, caller: &CallerIdentity, locator: &SecretLocator<'_>) -> bool {
        (**self).allows(caller, locator)
    }
}

impl<T> AccessPolicy for std::sync::Arc<T>
where
    T: AccessPolicy + ?Sized,
{
    fn allows(&self, caller: &CallerIdentity, locator: &SecretLocator<'_>) -> bool {
        (**self).allows(caller, locator)
    }
}

/// Any authenticated caller may read any secret the store will hand out.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAuthenticated;

impl AccessPolicy for AllowAuthenticated {
    fn allows(&self, _caller: &CallerIdentity, _locator: &SecretLocator<'_>) -> bool {
        true
    }
}

/// Restricts callers by kind and by the environment and project they ask for.
/// Empty sets mean unrestricted.
#[derive(Debug, Default, Clone)]
pub struct ScopePolicy {
    kinds: HashSet<CallerKind>,
    environments: HashSet<String>,
    projects: HashSet<String>,
}

impl ScopePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_kind(mut self, kind: CallerKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn allow_environment(mut self, environment: impl Into<String>) -> Self {
        self.environments.insert(environment.into());
        self
    }

    pub fn allow_project(mut self, project_scope: impl Into<String>) -> Self {
        self.projects.insert(project_scope.into());
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.kinds.is_empty() && self.environments.is_empty() && self.projects.is_empty()
    }
}

impl AccessPolicy for ScopePolicy {
    fn allows(&self, caller: &CallerIdentity, locator: &SecretLocator<'_>) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&caller.kind);
        let env_ok =
            self.environments.is_empty() || self.environments.contains(locator.environment);
        let project_ok =
            self.projects.is_empty() || self.projects.contains(locator.project_scope);
        kind_ok && env_ok && project_ok
    }
}
