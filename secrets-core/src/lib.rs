//! Encrypted secret lookups: key agreement, caller identity and store resolution.

pub mod crypto;
pub mod errors;
pub mod identity;
pub mod orchestrator;
pub mod policy;
pub mod store;
pub mod types;

pub use crypto::xkey::{CallerKeyPair, CallerSession, ServiceKeyPair, SharedSecret};
pub use errors::{AuthError, CryptoError, ErrorCode, RequestError, StoreError};
pub use identity::{AnchorError, IdentityValidator, TrustAnchor};
pub use orchestrator::{Abort, Orchestrator, Sealed, Stage, StoreDefaults};
pub use policy::{AccessPolicy, AllowAuthenticated, ScopePolicy};
pub use store::{MemoryStore, SecretLocator, SecretStore};
pub use types::{
    CallerIdentity, CallerKind, RequestEnvelope, ResponseEnvelope, ResponsePayload, SecretBody,
    SecretQuery, SecretResult, SecretValue, ValueEncoding,
};
