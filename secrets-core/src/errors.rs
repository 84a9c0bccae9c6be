use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of the key agreement and AEAD layer.
///
/// `InvalidPeerKey` and `DecryptionFailed` collapse to the same wire code so
/// a caller cannot tell which half of the handshake went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("caller public key is not a usable x25519 key")]
    InvalidPeerKey,
    #[error("request payload could not be decrypted")]
    DecryptionFailed,
    #[error("response payload could not be encrypted")]
    EncryptionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token signature does not match any trust anchor")]
    BadSignature,
    #[error("token is outside its validity window")]
    Expired,
    #[error("token does not describe a component or a provider")]
    UnknownKind,
}

impl AuthError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        AuthError::Malformed(reason.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret not found")]
    NotFound,
    #[error("access to secret denied by store")]
    AccessDenied,
}

/// Closed set of error codes that may appear inside an encrypted response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DecryptionFailed,
    AuthMalformed,
    AuthBadSignature,
    AuthExpired,
    AuthUnknownKind,
    NotFound,
    Unavailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::DecryptionFailed => "decryption_failed",
            ErrorCode::AuthMalformed => "auth_malformed",
            ErrorCode::AuthBadSignature => "auth_bad_signature",
            ErrorCode::AuthExpired => "auth_expired",
            ErrorCode::AuthUnknownKind => "auth_unknown_kind",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CryptoError> for ErrorCode {
    fn from(_: CryptoError) -> Self {
        ErrorCode::DecryptionFailed
    }
}

impl From<&AuthError> for ErrorCode {
    fn from(value: &AuthError) -> Self {
        match value {
            AuthError::Malformed(_) => ErrorCode::AuthMalformed,
            AuthError::BadSignature => ErrorCode::AuthBadSignature,
            AuthError::Expired => ErrorCode::AuthExpired,
            AuthError::UnknownKind => ErrorCode::AuthUnknownKind,
        }
    }
}

impl From<&StoreError> for ErrorCode {
    fn from(value: &StoreError) -> Self {
        match value {
            StoreError::NotFound | StoreError::AccessDenied => ErrorCode::NotFound,
            StoreError::Unavailable(_) => ErrorCode::Unavailable,
        }
    }
}

/// Anything that moves a request into the errored state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("access policy denied the request")]
    PolicyDenied,
}

impl RequestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RequestError::Crypto(err) => ErrorCode::from(*err),
            RequestError::Auth(err) => ErrorCode::from(err),
            RequestError::Store(err) => ErrorCode::from(err),
            RequestError::PolicyDenied => ErrorCode::NotFound,
        }
    }
}
