use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::errors::ErrorCode;

/// Encrypted request as it arrives on the bus.
#[derive(Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(with = "b64")]
    pub caller_public_key: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    pub token: String,
}

impl RequestEnvelope {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl fmt::Debug for RequestEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEnvelope")
            .field("caller_public_key", &STANDARD.encode(&self.caller_public_key))
            .field("nonce_len", &self.nonce.len())
            .field("ciphertext_len", &self.ciphertext.len())
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Encrypted response handed back to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

impl ResponseEnvelope {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Decrypted request payload. Cleared from memory when dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretQuery {
    #[serde(alias = "key")]
    pub secret_name: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub project_scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SecretQuery {
    pub fn new(
        secret_name: impl Into<String>,
        environment: impl Into<String>,
        project_scope: impl Into<String>,
    ) -> Self {
        Self {
            secret_name: secret_name.into(),
            environment: environment.into(),
            project_scope: project_scope.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerKind {
    Component,
    Provider,
}

impl CallerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallerKind::Component => "component",
            CallerKind::Provider => "provider",
        }
    }
}

impl std::str::FromStr for CallerKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "component" => Ok(CallerKind::Component),
            "provider" => Ok(CallerKind::Provider),
            other => Err(format!("unknown caller kind '{other}'")),
        }
    }
}

/// Authenticated caller, produced only by a successful token validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub subject_id: String,
    pub kind: CallerKind,
    /// Unix timestamp (seconds) after which the token stops being accepted.
    pub expiry: i64,
    pub name: Option<String>,
}

/// Secret bytes returned by a store.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue {
    bytes: Zeroizing<Vec<u8>>,
    version: Option<String>,
}

impl SecretValue {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Zeroizing::new(bytes.into()),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("len", &self.bytes.len())
            .field("version", &self.version)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretResult {
    Found(SecretValue),
    NotFound,
    AccessDenied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueEncoding {
    #[default]
    Utf8,
    Base64,
}

/// A secret as rendered inside the encrypted response.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretBody {
    pub name: String,
    pub value: String,
    #[zeroize(skip)]
    #[serde(default)]
    pub encoding: ValueEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SecretBody {
    pub fn new(name: &str, secret: &SecretValue) -> Self {
        let (value, encoding) = match secret.as_str() {
            Some(text) => (text.to_owned(), ValueEncoding::Utf8),
            None => (STANDARD.encode(secret.as_bytes()), ValueEncoding::Base64),
        };
        Self {
            name: name.to_owned(),
            value,
            encoding,
            version: secret.version().map(str::to_owned),
        }
    }

    /// Raw secret bytes, undoing the transport encoding.
    pub fn decoded_value(&self) -> Result<Zeroizing<Vec<u8>>, base64::DecodeError> {
        match self.encoding {
            ValueEncoding::Utf8 => Ok(Zeroizing::new(self.value.as_bytes().to_vec())),
            ValueEncoding::Base64 => STANDARD.decode(self.value.as_bytes()).map(Zeroizing::new),
        }
    }
}

impl fmt::Debug for SecretBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBody")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("encoding", &self.encoding)
            .field("version", &self.version)
            .finish()
    }
}

/// Plaintext of a [`ResponseEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePayload {
    Secret(SecretBody),
    Error { code: ErrorCode },
}

impl ResponsePayload {
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ResponsePayload::Error { code } => Some(*code),
            ResponsePayload::Secret(_) => None,
        }
    }
}

pub(crate) mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
