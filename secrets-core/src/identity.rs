use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::errors::AuthError;
use crate::types::{CallerIdentity, CallerKind};

const ED25519_PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 public key that is allowed to sign caller tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    pub kid: Option<String>,
    key: Vec<u8>,
}

impl TrustAnchor {
    pub fn new(kid: Option<String>, key: Vec<u8>) -> Result<Self, AnchorError> {
        if key.len() != ED25519_PUBLIC_KEY_LEN {
            return Err(AnchorError::KeyLength(key.len()));
        }
        Ok(Self { kid, key })
    }

    /// Parse a base64url (unpadded) raw Ed25519 key.
    pub fn from_encoded(kid: Option<String>, value: &str) -> Result<Self, AnchorError> {
        let raw = decode_ed25519_key(value.trim())?;
        Self::new(kid, raw)
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        ring::signature::UnparsedPublicKey::new(&ring::signature::ED25519, &self.key)
            .verify(message, signature)
            .is_ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnchorError {
    #[error("trust anchor is not valid base64url: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("trust anchor must be a 32 byte ed25519 key, got {0} bytes")]
    KeyLength(usize),
    #[error("failed to read jwks document: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse jwks document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("jwks document contains no ed25519 keys")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    x: Option<String>,
}

/// Parse the OKP/Ed25519 entries of a JWKS document. Other key types are skipped.
pub fn anchors_from_jwks(document: &str) -> Result<Vec<TrustAnchor>, AnchorError> {
    let jwks: Jwks = serde_json::from_str(document)?;
    let mut anchors = Vec::new();
    for jwk in jwks.keys {
        if jwk.kty != "OKP" || jwk.crv.as_deref() != Some("Ed25519") {
            continue;
        }
        if let Some(x) = jwk.x.as_deref() {
            anchors.push(TrustAnchor::from_encoded(jwk.kid.clone(), x)?);
        }
    }
    if anchors.is_empty() {
        return Err(AnchorError::Empty);
    }
    Ok(anchors)
}

pub fn anchors_from_jwks_file(path: &Path) -> Result<Vec<TrustAnchor>, AnchorError> {
    let document = std::fs::read_to_string(path)?;
    anchors_from_jwks(&document)
}

#[derive(Debug, Deserialize)]
struct JwtHeaderParts {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    nbf: Option<i64>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    wascap: Option<CapabilityClaims>,
}

#[derive(Debug, Deserialize)]
struct CapabilityClaims {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    prov: Option<bool>,
    #[serde(default)]
    provider: Option<Value>,
    #[serde(default)]
    component: Option<Value>,
}

/// Verifies caller tokens against a fixed set of trust anchors.
///
/// Validation is purely local: no key fetches and no retries happen on the
/// request path.
#[derive(Debug, Clone)]
pub struct IdentityValidator {
    anchors: Vec<TrustAnchor>,
    clock_skew: Duration,
}

impl IdentityValidator {
    pub fn new(anchors: Vec<TrustAnchor>) -> Self {
        Self {
            anchors,
            clock_skew: Duration::ZERO,
        }
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    pub fn anchors(&self) -> &[TrustAnchor] {
        &self.anchors
    }

    pub fn validate(&self, token: &str) -> Result<CallerIdentity, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_secs() as i64;
        self.validate_at(token, now)
    }

    /// Validate against an explicit clock (unix seconds).
    pub fn validate_at(&self, token: &str, now: i64) -> Result<CallerIdentity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::malformed("empty token"));
        }

        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 {
            return Err(AuthError::malformed("token must have three segments"));
        }

        let header_bytes = URL_SAFE_NO_PAD
            .decode(segments[0].as_bytes())
            .map_err(|_| AuthError::malformed("invalid token header encoding"))?;
        let header: JwtHeaderParts = serde_json::from_slice(&header_bytes)
            .map_err(|_| AuthError::malformed("invalid token header"))?;
        if header.alg != "EdDSA" && header.alg != "Ed25519" {
            return Err(AuthError::malformed(format!(
                "unsupported signing algorithm {}",
                header.alg
            )));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(segments[2].as_bytes())
            .map_err(|_| AuthError::malformed("invalid token signature encoding"))?;
        let payload_bytes = URL_SAFE_NO_PAD
            .decode(segments[1].as_bytes())
            .map_err(|_| AuthError::malformed("invalid token payload encoding"))?;
        let claims: Claims = serde_json::from_slice(&payload_bytes)
            .map_err(|_| AuthError::malformed("invalid token payload"))?;

        let signing_input = format!(
            "{header}.{payload}",
            header = segments[0],
            payload = segments[1]
        );
        self.verify_signature(header.kid.as_deref(), signing_input.as_bytes(), &signature)?;

        let subject_id = claims
            .sub
            .clone()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AuthError::malformed("token missing subject"))?;
        let issued_at = claims
            .iat
            .ok_or_else(|| AuthError::malformed("token missing iat"))?;
        let expiry = claims
            .exp
            .ok_or_else(|| AuthError::malformed("token missing exp"))?;

        let skew = self.clock_skew.as_secs() as i64;
        if now < issued_at.saturating_sub(skew) || now >= expiry.saturating_add(skew) {
            return Err(AuthError::Expired);
        }
        if let Some(not_before) = claims.nbf {
            if now < not_before.saturating_sub(skew) {
                return Err(AuthError::Expired);
            }
        }

        let kind = classify(&claims)?;
        debug!(subject = %subject_id, kind = kind.as_str(), "caller token accepted");

        Ok(CallerIdentity {
            subject_id,
            kind,
            expiry,
            name: claims.wascap.and_then(|caps| caps.name),
        })
    }

    fn verify_signature(
        &self,
        kid: Option<&str>,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), AuthError> {
        let named = kid.and_then(|kid| {
            self.anchors
                .iter()
                .find(|anchor| anchor.kid.as_deref() == Some(kid))
        });
        let verified = match named {
            Some(anchor) => anchor.verify(message, signature),
            None => self
                .anchors
                .iter()
                .any(|anchor| anchor.verify(message, signature)),
        };
        if verified {
            Ok(())
        } else {
            Err(AuthError::BadSignature)
        }
    }
}

fn classify(claims: &Claims) -> Result<CallerKind, AuthError> {
    if let Some(caps) = &claims.wascap {
        match caps.prov {
            Some(true) => return Ok(CallerKind::Provider),
            Some(false) => return Ok(CallerKind::Component),
            None => {}
        }
        match (caps.provider.is_some(), caps.component.is_some()) {
            (true, false) => return Ok(CallerKind::Provider),
            (false, true) => return Ok(CallerKind::Component),
            _ => {}
        }
    }
    claims
        .kind
        .as_deref()
        .and_then(|kind| kind.parse().ok())
        .ok_or(AuthError::UnknownKind)
}

fn decode_ed25519_key(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(value.as_bytes())
}
