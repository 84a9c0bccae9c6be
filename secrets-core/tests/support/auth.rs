use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use secrets_core::{IdentityValidator, TrustAnchor};
use serde::Serialize;

/// Mints capability tokens signed by a throwaway Ed25519 issuer.
pub struct TestAuth {
    encoding: EncodingKey,
    public_key: Vec<u8>,
}

impl TestAuth {
    pub fn new() -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("generate key");
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("keypair");
        let encoding_pem = encode_pem("PRIVATE KEY", pkcs8.as_ref());
        let encoding = EncodingKey::from_ed_pem(encoding_pem.as_bytes()).expect("encoding key");

        Self {
            encoding,
            public_key: keypair.public_key().as_ref().to_vec(),
        }
    }

    pub fn anchor(&self) -> TrustAnchor {
        TrustAnchor::new(None, self.public_key.clone()).expect("anchor")
    }

    pub fn validator(&self) -> IdentityValidator {
        IdentityValidator::new(vec![self.anchor()])
    }

    pub fn component_token(&self) -> String {
        self.token("MCOMPONENT", Some(false), 3600)
    }

    pub fn provider_token(&self) -> String {
        self.token("VPROVIDER", Some(true), 3600)
    }

    pub fn expired_token(&self) -> String {
        self.token("MCOMPONENT", Some(false), -60)
    }

    pub fn unclassified_token(&self) -> String {
        self.token("MSTRANGER", None, 3600)
    }

    pub fn token(&self, subject: &str, prov: Option<bool>, ttl_secs: i64) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_secs() as i64;
        let claims = TestClaims {
            sub: subject,
            iss: "ACCOUNTISSUER",
            iat: now.saturating_sub(120).min(now.saturating_add(ttl_secs) - 1),
            exp: now.saturating_add(ttl_secs),
            wascap: TestCapabilities {
                name: "test-caller",
                prov,
            },
        };
        encode(&Header::new(Algorithm::EdDSA), &claims, &self.encoding)
            .expect("failed to encode test token")
    }
}

#[derive(Serialize)]
struct TestClaims<'a> {
    sub: &'a str,
    iss: &'a str,
    iat: i64,
    exp: i64,
    wascap: TestCapabilities<'a>,
}

#[derive(Serialize)]
struct TestCapabilities<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prov: Option<bool>,
}

fn encode_pem(label: &str, der: &[u8]) -> String {
    let b64 = STANDARD.encode(der);
    let mut body = String::new();
    for chunk in b64.as_bytes().chunks(64) {
        body.push_str(std::str::from_utf8(chunk).expect("utf8"));
        body.push('\n');
    }
    format!("-----BEGIN {label}-----\n{body}-----END {label}-----\n")
}
