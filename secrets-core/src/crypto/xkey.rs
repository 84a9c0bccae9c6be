//! X25519 key agreement and XChaCha20-Poly1305 sealing for bus messages.
//!
//! Both ends derive the symmetric key as
//! `HKDF-SHA256(ikm = X25519(own, peer), salt = caller_pub || service_pub)`,
//! so a shared secret is bound to the exact pair of public keys that produced it.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::crypto::plaintext;
use crate::errors::CryptoError;
use crate::types::{RequestEnvelope, ResponseEnvelope, ResponsePayload, SecretQuery};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

const HKDF_INFO: &[u8] = b"xkey-secrets/v1 request key";

/// Long-lived service key pair. The private half never leaves this struct.
pub struct ServiceKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl ServiceKeyPair {
    pub fn generate() -> Self {
        Self::from_secret(random_key())
    }

    /// Rebuild a key pair from a pinned 32-byte private key.
    pub fn from_secret(bytes: Zeroizing<[u8; KEY_LEN]>) -> Self {
        let secret = StaticSecret::from(*bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.public.to_bytes()
    }

    /// Standard base64 rendering served on the `server_xkey` subject.
    pub fn public_key_encoded(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    pub fn derive_shared_secret(&self, caller_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        let caller = parse_public_key(caller_public)?;
        let raw = agree(&self.secret, &caller)?;
        SharedSecret::expand(&raw, caller.as_bytes(), self.public.as_bytes())
    }
}

impl fmt::Debug for ServiceKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceKeyPair")
            .field("public", &self.public_key_encoded())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Per-request key pair held by the calling side.
pub struct CallerKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl CallerKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::from(*random_key());
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn derive_shared_secret(&self, service_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        let service = parse_public_key(service_public)?;
        let raw = agree(&self.secret, &service)?;
        SharedSecret::expand(&raw, self.public.as_bytes(), service.as_bytes())
    }
}

/// Symmetric key for one request. Zeroed when dropped.
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl SharedSecret {
    fn expand(
        raw: &x25519_dalek::SharedSecret,
        caller_public: &[u8; KEY_LEN],
        service_public: &[u8; KEY_LEN],
    ) -> Result<Self, CryptoError> {
        let mut salt = [0u8; KEY_LEN * 2];
        salt[..KEY_LEN].copy_from_slice(caller_public);
        salt[KEY_LEN..].copy_from_slice(service_public);

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), raw.as_bytes());
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        hkdf.expand(HKDF_INFO, &mut key[..])
            .map_err(|_| CryptoError::InvalidPeerKey)?;
        Ok(Self { key })
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key[..]))
    }

    /// Encrypt under a fresh random nonce, returning `(nonce, ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let mut nonce = vec![0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok((nonce, ciphertext))
    }

    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        self.cipher()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

pub fn derive_shared_secret(
    keys: &ServiceKeyPair,
    caller_public: &[u8],
) -> Result<SharedSecret, CryptoError> {
    keys.derive_shared_secret(caller_public)
}

/// Open a request payload. Every failure, including a plaintext that is not a
/// query, reports as [`CryptoError::DecryptionFailed`].
pub fn decrypt(
    shared: &SharedSecret,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<SecretQuery, CryptoError> {
    let plaintext = shared.open(nonce, ciphertext)?;
    serde_json::from_slice(&plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

pub fn encrypt(shared: &SharedSecret, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    shared.seal(plaintext)
}

pub fn public_key(keys: &ServiceKeyPair) -> [u8; KEY_LEN] {
    keys.public_key()
}

/// Client half of the exchange: one ephemeral key pair bound to one service key.
pub struct CallerSession {
    keys: CallerKeyPair,
    shared: SharedSecret,
}

impl CallerSession {
    pub fn new(service_public: &[u8]) -> Result<Self, CryptoError> {
        let keys = CallerKeyPair::generate();
        let shared = keys.derive_shared_secret(service_public)?;
        Ok(Self { keys, shared })
    }

    /// Accepts the base64 text served on the `server_xkey` subject.
    pub fn from_encoded(service_public: &str) -> Result<Self, CryptoError> {
        let raw = STANDARD
            .decode(service_public.trim().as_bytes())
            .map_err(|_| CryptoError::InvalidPeerKey)?;
        Self::new(&raw)
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.keys.public_key()
    }

    pub fn seal_request(
        &self,
        query: &SecretQuery,
        token: &str,
    ) -> Result<RequestEnvelope, CryptoError> {
        let plaintext = plaintext::to_json(query).map_err(|_| CryptoError::EncryptionFailed)?;
        let (nonce, ciphertext) = self.shared.seal(&plaintext)?;
        Ok(RequestEnvelope {
            caller_public_key: self.public_key().to_vec(),
            nonce,
            ciphertext,
            token: token.to_owned(),
        })
    }

    pub fn open_response(&self, envelope: &ResponseEnvelope) -> Result<ResponsePayload, CryptoError> {
        let plaintext = self.shared.open(&envelope.nonce, &envelope.ciphertext)?;
        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidPeerKey)?;
    Ok(PublicKey::from(raw))
}

fn agree(
    secret: &StaticSecret,
    peer: &PublicKey,
) -> Result<x25519_dalek::SharedSecret, CryptoError> {
    let shared = secret.diffie_hellman(peer);
    // Small-order points force an all-zero output.
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPeerKey);
    }
    Ok(shared)
}

fn random_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    rand::rng().fill_bytes(&mut bytes[..]);
    bytes
}
