//! Ed25519 request signing
//!
//! The signed message is the SHA-256 digest of
//! [`SettlementRequest::canonical_bytes`]. The signer's key id travels in
//! request metadata under [`SIGNER_METADATA_KEY`].

use crate::{Error, Result, SettlementRequest};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Metadata key naming the signing key id
pub const SIGNER_METADATA_KEY: &str = "signer";

/// Digest that is actually signed
pub fn signing_digest(request: &SettlementRequest) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(request.canonical_bytes());
    hasher.finalize().into()
}

/// Holds one signing key
pub struct RequestSigner {
    key_id: String,
    signing_key: SigningKey,
}

impl RequestSigner {
    /// Create a signer from an existing key
    pub fn new(key_id: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            key_id: key_id.into(),
            signing_key,
        }
    }

    /// Create a signer with a fresh random key
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self::new(key_id, SigningKey::generate(&mut OsRng))
    }

    /// Load a signer from a hex-encoded 32-byte secret
    pub fn from_hex(key_id: impl Into<String>, secret_hex: &str) -> Result<Self> {
        let bytes = decode_key(secret_hex)?;
        Ok(Self::new(key_id, SigningKey::from_bytes(&bytes)))
    }

    /// Key id written into request metadata
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Public half of the key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign the request in place
    pub fn sign(&self, request: &mut SettlementRequest) {
        request
            .metadata
            .insert(SIGNER_METADATA_KEY.to_string(), self.key_id.clone());
        let signature = self.signing_key.sign(&signing_digest(request));
        request.signature = signature.to_bytes().to_vec();
    }
}

/// Known verifying keys by key id
#[derive(Debug, Clone, Default)]
pub struct SignerRegistry {
    keys: HashMap<String, VerifyingKey>,
}

impl SignerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from key id → hex public key pairs
    pub fn from_hex_map(entries: &HashMap<String, String>) -> Result<Self> {
        let mut registry = Self::new();
        for (key_id, public_hex) in entries {
            let bytes = decode_key(public_hex)?;
            registry.insert(key_id.clone(), VerifyingKey::from_bytes(&bytes)?);
        }
        Ok(registry)
    }

    /// Register a key
    pub fn insert(&mut self, key_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(key_id.into(), key);
    }

    /// Number of known keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are registered
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify the request's signature against its declared signer
    pub fn verify(&self, request: &SettlementRequest) -> Result<()> {
        let key_id = request
            .metadata
            .get(SIGNER_METADATA_KEY)
            .ok_or_else(|| Error::SignatureInvalid("missing signer".to_string()))?;
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| Error::SignatureInvalid(format!("unknown signer {}", key_id)))?;

        let bytes: [u8; 64] = request.signature.as_slice().try_into().map_err(|_| {
            Error::SignatureInvalid(format!(
                "expected 64 signature bytes, got {}",
                request.signature.len()
            ))
        })?;
        let signature = Signature::from_bytes(&bytes);

        key.verify(&signing_digest(request), &signature)?;
        Ok(())
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(encoded.trim())
        .map_err(|e| Error::SignatureInvalid(format!("bad key encoding: {}", e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::SignatureInvalid(format!("expected 32 key bytes, got {}", bytes.len())))
}
