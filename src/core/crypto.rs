//! Hashing, signatures and the VRF construction.
//!
//! SHA-256 is the consensus hash: block hashes, Merkle trees and the VDF
//! chain all use it. BLAKE3 and SHA3-256 serve non-consensus paths (fast
//! record digests, domain-separated entropy mixing).

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use hmac::{Hmac, Mac, NewMac};
use sha2::{Digest, Sha256};
use sha3::Sha3_256;

use crate::core::errors::{MontanaError, MontanaResult};
use crate::core::types::{Address, Hash};

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Compute SHA-256 hash of data.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// SHA-256 over the concatenation of several slices, without an
/// intermediate allocation.
pub fn sha256_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash(hasher.finalize().into())
}

/// Fast non-consensus hash.
pub fn blake3_hash(data: &[u8]) -> Hash {
    Hash(blake3::hash(data).into())
}

/// SHA3-256 for entropy mixing, kept distinct from the consensus hash.
pub fn sha3_256(data: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Verify an Ed25519 signature. Returns Ok(false) on a well-formed but
/// wrong signature, Err on malformed key or signature bytes.
pub fn verify_signature(public_key: &[u8], data: &[u8], signature: &[u8]) -> MontanaResult<bool> {
    if public_key.len() != PUBLIC_KEY_SIZE {
        return Err(MontanaError::Crypto(format!(
            "invalid public key size {}",
            public_key.len()
        )));
    }
    if signature.len() != SIGNATURE_SIZE {
        return Err(MontanaError::Crypto(format!(
            "invalid signature size {}",
            signature.len()
        )));
    }

    let public_key = PublicKey::from_bytes(public_key)
        .map_err(|e| MontanaError::Crypto(format!("invalid public key: {}", e)))?;
    let signature = Signature::from_bytes(signature)
        .map_err(|e| MontanaError::Crypto(format!("invalid signature: {}", e)))?;

    Ok(public_key.verify(data, &signature).is_ok())
}

/// Generate a random u64 nonce from OS randomness.
pub fn random_nonce() -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).unwrap_or_default();
    u64::from_be_bytes(bytes)
}

/// Combine OS randomness, time, process identity and caller context
/// into 32 bytes. SHA3 keeps this domain separate from the consensus
/// hash.
pub fn generate_secure_entropy(additional: &[u8]) -> [u8; 32] {
    let mut entropy = Vec::new();
    entropy.extend_from_slice(&crate::core::types::now_ms().to_be_bytes());

    let mut system_random = [0u8; 32];
    getrandom::getrandom(&mut system_random).unwrap_or_default();
    entropy.extend_from_slice(&system_random);

    entropy.extend_from_slice(&std::process::id().to_be_bytes());
    entropy.extend_from_slice(additional);

    sha3_256(&entropy).0
}

/// Key material and signing operations a node needs to participate.
pub trait KeyStore: Send + Sync {
    fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE];
    fn address(&self) -> Address;
    fn sign(&self, data: &[u8]) -> Vec<u8>;
    /// Keyed pseudo-random evaluation over `input`, publicly bound to
    /// this node's key through its heartbeat chain.
    fn vrf(&self, input: &[u8]) -> Hash;
}

/// Ed25519 node keys. Signing is deterministic, so re-signing identical
/// bytes yields identical signatures.
pub struct NodeKeys {
    keypair: Keypair,
}

impl NodeKeys {
    pub fn generate() -> Self {
        Self::from_secret_bytes(&generate_secure_entropy(b"montana-node-key"))
            .expect("fresh entropy is a valid secret")
    }

    pub fn from_secret_bytes(secret: &[u8]) -> MontanaResult<Self> {
        if secret.len() != SECRET_KEY_SIZE {
            return Err(MontanaError::Crypto(format!(
                "invalid secret key size {}",
                secret.len()
            )));
        }
        let secret_key = SecretKey::from_bytes(secret)
            .map_err(|e| MontanaError::Crypto(format!("invalid secret key: {}", e)))?;
        let public_key = PublicKey::from(&secret_key);
        Ok(NodeKeys {
            keypair: Keypair {
                secret: secret_key,
                public: public_key,
            },
        })
    }

    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.keypair.secret.to_bytes()
    }
}

impl KeyStore for NodeKeys {
    fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.keypair.public.to_bytes()
    }

    fn address(&self) -> Address {
        Address(self.keypair.public.to_bytes())
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.keypair.sign(data).to_bytes().to_vec()
    }

    fn vrf(&self, input: &[u8]) -> Hash {
        vrf_evaluate(&self.secret_bytes(), input)
    }
}

/// HMAC-SHA256 keyed evaluation used as the VRF. The output is a keyed
/// commitment to `input`; the eligibility filter only consumes its 8-byte
/// prefix, so a stronger VRF scheme can be substituted without touching
/// callers.
pub fn vrf_evaluate(secret: &[u8], input: &[u8]) -> Hash {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_varkey(secret).expect("HMAC can take key of any size");
    mac.update(b"montana-vrf");
    mac.update(input);

    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    Hash(out)
}
