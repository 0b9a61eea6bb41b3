//! Fixed-width identifiers and shared enumerations.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const HASH_SIZE: usize = 32;

/// 32-byte opaque identifier. The zero hash is reserved for "absent".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_SIZE {
            return None;
        }
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(bytes);
        Some(Hash(out))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().and_then(|b| Self::from_slice(&b))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).ok_or_else(|| D::Error::custom("invalid hash hex"))
    }
}

/// 32-byte account identifier: the producer's Ed25519 public key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; HASH_SIZE]);

impl Address {
    pub const ZERO: Address = Address([0u8; HASH_SIZE]);

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_SIZE {
            return None;
        }
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(bytes);
        Some(Address(out))
    }

    /// First 32 bytes of the key's canonical serialization; Ed25519 keys
    /// are exactly 32 bytes, so the address is the key itself.
    pub fn from_public_key(public_key: &[u8]) -> Option<Self> {
        Self::from_slice(public_key.get(..HASH_SIZE)?)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().and_then(|b| Self::from_slice(&b))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).ok_or_else(|| D::Error::custom("invalid address hex"))
    }
}

/// Monotone classification of VDF work observed over a block's lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FinalityLevel {
    None = 0,
    Weak = 1,
    Strong = 2,
    Final = 3,
}

impl FinalityLevel {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FinalityLevel::None),
            1 => Some(FinalityLevel::Weak),
            2 => Some(FinalityLevel::Strong),
            3 => Some(FinalityLevel::Final),
            _ => None,
        }
    }
}

/// How an account's balance is revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivacyTier {
    Public = 0,
    Shielded = 1,
    Private = 2,
}

impl PrivacyTier {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PrivacyTier::Public),
            1 => Some(PrivacyTier::Shielded),
            2 => Some(PrivacyTier::Private),
            _ => None,
        }
    }
}

impl Default for PrivacyTier {
    fn default() -> Self {
        PrivacyTier::Public
    }
}

/// Wall-clock source, swappable for deterministic tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// System wall clock in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_ms()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
