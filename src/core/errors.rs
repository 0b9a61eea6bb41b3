//! Error taxonomy for the timechain core.
//!
//! Errors are plain values. Task boundaries log them and translate them
//! into peer-level actions; nothing in the core panics on bad input.

use thiserror::Error;

use crate::core::types::Hash;

/// Failures while decoding canonical or wire bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated input: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("invalid length {length} (limit {limit})")]
    InvalidLength { length: usize, limit: usize },

    #[error("invalid variant tag {tag} for {kind}")]
    InvalidVariant { kind: &'static str, tag: u8 },

    #[error("trailing bytes: {0} left after decode")]
    TrailingBytes(usize),
}

/// Top-level error type shared across subsystems.
#[derive(Error, Debug)]
pub enum MontanaError {
    // Decode
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    // Validation
    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: Hash, got: Hash },

    #[error("merkle root mismatch for {kind}")]
    MerkleMismatch { kind: &'static str },

    #[error("VDF proof rejected: {reason}")]
    BadVdfProof { reason: &'static str },

    #[error("nonce mismatch: expected {expected}, got {got}")]
    NonceMismatch { expected: u64, got: u64 },

    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: u64, required: u64 },

    #[error("fee {fee} below minimum {minimum}")]
    FeeTooLow { fee: u64, minimum: u64 },

    #[error("unknown parent {0}")]
    UnknownParent(Hash),

    #[error("invalid height {got} (expected {expected})")]
    BadHeight { expected: u64, got: u64 },

    #[error("block {0} is recorded invalid")]
    KnownInvalid(Hash),

    #[error("heartbeat chain link broken for {node}")]
    BrokenHeartbeatChain { node: Hash },

    #[error("state root mismatch: header {header}, computed {computed}")]
    StateRootMismatch { header: Hash, computed: Hash },

    #[error("structural validation failed: {0}")]
    BadStructure(&'static str),

    // Storage
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted record: {0}")]
    Corruption(String),

    // Network
    #[error("operation timed out: {0}")]
    Timeout(&'static str),

    #[error("peer is banned")]
    PeerBanned,

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("self connection detected")]
    SelfConnection,

    #[error("peer protocol version {0} too old")]
    VersionTooOld(u32),

    // Mempool
    #[error("mempool full")]
    MempoolFull,

    #[error("duplicate transaction for (sender, nonce)")]
    DuplicateTx,

    // Crypto plumbing
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
}

/// Helper alias for fallible core operations.
pub type MontanaResult<T> = std::result::Result<T, MontanaError>;

impl MontanaError {
    /// Whether the origin peer should be penalised for this error.
    /// Transient local conditions (I/O, timeouts, pool limits) are not
    /// the peer's fault.
    pub fn is_peer_fault(&self) -> bool {
        !matches!(
            self,
            MontanaError::Io(_)
                | MontanaError::Timeout(_)
                | MontanaError::MempoolFull
                | MontanaError::Corruption(_)
        )
    }
}
