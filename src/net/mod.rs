//! Peer-to-peer networking: wire framing, messages, peer lifecycle and
//! headers-first synchronization.

pub mod messages;
pub mod peer;
pub mod protocol;
pub mod sync;
