//! Montana timechain core.
//!
//! A presence-based distributed timechain: a continuously running
//! hash-chain VDF anchors wall-clock time, signed heartbeats prove node
//! presence, blocks form a DAG ordered PHANTOM-style with k-cluster
//! coloring, and a headers-first sync protocol keeps peers converged on
//! the same ordered history. Finality is earned by VDF work observed
//! over a block, never by any single peer's claim.
//!
//! Layout:
//! - [`core`] — primitives, canonical codec, crypto, blocks,
//!   heartbeats, the VDF engine and accumulator, logging.
//! - [`consensus`] — PHANTOM DAG ordering and production eligibility.
//! - [`state`] — accounts, the apply/rollback state machine, storage.
//! - [`net`] — wire protocol, peers and headers-first sync.
//! - [`node`] — the mempool and the full node assembly.

pub mod consensus;
pub mod core;
pub mod net;
pub mod node;
pub mod state;

pub use crate::core::block::{Block, BlockHeader, Transaction};
pub use crate::core::crypto::{KeyStore, NodeKeys};
pub use crate::core::errors::{DecodeError, MontanaError, MontanaResult};
pub use crate::core::heartbeat::Heartbeat;
pub use crate::core::types::{Address, Clock, FinalityLevel, Hash, SystemClock};
pub use crate::core::vdf::{VdfCheckpoint, VdfEngine, VdfProof, VdfStatus};
pub use crate::core::vdf_accumulator::VdfAccumulator;
pub use crate::consensus::dag::PhantomDag;
pub use crate::node::full_node::{FullNode, NodeConfig, NodeStatus};
pub use crate::node::mempool::Mempool;
pub use crate::state::machine::StateMachine;
pub use crate::state::store::{BlockStore, Database, StateStore};
