//! Protocol constants. One set of values defines one Montana network.

// Network Identification
pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 19333;
pub const USER_AGENT: &str = concat!("montana-timechain/", env!("CARGO_PKG_VERSION"));

// Timechain Cadence
pub const BLOCK_TIME_TARGET_SEC: u64 = 52; // Timechain average block time
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000; // Presence attestation cadence
pub const GENESIS_TIMESTAMP_MS: u64 = 1_700_000_000_000;

// VDF Parameters
pub const VDF_CHECKPOINT_INTERVAL: u64 = 10_000; // Iterations per published segment
pub const VDF_SUBSTEP_ITERATIONS: u64 = 1_000; // Cancellation granularity inside a segment
pub const VDF_TARGET_ITERS_PER_SEC: u64 = 200_000; // Engine pacing target

// Finality Thresholds (cumulative VDF iterations observed over a block)
pub const T_WEAK: u64 = 100_000;
pub const T_STRONG: u64 = 500_000;
pub const T_FINAL: u64 = 2_000_000;

// DAG Ordering
pub const PHANTOM_K: u32 = 3; // Max non-blue blocks in a blue block's anti-cone
pub const MAX_PARENTS: usize = 8; // Bounded parent fan-in per block

// Block Production
pub const MAX_HEARTBEATS_PER_BLOCK: usize = 100;
pub const MAX_TX_PER_BLOCK: usize = 100;
pub const BASE_PROBABILITY: f64 = 0.05; // Eligibility per unit of score

// Participation Score
pub const SCORE_DECAY: f64 = 0.99;
pub const SCORE_HEARTBEAT_WEIGHT: f64 = 0.05;
pub const SCORE_CAP: f64 = 100.0;

// Transaction Policy
pub const MIN_TX_FEE: u64 = 1;
pub const MAX_TX_PAYLOAD: usize = 1024 * 1024;

// Mempool Bounds
pub const MAX_MEMPOOL_TX: usize = 5_000;
pub const MAX_MEMPOOL_BYTES: usize = 32 * 1024 * 1024;

// Synchronization
pub const MAX_BLOCKS_PER_REQUEST: usize = 500; // getdata items per peer per round
pub const IBD_BATCH_SIZE: usize = 128; // Outstanding block downloads across all peers
pub const MAX_ORPHAN_BLOCKS: usize = 100;
pub const MAX_PENDING_BLOCKS: usize = 1024;
pub const SYNC_REQUEST_TIMEOUT_SEC: u64 = 30;
pub const IDLE_GRACE_SEC: u64 = 10; // No-higher-peer window before caught_up
pub const STALL_THRESHOLD: u32 = 3; // Timed-out rounds before a peer is demoted

// Peer Management
pub const MAX_PEERS: usize = 125;
pub const HANDSHAKE_TIMEOUT_SEC: u64 = 10;
pub const PING_INTERVAL_SEC: u64 = 60;
pub const MAX_PEER_FAILURES: u32 = 5;
pub const BAN_DURATION_SECS: u64 = 3600;

// Wire Limits
pub const MESSAGE_SIZE_LIMIT: usize = 2 * 1024 * 1024; // Outer cap for any frame
pub const MAX_HEADERS_PER_MSG: usize = 2_000;
pub const MAX_INV_ITEMS: usize = 50_000;
pub const MAX_LOCATOR_HASHES: usize = 64;

// Performance Targets
pub const BLOCK_APPLY_TARGET_MS: u64 = 1_000;
pub const BLOCK_PRODUCE_TARGET_MS: u64 = 2_000;

// Storage
pub const BLOCK_CACHE_SIZE: usize = 256; // Decoded blocks kept in memory
