//! Full node assembly.
//!
//! Wires the VDF engine, DAG, state machine, block store, mempool, peer
//! manager and sync manager together and runs the long-lived loops:
//! checkpoint consumption, heartbeat generation, block production, sync
//! housekeeping, peer maintenance and the TCP accept loop. Tasks talk
//! through channels and per-subsystem locks; none of them holds two
//! subsystem locks at once except where noted (sync -> store and
//! state -> store reads).

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::consensus::dag::PhantomDag;
use crate::consensus::eligibility::EligibilityFilter;
use crate::core::block::{Block, BlockHeader, Transaction};
use crate::core::constants::{
    BLOCK_APPLY_TARGET_MS, BLOCK_PRODUCE_TARGET_MS, BLOCK_TIME_TARGET_SEC, DEFAULT_PORT,
    HEARTBEAT_INTERVAL_MS, MAX_HEARTBEATS_PER_BLOCK, MAX_HEADERS_PER_MSG, MAX_PARENTS,
    MAX_TX_PER_BLOCK, PHANTOM_K, PING_INTERVAL_SEC, PROTOCOL_VERSION, USER_AGENT,
};
use crate::core::crypto::{KeyStore, NodeKeys};
use crate::core::errors::{MontanaError, MontanaResult};
use crate::core::heartbeat::Heartbeat;
use crate::core::logging::{
    init_logger, log_block_applied, log_finality, log_sync_progress, OpTimer,
};
use crate::core::types::{Address, Clock, FinalityLevel, Hash, SystemClock};
use crate::core::vdf::{VdfCheckpoint, VdfEngine, VdfStatus};
use crate::core::vdf_accumulator::VdfAccumulator;
use crate::net::messages::{GetHeadersMsg, HeadersMsg, InvItem, InventoryMsg, NetMessage};
use crate::net::peer::{Peer, PeerManager, PeerState};
use crate::net::protocol::{read_frame, services, InvType};
use crate::net::sync::{BlockSource, PeerView, SyncManager};
use crate::node::mempool::Mempool;
use crate::state::machine::StateMachine;
use crate::state::store::{BlockStore, Database, StateStore};

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub port: u16,
    pub bootstrap: Vec<SocketAddr>,
    pub enable_mining: bool,
    /// Balances credited before any block applies; fixed per network.
    pub genesis_alloc: Vec<(Address, u64)>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("./montana_data"),
            port: DEFAULT_PORT,
            bootstrap: Vec::new(),
            enable_mining: true,
            genesis_alloc: Vec::new(),
        }
    }
}

/// Operator-facing status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: Address,
    pub height: u64,
    pub best_block: Hash,
    pub peers: usize,
    pub mempool_len: usize,
    pub vdf_iterations: u64,
    pub sync_state: String,
}

/// Result of feeding one block through store, DAG and state machine.
#[derive(Debug, Default)]
pub struct AcceptOutcome {
    /// False when the block was already present.
    pub accepted: bool,
    /// Blocks newly applied to state (reorgs can apply several).
    pub newly_applied: Vec<Hash>,
}

/// Shared subsystems behind per-subsystem locks.
///
/// Lock discipline: `sync` and `state` may take `store` reads while
/// held; nothing takes any other lock while holding `store`, `dag` or
/// `mempool`.
pub struct NodeCore {
    pub keys: Arc<NodeKeys>,
    pub clock: Arc<dyn Clock>,
    store: RwLock<BlockStore>,
    state: RwLock<StateMachine>,
    dag: RwLock<PhantomDag>,
    accumulator: RwLock<VdfAccumulator>,
    mempool: Mutex<Mempool>,
    sync: Mutex<SyncManager>,
    peers: PeerManager,
    state_store: StateStore,
    vdf: Mutex<VdfEngine>,
    pending_heartbeats: Mutex<VecDeque<Heartbeat>>,
    last_heartbeat: Mutex<Hash>,
    eligibility: EligibilityFilter,
    enable_mining: bool,
    genesis_alloc: Vec<(Address, u64)>,
}

impl BlockSource for NodeCore {
    fn best_height(&self) -> u64 {
        self.store.read().unwrap().height()
    }

    fn has_block(&self, hash: &Hash) -> bool {
        self.store.read().unwrap().contains(hash)
    }

    fn get_block(&self, hash: &Hash) -> Option<Block> {
        self.store.read().unwrap().get(hash).ok().flatten()
    }

    fn get_header(&self, hash: &Hash) -> Option<BlockHeader> {
        self.store.read().unwrap().get_header(hash).ok().flatten()
    }

    /// Tip-first locator walking back with doubling gaps, ending at
    /// genesis.
    fn locator(&self) -> Vec<Hash> {
        let store = self.store.read().unwrap();
        let mut locators = Vec::new();
        let top = store.height();
        let mut step = 1u64;
        let mut height = top;
        loop {
            if let Some(hash) = store.hashes_at_height(height).first() {
                locators.push(*hash);
            }
            if height == 0 {
                break;
            }
            height = height.saturating_sub(step);
            if locators.len() > 8 {
                step *= 2;
            }
        }
        let genesis = Block::genesis().hash();
        if locators.last() != Some(&genesis) {
            locators.push(genesis);
        }
        locators
    }
}

impl NodeCore {
    pub fn node_id(&self) -> Address {
        self.keys.address()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id(),
            height: self.store.read().unwrap().height(),
            best_block: self
                .state
                .read()
                .unwrap()
                .best_block()
                .unwrap_or_else(|| Block::genesis().hash()),
            peers: self.peers.peer_count(),
            mempool_len: self.mempool.lock().unwrap().len(),
            vdf_iterations: self.vdf.lock().unwrap().status().total_iterations,
            sync_state: self.sync.lock().unwrap().status_json(),
        }
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn state_root(&self) -> Hash {
        self.state.read().unwrap().state_root()
    }

    pub fn vdf_status(&self) -> VdfStatus {
        self.vdf.lock().unwrap().status()
    }

    /// Feed a block through structural checks, proof verification, the
    /// store, the DAG and the state machine. Returns how much of the
    /// order it ended up applying; errors leave persistent state
    /// untouched except for recorded invalidity.
    pub fn accept_block(&self, block: &Block) -> MontanaResult<AcceptOutcome> {
        let timer = OpTimer::start("block accept");
        block.validate_structure()?;
        let hash = block.hash();

        if self.dag.read().unwrap().is_invalid(&hash) {
            return Err(MontanaError::KnownInvalid(hash));
        }

        // CPU-heavy proof checks run before any lock is taken.
        if let Some(err) = block
            .heartbeats
            .par_iter()
            .find_map_any(|hb| hb.verify().err())
        {
            return Err(err);
        }
        if let Some(err) = block
            .transactions
            .par_iter()
            .find_map_any(|tx| tx.verify_signature().err())
        {
            return Err(err);
        }

        // Parent existence and VDF monotonicity against the store.
        if !block.header.is_genesis() {
            let store = self.store.read().unwrap();
            let mut max_parent_iters = 0u64;
            for parent in &block.header.parents {
                let header = store
                    .get_header(parent)?
                    .ok_or(MontanaError::UnknownParent(*parent))?;
                max_parent_iters = max_parent_iters.max(header.vdf_iterations);
            }
            if block.header.vdf_iterations <= max_parent_iters {
                return Err(MontanaError::ProtocolViolation(
                    "vdf iterations not increasing",
                ));
            }
        }

        {
            let mut store = self.store.write().unwrap();
            if !store.add(block)? {
                return Ok(AcceptOutcome {
                    accepted: false,
                    newly_applied: Vec::new(),
                });
            }
        }

        {
            let mut dag = self.dag.write().unwrap();
            if let Err(e) = dag.insert(hash, &block.header.parents, block.header.height) {
                dag.mark_invalid(&hash);
                return Err(e);
            }
        }

        // The header's state root commits to the block's own branch:
        // replay its past and require the commitment to hold there.
        if let Err(e) = self.verify_branch_root(block) {
            self.dag.write().unwrap().mark_invalid(&hash);
            let _ = self.reconcile_order();
            return Err(e);
        }

        let newly_applied = self.reconcile_order()?;
        if self.dag.read().unwrap().is_invalid(&hash) {
            return Err(MontanaError::KnownInvalid(hash));
        }

        // Mempool observes every newly applied block.
        let applied_blocks: Vec<Block> = {
            let store = self.store.read().unwrap();
            newly_applied
                .iter()
                .filter_map(|h| store.get(h).ok().flatten())
                .collect()
        };
        {
            let mut pool = self.mempool.lock().unwrap();
            for applied in &applied_blocks {
                pool.on_block_applied(applied);
            }
        }
        for applied in &applied_blocks {
            log_block_applied(
                &applied.hash(),
                applied.height(),
                applied.heartbeats.len(),
                applied.transactions.len(),
            );
        }

        self.persist_state()?;
        timer.finish(BLOCK_APPLY_TARGET_MS);
        Ok(AcceptOutcome {
            accepted: true,
            newly_applied,
        })
    }

    /// Replay a block's past in branch order and check its state root
    /// commitment against that context.
    fn verify_branch_root(&self, block: &Block) -> MontanaResult<()> {
        let hash = block.hash();
        let branch = {
            let dag = self.dag.read().unwrap();
            dag.branch_order(&hash)
        };
        let genesis_hash = Block::genesis().hash();

        let mut scratch = StateMachine::new();
        for (address, amount) in &self.genesis_alloc {
            scratch.credit(address, *amount);
        }
        for ancestor in &branch {
            if *ancestor == genesis_hash {
                continue;
            }
            let ancestor_block = self
                .store
                .read()
                .unwrap()
                .get(ancestor)?
                .ok_or_else(|| {
                    MontanaError::Corruption(format!("branch block {} missing", ancestor))
                })?;
            scratch.apply_for_ledger(&ancestor_block).map_err(|e| {
                MontanaError::Corruption(format!("branch replay of {} failed: {}", ancestor, e))
            })?;
        }
        scratch.apply_block(block)?;
        Ok(())
    }

    /// Re-align the state machine with the DAG's canonical order,
    /// marking blocks that fail application invalid and retrying until
    /// the order is clean.
    fn reconcile_order(&self) -> MontanaResult<Vec<Hash>> {
        let mut newly_applied = Vec::new();
        loop {
            let order: Vec<Hash> = {
                let dag = self.dag.read().unwrap();
                dag.ordered().iter().skip(1).copied().collect()
            };
            let fetch = |h: &Hash| -> Option<Block> {
                self.store.read().unwrap().get(h).ok().flatten()
            };
            let result = {
                let mut state = self.state.write().unwrap();
                state.sync_to_order(&order, &fetch)
            };
            match result {
                Ok(outcome) => {
                    newly_applied.extend(outcome.applied);
                    return Ok(newly_applied);
                }
                Err(failure) => {
                    newly_applied.extend(failure.outcome.applied.iter().copied());
                    if failure.hash.is_zero() {
                        return Err(failure.error);
                    }
                    warn!(
                        "block {} failed application ({}); marking invalid",
                        failure.hash.short(),
                        failure.error
                    );
                    self.dag.write().unwrap().mark_invalid(&failure.hash);
                }
            }
        }
    }

    fn persist_state(&self) -> MontanaResult<()> {
        let best = {
            let state = self.state.read().unwrap();
            self.state_store.write_accounts(state.accounts())?;
            state.best_block().unwrap_or_else(|| Block::genesis().hash())
        };
        let snapshot = self.accumulator.read().unwrap().snapshot();
        self.state_store.write_state(&best, &snapshot)
    }

    /// One checkpoint from the engine: credit the best block and advance
    /// the stable boundary when finality allows.
    fn observe_checkpoint(&self, checkpoint: &VdfCheckpoint) {
        let best = {
            let state = self.state.read().unwrap();
            state.best_block().unwrap_or_else(|| Block::genesis().hash())
        };
        let (before, after, iterations) = {
            let mut acc = self.accumulator.write().unwrap();
            let before = acc.level_of(&best);
            let after = acc.observe(best, checkpoint.segment_iterations);
            (before, after, acc.iterations_of(&best))
        };
        if after > before {
            log_finality(&best, after, iterations);
            if after >= FinalityLevel::Strong {
                self.state.write().unwrap().mark_stable(&best);
            }
        }
        if let Err(e) = self.persist_state() {
            error!("failed to persist accumulator state: {}", e);
        }
    }

    /// Enqueue a freshly signed heartbeat for the next produced block.
    fn generate_heartbeat(&self) {
        let status = self.vdf_status();
        let prev = *self.last_heartbeat.lock().unwrap();
        let hb = match Heartbeat::create(self.keys.as_ref(), prev, &status) {
            Some(hb) => hb,
            None => return, // engine has not completed a segment yet
        };
        let hash = hb.hash();
        let mut pending = self.pending_heartbeats.lock().unwrap();
        pending.push_back(hb);
        while pending.len() > MAX_HEARTBEATS_PER_BLOCK * 4 {
            pending.pop_front();
        }
        *self.last_heartbeat.lock().unwrap() = hash;
        debug!("generated heartbeat {}", hash.short());
    }

    /// Production-eligibility score: the account's participation score,
    /// or the bootstrap floor for nodes with no history yet.
    fn own_score(&self) -> f64 {
        self.state
            .read()
            .unwrap()
            .accounts()
            .get(&self.node_id())
            .map(|a| a.score)
            .filter(|s| *s > 0.0)
            .unwrap_or(1.0)
    }

    /// Assemble, sign, apply and announce one block. Returns the block
    /// hash, or None when there is nothing eligible to do.
    pub fn produce_block(&self, vdf: &VdfStatus) -> MontanaResult<Option<Hash>> {
        let checkpoint = match &vdf.last_checkpoint {
            Some(c) => c.clone(),
            None => return Ok(None),
        };
        let timer = OpTimer::start("block production");

        let (parents, height) = {
            let dag = self.dag.read().unwrap();
            let tips: Vec<Hash> = dag.tips().into_iter().take(MAX_PARENTS).collect();
            let height = 1 + tips
                .iter()
                .filter_map(|t| dag.get(t).map(|n| n.height))
                .max()
                .unwrap_or(0);
            (tips, height)
        };

        let heartbeats: Vec<Heartbeat> = {
            let mut pending = self.pending_heartbeats.lock().unwrap();
            let take = pending.len().min(MAX_HEARTBEATS_PER_BLOCK);
            pending.drain(..take).collect()
        };

        let transactions: Vec<Transaction> = {
            let accounts = self.state.read().unwrap().accounts().clone();
            self.mempool
                .lock()
                .unwrap()
                .select(MAX_TX_PER_BLOCK, &accounts)
        };

        let mut block = Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                producer_id: self.node_id(),
                parents,
                height,
                timestamp_ms: self.clock.now_ms(),
                vdf_output: checkpoint.output,
                vdf_iterations: checkpoint.total_iterations,
                heartbeat_root: Hash::ZERO,
                tx_root: Hash::ZERO,
                state_root: Hash::ZERO,
                signature: Vec::new(),
            },
            heartbeats,
            transactions,
        };
        block.header.heartbeat_root = block.compute_heartbeat_root();
        block.header.tx_root = block.compute_tx_root();

        let root = {
            let state = self.state.read().unwrap();
            state.preview_root(&block)
        };
        let root = match root {
            Ok(root) => root,
            Err(e) => {
                self.restore_heartbeats(&block.heartbeats);
                return Err(e);
            }
        };
        block.header.state_root = root;
        block.header.sign(self.keys.as_ref());

        match self.accept_block(&block) {
            Ok(outcome) if outcome.accepted => {
                let hash = block.hash();
                info!(
                    "produced block {} at height {} ({} heartbeats, {} txs)",
                    hash.short(),
                    height,
                    block.heartbeats.len(),
                    block.transactions.len()
                );
                self.announce_block(&hash);
                {
                    let mut sync = self.sync.lock().unwrap();
                    sync.on_block_connected(&hash, self);
                }
                timer.finish(BLOCK_PRODUCE_TARGET_MS);
                Ok(Some(hash))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                self.restore_heartbeats(&block.heartbeats);
                Err(e)
            }
        }
    }

    fn restore_heartbeats(&self, heartbeats: &[Heartbeat]) {
        let mut pending = self.pending_heartbeats.lock().unwrap();
        for hb in heartbeats.iter().rev() {
            pending.push_front(hb.clone());
        }
    }

    fn announce_block(&self, hash: &Hash) {
        self.peers.broadcast(&NetMessage::Inv(InventoryMsg {
            items: vec![InvItem::block(*hash)],
        }));
    }

    fn announce_transaction(&self, hash: &Hash) {
        self.peers.broadcast(&NetMessage::Inv(InventoryMsg {
            items: vec![InvItem::transaction(*hash)],
        }));
    }

    /// Serve a getheaders request from the archive, walking height order
    /// from the best locator match.
    fn serve_headers(&self, req: &GetHeadersMsg) -> HeadersMsg {
        let store = self.store.read().unwrap();
        let mut from_height = 0u64;
        for locator in &req.locators {
            if let Ok(Some(header)) = store.get_header(locator) {
                from_height = header.height;
                break;
            }
        }

        let mut headers = Vec::new();
        'walk: for hash in store.hashes_in_height_order() {
            match store.get_header(&hash) {
                Ok(Some(header)) => {
                    if header.height <= from_height || header.is_genesis() {
                        continue;
                    }
                    headers.push(header);
                    if headers.len() >= MAX_HEADERS_PER_MSG || hash == req.stop {
                        break 'walk;
                    }
                }
                _ => continue,
            }
        }
        HeadersMsg { headers }
    }

    /// Handle one decoded message from a ready peer.
    fn handle_message(self: &Arc<Self>, peer: &Arc<Peer>, msg: NetMessage) {
        peer.record_recv();
        match msg {
            NetMessage::Ping(nonce) => {
                let _ = peer.send(&NetMessage::Pong(nonce));
            }
            NetMessage::Pong(nonce) => {
                if let Some(latency) = peer.complete_ping(nonce) {
                    debug!("peer {} latency {}ms", peer.addr, latency);
                }
            }
            NetMessage::Inv(inv) => {
                let tx_hashes = {
                    let mut sync = self.sync.lock().unwrap();
                    let mut send = |addr: SocketAddr, msg: NetMessage| {
                        self.send_to(addr, msg);
                    };
                    sync.handle_inv(peer.addr, &inv, self.as_ref(), &mut send)
                };
                let wanted: Vec<InvItem> = {
                    let pool = self.mempool.lock().unwrap();
                    tx_hashes
                        .into_iter()
                        .filter(|h| !pool.contains(h))
                        .map(InvItem::transaction)
                        .collect()
                };
                if !wanted.is_empty() {
                    let _ = peer.send(&NetMessage::GetData(InventoryMsg { items: wanted }));
                }
            }
            NetMessage::GetData(request) => {
                for item in request.items {
                    match item.kind {
                        InvType::Block => {
                            let block = self.store.read().unwrap().get(&item.hash).ok().flatten();
                            if let Some(block) = block {
                                let _ = peer.send(&NetMessage::Block(block));
                            }
                        }
                        InvType::Transaction => {
                            let tx = self.mempool.lock().unwrap().get(&item.hash);
                            if let Some(tx) = tx {
                                let _ = peer.send(&NetMessage::Tx(tx));
                            }
                        }
                    }
                }
            }
            NetMessage::Block(block) => {
                peer.observe_height(block.height());
                let result = {
                    let mut sync = self.sync.lock().unwrap();
                    sync.handle_block(peer.addr, block, self.as_ref())
                };
                if let Err(e) = result {
                    warn!("bad block from {}: {}", peer.addr, e);
                    if e.is_peer_fault() {
                        self.peers.punish(peer);
                    }
                }
            }
            NetMessage::Tx(tx) => {
                let hash = tx.hash();
                let accounts = self.state.read().unwrap().accounts().clone();
                let result = {
                    let mut pool = self.mempool.lock().unwrap();
                    pool.insert(tx, self.clock.now_ms(), &accounts)
                };
                match result {
                    Ok(()) => self.announce_transaction(&hash),
                    Err(MontanaError::DuplicateTx) => {}
                    Err(e) => debug!("rejected relayed tx {}: {}", hash.short(), e),
                }
            }
            NetMessage::GetHeaders(req) => {
                let headers = self.serve_headers(&req);
                let _ = peer.send(&NetMessage::Headers(headers));
            }
            NetMessage::Headers(batch) => {
                let result = {
                    let mut sync = self.sync.lock().unwrap();
                    let mut send = |addr: SocketAddr, msg: NetMessage| {
                        self.send_to(addr, msg);
                    };
                    sync.handle_headers(peer.addr, batch.headers, self.as_ref(), &mut send)
                };
                if let Err(e) = result {
                    warn!("bad headers from {}: {}", peer.addr, e);
                    if e.is_peer_fault() {
                        self.peers.punish(peer);
                    }
                }
            }
            NetMessage::Version(_) | NetMessage::Verack => {
                warn!("handshake message after handshake from {}", peer.addr);
                self.peers.punish(peer);
            }
        }
    }

    fn send_to(&self, addr: SocketAddr, msg: NetMessage) {
        if let Some(peer) = self.peers.get(&addr) {
            if peer.send(&msg).is_err() {
                self.peers.disconnect(&addr);
            }
        }
    }

    fn peer_views(&self) -> Vec<PeerView> {
        self.peers
            .ready_peers()
            .iter()
            .map(|p| PeerView {
                addr: p.addr,
                best_height: p.best_height(),
            })
            .collect()
    }
}

/// The full node: owns the core, the engine thread and the task loops.
pub struct FullNode {
    config: NodeConfig,
    core: Arc<NodeCore>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl FullNode {
    /// Open storage, rebuild the DAG and replay state. The node is ready
    /// to serve after this; `start` spawns the live loops.
    pub fn new(config: NodeConfig, keys: NodeKeys) -> MontanaResult<Self> {
        Self::with_clock(config, keys, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: NodeConfig,
        keys: NodeKeys,
        clock: Arc<dyn Clock>,
    ) -> MontanaResult<Self> {
        init_logger();
        let db = Database::open(&config.data_dir)?;
        let store = BlockStore::open(db.clone())?;
        let state_store = StateStore::new(db);

        // The DAG is a derived view rebuilt from the store.
        let genesis_hash = Block::genesis().hash();
        let mut dag = PhantomDag::new(PHANTOM_K, genesis_hash);
        for hash in store.hashes_in_height_order() {
            if hash == genesis_hash {
                continue;
            }
            if let Some(header) = store.get_header(&hash)? {
                if let Err(e) = dag.insert(hash, &header.parents, header.height) {
                    warn!("skipping stored block {} during rebuild: {}", hash.short(), e);
                }
            }
        }

        let mut machine = StateMachine::new();
        for (address, amount) in &config.genesis_alloc {
            machine.credit(address, *amount);
        }

        let mut accumulator = VdfAccumulator::new();
        if let Some((_, snapshot)) = state_store.read_state()? {
            accumulator.restore(snapshot);
        }

        let vdf_input = store.tip_hash();
        let core = Arc::new(NodeCore {
            keys: Arc::new(keys),
            clock,
            store: RwLock::new(store),
            state: RwLock::new(machine),
            dag: RwLock::new(dag),
            accumulator: RwLock::new(accumulator),
            mempool: Mutex::new(Mempool::new()),
            sync: Mutex::new(SyncManager::new()),
            peers: PeerManager::new(
                services::NODE_NETWORK | services::NODE_VDF,
                USER_AGENT.to_string(),
            ),
            state_store,
            vdf: Mutex::new(VdfEngine::new(vdf_input)),
            pending_heartbeats: Mutex::new(VecDeque::new()),
            last_heartbeat: Mutex::new(Hash::ZERO),
            eligibility: EligibilityFilter::default(),
            enable_mining: config.enable_mining,
            genesis_alloc: config.genesis_alloc.clone(),
        });

        // Deterministic replay of the stored history.
        let replayed = core.reconcile_order()?;
        if !replayed.is_empty() {
            info!("replayed {} stored blocks", replayed.len());
        }
        core.persist_state()?;

        info!(
            "full node {} initialized at height {}",
            core.node_id().short(),
            core.best_height()
        );
        Ok(FullNode {
            config,
            core,
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        })
    }

    pub fn core(&self) -> Arc<NodeCore> {
        self.core.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the engine and every task loop. Idempotent.
    pub fn start(&mut self) -> MontanaResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("starting full node {}", self.core.node_id().short());

        let checkpoint_rx = {
            let mut vdf = self.core.vdf.lock().unwrap();
            let rx = vdf.subscribe();
            vdf.start();
            rx
        };

        self.spawn("checkpoints", {
            let core = self.core.clone();
            let running = self.running.clone();
            move || checkpoint_loop(core, running, checkpoint_rx)
        });
        self.spawn("heartbeats", {
            let core = self.core.clone();
            let running = self.running.clone();
            move || heartbeat_loop(core, running)
        });
        self.spawn("production", {
            let core = self.core.clone();
            let running = self.running.clone();
            move || production_loop(core, running)
        });
        self.spawn("sync", {
            let core = self.core.clone();
            let running = self.running.clone();
            move || sync_loop(core, running)
        });
        self.spawn("maintenance", {
            let core = self.core.clone();
            let running = self.running.clone();
            let bootstrap = self.config.bootstrap.clone();
            move || maintenance_loop(core, running, bootstrap)
        });

        let listener = TcpListener::bind(("0.0.0.0", self.config.port))?;
        listener.set_nonblocking(true)?;
        info!("listening on port {}", self.config.port);
        self.spawn("accept", {
            let core = self.core.clone();
            let running = self.running.clone();
            move || accept_loop(core, running, listener)
        });

        Ok(())
    }

    fn spawn<F: FnOnce() + Send + 'static>(&mut self, name: &str, f: F) {
        let handle = thread::Builder::new()
            .name(format!("montana-{}", name))
            .spawn(f)
            .expect("spawn node thread");
        self.threads.push(handle);
    }

    /// Cancel all loops, stop the engine, flush state, drop peers.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping full node");
        self.core.vdf.lock().unwrap().stop();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.core.peers.disconnect_all();
        if let Err(e) = self.core.persist_state() {
            error!("final state flush failed: {}", e);
        }
        info!("full node stopped");
    }

    pub fn status(&self) -> NodeStatus {
        self.core.status()
    }
}

impl Drop for FullNode {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sleep_while_running(running: &AtomicBool, total_ms: u64) {
    let mut remaining = total_ms;
    while remaining > 0 && running.load(Ordering::SeqCst) {
        let step = remaining.min(100);
        thread::sleep(Duration::from_millis(step));
        remaining -= step;
    }
}

/// Consume engine checkpoints and advance finality.
fn checkpoint_loop(core: Arc<NodeCore>, running: Arc<AtomicBool>, rx: Receiver<VdfCheckpoint>) {
    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(checkpoint) => core.observe_checkpoint(&checkpoint),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Sample the VDF on the heartbeat cadence.
fn heartbeat_loop(core: Arc<NodeCore>, running: Arc<AtomicBool>) {
    info!("heartbeat loop started");
    while running.load(Ordering::SeqCst) {
        core.generate_heartbeat();
        sleep_while_running(&running, HEARTBEAT_INTERVAL_MS);
    }
}

/// Produce blocks when caught up, mining is enabled and the eligibility
/// filter accepts the current VRF output.
fn production_loop(core: Arc<NodeCore>, running: Arc<AtomicBool>) {
    info!("block production loop started");
    while running.load(Ordering::SeqCst) {
        sleep_while_running(&running, BLOCK_TIME_TARGET_SEC * 1000);
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if !core.enable_mining {
            continue;
        }

        let caught_up = {
            let sync = core.sync.lock().unwrap();
            // A fresh chain with no peers is trivially caught up.
            sync.is_caught_up() || core.peers.ready_peers().is_empty()
        };
        if !caught_up {
            continue;
        }

        let status = core.vdf_status();
        let vrf = core.keys.vrf(status.output.as_bytes());
        if !core
            .eligibility
            .check(&vrf, &core.node_id(), core.own_score())
        {
            continue;
        }

        match core.produce_block(&status) {
            Ok(Some(_)) | Ok(None) => {}
            Err(e) => error!("block production failed: {}", e),
        }
    }
}

/// Drive the sync manager and apply downloaded blocks.
fn sync_loop(core: Arc<NodeCore>, running: Arc<AtomicBool>) {
    info!("sync loop started");
    let mut last_progress_log = 0u64;
    while running.load(Ordering::SeqCst) {
        let views = core.peer_views();
        {
            let mut sync = core.sync.lock().unwrap();
            let mut send = |addr: SocketAddr, msg: NetMessage| core.send_to(addr, msg);
            sync.tick(core.as_ref(), &views, &mut send);
        }

        let drained = {
            let mut sync = core.sync.lock().unwrap();
            sync.drain_pending(16)
        };
        for (origin, block) in drained {
            let hash = block.hash();
            match core.accept_block(&block) {
                Ok(outcome) => {
                    if outcome.accepted {
                        let mut sync = core.sync.lock().unwrap();
                        sync.on_block_connected(&hash, core.as_ref());
                        drop(sync);
                        core.announce_block(&hash);
                    }
                }
                Err(e) => {
                    warn!("rejected block {} from {}: {}", hash.short(), origin, e);
                    if e.is_peer_fault() {
                        if let Some(peer) = core.peers.get(&origin) {
                            core.peers.punish(&peer);
                        }
                    }
                }
            }
        }

        // Progress line once per second while syncing.
        let now = core.clock.now_ms();
        if now.saturating_sub(last_progress_log) >= 1000 {
            let sync = core.sync.lock().unwrap();
            if sync.is_syncing() {
                log_sync_progress(
                    sync.progress.current_height,
                    sync.progress.target_height,
                    sync.progress.blocks_per_second(now),
                );
            }
            last_progress_log = now;
        }

        thread::sleep(Duration::from_millis(100));
    }
}

/// Ping idle peers, drop dead ones, keep bootstrap connections alive.
fn maintenance_loop(core: Arc<NodeCore>, running: Arc<AtomicBool>, bootstrap: Vec<SocketAddr>) {
    info!("peer maintenance loop started");
    while running.load(Ordering::SeqCst) {
        let now = core.clock.now_ms();

        for peer in core.peers.ready_peers() {
            let idle = now.saturating_sub(peer.last_send_ms.load(Ordering::Relaxed));
            if idle >= PING_INTERVAL_SEC * 1000 {
                let _ = peer.begin_ping();
            }
            let silent = now.saturating_sub(peer.last_recv_ms.load(Ordering::Relaxed));
            if silent >= PING_INTERVAL_SEC * 3 * 1000 {
                warn!("peer {} unresponsive, disconnecting", peer.addr);
                core.peers.disconnect(&peer.addr);
            }
        }

        for addr in &bootstrap {
            if core.peers.get(addr).is_none() && !core.peers.is_banned(&addr.ip()) {
                let best = core.best_height();
                match core.peers.connect(*addr, best) {
                    Ok(peer) => spawn_peer_reader(core.clone(), running.clone(), peer),
                    Err(e) => debug!("bootstrap connect to {} failed: {}", addr, e),
                }
            }
        }

        sleep_while_running(&running, 5000);
    }
}

/// Accept inbound connections and hand each to a reader thread.
fn accept_loop(core: Arc<NodeCore>, running: Arc<AtomicBool>, listener: TcpListener) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!("inbound connection from {}", addr);
                let best = core.best_height();
                match core.peers.accept(stream, best) {
                    Ok(peer) => spawn_peer_reader(core.clone(), running.clone(), peer),
                    Err(e) => debug!("inbound handshake with {} failed: {}", addr, e),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                error!("accept failed: {}", e);
                thread::sleep(Duration::from_millis(500));
            }
        }
    }
}

/// Per-peer reader: decode frames and dispatch until disconnect.
fn spawn_peer_reader(core: Arc<NodeCore>, running: Arc<AtomicBool>, peer: Arc<Peer>) {
    let name = format!("montana-peer-{}", peer.addr);
    let _ = thread::Builder::new().name(name).spawn(move || {
        let mut stream = match peer.reader_stream() {
            Ok(stream) => stream,
            Err(_) => return,
        };
        while running.load(Ordering::SeqCst) && peer.state() != PeerState::Disconnected {
            match read_frame(&mut stream) {
                Ok((ty, payload)) => match NetMessage::decode(ty, &payload) {
                    Ok(msg) => core.handle_message(&peer, msg),
                    Err(e) => {
                        warn!("undecodable {:?} from {}: {}", ty, peer.addr, e);
                        core.peers.punish(&peer);
                    }
                },
                Err(MontanaError::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(MontanaError::Io(_)) => {
                    core.peers.disconnect(&peer.addr);
                    break;
                }
                Err(e) => {
                    warn!("protocol error from {}: {}", peer.addr, e);
                    core.peers.punish(&peer);
                    core.peers.disconnect(&peer.addr);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::random_nonce;
    use crate::core::vdf::advance;

    fn temp_config(tag: &str) -> NodeConfig {
        NodeConfig {
            data_dir: std::env::temp_dir().join(format!(
                "montana-node-{}-{}-{}",
                tag,
                std::process::id(),
                random_nonce()
            )),
            port: 0,
            bootstrap: Vec::new(),
            enable_mining: false,
            genesis_alloc: Vec::new(),
        }
    }

    fn test_keys(seed: u8) -> NodeKeys {
        NodeKeys::from_secret_bytes(&[seed; 32]).unwrap()
    }

    /// A VDF status with one completed segment, fabricated so tests do
    /// not need the live engine.
    fn fabricated_status(seed: u8, total: u64) -> VdfStatus {
        let input = Hash([seed; 32]);
        let (output, proof) = advance(&input, 64);
        VdfStatus {
            input,
            output,
            total_iterations: total,
            last_checkpoint: Some(VdfCheckpoint {
                input,
                output,
                segment_iterations: 64,
                total_iterations: total,
                proof,
                timestamp_ms: 0,
            }),
        }
    }

    #[test]
    fn test_new_node_starts_at_genesis() {
        let node = FullNode::new(temp_config("fresh"), test_keys(1)).unwrap();
        let core = node.core();
        assert_eq!(core.best_height(), 0);
        assert!(core.has_block(&Block::genesis().hash()));
        assert_eq!(core.state_root(), Hash::ZERO);
    }

    #[test]
    fn test_produce_block_applies_and_persists() {
        let config = temp_config("produce");
        let mut node = FullNode::new(config.clone(), test_keys(2)).unwrap();
        let core = node.core();

        // Queue one heartbeat by hand, then produce.
        let status = fabricated_status(2, 64);
        {
            let hb = Heartbeat::create(core.keys.as_ref(), Hash::ZERO, &status).unwrap();
            core.pending_heartbeats.lock().unwrap().push_back(hb);
        }
        let hash = core.produce_block(&status).unwrap().unwrap();

        assert_eq!(core.best_height(), 1);
        let block = core.get_block(&hash).unwrap();
        assert_eq!(block.heartbeats.len(), 1);
        let account = core
            .state
            .read()
            .unwrap()
            .accounts()
            .get(&core.node_id())
            .cloned()
            .unwrap();
        assert_eq!(account.heartbeat_count, 1);
        node.stop();

        // Restart from disk: height and state survive.
        let reopened = FullNode::new(config, test_keys(2)).unwrap();
        let core2 = reopened.core();
        assert_eq!(core2.best_height(), 1);
        assert_eq!(core2.state_root(), core.state_root());
    }

    #[test]
    fn test_produce_without_checkpoint_is_noop() {
        let node = FullNode::new(temp_config("nocp"), test_keys(3)).unwrap();
        let status = VdfStatus {
            input: Hash::ZERO,
            output: Hash::ZERO,
            total_iterations: 0,
            last_checkpoint: None,
        };
        assert!(node.core().produce_block(&status).unwrap().is_none());
        assert_eq!(node.core().best_height(), 0);
    }

    #[test]
    fn test_accept_block_is_idempotent() {
        let node = FullNode::new(temp_config("dup"), test_keys(4)).unwrap();
        let core = node.core();
        let status = fabricated_status(4, 64);
        let hash = core.produce_block(&status).unwrap().unwrap();
        let block = core.get_block(&hash).unwrap();

        let outcome = core.accept_block(&block).unwrap();
        assert!(!outcome.accepted);
        assert_eq!(core.best_height(), 1);
    }

    #[test]
    fn test_accept_rejects_bad_heartbeat_proof() {
        let node = FullNode::new(temp_config("badhb"), test_keys(5)).unwrap();
        let core = node.core();
        let keys = test_keys(6);
        let status = fabricated_status(6, 64);

        let mut hb = Heartbeat::create(&keys, Hash::ZERO, &status).unwrap();
        hb.vdf_output = Hash([0xdd; 32]);
        hb.signature = keys.sign(&hb.signing_bytes());

        let mut block = Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                producer_id: keys.address(),
                parents: vec![Block::genesis().hash()],
                height: 1,
                timestamp_ms: core.clock.now_ms(),
                vdf_output: status.output,
                vdf_iterations: 64,
                heartbeat_root: Hash::ZERO,
                tx_root: Hash::ZERO,
                state_root: Hash::ZERO,
                signature: Vec::new(),
            },
            heartbeats: vec![hb],
            transactions: Vec::new(),
        };
        block.header.heartbeat_root = block.compute_heartbeat_root();
        block.header.tx_root = block.compute_tx_root();
        block.header.sign(&keys);

        assert!(matches!(
            core.accept_block(&block),
            Err(MontanaError::BadVdfProof { .. })
        ));
        assert_eq!(core.best_height(), 0);
        assert_eq!(core.state_root(), Hash::ZERO);
    }

    #[test]
    fn test_concurrent_blocks_from_two_producers() {
        // Seed scenario: two producers build on genesis; a third node
        // accepts both and orders them by hash.
        let node = FullNode::new(temp_config("concurrent"), test_keys(7)).unwrap();
        let core = node.core();

        let make = |keys: &NodeKeys, seed: u8| {
            let status = fabricated_status(seed, 64);
            let hb = Heartbeat::create(keys, Hash::ZERO, &status).unwrap();
            let mut block = Block {
                header: BlockHeader {
                    version: PROTOCOL_VERSION,
                    producer_id: keys.address(),
                    parents: vec![Block::genesis().hash()],
                    height: 1,
                    timestamp_ms: 1,
                    vdf_output: status.output,
                    vdf_iterations: 64,
                    heartbeat_root: Hash::ZERO,
                    tx_root: Hash::ZERO,
                    state_root: Hash::ZERO,
                    signature: Vec::new(),
                },
                heartbeats: vec![hb],
                transactions: Vec::new(),
            };
            block.header.heartbeat_root = block.compute_heartbeat_root();
            block.header.tx_root = block.compute_tx_root();
            // Each producer computes its root against empty state.
            let machine = StateMachine::new();
            block.header.state_root = machine.preview_root(&block).unwrap();
            block.header.sign(keys);
            block
        };

        let p1 = test_keys(8);
        let p2 = test_keys(9);
        let b1 = make(&p1, 8);
        let b2 = make(&p2, 9);

        // The lexicographically smaller block hash must come first in
        // the final order regardless of arrival order.
        let (first, second) = if b1.hash() < b2.hash() {
            (b1.clone(), b2.clone())
        } else {
            (b2.clone(), b1.clone())
        };

        // Deliver in "wrong" order on purpose.
        core.accept_block(&second).unwrap();
        core.accept_block(&first).unwrap();

        {
            let dag = core.dag.read().unwrap();
            let order = dag.ordered();
            assert_eq!(order[0], Block::genesis().hash());
            let pos_first = order.iter().position(|h| *h == first.hash()).unwrap();
            let pos_second = order.iter().position(|h| *h == second.hash()).unwrap();
            assert!(pos_first < pos_second);
            let mut tips = dag.tips();
            tips.sort();
            let mut expected = vec![first.hash(), second.hash()];
            expected.sort();
            assert_eq!(tips, expected);
        }

        // The ledger replayed both branches: each producer's heartbeat
        // landed in state.
        let state = core.state.read().unwrap();
        assert_eq!(state.applied().len(), 2);
        assert_eq!(
            state.accounts().get(&p1.address()).unwrap().heartbeat_count,
            1
        );
        assert_eq!(
            state.accounts().get(&p2.address()).unwrap().heartbeat_count,
            1
        );
    }

    #[test]
    fn test_locator_starts_at_tip_and_ends_at_genesis() {
        let node = FullNode::new(temp_config("locator"), test_keys(10)).unwrap();
        let core = node.core();
        let status = fabricated_status(10, 64);
        core.produce_block(&status).unwrap().unwrap();

        let locator = core.locator();
        assert_eq!(locator.first().copied(), Some(core.store.read().unwrap().tip_hash()));
        assert_eq!(locator.last().copied(), Some(Block::genesis().hash()));
    }

    #[test]
    fn test_serve_headers_after_locator() {
        let node = FullNode::new(temp_config("headers"), test_keys(11)).unwrap();
        let core = node.core();
        let h1 = core.produce_block(&fabricated_status(11, 64)).unwrap().unwrap();
        let h2 = core.produce_block(&fabricated_status(11, 128)).unwrap().unwrap();

        let all = core.serve_headers(&GetHeadersMsg {
            locators: vec![Block::genesis().hash()],
            stop: Hash::ZERO,
        });
        assert_eq!(all.headers.len(), 2);
        assert_eq!(all.headers[0].hash(), h1);
        assert_eq!(all.headers[1].hash(), h2);

        let after_first = core.serve_headers(&GetHeadersMsg {
            locators: vec![h1],
            stop: Hash::ZERO,
        });
        assert_eq!(after_first.headers.len(), 1);
        assert_eq!(after_first.headers[0].hash(), h2);
    }

    #[test]
    fn test_status_snapshot() {
        let node = FullNode::new(temp_config("status"), test_keys(12)).unwrap();
        let status = node.status();
        assert_eq!(status.height, 0);
        assert_eq!(status.peers, 0);
        assert_eq!(status.node_id, node.core().node_id());
    }
}
