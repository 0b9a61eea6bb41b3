//! Persistence: the content-addressed block archive and scalar state.
//!
//! Layout under the data directory:
//!
//! - `blocks/<hex-hash>.blk` — canonical block bytes plus a trailing
//!   CRC-32, checked on every read.
//! - `index.json` — height and parent->children indices plus the tip,
//!   rewritten after each accepted block.
//! - `accounts.json` — canonical account records, written atomically.
//! - `state.json` — scalar keys: protocol version, `best_block_hash`,
//!   VDF accumulator snapshot; written atomically after each apply.
//!
//! The directory scan is authoritative on startup; the JSON indices are
//! rebuilt from it and kept current afterwards.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::core::block::{Block, BlockHeader};
use crate::core::codec::{Decodable, Encodable};
use crate::core::constants::{BLOCK_CACHE_SIZE, PROTOCOL_VERSION};
use crate::core::errors::{MontanaError, MontanaResult};
use crate::core::types::{Address, Hash};
use crate::core::vdf_accumulator::AccumulatorSnapshot;
use crate::state::accounts::{Account, AccountSet};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute the CRC-32 integrity checksum of a record payload.
fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Directory-backed key-value storage shared by the stores.
#[derive(Clone)]
pub struct Database {
    root: PathBuf,
}

impl Database {
    pub fn open(root: impl Into<PathBuf>) -> MontanaResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blocks"))?;
        info!("database opened at {}", root.display());
        Ok(Database { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn block_path(&self, hash: &Hash) -> PathBuf {
        self.root.join("blocks").join(format!("{}.blk", hash.to_hex()))
    }

    pub fn write_block(&self, hash: &Hash, bytes: &[u8]) -> MontanaResult<()> {
        let mut record = Vec::with_capacity(bytes.len() + 4);
        record.extend_from_slice(bytes);
        record.extend_from_slice(&crc32(bytes).to_be_bytes());
        fs::write(self.block_path(hash), record)?;
        Ok(())
    }

    pub fn read_block(&self, hash: &Hash) -> MontanaResult<Option<Vec<u8>>> {
        let record = match fs::read(self.block_path(hash)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if record.len() < 4 {
            return Err(MontanaError::Corruption(format!(
                "block record {} too short",
                hash
            )));
        }
        let (payload, checksum) = record.split_at(record.len() - 4);
        let stored = u32::from_be_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        if crc32(payload) != stored {
            return Err(MontanaError::Corruption(format!(
                "block record {} failed CRC check",
                hash
            )));
        }
        Ok(Some(payload.to_vec()))
    }

    pub fn list_block_hashes(&self) -> MontanaResult<Vec<Hash>> {
        let mut hashes = Vec::new();
        for entry in fs::read_dir(self.root.join("blocks"))? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".blk") {
                match Hash::from_hex(stem) {
                    Some(hash) => hashes.push(hash),
                    None => warn!("ignoring foreign file in block archive: {}", name),
                }
            }
        }
        Ok(hashes)
    }

    /// Atomic JSON write: temp file then rename, so readers never observe
    /// a partial record.
    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> MontanaResult<()> {
        let tmp = self.root.join(format!("{}.tmp", name));
        let path = self.root.join(name);
        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| MontanaError::Corruption(format!("serialize {}: {}", name, e)))?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> MontanaResult<Option<T>> {
        let path = self.root.join(name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_slice(&data)
            .map_err(|e| MontanaError::Corruption(format!("parse {}: {}", name, e)))?;
        Ok(Some(value))
    }
}

/// Bounded LRU of decoded blocks fronting the archive.
struct BlockCache {
    map: HashMap<Hash, Block>,
    order: VecDeque<Hash>,
    capacity: usize,
}

impl BlockCache {
    fn new(capacity: usize) -> Self {
        BlockCache {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, hash: &Hash) -> Option<Block> {
        if let Some(block) = self.map.get(hash).cloned() {
            // Refresh recency.
            self.order.retain(|h| h != hash);
            self.order.push_back(*hash);
            Some(block)
        } else {
            None
        }
    }

    fn put(&mut self, hash: Hash, block: Block) {
        if self.map.insert(hash, block).is_none() {
            self.order.push_back(hash);
        }
        while self.map.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            } else {
                break;
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct BlockIndexFile {
    heights: Vec<(u64, Vec<Hash>)>,
    children: Vec<(Hash, Vec<Hash>)>,
    tip: Hash,
}

/// Content-addressed block archive with height and parent indices. The
/// single source of truth for block persistence; other components hold
/// hashes only.
pub struct BlockStore {
    db: Database,
    cache: Mutex<BlockCache>,
    known: HashSet<Hash>,
    height_index: BTreeMap<u64, Vec<Hash>>,
    children_index: HashMap<Hash, Vec<Hash>>,
    tip: Hash,
    tip_height: u64,
}

impl BlockStore {
    /// Open the archive, rebuild indices from disk, and make sure the
    /// genesis block is present.
    pub fn open(db: Database) -> MontanaResult<Self> {
        let genesis = Block::genesis();
        let mut store = BlockStore {
            db,
            cache: Mutex::new(BlockCache::new(BLOCK_CACHE_SIZE)),
            known: HashSet::new(),
            height_index: BTreeMap::new(),
            children_index: HashMap::new(),
            tip: genesis.hash(),
            tip_height: 0,
        };

        for hash in store.db.list_block_hashes()? {
            match store.db.read_block(&hash)? {
                Some(bytes) => {
                    let block = Block::decode(&bytes)
                        .map_err(|e| MontanaError::Corruption(format!("block {}: {}", hash, e)))?;
                    if block.hash() != hash {
                        return Err(MontanaError::Corruption(format!(
                            "archive file {} holds block {}",
                            hash,
                            block.hash()
                        )));
                    }
                    store.index_block(&block);
                }
                None => continue,
            }
        }

        if !store.known.contains(&genesis.hash()) {
            store.add(&genesis)?;
        } else {
            store.persist_index()?;
        }

        info!(
            "block store open: {} blocks, height {}",
            store.known.len(),
            store.height()
        );
        Ok(store)
    }

    fn index_block(&mut self, block: &Block) {
        let hash = block.hash();
        self.known.insert(hash);

        let at_height = self.height_index.entry(block.height()).or_default();
        at_height.push(hash);
        at_height.sort();
        at_height.dedup();

        for parent in &block.header.parents {
            let children = self.children_index.entry(*parent).or_default();
            children.push(hash);
            children.sort();
            children.dedup();
        }

        // Highest block wins the tip; ties go to the smaller hash.
        if block.height() > self.tip_height
            || (block.height() == self.tip_height && hash < self.tip)
        {
            self.tip = hash;
            self.tip_height = block.height();
        }
    }

    fn persist_index(&self) -> MontanaResult<()> {
        let index = BlockIndexFile {
            heights: self
                .height_index
                .iter()
                .map(|(h, v)| (*h, v.clone()))
                .collect(),
            children: {
                let mut entries: Vec<(Hash, Vec<Hash>)> = self
                    .children_index
                    .iter()
                    .map(|(h, v)| (*h, v.clone()))
                    .collect();
                entries.sort_by_key(|(h, _)| *h);
                entries
            },
            tip: self.tip,
        };
        self.db.write_json("index.json", &index)
    }

    /// Store a block. Returns false (and changes nothing) if it is
    /// already present.
    pub fn add(&mut self, block: &Block) -> MontanaResult<bool> {
        let hash = block.hash();
        if self.known.contains(&hash) {
            return Ok(false);
        }

        self.db.write_block(&hash, &block.encode())?;
        self.index_block(block);
        self.persist_index()?;
        self.cache.lock().unwrap().put(hash, block.clone());
        debug!("stored block {} at height {}", hash.short(), block.height());
        Ok(true)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.known.contains(hash)
    }

    pub fn get(&self, hash: &Hash) -> MontanaResult<Option<Block>> {
        if !self.known.contains(hash) {
            return Ok(None);
        }
        if let Some(block) = self.cache.lock().unwrap().get(hash) {
            return Ok(Some(block));
        }
        let bytes = match self.db.read_block(hash)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let block = Block::decode(&bytes)
            .map_err(|e| MontanaError::Corruption(format!("block {}: {}", hash, e)))?;
        if block.hash() != *hash {
            return Err(MontanaError::Corruption(format!(
                "stored bytes for {} hash to {}",
                hash,
                block.hash()
            )));
        }
        self.cache.lock().unwrap().put(*hash, block.clone());
        Ok(Some(block))
    }

    pub fn get_header(&self, hash: &Hash) -> MontanaResult<Option<BlockHeader>> {
        Ok(self.get(hash)?.map(|b| b.header))
    }

    pub fn hashes_at_height(&self, height: u64) -> Vec<Hash> {
        self.height_index.get(&height).cloned().unwrap_or_default()
    }

    pub fn get_at_height(&self, height: u64) -> MontanaResult<Vec<Block>> {
        let mut blocks = Vec::new();
        for hash in self.hashes_at_height(height) {
            if let Some(block) = self.get(&hash)? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    pub fn children_of(&self, hash: &Hash) -> Vec<Hash> {
        self.children_index.get(hash).cloned().unwrap_or_default()
    }

    /// Max height across all stored blocks.
    pub fn height(&self) -> u64 {
        self.height_index.keys().next_back().copied().unwrap_or(0)
    }

    pub fn tip_hash(&self) -> Hash {
        self.tip
    }

    pub fn get_tip(&self) -> MontanaResult<Option<Block>> {
        let tip = self.tip;
        self.get(&tip)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// All block hashes in ascending height order (hash order within a
    /// height), the order the DAG is rebuilt in at startup.
    pub fn hashes_in_height_order(&self) -> Vec<Hash> {
        let mut out = Vec::with_capacity(self.known.len());
        for hashes in self.height_index.values() {
            out.extend(hashes.iter().copied());
        }
        out
    }
}

#[derive(Serialize, Deserialize)]
struct ScalarStateFile {
    protocol_version: u32,
    best_block_hash: Hash,
    written_at: i64,
    vdf: AccumulatorSnapshot,
}

/// Scalar node state persisted atomically after each apply so the state
/// machine's view and the block store agree on restart.
pub struct StateStore {
    db: Database,
}

impl StateStore {
    pub fn new(db: Database) -> Self {
        StateStore { db }
    }

    pub fn write_state(&self, best: &Hash, vdf: &AccumulatorSnapshot) -> MontanaResult<()> {
        self.db.write_json(
            "state.json",
            &ScalarStateFile {
                protocol_version: PROTOCOL_VERSION,
                best_block_hash: *best,
                written_at: chrono::Utc::now().timestamp(),
                vdf: vdf.clone(),
            },
        )
    }

    pub fn read_state(&self) -> MontanaResult<Option<(Hash, AccumulatorSnapshot)>> {
        match self.db.read_json::<ScalarStateFile>("state.json")? {
            Some(state) if state.protocol_version == PROTOCOL_VERSION => {
                Ok(Some((state.best_block_hash, state.vdf)))
            }
            Some(state) => {
                warn!(
                    "persisted state has protocol version {}, expected {}; ignoring",
                    state.protocol_version, PROTOCOL_VERSION
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn write_accounts(&self, accounts: &AccountSet) -> MontanaResult<()> {
        self.db.write_json("accounts.json", &accounts.sorted_entries())
    }

    pub fn read_accounts(&self) -> MontanaResult<Option<AccountSet>> {
        Ok(self
            .db
            .read_json::<Vec<(Address, Account)>>("accounts.json")?
            .map(AccountSet::from_entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::BlockHeader;
    use crate::core::constants::GENESIS_TIMESTAMP_MS;
    use crate::core::crypto::{random_nonce, KeyStore, NodeKeys};
    use crate::core::types::FinalityLevel;
    use crate::core::vdf_accumulator::BlockFinality;

    fn temp_db(tag: &str) -> Database {
        let dir = std::env::temp_dir().join(format!(
            "montana-store-{}-{}-{}",
            tag,
            std::process::id(),
            random_nonce()
        ));
        Database::open(dir).unwrap()
    }

    fn signed_block(seed: u8, parents: Vec<Hash>, height: u64) -> Block {
        let keys = NodeKeys::from_secret_bytes(&[seed; 32]).unwrap();
        let mut block = Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                producer_id: keys.address(),
                parents,
                height,
                timestamp_ms: GENESIS_TIMESTAMP_MS + height * 1000 + seed as u64,
                vdf_output: Hash([seed; 32]),
                vdf_iterations: height * 10,
                heartbeat_root: Hash::ZERO,
                tx_root: Hash::ZERO,
                state_root: Hash::ZERO,
                signature: Vec::new(),
            },
            heartbeats: Vec::new(),
            transactions: Vec::new(),
        };
        block.header.sign(&keys);
        block
    }

    #[test]
    fn test_open_seeds_genesis() {
        let store = BlockStore::open(temp_db("genesis")).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.contains(&Block::genesis().hash()));
        assert_eq!(store.height(), 0);
        assert_eq!(store.tip_hash(), Block::genesis().hash());
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut store = BlockStore::open(temp_db("idempotent")).unwrap();
        let block = signed_block(1, vec![Block::genesis().hash()], 1);
        assert!(store.add(&block).unwrap());
        assert!(!store.add(&block).unwrap());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_round_trip_through_disk() {
        let db = temp_db("roundtrip");
        let block = signed_block(2, vec![Block::genesis().hash()], 1);
        {
            let mut store = BlockStore::open(db.clone()).unwrap();
            store.add(&block).unwrap();
        }
        // Fresh store rebuilt from disk.
        let store = BlockStore::open(db).unwrap();
        assert!(store.contains(&block.hash()));
        let loaded = store.get(&block.hash()).unwrap().unwrap();
        assert_eq!(loaded, block);
        assert_eq!(store.height(), 1);
        assert_eq!(store.tip_hash(), block.hash());
    }

    #[test]
    fn test_corrupted_record_detected() {
        let db = temp_db("corrupt");
        let block = signed_block(3, vec![Block::genesis().hash()], 1);
        {
            let mut store = BlockStore::open(db.clone()).unwrap();
            store.add(&block).unwrap();
        }
        // Flip a byte inside the record.
        let path = db.block_path(&block.hash());
        let mut record = fs::read(&path).unwrap();
        record[10] ^= 0xff;
        fs::write(&path, record).unwrap();

        assert!(matches!(
            db.read_block(&block.hash()),
            Err(MontanaError::Corruption(_))
        ));
    }

    #[test]
    fn test_indices() {
        let mut store = BlockStore::open(temp_db("indices")).unwrap();
        let genesis_hash = Block::genesis().hash();
        let a = signed_block(4, vec![genesis_hash], 1);
        let b = signed_block(5, vec![genesis_hash], 1);
        let c = signed_block(6, vec![a.hash(), b.hash()], 2);
        store.add(&a).unwrap();
        store.add(&b).unwrap();
        store.add(&c).unwrap();

        let mut at_one = store.hashes_at_height(1);
        at_one.sort();
        let mut expected = vec![a.hash(), b.hash()];
        expected.sort();
        assert_eq!(at_one, expected);

        let mut children = store.children_of(&genesis_hash);
        children.sort();
        assert_eq!(children, expected);
        assert_eq!(store.children_of(&a.hash()), vec![c.hash()]);
        assert_eq!(store.height(), 2);
        assert_eq!(store.tip_hash(), c.hash());

        let order = store.hashes_in_height_order();
        assert_eq!(order[0], genesis_hash);
        assert_eq!(*order.last().unwrap(), c.hash());
    }

    #[test]
    fn test_state_store_round_trip() {
        let db = temp_db("scalar");
        let state_store = StateStore::new(db);
        assert!(state_store.read_state().unwrap().is_none());

        let best = Hash([7u8; 32]);
        let snapshot = vec![(
            best,
            BlockFinality {
                iterations: 1234,
                level: FinalityLevel::Weak,
            },
        )];
        state_store.write_state(&best, &snapshot).unwrap();

        let (read_best, read_snapshot) = state_store.read_state().unwrap().unwrap();
        assert_eq!(read_best, best);
        assert_eq!(read_snapshot.len(), 1);
        assert_eq!(read_snapshot[0].1.iterations, 1234);
    }

    #[test]
    fn test_accounts_persistence() {
        let db = temp_db("accounts");
        let state_store = StateStore::new(db);

        let mut accounts = AccountSet::new();
        accounts.get_or_create(&Address([1u8; 32])).balance = 77;
        state_store.write_accounts(&accounts).unwrap();

        let loaded = state_store.read_accounts().unwrap().unwrap();
        assert_eq!(loaded.state_root(), accounts.state_root());
        assert_eq!(loaded.get(&Address([1u8; 32])).unwrap().balance, 77);
    }
}
