//! Transactions, block headers and blocks.
//!
//! The block hash is the SHA-256 of the canonical header encoding with
//! the signature included; Ed25519 signing is deterministic so identical
//! headers always hash identically. Transaction hashes cover every field
//! except the signature.

use crate::core::codec::{Decodable, Encodable, Reader, Writer};
use crate::core::constants::{
    GENESIS_TIMESTAMP_MS, MAX_HEARTBEATS_PER_BLOCK, MAX_PARENTS, MAX_TX_PAYLOAD,
    MAX_TX_PER_BLOCK, PROTOCOL_VERSION,
};
use crate::core::crypto::{sha256, verify_signature, KeyStore, SIGNATURE_SIZE};
use crate::core::errors::{DecodeError, MontanaError, MontanaResult};
use crate::core::heartbeat::Heartbeat;
use crate::core::merkle::merkle_root;
use crate::core::types::{Address, Hash};

/// Value transfer between two accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub sender: Address,
    pub recipient: Address,
    pub amount: u64,
    pub fee: u64,
    pub nonce: u64,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Transaction {
    pub fn create(
        keys: &dyn KeyStore,
        recipient: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
        payload: Vec<u8>,
    ) -> Self {
        let mut tx = Transaction {
            sender: keys.address(),
            recipient,
            amount,
            fee,
            nonce,
            payload,
            signature: Vec::new(),
        };
        tx.signature = keys.sign(&tx.signing_bytes());
        tx
    }

    /// Canonical encoding of every field except the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_raw(self.sender.as_bytes());
        w.put_raw(self.recipient.as_bytes());
        w.put_u64(self.amount);
        w.put_u64(self.fee);
        w.put_u64(self.nonce);
        w.put_bytes(&self.payload);
        w.into_bytes()
    }

    pub fn hash(&self) -> Hash {
        sha256(&self.signing_bytes())
    }

    /// Sender's address doubles as the verification key.
    pub fn verify_signature(&self) -> MontanaResult<()> {
        if verify_signature(self.sender.as_bytes(), &self.signing_bytes(), &self.signature)? {
            Ok(())
        } else {
            Err(MontanaError::SignatureInvalid)
        }
    }

    /// Encoded size in bytes, used for fee ordering and pool bounds.
    pub fn size(&self) -> usize {
        self.encode().len()
    }
}

impl Encodable for Transaction {
    fn encode_into(&self, w: &mut Writer) {
        w.put_raw(self.sender.as_bytes());
        w.put_raw(self.recipient.as_bytes());
        w.put_u64(self.amount);
        w.put_u64(self.fee);
        w.put_u64(self.nonce);
        w.put_bytes(&self.payload);
        w.put_bytes(&self.signature);
    }
}

impl Decodable for Transaction {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Transaction {
            sender: Address::from_slice(r.take(32)?).expect("fixed width"),
            recipient: Address::from_slice(r.take(32)?).expect("fixed width"),
            amount: r.u64()?,
            fee: r.u64()?,
            nonce: r.u64()?,
            payload: r.bytes_max(MAX_TX_PAYLOAD)?,
            signature: r.bytes_max(SIGNATURE_SIZE)?,
        })
    }
}

/// Canonical block header. Field order is fixed by the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub producer_id: Address,
    pub parents: Vec<Hash>,
    pub height: u64,
    pub timestamp_ms: u64,
    pub vdf_output: Hash,
    pub vdf_iterations: u64,
    pub heartbeat_root: Hash,
    pub tx_root: Hash,
    pub state_root: Hash,
    pub signature: Vec<u8>,
}

impl BlockHeader {
    /// Canonical encoding of every field except the signature: the signed
    /// preimage.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode_unsigned(&mut w);
        w.into_bytes()
    }

    fn encode_unsigned(&self, w: &mut Writer) {
        w.put_u32(self.version);
        w.put_raw(self.producer_id.as_bytes());
        w.put_count(self.parents.len());
        for parent in &self.parents {
            w.put_hash(parent);
        }
        w.put_u64(self.height);
        w.put_u64(self.timestamp_ms);
        w.put_hash(&self.vdf_output);
        w.put_u64(self.vdf_iterations);
        w.put_hash(&self.heartbeat_root);
        w.put_hash(&self.tx_root);
        w.put_hash(&self.state_root);
    }

    /// Block hash: SHA-256 over the full header encoding, signature
    /// included.
    pub fn hash(&self) -> Hash {
        sha256(&self.encode())
    }

    pub fn sign(&mut self, keys: &dyn KeyStore) {
        self.signature = keys.sign(&self.signing_bytes());
    }

    pub fn verify_signature(&self) -> MontanaResult<()> {
        if verify_signature(
            self.producer_id.as_bytes(),
            &self.signing_bytes(),
            &self.signature,
        )? {
            Ok(())
        } else {
            Err(MontanaError::SignatureInvalid)
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.parents.is_empty()
    }
}

impl Encodable for BlockHeader {
    fn encode_into(&self, w: &mut Writer) {
        self.encode_unsigned(w);
        w.put_bytes(&self.signature);
    }
}

impl Decodable for BlockHeader {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = r.u32()?;
        let producer_id = Address::from_slice(r.take(32)?).expect("fixed width");
        let parent_count = r.count(MAX_PARENTS)?;
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents.push(r.hash()?);
        }
        Ok(BlockHeader {
            version,
            producer_id,
            parents,
            height: r.u64()?,
            timestamp_ms: r.u64()?,
            vdf_output: r.hash()?,
            vdf_iterations: r.u64()?,
            heartbeat_root: r.hash()?,
            tx_root: r.hash()?,
            state_root: r.hash()?,
            signature: r.bytes_max(SIGNATURE_SIZE)?,
        })
    }
}

/// Header plus the ordered bodies its roots commit to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub heartbeats: Vec<Heartbeat>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The fixed block anchoring every chain of this network.
    pub fn genesis() -> Block {
        Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                producer_id: Address::ZERO,
                parents: Vec::new(),
                height: 0,
                timestamp_ms: GENESIS_TIMESTAMP_MS,
                vdf_output: Hash::ZERO,
                vdf_iterations: 0,
                heartbeat_root: Hash::ZERO,
                tx_root: Hash::ZERO,
                state_root: Hash::ZERO,
                signature: Vec::new(),
            },
            heartbeats: Vec::new(),
            transactions: Vec::new(),
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Merkle root over the encoded heartbeat sequence.
    pub fn compute_heartbeat_root(&self) -> Hash {
        let leaves: Vec<Vec<u8>> = self.heartbeats.iter().map(|hb| hb.encode()).collect();
        merkle_root(&leaves)
    }

    /// Merkle root over the encoded transaction sequence.
    pub fn compute_tx_root(&self) -> Hash {
        let leaves: Vec<Vec<u8>> = self.transactions.iter().map(|tx| tx.encode()).collect();
        merkle_root(&leaves)
    }

    /// Structural invariants that gate DAG entry: parent shape, body
    /// commitments and the producer signature. Parent existence, heights
    /// and VDF monotonicity are checked against the store.
    pub fn validate_structure(&self) -> MontanaResult<()> {
        if self.header.is_genesis() {
            if *self == Block::genesis() {
                return Ok(());
            }
            return Err(MontanaError::BadStructure("counterfeit genesis"));
        }

        if self.header.parents.is_empty() {
            return Err(MontanaError::BadStructure("empty parent set"));
        }
        if self.header.parents.len() > MAX_PARENTS {
            return Err(MontanaError::BadStructure("too many parents"));
        }
        let mut sorted = self.header.parents.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.header.parents.len() {
            return Err(MontanaError::BadStructure("duplicate parent"));
        }

        if self.heartbeats.len() > MAX_HEARTBEATS_PER_BLOCK {
            return Err(MontanaError::BadStructure("too many heartbeats"));
        }
        if self.transactions.len() > MAX_TX_PER_BLOCK {
            return Err(MontanaError::BadStructure("too many transactions"));
        }

        if self.compute_heartbeat_root() != self.header.heartbeat_root {
            return Err(MontanaError::MerkleMismatch { kind: "heartbeats" });
        }
        if self.compute_tx_root() != self.header.tx_root {
            return Err(MontanaError::MerkleMismatch { kind: "transactions" });
        }

        self.header.verify_signature()
    }
}

impl Encodable for Block {
    fn encode_into(&self, w: &mut Writer) {
        self.header.encode_into(w);
        w.put_count(self.heartbeats.len());
        for hb in &self.heartbeats {
            hb.encode_into(w);
        }
        w.put_count(self.transactions.len());
        for tx in &self.transactions {
            tx.encode_into(w);
        }
    }
}

impl Decodable for Block {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::decode_from(r)?;
        let hb_count = r.count(MAX_HEARTBEATS_PER_BLOCK)?;
        let mut heartbeats = Vec::with_capacity(hb_count);
        for _ in 0..hb_count {
            heartbeats.push(Heartbeat::decode_from(r)?);
        }
        let tx_count = r.count(MAX_TX_PER_BLOCK)?;
        let mut transactions = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            transactions.push(Transaction::decode_from(r)?);
        }
        Ok(Block {
            header,
            heartbeats,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::NodeKeys;
    use crate::core::vdf::{advance, VdfCheckpoint};
    use crate::core::types::now_ms;
    use crate::core::vdf::VdfStatus;

    fn producer() -> NodeKeys {
        NodeKeys::from_secret_bytes(&[11u8; 32]).unwrap()
    }

    fn sample_heartbeat(keys: &NodeKeys) -> Heartbeat {
        let input = Hash([1u8; 32]);
        let (output, proof) = advance(&input, 50);
        let status = VdfStatus {
            input,
            output,
            total_iterations: 50,
            last_checkpoint: Some(VdfCheckpoint {
                input,
                output,
                segment_iterations: 50,
                total_iterations: 50,
                proof,
                timestamp_ms: now_ms(),
            }),
        };
        Heartbeat::create(keys, Hash::ZERO, &status).unwrap()
    }

    fn sample_block(keys: &NodeKeys) -> Block {
        let hb = sample_heartbeat(keys);
        let tx = Transaction::create(keys, Address([9u8; 32]), 10, 1, 0, Vec::new());
        let mut block = Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                producer_id: keys.address(),
                parents: vec![Block::genesis().hash()],
                height: 1,
                timestamp_ms: GENESIS_TIMESTAMP_MS + 1000,
                vdf_output: hb.vdf_output,
                vdf_iterations: hb.vdf_iterations,
                heartbeat_root: Hash::ZERO,
                tx_root: Hash::ZERO,
                state_root: Hash([3u8; 32]),
                signature: Vec::new(),
            },
            heartbeats: vec![hb],
            transactions: vec![tx],
        };
        block.header.heartbeat_root = block.compute_heartbeat_root();
        block.header.tx_root = block.compute_tx_root();
        block.header.sign(keys);
        block
    }

    #[test]
    fn test_tx_hash_excludes_signature() {
        let keys = producer();
        let mut tx = Transaction::create(&keys, Address([2u8; 32]), 5, 1, 0, b"memo".to_vec());
        let hash = tx.hash();
        tx.signature = vec![0u8; 64];
        assert_eq!(tx.hash(), hash);
    }

    #[test]
    fn test_tx_signature_verifies() {
        let keys = producer();
        let tx = Transaction::create(&keys, Address([2u8; 32]), 5, 1, 0, Vec::new());
        tx.verify_signature().unwrap();

        let mut forged = tx.clone();
        forged.amount = 500;
        assert!(forged.verify_signature().is_err());
    }

    #[test]
    fn test_tx_codec_round_trip() {
        let keys = producer();
        let tx = Transaction::create(&keys, Address([2u8; 32]), 5, 1, 7, b"data".to_vec());
        let parsed = Transaction::decode(&tx.encode()).unwrap();
        assert_eq!(parsed, tx);
    }

    #[test]
    fn test_block_hash_covers_signature() {
        let keys = producer();
        let mut block = sample_block(&keys);
        let hash = block.hash();
        block.header.signature = vec![0u8; 64];
        assert_ne!(block.hash(), hash);
    }

    #[test]
    fn test_block_codec_round_trip() {
        let keys = producer();
        let block = sample_block(&keys);
        let bytes = block.encode();
        let parsed = Block::decode(&bytes).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(parsed.hash(), block.hash());
        // Re-encoding reproduces the original bytes.
        assert_eq!(parsed.encode(), bytes);
    }

    #[test]
    fn test_structure_accepts_valid_block() {
        let keys = producer();
        sample_block(&keys).validate_structure().unwrap();
    }

    #[test]
    fn test_structure_rejects_bad_merkle_root() {
        let keys = producer();
        let mut block = sample_block(&keys);
        block.header.tx_root = Hash([0xaa; 32]);
        block.header.sign(&keys);
        assert!(matches!(
            block.validate_structure(),
            Err(MontanaError::MerkleMismatch { kind: "transactions" })
        ));
    }

    #[test]
    fn test_structure_rejects_unsigned_block() {
        let keys = producer();
        let mut block = sample_block(&keys);
        block.header.signature = Vec::new();
        assert!(block.validate_structure().is_err());
    }

    #[test]
    fn test_structure_rejects_duplicate_parents() {
        let keys = producer();
        let mut block = sample_block(&keys);
        let parent = block.header.parents[0];
        block.header.parents.push(parent);
        block.header.sign(&keys);
        assert!(matches!(
            block.validate_structure(),
            Err(MontanaError::BadStructure("duplicate parent"))
        ));
    }

    #[test]
    fn test_genesis_is_stable() {
        assert_eq!(Block::genesis().hash(), Block::genesis().hash());
        Block::genesis().validate_structure().unwrap();
        assert!(Block::genesis().header.is_genesis());
    }

    #[test]
    fn test_counterfeit_genesis_rejected() {
        let mut fake = Block::genesis();
        fake.header.timestamp_ms += 1;
        assert!(fake.validate_structure().is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let keys = producer();
        let mut bytes = sample_block(&keys).encode();
        bytes.push(0);
        assert!(Block::decode(&bytes).is_err());
    }
}
