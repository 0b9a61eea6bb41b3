//! Account records and the canonical account set.
//!
//! The state root is the Merkle root over `address || account` encodings
//! in ascending address order, so any two nodes with the same applied
//! history compute identical roots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::codec::{Decodable, Encodable, Reader, Writer};
use crate::core::errors::DecodeError;
use crate::core::merkle::merkle_root;
use crate::core::types::{Address, Hash, PrivacyTier};

/// Mutable per-address record. Created lazily on first reference and
/// never destroyed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub balance: u64,
    pub nonce: u64,
    pub score: f64,
    pub heartbeat_count: u64,
    pub privacy_tier: PrivacyTier,
    pub last_heartbeat_ms: u64,
    /// Head of this node's heartbeat chain; zero before the first one.
    pub heartbeat_head: Hash,
}

impl Default for Account {
    fn default() -> Self {
        Account {
            balance: 0,
            nonce: 0,
            score: 0.0,
            heartbeat_count: 0,
            privacy_tier: PrivacyTier::Public,
            last_heartbeat_ms: 0,
            heartbeat_head: Hash::ZERO,
        }
    }
}

impl Encodable for Account {
    fn encode_into(&self, w: &mut Writer) {
        w.put_u64(self.balance);
        w.put_u64(self.nonce);
        // IEEE-754 bits keep the float canonical across platforms.
        w.put_u64(self.score.to_bits());
        w.put_u64(self.heartbeat_count);
        w.put_u8(self.privacy_tier as u8);
        w.put_u64(self.last_heartbeat_ms);
        w.put_hash(&self.heartbeat_head);
    }
}

impl Decodable for Account {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let balance = r.u64()?;
        let nonce = r.u64()?;
        let score = f64::from_bits(r.u64()?);
        let heartbeat_count = r.u64()?;
        let tier_tag = r.u8()?;
        let privacy_tier = PrivacyTier::from_tag(tier_tag).ok_or(DecodeError::InvalidVariant {
            kind: "privacy tier",
            tag: tier_tag,
        })?;
        Ok(Account {
            balance,
            nonce,
            score,
            heartbeat_count,
            privacy_tier,
            last_heartbeat_ms: r.u64()?,
            heartbeat_head: r.hash()?,
        })
    }
}

/// The full account state owned by the state machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountSet {
    accounts: HashMap<Address, Account>,
}

impl AccountSet {
    pub fn new() -> Self {
        AccountSet {
            accounts: HashMap::new(),
        }
    }

    pub fn get(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn get_or_create(&mut self, address: &Address) -> &mut Account {
        self.accounts.entry(*address).or_default()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    /// Accounts in canonical (address) order.
    pub fn sorted_entries(&self) -> Vec<(Address, Account)> {
        let mut entries: Vec<(Address, Account)> = self
            .accounts
            .iter()
            .map(|(a, acc)| (*a, acc.clone()))
            .collect();
        entries.sort_by_key(|(a, _)| *a);
        entries
    }

    pub fn from_entries(entries: Vec<(Address, Account)>) -> Self {
        AccountSet {
            accounts: entries.into_iter().collect(),
        }
    }

    /// Merkle root over the canonical account sequence. Empty state has
    /// the zero root.
    pub fn state_root(&self) -> Hash {
        let leaves: Vec<Vec<u8>> = self
            .sorted_entries()
            .iter()
            .map(|(address, account)| {
                let mut w = Writer::new();
                w.put_raw(address.as_bytes());
                account.encode_into(&mut w);
                w.into_bytes()
            })
            .collect();
        merkle_root(&leaves)
    }
}
