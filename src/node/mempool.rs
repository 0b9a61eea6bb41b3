//! Bounded transaction pool with fee-based eviction.
//!
//! Ordering is fee-per-byte descending, insertion time ascending. One
//! pending entry per (sender, nonce); a replacement must pay strictly
//! more fee. When full, the lowest fee-per-byte entry makes room unless
//! it dominates the newcomer.

use std::collections::HashMap;

use log::debug;

use crate::core::block::{Block, Transaction};
use crate::core::constants::{MAX_MEMPOOL_BYTES, MAX_MEMPOOL_TX, MIN_TX_FEE};
use crate::core::errors::{MontanaError, MontanaResult};
use crate::core::types::{Address, Hash};
use crate::state::accounts::AccountSet;

struct MempoolEntry {
    tx: Transaction,
    added_ms: u64,
    size: usize,
    fee_per_byte: f64,
}

/// The pool. Writers come from RPC relay and peer relay; the node wraps
/// it in a mutex.
pub struct Mempool {
    entries: HashMap<Hash, MempoolEntry>,
    by_sender_nonce: HashMap<(Address, u64), Hash>,
    total_bytes: usize,
    max_tx: usize,
    max_bytes: usize,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool {
            entries: HashMap::new(),
            by_sender_nonce: HashMap::new(),
            total_bytes: 0,
            max_tx: MAX_MEMPOOL_TX,
            max_bytes: MAX_MEMPOOL_BYTES,
        }
    }

    #[cfg(test)]
    fn with_capacity(max_tx: usize, max_bytes: usize) -> Self {
        Mempool {
            entries: HashMap::new(),
            by_sender_nonce: HashMap::new(),
            total_bytes: 0,
            max_tx,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<Transaction> {
        self.entries.get(hash).map(|e| e.tx.clone())
    }

    /// Admission: signature, fee floor, affordability against the
    /// current account view, and the (sender, nonce) replacement rule.
    pub fn insert(
        &mut self,
        tx: Transaction,
        now_ms: u64,
        accounts: &AccountSet,
    ) -> MontanaResult<()> {
        let hash = tx.hash();
        if self.entries.contains_key(&hash) {
            return Err(MontanaError::DuplicateTx);
        }

        tx.verify_signature()?;
        if tx.fee < MIN_TX_FEE {
            return Err(MontanaError::FeeTooLow {
                fee: tx.fee,
                minimum: MIN_TX_FEE,
            });
        }

        let required = tx
            .amount
            .checked_add(tx.fee)
            .ok_or(MontanaError::BadStructure("amount overflow"))?;
        let (balance, account_nonce) = accounts
            .get(&tx.sender)
            .map(|a| (a.balance, a.nonce))
            .unwrap_or((0, 0));
        if tx.nonce < account_nonce {
            return Err(MontanaError::NonceMismatch {
                expected: account_nonce,
                got: tx.nonce,
            });
        }
        if balance < required {
            return Err(MontanaError::InsufficientBalance {
                balance,
                required,
            });
        }

        // One entry per (sender, nonce); replacement needs a higher fee.
        if let Some(existing_hash) = self.by_sender_nonce.get(&(tx.sender, tx.nonce)).copied() {
            let existing_fee = self.entries[&existing_hash].tx.fee;
            if tx.fee <= existing_fee {
                return Err(MontanaError::DuplicateTx);
            }
            self.remove(&existing_hash);
        }

        let size = tx.size();
        let fee_per_byte = tx.fee as f64 / size.max(1) as f64;

        // Evict the cheapest entry while over either bound, unless it
        // dominates the newcomer on fee rate.
        while self.entries.len() + 1 > self.max_tx || self.total_bytes + size > self.max_bytes {
            let victim = match self.cheapest() {
                Some(v) => v,
                None => return Err(MontanaError::MempoolFull),
            };
            if self.entries[&victim].fee_per_byte >= fee_per_byte {
                return Err(MontanaError::MempoolFull);
            }
            debug!("mempool evicting {} for {}", victim.short(), hash.short());
            self.remove(&victim);
        }

        self.by_sender_nonce.insert((tx.sender, tx.nonce), hash);
        self.total_bytes += size;
        self.entries.insert(
            hash,
            MempoolEntry {
                tx,
                added_ms: now_ms,
                size,
                fee_per_byte,
            },
        );
        Ok(())
    }

    fn cheapest(&self) -> Option<Hash> {
        self.entries
            .iter()
            .min_by(|(ha, a), (hb, b)| {
                a.fee_per_byte
                    .partial_cmp(&b.fee_per_byte)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.added_ms.cmp(&a.added_ms))
                    .then(ha.cmp(hb))
            })
            .map(|(h, _)| *h)
    }

    fn remove(&mut self, hash: &Hash) {
        if let Some(entry) = self.entries.remove(hash) {
            self.total_bytes -= entry.size;
            self.by_sender_nonce
                .remove(&(entry.tx.sender, entry.tx.nonce));
        }
    }

    /// Select up to `max` transactions in fee-descending, time-ascending
    /// order, dropping entries whose nonce no longer matches the account
    /// view. Consecutive nonces from one sender are kept in nonce order.
    pub fn select(&self, max: usize, accounts: &AccountSet) -> Vec<Transaction> {
        let mut candidates: Vec<&MempoolEntry> = self.entries.values().collect();
        candidates.sort_by(|a, b| {
            b.fee_per_byte
                .partial_cmp(&a.fee_per_byte)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.added_ms.cmp(&b.added_ms))
                .then(a.tx.hash().cmp(&b.tx.hash()))
        });

        let mut selected = Vec::new();
        let mut taken: std::collections::HashSet<Hash> = std::collections::HashSet::new();
        let mut next_nonce: HashMap<Address, u64> = HashMap::new();
        // Repeat passes so a selected nonce unlocks the sender's next
        // one even when the later nonce carried the higher fee.
        loop {
            let mut progressed = false;
            for entry in &candidates {
                if selected.len() >= max {
                    break;
                }
                let hash = entry.tx.hash();
                if taken.contains(&hash) {
                    continue;
                }
                let expected = *next_nonce.entry(entry.tx.sender).or_insert_with(|| {
                    accounts
                        .get(&entry.tx.sender)
                        .map(|a| a.nonce)
                        .unwrap_or(0)
                });
                if entry.tx.nonce != expected {
                    continue;
                }
                next_nonce.insert(entry.tx.sender, expected + 1);
                taken.insert(hash);
                selected.push(entry.tx.clone());
                progressed = true;
            }
            if !progressed || selected.len() >= max {
                break;
            }
        }
        selected
    }

    /// A block was applied: drop included transactions and any entry
    /// superseded on (sender, nonce).
    pub fn on_block_applied(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.remove(&tx.hash());
            if let Some(stale) = self.by_sender_nonce.get(&(tx.sender, tx.nonce)).copied() {
                self.remove(&stale);
            }
        }
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Mempool::new()
    }
}
