//! The state machine: applies blocks in DAG order, all-or-nothing.
//!
//! Application snapshots account state up front and discards the snapshot
//! on success; any failure restores it, so a rejected block leaves no
//! partial effects. Reorgs roll back to the last stable boundary (a block
//! with finality >= strong) and replay the revised order.

use log::{debug, info, warn};

use crate::core::block::Block;
use crate::core::constants::{MIN_TX_FEE, SCORE_CAP, SCORE_DECAY, SCORE_HEARTBEAT_WEIGHT};
use crate::core::errors::{MontanaError, MontanaResult};
use crate::core::types::{Address, Hash};
use crate::state::accounts::AccountSet;

/// Result of a successful block application.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub block_hash: Hash,
    pub height: u64,
    pub state_root: Hash,
}

/// Result of reconciling the applied history with a revised DAG order.
#[derive(Debug, Clone, Default)]
pub struct ReplayOutcome {
    /// Blocks newly applied in this pass.
    pub applied: Vec<Hash>,
    /// Blocks rolled back before replaying.
    pub rolled_back: usize,
}

/// A block that failed during replay; the caller marks it invalid and
/// retries with a corrected order.
#[derive(Debug)]
pub struct ReplayFailure {
    pub hash: Hash,
    pub error: MontanaError,
    pub outcome: ReplayOutcome,
}

#[derive(Default)]
pub struct StateMachine {
    accounts: AccountSet,
    /// Applied block hashes in order, genesis excluded.
    applied: Vec<Hash>,
    /// Prefix of `applied` protected by finality.
    stable_len: usize,
    stable_accounts: AccountSet,
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine::default()
    }

    pub fn accounts(&self) -> &AccountSet {
        &self.accounts
    }

    pub fn state_root(&self) -> Hash {
        self.accounts.state_root()
    }

    pub fn applied(&self) -> &[Hash] {
        &self.applied
    }

    pub fn best_block(&self) -> Option<Hash> {
        self.applied.last().copied()
    }

    pub fn stable_len(&self) -> usize {
        self.stable_len
    }

    /// Genesis allocation: credit an address before any block applies.
    pub fn credit(&mut self, address: &Address, amount: u64) {
        let account = self.accounts.get_or_create(address);
        account.balance = account.balance.saturating_add(amount);
    }

    fn execute(accounts: &mut AccountSet, block: &Block) -> MontanaResult<()> {
        for hb in &block.heartbeats {
            hb.verify()?;
            let account = accounts.get_or_create(&hb.node_id);
            if hb.prev_heartbeat != account.heartbeat_head {
                return Err(MontanaError::BrokenHeartbeatChain {
                    node: Hash(hb.node_id.0),
                });
            }
            account.heartbeat_count += 1;
            account.score = (account.score * SCORE_DECAY + SCORE_HEARTBEAT_WEIGHT).min(SCORE_CAP);
            account.last_heartbeat_ms = block.header.timestamp_ms;
            account.heartbeat_head = hb.hash();
        }

        for tx in &block.transactions {
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

            let sender = accounts.get_or_create(&tx.sender);
            if tx.nonce != sender.nonce {
                return Err(MontanaError::NonceMismatch {
                    expected: sender.nonce,
                    got: tx.nonce,
                });
            }
            if sender.balance < required {
                return Err(MontanaError::InsufficientBalance {
                    balance: sender.balance,
                    required,
                });
            }
            sender.balance -= required;
            sender.nonce += 1;

            let recipient = accounts.get_or_create(&tx.recipient);
            recipient.balance = recipient.balance.saturating_add(tx.amount);

            let producer = accounts.get_or_create(&block.header.producer_id);
            producer.balance = producer.balance.saturating_add(tx.fee);
        }

        Ok(())
    }

    /// Apply one block and require the computed root to match the header
    /// commitment. Used where the application context is the block's own
    /// branch (production preview, branch verification, linear chains).
    pub fn apply_block(&mut self, block: &Block) -> MontanaResult<ApplyOutcome> {
        self.apply_inner(block, true)
    }

    /// Apply a block's effects to the ledger without re-checking its root
    /// commitment. The canonical replay order interleaves blocks from
    /// concurrent branches, so header roots (which commit to the
    /// producer's branch) are verified separately against that branch.
    pub fn apply_for_ledger(&mut self, block: &Block) -> MontanaResult<ApplyOutcome> {
        self.apply_inner(block, false)
    }

    fn apply_inner(&mut self, block: &Block, check_root: bool) -> MontanaResult<ApplyOutcome> {
        block.validate_structure()?;

        let block_hash = block.hash();
        if block.header.is_genesis() {
            // Genesis carries no state effects.
            return Ok(ApplyOutcome {
                block_hash,
                height: 0,
                state_root: self.state_root(),
            });
        }

        let snapshot = self.accounts.clone();
        if let Err(e) = Self::execute(&mut self.accounts, block) {
            self.accounts = snapshot;
            return Err(e);
        }

        let computed = self.accounts.state_root();
        if check_root && computed != block.header.state_root {
            self.accounts = snapshot;
            return Err(MontanaError::StateRootMismatch {
                header: block.header.state_root,
                computed,
            });
        }

        self.applied.push(block_hash);
        debug!(
            "applied block {} at height {} (root {})",
            block_hash.short(),
            block.header.height,
            computed.short()
        );
        Ok(ApplyOutcome {
            block_hash,
            height: block.header.height,
            state_root: computed,
        })
    }

    /// Dry-run a candidate block against current state and return the
    /// post-application root. Used by the producer to fill `state_root`
    /// before signing.
    pub fn preview_root(&self, block: &Block) -> MontanaResult<Hash> {
        let mut scratch = self.accounts.clone();
        Self::execute(&mut scratch, block)?;
        Ok(scratch.state_root())
    }

    /// Advance the stable boundary to the current best block. The
    /// boundary only moves when the finalized block is the tip of the
    /// applied history, which is where the accumulator credits work.
    pub fn mark_stable(&mut self, block: &Hash) -> bool {
        if self.best_block() == Some(*block) && self.stable_len < self.applied.len() {
            self.stable_len = self.applied.len();
            self.stable_accounts = self.accounts.clone();
            info!(
                "stable boundary advanced to {} ({} blocks protected)",
                block.short(),
                self.stable_len
            );
            return true;
        }
        false
    }

    /// Reconcile applied history with a revised canonical order (genesis
    /// excluded). Extends in place when the order is a superset of the
    /// applied prefix; otherwise rolls back to the stable boundary and
    /// replays. A failing block stops the pass so the caller can mark it
    /// invalid and retry with a corrected order.
    pub fn sync_to_order(
        &mut self,
        order: &[Hash],
        fetch: &dyn Fn(&Hash) -> Option<Block>,
    ) -> Result<ReplayOutcome, Box<ReplayFailure>> {
        let mut outcome = ReplayOutcome::default();

        let extends = order.len() >= self.applied.len()
            && order[..self.applied.len()] == self.applied[..];

        if !extends {
            if order.len() < self.stable_len || order[..self.stable_len] != self.applied[..self.stable_len] {
                return Err(Box::new(ReplayFailure {
                    hash: Hash::ZERO,
                    error: MontanaError::Corruption(
                        "revised order diverges below the stable boundary".into(),
                    ),
                    outcome,
                }));
            }
            outcome.rolled_back = self.applied.len() - self.stable_len;
            warn!(
                "reorg: rolling back {} blocks to stable boundary",
                outcome.rolled_back
            );
            self.accounts = self.stable_accounts.clone();
            self.applied.truncate(self.stable_len);
        }

        let start = self.applied.len();
        for hash in &order[start..] {
            let block = match fetch(hash) {
                Some(b) => b,
                None => {
                    return Err(Box::new(ReplayFailure {
                        hash: *hash,
                        error: MontanaError::Corruption(format!(
                            "ordered block {} missing from store",
                            hash
                        )),
                        outcome,
                    }))
                }
            };
            match self.apply_for_ledger(&block) {
                Ok(applied) => outcome.applied.push(applied.block_hash),
                Err(error) => {
                    return Err(Box::new(ReplayFailure {
                        hash: *hash,
                        error,
                        outcome,
                    }))
                }
            }
        }

        Ok(outcome)
    }
}
