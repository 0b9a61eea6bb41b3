//! Structured progress lines for timechain events.

use colored::*;
use log::info;

use crate::core::types::{FinalityLevel, Hash};

/// Log an accepted block with its position in the timechain.
pub fn log_block_applied(hash: &Hash, height: u64, heartbeats: usize, transactions: usize) {
    info!(
        "{} block {} at height {} ({} heartbeats, {} txs)",
        "APPLIED".green().bold(),
        hash.short(),
        height,
        heartbeats,
        transactions
    );
}

/// Log a finality transition observed by the VDF accumulator.
pub fn log_finality(hash: &Hash, level: FinalityLevel, iterations: u64) {
    let label = match level {
        FinalityLevel::None => "none".normal(),
        FinalityLevel::Weak => "weak".yellow(),
        FinalityLevel::Strong => "strong".cyan(),
        FinalityLevel::Final => "final".green().bold(),
    };
    info!(
        "finality {} for block {} ({} iterations observed)",
        label,
        hash.short(),
        iterations
    );
}

/// Log synchronization progress during IBD.
pub fn log_sync_progress(current: u64, target: u64, blocks_per_sec: f64) {
    let percent = if target > 0 {
        (current as f64 / target as f64) * 100.0
    } else {
        100.0
    };
    info!(
        "{} height {}/{} ({:.1}%) - {:.1} blocks/sec",
        "SYNC".cyan(),
        current,
        target,
        percent.min(100.0),
        blocks_per_sec
    );
}

/// Log a reorganization with the rollback depth.
pub fn log_reorg(old_tip: &Hash, new_tip: &Hash, rolled_back: usize) {
    info!(
        "{} tip {} -> {} ({} blocks rolled back)",
        "REORG".yellow().bold(),
        old_tip.short(),
        new_tip.short(),
        rolled_back
    );
}
