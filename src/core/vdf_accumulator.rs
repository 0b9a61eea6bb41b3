//! Maps observed VDF work onto block finality.
//!
//! Every checkpoint emitted while a block heads the timechain credits its
//! iterations to that block. Crossing `T_WEAK`, `T_STRONG` and `T_FINAL`
//! advances the block's finality; levels never regress.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::core::constants::{T_FINAL, T_STRONG, T_WEAK};
use crate::core::types::{FinalityLevel, Hash};

/// Per-block accumulated work and the finality it has earned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockFinality {
    pub iterations: u64,
    pub level: FinalityLevel,
}

fn level_for(iterations: u64) -> FinalityLevel {
    if iterations >= T_FINAL {
        FinalityLevel::Final
    } else if iterations >= T_STRONG {
        FinalityLevel::Strong
    } else if iterations >= T_WEAK {
        FinalityLevel::Weak
    } else {
        FinalityLevel::None
    }
}

/// Accumulator over cumulative iterations per block hash.
#[derive(Debug, Default)]
pub struct VdfAccumulator {
    entries: HashMap<Hash, BlockFinality>,
}

/// Serializable snapshot persisted across restarts.
pub type AccumulatorSnapshot = Vec<(Hash, BlockFinality)>;

impl VdfAccumulator {
    pub fn new() -> Self {
        VdfAccumulator {
            entries: HashMap::new(),
        }
    }

    /// Credit a completed segment to `block`. Returns the block's level
    /// after the update.
    pub fn observe(&mut self, block: Hash, segment_iterations: u64) -> FinalityLevel {
        let entry = self.entries.entry(block).or_insert(BlockFinality {
            iterations: 0,
            level: FinalityLevel::None,
        });
        entry.iterations = entry.iterations.saturating_add(segment_iterations);

        let candidate = level_for(entry.iterations);
        if candidate > entry.level {
            debug!(
                "block {} finality {:?} -> {:?} ({} iterations)",
                block.short(),
                entry.level,
                candidate,
                entry.iterations
            );
            entry.level = candidate;
        }
        entry.level
    }

    pub fn level_of(&self, block: &Hash) -> FinalityLevel {
        self.entries
            .get(block)
            .map(|e| e.level)
            .unwrap_or(FinalityLevel::None)
    }

    pub fn iterations_of(&self, block: &Hash) -> u64 {
        self.entries.get(block).map(|e| e.iterations).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot in deterministic (hash) order for persistence.
    pub fn snapshot(&self) -> AccumulatorSnapshot {
        let mut entries: AccumulatorSnapshot =
            self.entries.iter().map(|(h, f)| (*h, *f)).collect();
        entries.sort_by_key(|(h, _)| *h);
        entries
    }

    /// Restore from a persisted snapshot. Existing levels are kept when
    /// higher, preserving monotonicity across restarts.
    pub fn restore(&mut self, snapshot: AccumulatorSnapshot) {
        for (hash, finality) in snapshot {
            let entry = self.entries.entry(hash).or_insert(BlockFinality {
                iterations: 0,
                level: FinalityLevel::None,
            });
            entry.iterations = entry.iterations.max(finality.iterations);
            entry.level = entry.level.max(finality.level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_advance_at_thresholds() {
        let mut acc = VdfAccumulator::new();
        let block = Hash([1u8; 32]);

        assert_eq!(acc.observe(block, T_WEAK - 1), FinalityLevel::None);
        assert_eq!(acc.observe(block, 1), FinalityLevel::Weak);
        assert_eq!(acc.observe(block, T_STRONG - T_WEAK), FinalityLevel::Strong);
        assert_eq!(acc.observe(block, T_FINAL - T_STRONG), FinalityLevel::Final);
    }

    #[test]
    fn test_finality_never_regresses() {
        let mut acc = VdfAccumulator::new();
        let block = Hash([2u8; 32]);
        acc.observe(block, T_STRONG);
        let before = acc.level_of(&block);
        // Further zero-work observations must not move the level down.
        acc.observe(block, 0);
        assert_eq!(acc.level_of(&block), before);
    }

    #[test]
    fn test_unknown_block_has_no_finality() {
        let acc = VdfAccumulator::new();
        assert_eq!(acc.level_of(&Hash([3u8; 32])), FinalityLevel::None);
        assert_eq!(acc.iterations_of(&Hash([3u8; 32])), 0);
    }

    #[test]
    fn test_blocks_tracked_independently() {
        let mut acc = VdfAccumulator::new();
        let a = Hash([4u8; 32]);
        let b = Hash([5u8; 32]);
        acc.observe(a, T_FINAL);
        acc.observe(b, T_WEAK);
        assert_eq!(acc.level_of(&a), FinalityLevel::Final);
        assert_eq!(acc.level_of(&b), FinalityLevel::Weak);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut acc = VdfAccumulator::new();
        acc.observe(Hash([6u8; 32]), T_STRONG);
        acc.observe(Hash([7u8; 32]), 10);

        let snapshot = acc.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: AccumulatorSnapshot = serde_json::from_str(&json).unwrap();

        let mut restored = VdfAccumulator::new();
        restored.restore(parsed);
        assert_eq!(restored.level_of(&Hash([6u8; 32])), FinalityLevel::Strong);
        assert_eq!(restored.iterations_of(&Hash([7u8; 32])), 10);
    }

    #[test]
    fn test_restore_keeps_higher_level() {
        let mut acc = VdfAccumulator::new();
        let block = Hash([8u8; 32]);
        acc.observe(block, T_FINAL);
        acc.restore(vec![(
            block,
            BlockFinality {
                iterations: 5,
                level: FinalityLevel::Weak,
            },
        )]);
        assert_eq!(acc.level_of(&block), FinalityLevel::Final);
    }
}
