//! PHANTOM-style DAG ordering.
//!
//! The DAG is an in-memory derived view over the block store, rebuilt at
//! startup by inserting blocks in height order. Each inserted block gets
//! a selected parent (maximal blue score, ties to the smaller hash), a
//! blue set inherited from that parent and extended with merge-set blocks
//! that satisfy the k-cluster condition, and a blue score. The canonical
//! order walks the selected-parent spine from genesis, emitting each
//! spine block's merged blues before the block itself; red blocks follow
//! in a (height, hash) tail.
//!
//! Blue sets are computed strictly within the new block's past, so the
//! coloring is independent of arrival order: any two nodes holding the
//! same block set converge on the same order.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, warn};

use crate::core::errors::{MontanaError, MontanaResult};
use crate::core::types::Hash;

/// Per-block derived state.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub hash: Hash,
    pub parents: Vec<Hash>,
    pub children: Vec<Hash>,
    pub height: u64,
    /// Parent with maximal blue score; zero for genesis.
    pub selected_parent: Hash,
    /// Blue blocks among this block's ancestors.
    pub blue_set: HashSet<Hash>,
    /// Merge-set blocks this block colored blue, in (height, hash) order.
    pub merged_blues: Vec<Hash>,
    pub blue_score: u64,
}

/// DAG with PHANTOM coloring and a cached canonical order.
pub struct PhantomDag {
    k: u32,
    genesis: Hash,
    nodes: HashMap<Hash, DagNode>,
    tips: HashSet<Hash>,
    invalid: HashSet<Hash>,
    order: Vec<Hash>,
}

impl PhantomDag {
    pub fn new(k: u32, genesis: Hash) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            genesis,
            DagNode {
                hash: genesis,
                parents: Vec::new(),
                children: Vec::new(),
                height: 0,
                selected_parent: Hash::ZERO,
                blue_set: HashSet::new(),
                merged_blues: Vec::new(),
                blue_score: 1,
            },
        );
        let mut tips = HashSet::new();
        tips.insert(genesis);
        PhantomDag {
            k,
            genesis,
            nodes,
            tips,
            invalid: HashSet::new(),
            order: vec![genesis],
        }
    }

    pub fn genesis(&self) -> Hash {
        self.genesis
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn is_invalid(&self, hash: &Hash) -> bool {
        self.invalid.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, hash: &Hash) -> Option<&DagNode> {
        self.nodes.get(hash)
    }

    /// Current tips sorted by (blue score desc, hash asc): the preferred
    /// parent set for production.
    pub fn tips(&self) -> Vec<Hash> {
        let mut tips: Vec<Hash> = self.tips.iter().copied().collect();
        tips.sort_by(|a, b| {
            let sa = self.nodes[a].blue_score;
            let sb = self.nodes[b].blue_score;
            sb.cmp(&sa).then(a.cmp(b))
        });
        tips
    }

    /// Tip maximizing blue score, ties to the smallest hash.
    pub fn virtual_selected_tip(&self) -> Hash {
        self.tips
            .iter()
            .copied()
            .max_by(|a, b| {
                let sa = self.nodes[a].blue_score;
                let sb = self.nodes[b].blue_score;
                sa.cmp(&sb).then(b.cmp(a))
            })
            .unwrap_or(self.genesis)
    }

    /// The cached canonical total order.
    pub fn ordered(&self) -> &[Hash] {
        &self.order
    }

    /// Insert an accepted block and recompute derived state. Returns
    /// false if the block is already present.
    pub fn insert(&mut self, hash: Hash, parents: &[Hash], height: u64) -> MontanaResult<bool> {
        if self.invalid.contains(&hash) {
            return Err(MontanaError::KnownInvalid(hash));
        }
        if self.nodes.contains_key(&hash) {
            return Ok(false);
        }
        for parent in parents {
            if self.invalid.contains(parent) {
                return Err(MontanaError::KnownInvalid(*parent));
            }
            if !self.nodes.contains_key(parent) {
                return Err(MontanaError::UnknownParent(*parent));
            }
        }
        if parents.is_empty() {
            return Err(MontanaError::BadStructure("non-genesis block without parents"));
        }

        let expected_height = 1 + parents
            .iter()
            .map(|p| self.nodes[p].height)
            .max()
            .unwrap_or(0);
        if height != expected_height {
            return Err(MontanaError::BadHeight {
                expected: expected_height,
                got: height,
            });
        }

        let selected_parent = self.select_parent(parents);

        // Past of the new block, with ancestor sets memoized for the
        // anticone queries below.
        let mut ancestry: HashMap<Hash, HashSet<Hash>> = HashMap::new();
        let mut past: HashSet<Hash> = HashSet::new();
        for parent in parents {
            past.insert(*parent);
            for a in self.ancestors(parent) {
                past.insert(a);
            }
        }
        for member in past.iter() {
            let anc = self.ancestors(member);
            ancestry.insert(*member, anc);
        }

        let mut blue_set = self.nodes[&selected_parent].blue_set.clone();
        blue_set.insert(selected_parent);

        // Merge set: the new block's past that the selected parent's
        // chain has not already accounted for.
        let sp_past = &ancestry[&selected_parent];
        let mut merge_set: Vec<Hash> = past
            .iter()
            .filter(|h| **h != selected_parent && !sp_past.contains(*h))
            .copied()
            .collect();
        merge_set.sort_by(|a, b| {
            let ha = self.nodes[a].height;
            let hb = self.nodes[b].height;
            ha.cmp(&hb).then(a.cmp(b))
        });

        let mut merged_blues = Vec::new();
        for candidate in merge_set {
            if self.is_blue_candidate(&candidate, &blue_set, &past, &ancestry) {
                blue_set.insert(candidate);
                merged_blues.push(candidate);
            }
        }

        let blue_score = blue_set.len() as u64 + 1;

        for parent in parents {
            self.nodes.get_mut(parent).unwrap().children.push(hash);
            self.tips.remove(parent);
        }
        self.tips.insert(hash);
        self.nodes.insert(
            hash,
            DagNode {
                hash,
                parents: parents.to_vec(),
                children: Vec::new(),
                height,
                selected_parent,
                blue_set,
                merged_blues,
                blue_score,
            },
        );

        self.recompute_order();
        debug!(
            "dag: inserted {} at height {} (blue score {}, {} tips)",
            hash.short(),
            height,
            blue_score,
            self.tips.len()
        );
        Ok(true)
    }

    /// Record a block invalid and drop it and all its descendants from
    /// the view so the order never contains them again.
    pub fn mark_invalid(&mut self, hash: &Hash) -> Vec<Hash> {
        let mut removed = Vec::new();
        if !self.nodes.contains_key(hash) {
            self.invalid.insert(*hash);
            return removed;
        }

        let mut queue = VecDeque::new();
        queue.push_back(*hash);
        let mut doomed = HashSet::new();
        while let Some(h) = queue.pop_front() {
            if doomed.insert(h) {
                if let Some(node) = self.nodes.get(&h) {
                    queue.extend(node.children.iter().copied());
                }
            }
        }

        for h in &doomed {
            self.nodes.remove(h);
            self.tips.remove(h);
            self.invalid.insert(*h);
            removed.push(*h);
        }
        for node in self.nodes.values_mut() {
            node.children.retain(|c| !doomed.contains(c));
        }
        self.tips = self
            .nodes
            .values()
            .filter(|n| n.children.is_empty())
            .map(|n| n.hash)
            .collect();

        warn!(
            "dag: marked {} invalid ({} blocks removed)",
            hash.short(),
            removed.len()
        );
        self.recompute_order();
        removed
    }

    /// All ancestors of a known block (parents transitively).
    pub fn ancestors_of(&self, hash: &Hash) -> HashSet<Hash> {
        if !self.nodes.contains_key(hash) {
            return HashSet::new();
        }
        self.ancestors(hash)
    }

    /// Canonical order restricted to a block's past, excluding the block
    /// itself: the selected-parent spine with each spine block's merged
    /// blues first, then the past's red blocks in a (height, hash) tail.
    /// Depends only on the block's past, so every node derives the same
    /// sequence.
    pub fn branch_order(&self, tip: &Hash) -> Vec<Hash> {
        let node = match self.nodes.get(tip) {
            Some(node) => node,
            None => return Vec::new(),
        };

        let mut spine = Vec::new();
        let mut cursor = node.selected_parent;
        if *tip == self.genesis {
            return Vec::new();
        }
        loop {
            spine.push(cursor);
            if cursor == self.genesis {
                break;
            }
            cursor = self.nodes[&cursor].selected_parent;
        }
        spine.reverse();

        let mut order = Vec::new();
        let mut placed: HashSet<Hash> = HashSet::new();
        for spine_block in &spine {
            for blue in &self.nodes[spine_block].merged_blues {
                if placed.insert(*blue) {
                    order.push(*blue);
                }
            }
            if placed.insert(*spine_block) {
                order.push(*spine_block);
            }
        }
        // The tip's own merged blues come after its selected parent.
        for blue in &node.merged_blues {
            if placed.insert(*blue) {
                order.push(*blue);
            }
        }

        let past = self.ancestors(tip);
        let mut reds: Vec<Hash> = past
            .iter()
            .filter(|h| !placed.contains(*h))
            .copied()
            .collect();
        reds.sort_by(|a, b| {
            let ha = self.nodes[a].height;
            let hb = self.nodes[b].height;
            ha.cmp(&hb).then(a.cmp(b))
        });
        order.extend(reds);
        order
    }

    fn select_parent(&self, parents: &[Hash]) -> Hash {
        let mut sorted = parents.to_vec();
        sorted.sort();
        let mut best = sorted[0];
        for parent in &sorted[1..] {
            if self.nodes[parent].blue_score > self.nodes[&best].blue_score {
                best = *parent;
            }
        }
        best
    }

    fn ancestors(&self, start: &Hash) -> HashSet<Hash> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Hash> = self.nodes[start].parents.iter().copied().collect();
        while let Some(h) = queue.pop_front() {
            if seen.insert(h) {
                if let Some(node) = self.nodes.get(&h) {
                    queue.extend(node.parents.iter().copied());
                }
            }
        }
        seen
    }

    /// Anticone of `x` within `context`: members that are neither
    /// ancestors nor descendants of `x`.
    fn anticone_within(
        &self,
        x: &Hash,
        context: &HashSet<Hash>,
        ancestry: &HashMap<Hash, HashSet<Hash>>,
    ) -> Vec<Hash> {
        let x_past = &ancestry[x];
        context
            .iter()
            .filter(|d| {
                **d != *x && !x_past.contains(*d) && !ancestry[*d].contains(x)
            })
            .copied()
            .collect()
    }

    /// k-cluster condition: the candidate's anticone holds at most k blue
    /// blocks, and coloring it cannot push any of those blues past k.
    fn is_blue_candidate(
        &self,
        candidate: &Hash,
        blue_set: &HashSet<Hash>,
        context: &HashSet<Hash>,
        ancestry: &HashMap<Hash, HashSet<Hash>>,
    ) -> bool {
        let anticone = self.anticone_within(candidate, context, ancestry);
        let blues_in_anticone: Vec<Hash> = anticone
            .iter()
            .filter(|h| blue_set.contains(*h))
            .copied()
            .collect();

        if blues_in_anticone.len() > self.k as usize {
            return false;
        }
        for blue in &blues_in_anticone {
            let their_anticone = self.anticone_within(blue, context, ancestry);
            let their_blues = their_anticone
                .iter()
                .filter(|h| blue_set.contains(*h))
                .count();
            if their_blues + 1 > self.k as usize {
                return false;
            }
        }
        true
    }

    fn recompute_order(&mut self) {
        let vtip = self.virtual_selected_tip();

        let mut spine = Vec::new();
        let mut cursor = vtip;
        loop {
            spine.push(cursor);
            if cursor == self.genesis {
                break;
            }
            cursor = self.nodes[&cursor].selected_parent;
        }
        spine.reverse();

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut placed: HashSet<Hash> = HashSet::new();
        for spine_block in &spine {
            for blue in &self.nodes[spine_block].merged_blues {
                if placed.insert(*blue) {
                    order.push(*blue);
                }
            }
            if placed.insert(*spine_block) {
                order.push(*spine_block);
            }
        }

        let mut reds: Vec<Hash> = self
            .nodes
            .keys()
            .filter(|h| !placed.contains(*h))
            .copied()
            .collect();
        reds.sort_by(|a, b| {
            let ha = self.nodes[a].height;
            let hb = self.nodes[b].height;
            ha.cmp(&hb).then(a.cmp(b))
        });
        order.extend(reds);

        self.order = order;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> Hash {
        Hash([n; 32])
    }

    fn genesis_dag() -> PhantomDag {
        PhantomDag::new(3, h(0))
    }

    #[test]
    fn test_genesis_only_order() {
        let dag = genesis_dag();
        assert_eq!(dag.ordered(), &[h(0)]);
        assert_eq!(dag.tips(), vec![h(0)]);
        assert_eq!(dag.virtual_selected_tip(), h(0));
    }

    #[test]
    fn test_insert_requires_known_parent() {
        let mut dag = genesis_dag();
        assert!(matches!(
            dag.insert(h(1), &[h(99)], 1),
            Err(MontanaError::UnknownParent(_))
        ));
    }

    #[test]
    fn test_insert_checks_height() {
        let mut dag = genesis_dag();
        assert!(matches!(
            dag.insert(h(1), &[h(0)], 5),
            Err(MontanaError::BadHeight { expected: 1, got: 5 })
        ));
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut dag = genesis_dag();
        assert!(dag.insert(h(1), &[h(0)], 1).unwrap());
        assert!(!dag.insert(h(1), &[h(0)], 1).unwrap());
    }

    #[test]
    fn test_concurrent_blocks_order_by_hash() {
        // Two blocks at height 1 over genesis: the tie-break places the
        // lexicographically smaller hash first.
        let mut dag = genesis_dag();
        dag.insert(h(2), &[h(0)], 1).unwrap();
        dag.insert(h(1), &[h(0)], 1).unwrap();

        let order = dag.ordered().to_vec();
        let pos1 = order.iter().position(|x| *x == h(1)).unwrap();
        let pos2 = order.iter().position(|x| *x == h(2)).unwrap();
        assert!(pos1 < pos2);
        assert_eq!(order[0], h(0));

        let mut tips = dag.tips();
        tips.sort();
        assert_eq!(tips, vec![h(1), h(2)]);
    }

    #[test]
    fn test_merging_block_orders_both_branches() {
        let mut dag = genesis_dag();
        dag.insert(h(1), &[h(0)], 1).unwrap();
        dag.insert(h(2), &[h(0)], 1).unwrap();
        dag.insert(h(3), &[h(1), h(2)], 2).unwrap();

        let order = dag.ordered().to_vec();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], h(0));
        assert_eq!(*order.last().unwrap(), h(3));
        // Both height-1 blocks are blue under k = 3 and precede the merge.
        assert!(order.contains(&h(1)) && order.contains(&h(2)));
        assert_eq!(dag.tips(), vec![h(3)]);
        assert_eq!(dag.get(&h(3)).unwrap().blue_score, 4);
    }

    #[test]
    fn test_convergence_under_arrival_order() {
        // Same block set in three arrival orders must give one order.
        let build = |sequence: &[(u8, Vec<u8>, u64)]| {
            let mut dag = genesis_dag();
            let mut deferred: Vec<(u8, Vec<u8>, u64)> = sequence.to_vec();
            // Keep retrying until all inserted (parents may arrive late).
            while !deferred.is_empty() {
                let mut next = Vec::new();
                for (hash, parents, height) in deferred {
                    let parent_hashes: Vec<Hash> = parents.iter().map(|p| h(*p)).collect();
                    match dag.insert(h(hash), &parent_hashes, height) {
                        Ok(_) => {}
                        Err(MontanaError::UnknownParent(_)) => {
                            next.push((hash, parents, height))
                        }
                        Err(e) => panic!("unexpected: {}", e),
                    }
                }
                deferred = next;
            }
            dag.ordered().to_vec()
        };

        let blocks: Vec<(u8, Vec<u8>, u64)> = vec![
            (1, vec![0], 1),
            (2, vec![0], 1),
            (3, vec![1], 2),
            (4, vec![1, 2], 2),
            (5, vec![3, 4], 3),
        ];
        let mut reversed = blocks.clone();
        reversed.reverse();
        let shuffled: Vec<(u8, Vec<u8>, u64)> = vec![
            blocks[2].clone(),
            blocks[0].clone(),
            blocks[4].clone(),
            blocks[1].clone(),
            blocks[3].clone(),
        ];

        let a = build(&blocks);
        let b = build(&reversed);
        let c = build(&shuffled);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 6);
    }

    #[test]
    fn test_order_is_topological_over_blues() {
        let mut dag = genesis_dag();
        dag.insert(h(1), &[h(0)], 1).unwrap();
        dag.insert(h(2), &[h(1)], 2).unwrap();
        dag.insert(h(3), &[h(2)], 3).unwrap();

        let order = dag.ordered();
        assert_eq!(order, &[h(0), h(1), h(2), h(3)]);
    }

    #[test]
    fn test_k_zero_marks_conflicts_red() {
        // With k = 0 no block may have a blue block in its anticone, so
        // one of two parallel blocks must be red.
        let mut dag = PhantomDag::new(0, h(0));
        dag.insert(h(1), &[h(0)], 1).unwrap();
        dag.insert(h(2), &[h(0)], 1).unwrap();
        dag.insert(h(3), &[h(1), h(2)], 2).unwrap();

        let node = dag.get(&h(3)).unwrap();
        // Only the selected parent's branch is blue.
        assert_eq!(node.blue_set.len(), 2);
        assert!(node.merged_blues.is_empty());
        // The red block still appears in the total order, in the tail.
        assert!(dag.ordered().contains(&h(2)));
    }

    #[test]
    fn test_mark_invalid_removes_subtree() {
        let mut dag = genesis_dag();
        dag.insert(h(1), &[h(0)], 1).unwrap();
        dag.insert(h(2), &[h(1)], 2).unwrap();
        dag.insert(h(3), &[h(2)], 3).unwrap();

        let removed = dag.mark_invalid(&h(2));
        assert_eq!(removed.len(), 2);
        assert!(!dag.contains(&h(2)));
        assert!(!dag.contains(&h(3)));
        assert!(dag.is_invalid(&h(2)));
        assert_eq!(dag.tips(), vec![h(1)]);
        // Re-insertion of an invalid block is refused.
        assert!(matches!(
            dag.insert(h(2), &[h(1)], 2),
            Err(MontanaError::KnownInvalid(_))
        ));
    }

    #[test]
    fn test_branch_order_is_past_local() {
        let mut dag = genesis_dag();
        dag.insert(h(1), &[h(0)], 1).unwrap();
        dag.insert(h(2), &[h(0)], 1).unwrap();
        dag.insert(h(3), &[h(1), h(2)], 2).unwrap();
        // A sibling outside h(3)'s past must not affect its branch order.
        dag.insert(h(9), &[h(0)], 1).unwrap();

        let branch = dag.branch_order(&h(3));
        assert_eq!(branch, vec![h(0), h(1), h(2)]);
        assert_eq!(dag.branch_order(&h(0)), Vec::<Hash>::new());
        assert_eq!(dag.branch_order(&h(1)), vec![h(0)]);
    }

    #[test]
    fn test_virtual_tip_prefers_heavier_subtree() {
        let mut dag = genesis_dag();
        dag.insert(h(1), &[h(0)], 1).unwrap();
        dag.insert(h(2), &[h(0)], 1).unwrap();
        dag.insert(h(3), &[h(2)], 2).unwrap();

        // h(3)'s chain carries more blue weight than lone h(1).
        assert_eq!(dag.virtual_selected_tip(), h(3));
    }
}
