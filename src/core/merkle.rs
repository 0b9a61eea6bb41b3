//! Merkle root over an ordered leaf sequence.
//!
//! Leaf digests are `H(leaf)`, internal nodes `H(left || right)`. A level
//! with an odd number of nodes duplicates its last node. The root of an
//! empty sequence is the zero hash.

use crate::core::crypto::sha256_concat;
use crate::core::crypto::sha256;
use crate::core::types::Hash;

/// Merkle root over raw leaf encodings.
pub fn merkle_root<L: AsRef<[u8]>>(leaves: &[L]) -> Hash {
    let digests: Vec<Hash> = leaves.iter().map(|l| sha256(l.as_ref())).collect();
    merkle_root_from_digests(digests)
}

/// Merkle root over pre-hashed leaf digests.
pub fn merkle_root_from_digests(mut level: Vec<Hash>) -> Hash {
    if level.is_empty() {
        return Hash::ZERO;
    }

    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left); // odd node pairs with itself
            next.push(sha256_concat(&[left.as_bytes(), right.as_bytes()]));
        }
        level = next;
    }

    level[0]
}
