//! Merkle tree construction over transaction IDs
//!
//! The root commits a block to its exact transaction list. Levels with an
//! odd number of nodes duplicate the last node before pairing.

use super::hash::{double_sha256, Hash, ZERO_HASH};

/// Calculate the merkle root from an ordered list of transaction IDs.
///
/// An empty list yields the all-zero hash; a single element is its own root.
pub fn merkle_root(tx_ids: &[Hash]) -> Hash {
    if tx_ids.is_empty() {
        return ZERO_HASH;
    }
    if tx_ids.len() == 1 {
        return tx_ids[0];
    }

    let mut level: Vec<Hash> = tx_ids.to_vec();

    while level.len() > 1 {
        if level.len() % 2 != 0 {
            level.push(*level.last().unwrap());
        }

        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&pair[0]);
            combined[32..].copy_from_slice(&pair[1]);
            next.push(double_sha256(&combined));
        }

        level = next;
    }

    level[0]
}
