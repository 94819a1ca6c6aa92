//! Proof-of-work: compact targets, the validity predicate, the mining loop
//!
//! The difficulty field of a header is a target bit count `b`; a header
//! hash is valid when, read as a 256-bit big-endian integer, it is strictly
//! less than `2^(256 - b)`.

use log::debug;

use crate::core::block::Block;
use crate::crypto::Hash;

/// Lowest permitted target bit count (easiest difficulty)
pub const MIN_TARGET_BITS: u32 = 8;

/// Highest permitted target bit count (hardest difficulty)
pub const MAX_TARGET_BITS: u32 = 32;

/// Default difficulty for a new chain
pub const DEFAULT_TARGET_BITS: u32 = 16;

/// Expand a target bit count into the 256-bit big-endian target value
/// `2^(256 - bits)`
pub fn target_from_bits(bits: u32) -> Hash {
    let bits = bits.clamp(MIN_TARGET_BITS, MAX_TARGET_BITS);
    let shift = 256 - bits as usize;
    let mut target = [0u8; 32];
    target[31 - shift / 8] = 1 << (shift % 8);
    target
}

/// Whether a header hash satisfies the target implied by `bits`.
///
/// Byte-wise lexicographic comparison of 32-byte big-endian values is
/// numeric comparison.
pub fn meets_target(hash: &Hash, bits: u32) -> bool {
    *hash < target_from_bits(bits)
}

/// Mine the block in place: find a nonce whose header hash satisfies the
/// block's own difficulty bits. Returns the number of hash attempts.
///
/// If the 32-bit nonce space is exhausted, the timestamp is bumped by one
/// second and the search restarts; mining never gives up.
pub fn mine_block(block: &mut Block) -> u64 {
    let bits = block.header.bits;
    let mut attempts = 0u64;

    loop {
        let mut nonce = 0u32;
        loop {
            block.header.nonce = nonce;
            let hash = block.header.hash();
            attempts += 1;

            if meets_target(&hash, bits) {
                block.hash = hash;
                return attempts;
            }

            match nonce.checked_add(1) {
                Some(next) => nonce = next,
                None => break,
            }
        }

        // Nonce space exhausted: widen the search via the timestamp
        block.header.timestamp += 1;
        debug!(
            "nonce space exhausted at {} bits, bumping timestamp to {}",
            bits, block.header.timestamp
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::Transaction;
    use crate::crypto::{KeyPair, ZERO_HASH};

    #[test]
    fn test_target_from_bits() {
        // 2^248: highest byte is 1
        let target = target_from_bits(8);
        assert_eq!(target[0], 0x01);
        assert!(target[1..].iter().all(|&b| b == 0));

        // 2^240: second byte is 1
        let target = target_from_bits(16);
        assert_eq!(target[0], 0x00);
        assert_eq!(target[1], 0x01);

        // 2^224
        let target = target_from_bits(32);
        assert_eq!(target[3], 0x01);
    }

    #[test]
    fn test_meets_target_boundaries() {
        // A hash of all zeros beats any target
        assert!(meets_target(&ZERO_HASH, MAX_TARGET_BITS));

        // The target itself is not valid (comparison is strict)
        let target = target_from_bits(16);
        assert!(!meets_target(&target, 16));

        // Anything numerically below the target is valid
        let mut below = [0u8; 32];
        below[2] = 0xFF;
        assert!(below < target);
        assert!(meets_target(&below, 16));
    }

    #[test]
    fn test_meets_target_leading_bits() {
        let mut hash = [0u8; 32];
        hash[2] = 0x0F;
        // 16 leading zero bits plus change
        assert!(meets_target(&hash, 16));
        assert!(!meets_target(&hash, 24));
    }

    #[test]
    fn test_mine_block_at_low_difficulty() {
        let kp = KeyPair::generate();
        let coinbase = Transaction::coinbase(&kp.address(), b"pow test", 50).unwrap();
        let mut block = Block::new(ZERO_HASH, vec![coinbase], 1_700_000_000, MIN_TARGET_BITS);

        let attempts = mine_block(&mut block);
        assert!(attempts >= 1);
        assert!(meets_target(&block.hash, MIN_TARGET_BITS));
        assert!(block.verify_hash());
    }
}
