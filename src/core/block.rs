//! Block and block header structures
//!
//! The header has a fixed 80-byte canonical serialisation which is the
//! preimage of the block hash; the body is an ordered transaction list
//! committed to by the merkle root.

use serde::{Deserialize, Serialize};

use crate::core::transaction::Transaction;
use crate::crypto::{double_sha256, merkle_root, Hash, ZERO_HASH};

/// Current block format version
pub const BLOCK_VERSION: u32 = 1;

/// Size of the canonical header serialisation in bytes
pub const HEADER_SIZE: usize = 80;

/// Block header containing the chain linkage and proof-of-work fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block format version
    pub version: u32,
    /// Hash of the previous block; all zero for the genesis block
    #[serde(with = "hex")]
    pub prev_block_hash: Hash,
    /// Merkle root over the transaction IDs
    #[serde(with = "hex")]
    pub merkle_root: Hash,
    /// Unix seconds at block creation
    pub timestamp: i64,
    /// Compact difficulty: the number of target bits (see the pow module)
    pub bits: u32,
    /// Nonce found by the proof-of-work search
    pub nonce: u32,
}

impl BlockHeader {
    /// Canonical 80-byte serialisation, all integers little-endian:
    /// version (4) || prev hash (32) || merkle root (32) || timestamp (8)
    /// || bits (4) || nonce (4)
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(&self.prev_block_hash);
        buf[36..68].copy_from_slice(&self.merkle_root);
        buf[68..76].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[76..80].copy_from_slice(&self.bits.to_le_bytes());
        buf[80 - 4..].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Hash of the canonical header serialisation
    pub fn hash(&self) -> Hash {
        double_sha256(&self.serialize())
    }
}

/// A block: header plus an ordered, non-empty transaction list.
///
/// The first transaction must be the coinbase. The `hash` field caches
/// the header hash computed when the block was mined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    #[serde(with = "hex")]
    pub hash: Hash,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble an unmined block on top of `prev_block_hash`.
    ///
    /// The merkle root is computed from the transaction list; the nonce
    /// starts at zero and the cached hash matches that state.
    pub fn new(
        prev_block_hash: Hash,
        transactions: Vec<Transaction>,
        timestamp: i64,
        bits: u32,
    ) -> Self {
        let header = BlockHeader {
            version: BLOCK_VERSION,
            prev_block_hash,
            merkle_root: Self::merkle_root_of(&transactions),
            timestamp,
            bits,
            nonce: 0,
        };
        let hash = header.hash();

        Self {
            header,
            hash,
            transactions,
        }
    }

    /// Merkle root over the IDs of the given transactions
    pub fn merkle_root_of(transactions: &[Transaction]) -> Hash {
        let ids: Vec<Hash> = transactions.iter().map(|tx| tx.id).collect();
        merkle_root(&ids)
    }

    /// Check that the cached hash equals the recomputed header hash
    pub fn verify_hash(&self) -> bool {
        self.hash == self.header.hash()
    }

    /// Check that the header merkle root matches the transaction list
    pub fn verify_merkle_root(&self) -> bool {
        self.header.merkle_root == Self::merkle_root_of(&self.transactions)
    }

    /// The coinbase transaction, when the block is well formed
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Whether this block claims the genesis position
    pub fn is_genesis(&self) -> bool {
        self.header.prev_block_hash == ZERO_HASH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn sample_block() -> Block {
        let kp = KeyPair::generate();
        let coinbase = Transaction::coinbase(&kp.address(), b"test block", 50).unwrap();
        Block::new(ZERO_HASH, vec![coinbase], 1_700_000_000, 16)
    }

    #[test]
    fn test_header_serialization_is_80_bytes() {
        let block = sample_block();
        let bytes = block.header.serialize();
        assert_eq!(bytes.len(), HEADER_SIZE);

        // Spot-check the little-endian field layout
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..36], &block.header.prev_block_hash);
        assert_eq!(&bytes[68..76], &1_700_000_000i64.to_le_bytes());
        assert_eq!(&bytes[76..80], &16u32.to_le_bytes());
    }

    #[test]
    fn test_hash_changes_with_nonce() {
        let mut block = sample_block();
        let before = block.header.hash();
        block.header.nonce += 1;
        assert_ne!(block.header.hash(), before);
    }

    #[test]
    fn test_verify_hash_detects_tampering() {
        let mut block = sample_block();
        assert!(block.verify_hash());
        block.header.nonce += 1;
        assert!(!block.verify_hash());
    }

    #[test]
    fn test_verify_merkle_root_detects_tampering() {
        let mut block = sample_block();
        assert!(block.verify_merkle_root());
        block.transactions[0].id[0] ^= 0x01;
        assert!(!block.verify_merkle_root());
    }

    #[test]
    fn test_block_round_trip_preserves_hash() {
        let block = sample_block();
        let json = serde_json::to_string(&block).unwrap();
        let decoded: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.hash, block.hash);
        assert_eq!(decoded.header.hash(), block.header.hash());
    }

    #[test]
    fn test_genesis_detection() {
        let block = sample_block();
        assert!(block.is_genesis());
    }
}
