//! Cryptographic hashing utilities for the blockchain
//!
//! Provides the SHA-256 based hashing functions used for block hashes,
//! transaction IDs, merkle trees and address derivation.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// A 32-byte hash, used for block hashes, transaction IDs and merkle roots.
pub type Hash = [u8; 32];

/// The all-zero hash. Marks the predecessor of the genesis block.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for block hashes and transaction IDs in Bitcoin-style blockchains
pub fn double_sha256(data: &[u8]) -> Hash {
    sha256(&sha256(data))
}

/// Computes RIPEMD-160(SHA-256(data)), the Bitcoin-style public key hash
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut hasher = Ripemd160::new();
    hasher.update(sha256(data));
    hasher.finalize().into()
}
