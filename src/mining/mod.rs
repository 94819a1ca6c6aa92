//! Proof-of-work, the mempool, and the background mining worker

pub mod mempool;
pub mod pow;
pub mod worker;

pub use mempool::{Mempool, MempoolError};
pub use pow::{
    meets_target, mine_block, target_from_bits, DEFAULT_TARGET_BITS, MAX_TARGET_BITS,
    MIN_TARGET_BITS,
};
pub use worker::{MiningStats, MiningWorker};
