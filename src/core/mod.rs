//! Core consensus types: transactions, blocks, the UTXO index and the
//! chain engine

pub mod block;
pub mod blockchain;
pub mod transaction;
pub mod utxo;

pub use block::{Block, BlockHeader, BLOCK_VERSION, HEADER_SIZE};
pub use blockchain::{
    Blockchain, BlockchainError, ChainParams, ChainStats, BLOCK_SUBSIDY, GENESIS_DATA,
    MAX_FUTURE_DRIFT_SECS, RETARGET_INTERVAL, TARGET_BLOCK_SECS,
};
pub use transaction::{OutPoint, Transaction, TransactionError, TxInput, TxOutput};
pub use utxo::{UtxoError, UtxoSet};
