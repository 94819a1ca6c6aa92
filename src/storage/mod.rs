//! Durable storage: chain store and wallet store

pub mod chain_store;
pub mod wallet_store;

pub use chain_store::{ChainStore, StorageError, STORE_VERSION};
pub use wallet_store::{WalletRecord, WalletStore};
