//! Minicoin: a Bitcoin-style cryptocurrency node
//!
//! An append-only chain of proof-of-work blocks moving value between
//! addresses under the UTXO accounting model:
//! - double-SHA-256 block hashing with an 80-byte canonical header
//! - secp256k1 signatures and Base58Check addresses
//! - per-input transaction signing and verification
//! - difficulty retargeting over a fixed block window
//! - durable block, UTXO and metadata storage (sled)
//! - peer-to-peer block and transaction broadcast with height-based sync
//! - a transport-agnostic node service with wallets, mempool and mining
//!
//! # Example
//!
//! ```no_run
//! use minicoin::core::{Blockchain, ChainParams};
//! use minicoin::storage::ChainStore;
//! use minicoin::wallet::Wallet;
//!
//! let wallet = Wallet::new();
//! let store = ChainStore::open("./data/chain").unwrap();
//! let mut chain = Blockchain::open(store, &wallet.address(), ChainParams::default()).unwrap();
//!
//! let block = chain.append(vec![], &wallet.address()).unwrap();
//! println!("mined block {}", hex::encode(block.hash));
//! println!("balance: {}", chain.balance(&wallet.address()).unwrap());
//! ```

pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;
pub mod node;
pub mod storage;
pub mod wallet;

pub use crate::core::{Block, Blockchain, BlockchainError, ChainParams, Transaction};
pub use crate::crypto::KeyPair;
pub use crate::mining::Mempool;
pub use crate::network::{Node, NodeConfig, NodeIdentity};
pub use crate::node::{NodeError, NodeService};
pub use crate::storage::{ChainStore, WalletStore};
pub use crate::wallet::Wallet;
