//! Durable chain store backed by sled
//!
//! Three logical namespaces, one sled tree each:
//!
//! | tree    | key                  | value                 |
//! |---------|----------------------|-----------------------|
//! | `block` | block hash           | bincode-encoded block |
//! | `utxo`  | tx id || index (BE)  | bincode-encoded output|
//! | `meta`  | tip/height/difficulty/version | raw bytes    |
//!
//! A store written with an incompatible format version refuses to open.

use std::path::Path;

use thiserror::Error;

use crate::core::block::Block;
use crate::core::transaction::{OutPoint, TxOutput};
use crate::crypto::{Hash, ZERO_HASH};

/// On-disk format version. Bump on incompatible layout changes.
pub const STORE_VERSION: u32 = 1;

const META_TIP: &[u8] = b"tip";
const META_HEIGHT: &[u8] = b"height";
const META_DIFFICULTY: &[u8] = b"difficulty";
const META_VERSION: &[u8] = b"version";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open store: {0}")]
    OpenFailed(sled::Error),
    #[error("Store write failed: {0}")]
    WriteFailed(#[from] sled::Error),
    #[error("Store corrupted: {0}")]
    Corrupted(#[from] bincode::Error),
    #[error("Store corrupted: {0}")]
    Inconsistent(String),
    #[error("Incompatible store format: found version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

/// Handle to the durable block, UTXO and metadata store
pub struct ChainStore {
    db: sled::Db,
    blocks: sled::Tree,
    utxos: sled::Tree,
    meta: sled::Tree,
}

impl ChainStore {
    /// Open or create a store at `path`, checking the format version
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(StorageError::OpenFailed)?;
        let blocks = db.open_tree("block")?;
        let utxos = db.open_tree("utxo")?;
        let meta = db.open_tree("meta")?;

        match meta.get(META_VERSION)? {
            Some(raw) => {
                let found = decode_u32(&raw)?;
                if found != STORE_VERSION {
                    return Err(StorageError::VersionMismatch {
                        found,
                        expected: STORE_VERSION,
                    });
                }
            }
            None => {
                meta.insert(META_VERSION, &STORE_VERSION.to_be_bytes()[..])?;
            }
        }

        Ok(Self {
            db,
            blocks,
            utxos,
            meta,
        })
    }

    /// Persist a block under its hash
    pub fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        let encoded = bincode::serialize(block)?;
        self.blocks.insert(block.hash, encoded)?;
        Ok(())
    }

    /// Load a block by hash
    pub fn get_block(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
        match self.blocks.get(hash)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Whether a block with this hash has been persisted
    pub fn has_block(&self, hash: &Hash) -> Result<bool, StorageError> {
        Ok(self.blocks.contains_key(hash)?)
    }

    /// Record the chain tip hash
    pub fn set_tip(&self, hash: &Hash) -> Result<(), StorageError> {
        self.meta.insert(META_TIP, &hash[..])?;
        Ok(())
    }

    /// The chain tip hash, or `None` for a fresh store
    pub fn tip(&self) -> Result<Option<Hash>, StorageError> {
        match self.meta.get(META_TIP)? {
            Some(raw) => {
                if raw.len() != 32 {
                    return Err(StorageError::Inconsistent("malformed tip hash".into()));
                }
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&raw);
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    /// Record the number of applied blocks
    pub fn set_height(&self, height: u64) -> Result<(), StorageError> {
        self.meta.insert(META_HEIGHT, &height.to_be_bytes()[..])?;
        Ok(())
    }

    pub fn height(&self) -> Result<u64, StorageError> {
        match self.meta.get(META_HEIGHT)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Inconsistent("malformed height".into()))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    /// Record the current difficulty bits
    pub fn set_difficulty(&self, bits: u32) -> Result<(), StorageError> {
        self.meta.insert(META_DIFFICULTY, &bits.to_be_bytes()[..])?;
        Ok(())
    }

    pub fn difficulty(&self) -> Result<Option<u32>, StorageError> {
        match self.meta.get(META_DIFFICULTY)? {
            Some(raw) => Ok(Some(decode_u32(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist one unspent output
    pub fn put_utxo(&self, outpoint: &OutPoint, output: &TxOutput) -> Result<(), StorageError> {
        let encoded = bincode::serialize(output)?;
        self.utxos.insert(utxo_key(outpoint), encoded)?;
        Ok(())
    }

    /// Remove a spent output
    pub fn delete_utxo(&self, outpoint: &OutPoint) -> Result<(), StorageError> {
        self.utxos.remove(utxo_key(outpoint))?;
        Ok(())
    }

    /// Number of persisted UTXO entries. Used as a reload cross-check; the
    /// replayed chain is the authority.
    pub fn utxo_count(&self) -> usize {
        self.utxos.len()
    }

    /// Walk the chain backwards from the tip and return it in ascending
    /// order. Returns an empty vector for a fresh store.
    pub fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        let mut current = match self.tip()? {
            Some(tip) => tip,
            None => return Ok(Vec::new()),
        };

        let mut blocks = Vec::new();
        loop {
            let block = self.get_block(&current)?.ok_or_else(|| {
                StorageError::Inconsistent(format!("missing block {}", hex::encode(current)))
            })?;
            let prev = block.header.prev_block_hash;
            blocks.push(block);
            if prev == ZERO_HASH {
                break;
            }
            current = prev;
        }

        blocks.reverse();
        Ok(blocks)
    }

    /// Rewrite the whole store from scratch: used when adopting a chain
    /// from a peer that does not extend the local one.
    pub fn rewrite(
        &self,
        blocks: &[Block],
        bits: u32,
        utxos: impl Iterator<Item = (OutPoint, TxOutput)>,
    ) -> Result<(), StorageError> {
        self.blocks.clear()?;
        self.utxos.clear()?;

        for block in blocks {
            self.put_block(block)?;
        }
        if let Some(tip) = blocks.last() {
            self.set_tip(&tip.hash)?;
        }
        self.set_height(blocks.len() as u64)?;
        self.set_difficulty(bits)?;
        for (outpoint, output) in utxos {
            self.put_utxo(&outpoint, &output)?;
        }
        self.flush()
    }

    /// Block until sled has durably acknowledged all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn utxo_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(&outpoint.tx_id);
    key[32..].copy_from_slice(&outpoint.index.to_be_bytes());
    key
}

fn decode_u32(raw: &[u8]) -> Result<u32, StorageError> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| StorageError::Inconsistent("malformed u32 value".into()))?;
    Ok(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::Transaction;
    use crate::crypto::KeyPair;

    fn sample_block(prev: Hash) -> Block {
        let kp = KeyPair::generate();
        let coinbase = Transaction::coinbase(&kp.address(), b"store test", 50).unwrap();
        Block::new(prev, vec![coinbase], 1_700_000_000, 8)
    }

    #[test]
    fn test_block_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();

        let block = sample_block(ZERO_HASH);
        store.put_block(&block).unwrap();

        let loaded = store.get_block(&block.hash).unwrap().unwrap();
        assert_eq!(loaded, block);
        assert!(store.has_block(&block.hash).unwrap());
        assert!(store.get_block(&[1u8; 32]).unwrap().is_none());
    }

    #[test]
    fn test_meta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();

        assert!(store.tip().unwrap().is_none());
        assert_eq!(store.height().unwrap(), 0);
        assert!(store.difficulty().unwrap().is_none());

        store.set_tip(&[3u8; 32]).unwrap();
        store.set_height(7).unwrap();
        store.set_difficulty(16).unwrap();

        assert_eq!(store.tip().unwrap(), Some([3u8; 32]));
        assert_eq!(store.height().unwrap(), 7);
        assert_eq!(store.difficulty().unwrap(), Some(16));
    }

    #[test]
    fn test_load_chain_walks_back_to_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();

        let genesis = sample_block(ZERO_HASH);
        let second = sample_block(genesis.hash);
        let third = sample_block(second.hash);

        for block in [&genesis, &second, &third] {
            store.put_block(block).unwrap();
        }
        store.set_tip(&third.hash).unwrap();

        let chain = store.load_chain().unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].hash, genesis.hash);
        assert_eq!(chain[2].hash, third.hash);
    }

    #[test]
    fn test_version_check_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ChainStore::open(dir.path()).unwrap();
            store.flush().unwrap();
        }
        // Same version reopens fine
        let store = ChainStore::open(dir.path()).unwrap();
        drop(store);
    }

    #[test]
    fn test_utxo_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();

        let kp = KeyPair::generate();
        let tx = Transaction::coinbase(&kp.address(), b"", 50).unwrap();
        let outpoint = OutPoint {
            tx_id: tx.id,
            index: 0,
        };

        store.put_utxo(&outpoint, &tx.outputs[0]).unwrap();
        assert_eq!(store.utxo_count(), 1);
        store.delete_utxo(&outpoint).unwrap();
        assert_eq!(store.utxo_count(), 0);
    }
}
