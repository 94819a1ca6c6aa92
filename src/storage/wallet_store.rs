//! Durable store for operator wallets
//!
//! Kept in its own sled database, independent of the chain store. The chain
//! engine never reads key material; only the node service front-end does.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::chain_store::StorageError;

/// Serialisable wallet material: address, public key, secret key bytes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletRecord {
    pub address: String,
    #[serde(with = "hex")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex")]
    pub secret_key: Vec<u8>,
}

/// Handle to the wallet database
pub struct WalletStore {
    db: sled::Db,
    wallets: sled::Tree,
}

impl WalletStore {
    /// Open or create a wallet store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(StorageError::OpenFailed)?;
        let wallets = db.open_tree("wallet")?;
        Ok(Self { db, wallets })
    }

    /// Persist a wallet record under its address
    pub fn save(&self, record: &WalletRecord) -> Result<(), StorageError> {
        let encoded = bincode::serialize(record)?;
        self.wallets.insert(record.address.as_bytes(), encoded)?;
        self.db.flush()?;
        Ok(())
    }

    /// Load a wallet record by address
    pub fn get(&self, address: &str) -> Result<Option<WalletRecord>, StorageError> {
        match self.wallets.get(address.as_bytes())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// All stored wallet addresses
    pub fn addresses(&self) -> Result<Vec<String>, StorageError> {
        let mut addresses = Vec::new();
        for entry in self.wallets.iter() {
            let (key, _) = entry?;
            let address = String::from_utf8(key.to_vec())
                .map_err(|_| StorageError::Inconsistent("malformed wallet key".into()))?;
            addresses.push(address);
        }
        Ok(addresses)
    }

    /// All stored wallet records
    pub fn all(&self) -> Result<Vec<WalletRecord>, StorageError> {
        let mut records = Vec::new();
        for entry in self.wallets.iter() {
            let (_, raw) = entry?;
            records.push(bincode::deserialize(&raw)?);
        }
        Ok(records)
    }

    pub fn exists(&self, address: &str) -> Result<bool, StorageError> {
        Ok(self.wallets.contains_key(address.as_bytes())?)
    }

    pub fn delete(&self, address: &str) -> Result<(), StorageError> {
        self.wallets.remove(address.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn record_for(kp: &KeyPair) -> WalletRecord {
        WalletRecord {
            address: kp.address(),
            public_key: kp.public_key_bytes().to_vec(),
            secret_key: kp.secret_key.secret_bytes().to_vec(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::open(dir.path()).unwrap();

        let kp = KeyPair::generate();
        let record = record_for(&kp);
        store.save(&record).unwrap();

        assert!(store.exists(&kp.address()).unwrap());
        assert_eq!(store.get(&kp.address()).unwrap().unwrap(), record);
        assert_eq!(store.addresses().unwrap(), vec![kp.address()]);
    }

    #[test]
    fn test_missing_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::open(dir.path()).unwrap();
        assert!(store.get("1NoSuchAddress").unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::open(dir.path()).unwrap();

        let kp = KeyPair::generate();
        store.save(&record_for(&kp)).unwrap();
        store.delete(&kp.address()).unwrap();
        assert!(!store.exists(&kp.address()).unwrap());
    }
}
