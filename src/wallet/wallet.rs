//! Operator wallets: a key pair plus store round-trips

use serde::{Deserialize, Serialize};

use crate::crypto::{KeyError, KeyPair};
use crate::storage::WalletRecord;

/// A wallet holding the key pair that controls an address
#[derive(Clone)]
pub struct Wallet {
    key_pair: KeyPair,
}

impl Wallet {
    /// Create a wallet with a freshly generated key pair
    pub fn new() -> Self {
        Self {
            key_pair: KeyPair::generate(),
        }
    }

    /// Import a wallet from a hex-encoded private key
    pub fn from_secret_hex(hex_key: &str) -> Result<Self, KeyError> {
        Ok(Self {
            key_pair: KeyPair::from_secret_hex(hex_key)?,
        })
    }

    /// Restore a wallet from its stored record
    pub fn from_record(record: &WalletRecord) -> Result<Self, KeyError> {
        Ok(Self {
            key_pair: KeyPair::from_secret_bytes(&record.secret_key)?,
        })
    }

    /// The wallet's address
    pub fn address(&self) -> String {
        self.key_pair.address()
    }

    /// The public key as a hex string (uncompressed form)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key_pair.public_key_bytes())
    }

    /// The signing key pair
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// Serialisable form for the wallet store
    pub fn record(&self) -> WalletRecord {
        WalletRecord {
            address: self.address(),
            public_key: self.key_pair.public_key_bytes().to_vec(),
            secret_key: self.key_pair.secret_key.secret_bytes().to_vec(),
        }
    }

    /// Public information, safe to expose on the query surface
    pub fn info(&self) -> WalletInfo {
        WalletInfo {
            address: self.address(),
            public_key: self.public_key_hex(),
        }
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Public wallet information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletInfo {
    pub address: String,
    pub public_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_creation() {
        let wallet = Wallet::new();
        assert!(!wallet.address().is_empty());
        assert_eq!(wallet.public_key_hex().len(), 130);
    }

    #[test]
    fn test_record_round_trip() {
        let wallet = Wallet::new();
        let restored = Wallet::from_record(&wallet.record()).unwrap();
        assert_eq!(wallet.address(), restored.address());
        assert_eq!(wallet.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn test_import_from_hex() {
        let wallet = Wallet::new();
        let hex_key = hex::encode(wallet.key_pair().secret_key.secret_bytes());
        let imported = Wallet::from_secret_hex(&hex_key).unwrap();
        assert_eq!(wallet.address(), imported.address());
    }
}
