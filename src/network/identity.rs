//! Persistent node identity
//!
//! Every node holds a long-lived secp256k1 key pair. The node ID is the
//! Base58Check encoding of the public key hash under a dedicated version
//! byte, and every outbound envelope is signed with the node key.

use std::fs;
use std::path::Path;

use log::info;

use crate::crypto::{hash160, keys, KeyError, KeyPair};
use crate::storage::StorageError;

/// Version byte for node IDs, distinct from wallet addresses
pub const NODE_ID_VERSION: u8 = 0x35;

/// A node's long-lived key pair and derived ID
#[derive(Clone)]
pub struct NodeIdentity {
    key_pair: KeyPair,
}

impl NodeIdentity {
    /// Load the node key from `path`, generating and persisting a fresh one
    /// on first start
    pub fn load_or_generate(path: &Path) -> Result<Self, StorageError> {
        if path.exists() {
            let hex_key = fs::read_to_string(path)
                .map_err(|e| StorageError::Inconsistent(format!("unreadable node key: {}", e)))?;
            let key_pair = KeyPair::from_secret_hex(hex_key.trim())
                .map_err(|_| StorageError::Inconsistent("malformed node key".into()))?;
            return Ok(Self { key_pair });
        }

        let key_pair = KeyPair::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::Inconsistent(format!("cannot create data dir: {}", e)))?;
        }
        fs::write(path, key_pair.secret_hex())
            .map_err(|e| StorageError::Inconsistent(format!("cannot write node key: {}", e)))?;

        let identity = Self { key_pair };
        info!("generated node identity {}", identity.node_id());
        Ok(identity)
    }

    /// Ephemeral identity, not persisted. Used in tests.
    pub fn ephemeral() -> Self {
        Self {
            key_pair: KeyPair::generate(),
        }
    }

    /// The node ID derived from the public key
    pub fn node_id(&self) -> String {
        node_id_from_pubkey(&self.key_pair.public_key_bytes())
    }

    /// The node public key in uncompressed form
    pub fn public_key_bytes(&self) -> [u8; 65] {
        self.key_pair.public_key_bytes()
    }

    /// Sign arbitrary bytes with the node key
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64], KeyError> {
        self.key_pair.sign(message)
    }
}

/// Derive a node ID from serialized public key bytes
pub fn node_id_from_pubkey(pubkey: &[u8]) -> String {
    keys::encode_versioned(NODE_ID_VERSION, &hash160(pubkey))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_key");

        let first = NodeIdentity::load_or_generate(&path).unwrap();
        let second = NodeIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first.node_id(), second.node_id());
    }

    #[test]
    fn test_node_id_differs_from_address() {
        let identity = NodeIdentity::ephemeral();
        // Different version byte, different leading characters
        assert_ne!(
            identity.node_id(),
            crate::crypto::encode_address(&hash160(&identity.public_key_bytes()))
        );
    }
}
