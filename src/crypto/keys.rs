//! ECDSA key management and address encoding
//!
//! Provides key pair generation, signing, and verification using
//! the secp256k1 elliptic curve (same as Bitcoin), plus Base58Check
//! address encoding over the public key hash.

use rand::rngs::OsRng;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::{double_sha256, hash160, sha256};

/// Version byte prepended to the public key hash when encoding addresses.
pub const ADDRESS_VERSION: u8 = 0x00;

/// Number of checksum bytes appended to an encoded address.
pub const CHECKSUM_LEN: usize = 4;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// Errors that can occur while decoding an address
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address")]
    InvalidAddress,
    #[error("Address checksum mismatch")]
    ChecksumMismatch,
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from raw secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_secret_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        Self::from_secret_bytes(&bytes)
    }

    /// Get the private key as a hex string
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Public key in the 65-byte uncompressed form (0x04 || X || Y)
    pub fn public_key_bytes(&self) -> [u8; 65] {
        self.public_key.serialize_uncompressed()
    }

    /// Derive the blockchain address for this key pair
    pub fn address(&self) -> String {
        encode_address(&hash160(&self.public_key_bytes()))
    }

    /// Sign a message with the private key.
    ///
    /// The message is hashed with SHA-256 before signing; the signature is
    /// the fixed-width 64-byte concatenation of the R and S scalars.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64], KeyError> {
        sign_message(&self.secret_key, message)
    }
}

/// Sign a message with a secret key, returning the 64-byte compact signature
pub fn sign_message(secret_key: &SecretKey, message: &[u8]) -> Result<[u8; 64], KeyError> {
    let secp = Secp256k1::new();
    let digest = sha256(message);
    let message = Message::from_digest_slice(&digest)?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(signature.serialize_compact())
}

/// Verify a 64-byte compact signature against a message and public key.
///
/// Returns `Ok(false)` when the scalars are out of range or the ECDSA
/// equation does not hold.
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::new();
    let digest = sha256(message);
    let message = Message::from_digest_slice(&digest)?;

    let sig = match secp256k1::ecdsa::Signature::from_compact(signature) {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };

    Ok(secp.verify_ecdsa(&message, &sig, public_key).is_ok())
}

/// Parse a public key from its serialized bytes (compressed or uncompressed)
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, KeyError> {
    PublicKey::from_slice(bytes).map_err(|_| KeyError::InvalidPublicKey)
}

/// Encode a 20-byte public key hash into a Base58Check address
pub fn encode_address(pubkey_hash: &[u8; 20]) -> String {
    encode_versioned(ADDRESS_VERSION, pubkey_hash)
}

/// Base58Check-encode an arbitrary 20-byte payload under a version byte
pub fn encode_versioned(version: u8, payload: &[u8; 20]) -> String {
    let mut bytes = Vec::with_capacity(1 + 20 + CHECKSUM_LEN);
    bytes.push(version);
    bytes.extend_from_slice(payload);
    let checksum = double_sha256(&bytes);
    bytes.extend_from_slice(&checksum[..CHECKSUM_LEN]);
    bs58::encode(bytes).into_string()
}

/// Decode a Base58Check address back to the 20-byte public key hash.
///
/// Fails with `InvalidAddress` on a base58 error or short payload, and with
/// `ChecksumMismatch` when the trailing checksum does not match.
pub fn decode_address(address: &str) -> Result<[u8; 20], AddressError> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|_| AddressError::InvalidAddress)?;

    if decoded.len() != 1 + 20 + CHECKSUM_LEN {
        return Err(AddressError::InvalidAddress);
    }

    let (payload, checksum) = decoded.split_at(decoded.len() - CHECKSUM_LEN);
    let expected = double_sha256(payload);
    if checksum != &expected[..CHECKSUM_LEN] {
        return Err(AddressError::ChecksumMismatch);
    }

    let mut pubkey_hash = [0u8; 20];
    pubkey_hash.copy_from_slice(&payload[1..]);
    Ok(pubkey_hash)
}
