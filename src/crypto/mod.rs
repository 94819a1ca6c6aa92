//! Cryptographic primitives: hashing, keys, addresses, merkle trees

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, hash160, sha256, Hash, ZERO_HASH};
pub use keys::{
    decode_address, encode_address, public_key_from_bytes, sign_message, verify_signature,
    AddressError, KeyError, KeyPair, ADDRESS_VERSION,
};
pub use merkle::merkle_root;
