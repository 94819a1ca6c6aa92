//! Transaction model: inputs, outputs, canonical hashing, signing
//!
//! Transactions follow the UTXO accounting model. Every output is locked to
//! a public key hash; spending it requires a signature from the matching key
//! over a per-input sighash derived from a trimmed copy of the transaction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{
    decode_address, double_sha256, hash160, public_key_from_bytes, verify_signature, AddressError,
    Hash, KeyError, KeyPair,
};

use std::collections::HashMap;

/// Transaction-related errors
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Referenced previous transaction not found")]
    UnknownPrevTx,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Embedded public key does not match the spent output")]
    PubKeyMismatch,
    #[error("Output value must not be negative")]
    NegativeValue,
    #[error("Coinbase not allowed here")]
    UnexpectedCoinbase,
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Transaction input referencing a previous output.
///
/// Coinbase inputs reference nothing: `prev_tx_id` is `None`, `out_index`
/// is -1, and the `pub_key` slot carries arbitrary miner data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    #[serde(with = "hex_opt")]
    pub prev_tx_id: Option<Hash>,
    pub out_index: i32,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
    #[serde(with = "hex")]
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// The output this input spends, or `None` for coinbase inputs
    pub fn outpoint(&self) -> Option<OutPoint> {
        match (self.prev_tx_id, self.out_index) {
            (Some(tx_id), index) if index >= 0 => Some(OutPoint {
                tx_id,
                index: index as u32,
            }),
            _ => None,
        }
    }
}

/// Transaction output carrying value locked to a public key hash
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub value: i64,
    #[serde(with = "hex")]
    pub pubkey_hash: [u8; 20],
}

impl TxOutput {
    /// Create an output locked to the given address
    pub fn locked_to(address: &str, value: i64) -> Result<Self, TransactionError> {
        if value < 0 {
            return Err(TransactionError::NegativeValue);
        }
        Ok(Self {
            value,
            pubkey_hash: decode_address(address)?,
        })
    }

    /// Check whether this output is locked with the given public key hash
    pub fn is_locked_with(&self, pubkey_hash: &[u8; 20]) -> bool {
        &self.pubkey_hash == pubkey_hash
    }
}

/// Identifies a specific output of a previous transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutPoint {
    #[serde(with = "hex")]
    pub tx_id: Hash,
    pub index: u32,
}

/// A transaction moving value between addresses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    #[serde(with = "hex")]
    pub id: Hash,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Create a new transaction; the ID is computed from the canonical form
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self {
            id: [0u8; 32],
            inputs,
            outputs,
        };
        tx.id = tx.compute_id();
        tx
    }

    /// Create a coinbase transaction paying the block reward to `to`.
    ///
    /// The data blob lands in the public key slot of the single input; when
    /// empty, a default miner tag is used.
    pub fn coinbase(to: &str, data: &[u8], reward: i64) -> Result<Self, TransactionError> {
        let data = if data.is_empty() {
            format!("Reward to {}", to).into_bytes()
        } else {
            data.to_vec()
        };

        let input = TxInput {
            prev_tx_id: None,
            out_index: -1,
            signature: Vec::new(),
            pub_key: data,
        };
        let output = TxOutput::locked_to(to, reward)?;

        Ok(Self::new(vec![input], vec![output]))
    }

    /// Check whether this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].prev_tx_id.is_none()
            && self.inputs[0].out_index == -1
    }

    /// Canonical byte encoding of (inputs, outputs); the ID field is excluded.
    ///
    /// The encoding is deterministic: little-endian integers, u32 element
    /// counts, u32 length prefixes on variable-size fields, and a presence
    /// byte before the optional previous transaction ID.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.inputs.len() * 96 + self.outputs.len() * 28);

        buf.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            match &input.prev_tx_id {
                Some(id) => {
                    buf.push(1);
                    buf.extend_from_slice(id);
                }
                None => buf.push(0),
            }
            buf.extend_from_slice(&input.out_index.to_le_bytes());
            buf.extend_from_slice(&(input.signature.len() as u32).to_le_bytes());
            buf.extend_from_slice(&input.signature);
            buf.extend_from_slice(&(input.pub_key.len() as u32).to_le_bytes());
            buf.extend_from_slice(&input.pub_key);
        }

        buf.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            buf.extend_from_slice(&output.pubkey_hash);
        }

        buf
    }

    /// Compute the transaction ID: double SHA-256 of the canonical form
    pub fn compute_id(&self) -> Hash {
        double_sha256(&self.canonical_bytes())
    }

    /// Sum of all output values
    pub fn total_output(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Copy of this transaction with every signature and public key cleared
    fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                prev_tx_id: input.prev_tx_id,
                out_index: input.out_index,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();

        Transaction {
            id: self.id,
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// The per-input signing hash.
    ///
    /// Derived from the trimmed copy with the spent output's public key hash
    /// standing in for the input's public key slot.
    fn sighash(trimmed: &mut Transaction, index: usize, spent_pubkey_hash: &[u8; 20]) -> Hash {
        trimmed.inputs[index].pub_key = spent_pubkey_hash.to_vec();
        let digest = trimmed.compute_id();
        trimmed.inputs[index].pub_key = Vec::new();
        digest
    }

    /// Resolve the output spent by input `index` from a map of previous
    /// transactions
    fn spent_output<'a>(
        &self,
        index: usize,
        prev_txs: &'a HashMap<Hash, Transaction>,
    ) -> Result<&'a TxOutput, TransactionError> {
        let input = &self.inputs[index];
        let prev_id = input.prev_tx_id.ok_or(TransactionError::UnknownPrevTx)?;
        let prev_tx = prev_txs
            .get(&prev_id)
            .ok_or(TransactionError::UnknownPrevTx)?;
        if input.out_index < 0 {
            return Err(TransactionError::UnknownPrevTx);
        }
        prev_tx
            .outputs
            .get(input.out_index as usize)
            .ok_or(TransactionError::UnknownPrevTx)
    }

    /// Sign every input with the owner's key.
    ///
    /// `prev_txs` must contain every transaction referenced by an input;
    /// the per-input sighash binds the signature to the output being spent.
    pub fn sign(
        &mut self,
        key_pair: &KeyPair,
        prev_txs: &HashMap<Hash, Transaction>,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut trimmed = self.trimmed_copy();
        for i in 0..self.inputs.len() {
            let spent = self.spent_output(i, prev_txs)?.pubkey_hash;
            let digest = Self::sighash(&mut trimmed, i, &spent);
            let signature = key_pair.sign(&digest)?;
            self.inputs[i].signature = signature.to_vec();
        }

        Ok(())
    }

    /// Verify every input signature against the referenced previous outputs.
    ///
    /// Beyond the ECDSA check, the hash-160 of the embedded public key must
    /// equal the public key hash the spent output is locked with.
    pub fn verify(&self, prev_txs: &HashMap<Hash, Transaction>) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }

        for output in &self.outputs {
            if output.value < 0 {
                return Err(TransactionError::NegativeValue);
            }
        }

        let mut trimmed = self.trimmed_copy();
        for (i, input) in self.inputs.iter().enumerate() {
            let spent = self.spent_output(i, prev_txs)?;

            if hash160(&input.pub_key) != spent.pubkey_hash {
                return Err(TransactionError::PubKeyMismatch);
            }

            let digest = Self::sighash(&mut trimmed, i, &spent.pubkey_hash);
            let public_key = public_key_from_bytes(&input.pub_key)
                .map_err(|_| TransactionError::InvalidSignature)?;
            if !verify_signature(&public_key, &digest, &input.signature)? {
                return Err(TransactionError::InvalidSignature);
            }
        }

        Ok(())
    }
}

/// Serde adapter for `Option<Hash>` as an optional hex string
mod hex_opt {
    use crate::crypto::Hash;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Hash>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(hash) => serializer.serialize_some(&hex::encode(hash)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Hash>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            Some(text) => {
                let mut hash = [0u8; 32];
                hex::decode_to_slice(&text, &mut hash).map_err(serde::de::Error::custom)?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }
}
