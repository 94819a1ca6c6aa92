//! In-memory index of unspent transaction outputs
//!
//! Keyed by (transaction ID, output index). The index is the authority for
//! balances and coin selection; blocks mutate it atomically through `apply`.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::transaction::{OutPoint, Transaction, TxOutput};
use crate::crypto::{decode_address, AddressError};

/// UTXO index errors
#[derive(Error, Debug)]
pub enum UtxoError {
    #[error("No such UTXO")]
    NoSuchUtxo,
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: i64, need: i64 },
    #[error(transparent)]
    Address(#[from] AddressError),
}

/// The unspent transaction output set.
///
/// Backed by an ordered map so iteration, and therefore coin selection,
/// is deterministic across runs and across nodes.
#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    entries: BTreeMap<OutPoint, TxOutput>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert every output of `tx` under its (id, index) key
    pub fn add(&mut self, tx: &Transaction) {
        for (index, output) in tx.outputs.iter().enumerate() {
            self.entries.insert(
                OutPoint {
                    tx_id: tx.id,
                    index: index as u32,
                },
                output.clone(),
            );
        }
    }

    /// Remove a single entry, returning the spent output
    pub fn remove(&mut self, outpoint: &OutPoint) -> Result<TxOutput, UtxoError> {
        self.entries.remove(outpoint).ok_or(UtxoError::NoSuchUtxo)
    }

    /// Look up an entry
    pub fn get(&self, outpoint: &OutPoint) -> Option<&TxOutput> {
        self.entries.get(outpoint)
    }

    /// Check whether an entry exists
    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    /// Apply a transaction: remove every referenced input, then insert every
    /// output.
    ///
    /// Atomic: if any referenced input is missing, the index is left
    /// unchanged.
    pub fn apply(&mut self, tx: &Transaction) -> Result<(), UtxoError> {
        if !tx.is_coinbase() {
            let mut spent = std::collections::BTreeSet::new();
            for input in &tx.inputs {
                let outpoint = input.outpoint().ok_or(UtxoError::NoSuchUtxo)?;
                // A second reference to the same output is already spent
                if !self.entries.contains_key(&outpoint) || !spent.insert(outpoint) {
                    return Err(UtxoError::NoSuchUtxo);
                }
            }
            for outpoint in spent {
                self.entries.remove(&outpoint);
            }
        }

        self.add(tx);
        Ok(())
    }

    /// Total value held by an address
    pub fn balance(&self, address: &str) -> Result<i64, UtxoError> {
        let pubkey_hash = decode_address(address)?;
        Ok(self
            .entries
            .values()
            .filter(|out| out.is_locked_with(&pubkey_hash))
            .map(|out| out.value)
            .sum())
    }

    /// Select outputs of `address` until their sum reaches `amount`.
    ///
    /// Iterates the index in key order, so the selection is reproducible.
    /// Returns the accumulated value and the chosen outpoints.
    pub fn select_spendable(
        &self,
        address: &str,
        amount: i64,
    ) -> Result<(i64, Vec<OutPoint>), UtxoError> {
        let pubkey_hash = decode_address(address)?;

        let mut accumulated = 0i64;
        let mut selected = Vec::new();

        for (outpoint, output) in &self.entries {
            if !output.is_locked_with(&pubkey_hash) {
                continue;
            }
            accumulated += output.value;
            selected.push(*outpoint);
            if accumulated >= amount {
                return Ok((accumulated, selected));
            }
        }

        Err(UtxoError::InsufficientFunds {
            have: accumulated,
            need: amount,
        })
    }

    /// All entries held by an address
    pub fn all_for_address(&self, address: &str) -> Result<Vec<(OutPoint, TxOutput)>, UtxoError> {
        let pubkey_hash = decode_address(address)?;
        Ok(self
            .entries
            .iter()
            .filter(|(_, out)| out.is_locked_with(&pubkey_hash))
            .map(|(op, out)| (*op, out.clone()))
            .collect())
    }

    /// Number of unspent outputs in the index
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all values in the index
    pub fn total_value(&self) -> i64 {
        self.entries.values().map(|out| out.value).sum()
    }

    /// Iterate over every entry in key order
    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &TxOutput)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::TxInput;
    use crate::crypto::KeyPair;

    fn coinbase_for(kp: &KeyPair, value: i64) -> Transaction {
        Transaction::coinbase(&kp.address(), b"utxo test", value).unwrap()
    }

    #[test]
    fn test_add_and_balance() {
        let kp = KeyPair::generate();
        let mut set = UtxoSet::new();
        set.add(&coinbase_for(&kp, 50));
        set.add(&coinbase_for(&kp, 25));

        assert_eq!(set.count(), 2);
        assert_eq!(set.balance(&kp.address()).unwrap(), 75);
    }

    #[test]
    fn test_remove_missing_fails() {
        let mut set = UtxoSet::new();
        let outpoint = OutPoint {
            tx_id: [7u8; 32],
            index: 0,
        };
        assert!(matches!(set.remove(&outpoint), Err(UtxoError::NoSuchUtxo)));
    }

    #[test]
    fn test_apply_spends_and_creates() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut set = UtxoSet::new();

        let funding = coinbase_for(&alice, 100);
        set.add(&funding);

        let spend = Transaction::new(
            vec![TxInput {
                prev_tx_id: Some(funding.id),
                out_index: 0,
                signature: Vec::new(),
                pub_key: alice.public_key_bytes().to_vec(),
            }],
            vec![
                TxOutput::locked_to(&bob.address(), 60).unwrap(),
                TxOutput::locked_to(&alice.address(), 40).unwrap(),
            ],
        );

        set.apply(&spend).unwrap();

        assert_eq!(set.count(), 2);
        assert_eq!(set.balance(&alice.address()).unwrap(), 40);
        assert_eq!(set.balance(&bob.address()).unwrap(), 60);
        assert_eq!(set.total_value(), 100);
    }

    #[test]
    fn test_apply_is_atomic_on_missing_input() {
        let alice = KeyPair::generate();
        let mut set = UtxoSet::new();
        let funding = coinbase_for(&alice, 100);
        set.add(&funding);

        // Second input references nothing
        let bad = Transaction::new(
            vec![
                TxInput {
                    prev_tx_id: Some(funding.id),
                    out_index: 0,
                    signature: Vec::new(),
                    pub_key: Vec::new(),
                },
                TxInput {
                    prev_tx_id: Some([9u8; 32]),
                    out_index: 0,
                    signature: Vec::new(),
                    pub_key: Vec::new(),
                },
            ],
            vec![TxOutput::locked_to(&alice.address(), 100).unwrap()],
        );

        assert!(set.apply(&bad).is_err());
        // The funding output must still be spendable
        assert_eq!(set.balance(&alice.address()).unwrap(), 100);
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_apply_rejects_duplicate_input() {
        let alice = KeyPair::generate();
        let mut set = UtxoSet::new();
        let funding = coinbase_for(&alice, 100);
        set.add(&funding);

        let input = TxInput {
            prev_tx_id: Some(funding.id),
            out_index: 0,
            signature: Vec::new(),
            pub_key: Vec::new(),
        };
        let bad = Transaction::new(
            vec![input.clone(), input],
            vec![TxOutput::locked_to(&alice.address(), 200).unwrap()],
        );

        assert!(matches!(set.apply(&bad), Err(UtxoError::NoSuchUtxo)));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_select_spendable() {
        let kp = KeyPair::generate();
        let mut set = UtxoSet::new();
        set.add(&coinbase_for(&kp, 30));
        set.add(&coinbase_for(&kp, 30));

        let (sum, selected) = set.select_spendable(&kp.address(), 40).unwrap();
        assert_eq!(sum, 60);
        assert_eq!(selected.len(), 2);

        let err = set.select_spendable(&kp.address(), 1000).unwrap_err();
        assert!(matches!(
            err,
            UtxoError::InsufficientFunds { have: 60, need: 1000 }
        ));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let kp = KeyPair::generate();
        let mut set = UtxoSet::new();
        for value in [10, 20, 30, 40] {
            set.add(&coinbase_for(&kp, value));
        }

        let first = set.select_spendable(&kp.address(), 55).unwrap();
        let second = set.select_spendable(&kp.address(), 55).unwrap();
        assert_eq!(first, second);
    }
}
