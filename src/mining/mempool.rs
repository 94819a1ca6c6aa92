//! Pool of verified, unconfirmed transactions awaiting inclusion
//!
//! Admission contract: every entry has already been verified against the
//! current UTXO index by the caller. The pool preserves arrival order; the
//! mining worker drains it and restores the drained batch if the block is
//! not committed.

use std::collections::HashSet;

use thiserror::Error;

use crate::core::{Block, Transaction, UtxoSet};
use crate::crypto::Hash;

/// Mempool errors
#[derive(Error, Debug)]
pub enum MempoolError {
    #[error("Transaction already in the mempool")]
    DuplicateTransaction,
}

/// Ordered pool of unconfirmed transactions
#[derive(Debug, Default)]
pub struct Mempool {
    entries: Vec<Transaction>,
    ids: HashSet<Hash>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a verified transaction, preserving arrival order
    pub fn insert(&mut self, tx: Transaction) -> Result<(), MempoolError> {
        if self.ids.contains(&tx.id) {
            return Err(MempoolError::DuplicateTransaction);
        }
        self.ids.insert(tx.id);
        self.entries.push(tx);
        Ok(())
    }

    /// Take every pending transaction, leaving the pool empty
    pub fn drain(&mut self) -> Vec<Transaction> {
        self.ids.clear();
        std::mem::take(&mut self.entries)
    }

    /// Put a drained batch back at the front, keeping its original order.
    /// Used when a candidate block fails to commit.
    pub fn restore(&mut self, txs: Vec<Transaction>) {
        let mut restored: Vec<Transaction> = Vec::with_capacity(txs.len() + self.entries.len());
        for tx in txs {
            if !self.ids.contains(&tx.id) {
                self.ids.insert(tx.id);
                restored.push(tx);
            }
        }
        restored.append(&mut self.entries);
        self.entries = restored;
    }

    /// Drop every transaction that was committed in the given block
    pub fn remove_committed(&mut self, block: &Block) {
        let committed: HashSet<Hash> = block.transactions.iter().map(|tx| tx.id).collect();
        self.entries.retain(|tx| !committed.contains(&tx.id));
        self.ids.retain(|id| !committed.contains(id));
    }

    /// Drop every transaction whose inputs are no longer spendable.
    /// Called after a block lands, when committed spends may have
    /// invalidated pending entries.
    pub fn evict_conflicting(&mut self, utxos: &UtxoSet) {
        let entries = std::mem::take(&mut self.entries);
        self.ids.clear();
        for tx in entries {
            let spendable = tx.inputs.iter().all(|input| {
                input
                    .outpoint()
                    .map(|op| utxos.contains(&op))
                    .unwrap_or(false)
            });
            if spendable {
                self.ids.insert(tx.id);
                self.entries.push(tx);
            } else {
                log::debug!("evicting conflicting transaction {}", hex::encode(tx.id));
            }
        }
    }

    /// Look up a pending transaction by ID
    pub fn get(&self, id: &Hash) -> Option<&Transaction> {
        self.entries.iter().find(|tx| &tx.id == id)
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.ids.contains(id)
    }

    /// Snapshot of the pending transactions in arrival order
    pub fn transactions(&self) -> Vec<Transaction> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
