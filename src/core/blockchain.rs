//! The chain engine: genesis, append-with-validation, difficulty
//! retargeting, peer receive path and lookups
//!
//! The engine owns the in-memory block list, the UTXO index and the durable
//! store. Blocks enter either through `append` (local mining) or `receive`
//! (peer delivery); both paths run the same validation.

use std::collections::HashMap;

use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::block::Block;
use crate::core::transaction::{OutPoint, Transaction, TransactionError, TxInput, TxOutput};
use crate::core::utxo::{UtxoError, UtxoSet};
use crate::crypto::{AddressError, Hash, KeyPair};
use crate::mining::pow::{self, DEFAULT_TARGET_BITS, MAX_TARGET_BITS, MIN_TARGET_BITS};
use crate::storage::{ChainStore, StorageError};

/// Block subsidy paid to the miner, in smallest units
pub const BLOCK_SUBSIDY: i64 = 50 * 100_000_000;

/// Data embedded in the genesis coinbase
pub const GENESIS_DATA: &str = "minicoin genesis: in math we trust";

/// Blocks between difficulty reassessments
pub const RETARGET_INTERVAL: u64 = 10;

/// Target seconds between consecutive blocks
pub const TARGET_BLOCK_SECS: i64 = 10;

/// Maximum clock skew tolerated on inbound block timestamps
pub const MAX_FUTURE_DRIFT_SECS: i64 = 2 * 60 * 60;

/// Chain engine errors
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("Invalid proof of work")]
    InvalidProofOfWork,
    #[error("Cached block hash does not match the header")]
    HashMismatch,
    #[error("Merkle root mismatch")]
    MerkleRootMismatch,
    #[error("Previous block hash does not match the chain tip")]
    PrevHashMismatch,
    #[error("Block timestamp too far in the future")]
    TimestampTooFarFuture,
    #[error("Block has no transactions")]
    EmptyBlock,
    #[error("First transaction is not a coinbase")]
    MissingCoinbase,
    #[error("Block contains more than one coinbase")]
    MultipleCoinbase,
    #[error("Value not conserved: inputs {inputs}, outputs {outputs}")]
    ValueNotConserved { inputs: i64, outputs: i64 },
    #[error("Block already known")]
    AlreadyKnown,
    #[error("Block not found")]
    NoSuchBlock,
    #[error("Replacement chain is not better than the local one")]
    ChainNotBetter,
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),
    #[error(transparent)]
    Utxo(#[from] UtxoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Address(#[from] AddressError),
}

/// Consensus parameters. Tests shrink the retarget window; deployments use
/// the defaults.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Difficulty bits for the genesis block and fresh chains
    pub target_bits: u32,
    /// Blocks between difficulty reassessments
    pub retarget_interval: u64,
    /// Expected seconds between consecutive blocks
    pub target_block_secs: i64,
    /// Fixed miner subsidy in smallest units
    pub subsidy: i64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            target_bits: DEFAULT_TARGET_BITS,
            retarget_interval: RETARGET_INTERVAL,
            target_block_secs: TARGET_BLOCK_SECS,
            subsidy: BLOCK_SUBSIDY,
        }
    }
}

/// Chain-level summary for the query surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStats {
    pub height: u64,
    pub tip_hash: String,
    pub difficulty: u32,
    pub total_transactions: u64,
}

/// The blockchain engine
pub struct Blockchain {
    params: ChainParams,
    blocks: Vec<Block>,
    bits: u32,
    utxos: UtxoSet,
    store: ChainStore,
}

impl Blockchain {
    /// Open a chain on the given store.
    ///
    /// A fresh store gets a mined genesis block paying the operator; an
    /// existing store is reloaded and the UTXO index rebuilt by replay.
    pub fn open(
        store: ChainStore,
        operator_address: &str,
        params: ChainParams,
    ) -> Result<Self, BlockchainError> {
        if store.tip()?.is_some() {
            Self::reload(store, params)
        } else {
            Self::bootstrap(store, operator_address, params)
        }
    }

    fn bootstrap(
        store: ChainStore,
        operator_address: &str,
        params: ChainParams,
    ) -> Result<Self, BlockchainError> {
        info!("creating new blockchain, genesis paying {}", operator_address);

        let coinbase =
            Transaction::coinbase(operator_address, GENESIS_DATA.as_bytes(), params.subsidy)?;
        let mut genesis = Block::new(
            crate::crypto::ZERO_HASH,
            vec![coinbase],
            Utc::now().timestamp(),
            params.target_bits,
        );
        let attempts = pow::mine_block(&mut genesis);
        info!(
            "genesis mined after {} attempts: {}",
            attempts,
            hex::encode(genesis.hash)
        );

        let mut utxos = UtxoSet::new();
        utxos.apply(&genesis.transactions[0])?;

        store.put_block(&genesis)?;
        store.set_tip(&genesis.hash)?;
        store.set_height(1)?;
        store.set_difficulty(params.target_bits)?;
        for (outpoint, output) in utxos.iter() {
            store.put_utxo(outpoint, output)?;
        }
        store.flush()?;

        Ok(Self {
            bits: params.target_bits,
            params,
            blocks: vec![genesis],
            utxos,
            store,
        })
    }

    fn reload(store: ChainStore, params: ChainParams) -> Result<Self, BlockchainError> {
        let blocks = store.load_chain()?;
        let bits = store.difficulty()?.unwrap_or(params.target_bits);

        let mut utxos = UtxoSet::new();
        for block in &blocks {
            for tx in &block.transactions {
                utxos.apply(tx)?;
            }
        }

        // The persisted utxo namespace is a cross-check only
        if store.utxo_count() != utxos.count() {
            warn!(
                "persisted UTXO count {} differs from replayed count {}; trusting the replay",
                store.utxo_count(),
                utxos.count()
            );
        }

        info!(
            "loaded blockchain: {} blocks, difficulty {} bits",
            blocks.len(),
            bits
        );

        Ok(Self {
            params,
            blocks,
            bits,
            utxos,
            store,
        })
    }

    /// Number of applied blocks
    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// The most recent block
    pub fn tip(&self) -> &Block {
        self.blocks.last().expect("chain always holds genesis")
    }

    /// Current difficulty bits for the next block
    pub fn current_bits(&self) -> u32 {
        self.bits
    }

    /// Consensus parameters in force
    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Block at the given position (0 = genesis)
    pub fn block_at(&self, index: u64) -> Option<&Block> {
        self.blocks.get(index as usize)
    }

    /// Find a block by its hash
    pub fn block_by_hash(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.iter().find(|b| &b.hash == hash)
    }

    /// Blocks from `from` onwards, at most `limit`
    pub fn blocks_from(&self, from: u64, limit: usize) -> Vec<Block> {
        self.blocks
            .iter()
            .skip(from as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Find a committed transaction by ID
    pub fn find_transaction(&self, id: &Hash) -> Option<&Transaction> {
        find_tx_in(&self.blocks, id)
    }

    /// Read-only view of the UTXO index
    pub fn utxos(&self) -> &UtxoSet {
        &self.utxos
    }

    /// Balance of an address in smallest units
    pub fn balance(&self, address: &str) -> Result<i64, BlockchainError> {
        Ok(self.utxos.balance(address)?)
    }

    /// Chain summary for the query surface
    pub fn stats(&self) -> ChainStats {
        let total_transactions = self
            .blocks
            .iter()
            .map(|b| b.transactions.len() as u64)
            .sum();
        ChainStats {
            height: self.height(),
            tip_hash: hex::encode(self.tip().hash),
            difficulty: self.bits,
            total_transactions,
        }
    }

    /// Mine and append a block carrying `candidate_txs`, paying the subsidy
    /// to `miner_address`. Blocks the caller for the duration of the
    /// proof-of-work search.
    pub fn append(
        &mut self,
        candidate_txs: Vec<Transaction>,
        miner_address: &str,
    ) -> Result<Block, BlockchainError> {
        let mut block = self.build_template(candidate_txs, miner_address)?;
        let attempts = pow::mine_block(&mut block);
        info!(
            "mined block {} after {} attempts at {} bits",
            hex::encode(block.hash),
            attempts,
            block.header.bits
        );
        self.connect(block.clone())?;
        Ok(block)
    }

    /// Assemble an unmined candidate block on the current tip.
    ///
    /// Verifies the candidate transactions against the current UTXO index
    /// first, honouring spends of outputs created earlier in the same
    /// candidate list, and fails fast on the first invalid one. The caller
    /// mines the returned block and hands it to `connect`; a tip that moved
    /// in the meantime makes `connect` reject it.
    pub fn build_template(
        &self,
        candidate_txs: Vec<Transaction>,
        miner_address: &str,
    ) -> Result<Block, BlockchainError> {
        let coinbase = Transaction::coinbase(
            miner_address,
            format!("Block {} reward", self.height()).as_bytes(),
            self.params.subsidy,
        )?;

        // Fail fast before mining: each candidate must verify against the
        // chain state plus the candidates before it.
        let mut overlay = self.utxos.clone();
        let mut pending: HashMap<Hash, Transaction> = HashMap::new();
        for tx in &candidate_txs {
            if tx.is_coinbase() {
                return Err(TransactionError::UnexpectedCoinbase.into());
            }
            verify_tx_against(&self.blocks, tx, &overlay, &pending)?;
            overlay.apply(tx)?;
            pending.insert(tx.id, tx.clone());
        }

        let mut transactions = vec![coinbase];
        transactions.extend(candidate_txs);

        Ok(Block::new(
            self.tip().hash,
            transactions,
            Utc::now().timestamp(),
            self.bits,
        ))
    }

    /// Split candidates into a mineable prefix-consistent set, dropping the
    /// ones that no longer verify. Used by the mining worker so one stale
    /// transaction cannot wedge the loop.
    pub fn filter_candidates(&self, candidate_txs: Vec<Transaction>) -> Vec<Transaction> {
        let mut overlay = self.utxos.clone();
        let mut pending: HashMap<Hash, Transaction> = HashMap::new();
        let mut kept = Vec::with_capacity(candidate_txs.len());

        for tx in candidate_txs {
            if tx.is_coinbase() {
                continue;
            }
            match verify_tx_against(&self.blocks, &tx, &overlay, &pending) {
                Ok(()) => {
                    if overlay.apply(&tx).is_ok() {
                        pending.insert(tx.id, tx.clone());
                        kept.push(tx);
                    }
                }
                Err(err) => {
                    warn!("dropping unmineable transaction {}: {}", hex::encode(tx.id), err);
                }
            }
        }

        kept
    }

    /// Accept a block delivered by a peer.
    ///
    /// Returns `Ok(false)` when the block is already known. A block whose
    /// predecessor is not the current tip is rejected with
    /// `PrevHashMismatch`; competing branches are dropped, first seen wins.
    pub fn receive(&mut self, block: Block) -> Result<bool, BlockchainError> {
        if self.block_by_hash(&block.hash).is_some() {
            return Ok(false);
        }
        self.connect(block)?;
        Ok(true)
    }

    /// Validate a mined block against the current tip, apply it to the UTXO
    /// index, append it and persist. The single commit point for both the
    /// local mining and the peer receive path.
    pub fn connect(&mut self, block: Block) -> Result<(), BlockchainError> {
        let new_utxos = validate_block_against(&self.blocks, &self.utxos, &block)?;

        let spent = spent_outpoints(&block);
        let created = created_outputs(&block);
        let new_height = self.height() + 1;
        let new_bits = retarget(&self.params, &self.blocks, self.bits, &block, new_height);

        // Persist before exposing the block to readers
        self.store.put_block(&block)?;
        self.store.set_tip(&block.hash)?;
        self.store.set_height(new_height)?;
        self.store.set_difficulty(new_bits)?;
        for outpoint in &spent {
            self.store.delete_utxo(outpoint)?;
        }
        for (outpoint, output) in &created {
            self.store.put_utxo(outpoint, output)?;
        }
        self.store.flush()?;

        if new_bits != self.bits {
            info!("difficulty adjusted: {} -> {} bits", self.bits, new_bits);
        }
        self.bits = new_bits;
        self.utxos = new_utxos;
        self.blocks.push(block);

        Ok(())
    }

    /// Verify a standalone transaction against the current UTXO index.
    /// The admission check for mempool entries, local or from peers.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<(), BlockchainError> {
        if tx.is_coinbase() {
            return Err(TransactionError::UnexpectedCoinbase.into());
        }
        verify_tx_against(&self.blocks, tx, &self.utxos, &HashMap::new())
    }

    /// Build and sign a transaction moving `amount` from `from` to `to`,
    /// spending deterministically selected outputs and returning change.
    pub fn create_transaction(
        &self,
        from: &str,
        to: &str,
        amount: i64,
        key_pair: &KeyPair,
    ) -> Result<Transaction, BlockchainError> {
        if amount < 0 {
            return Err(TransactionError::NegativeValue.into());
        }

        let (accumulated, selected) = self.utxos.select_spendable(from, amount)?;

        let inputs: Vec<TxInput> = selected
            .iter()
            .map(|outpoint| TxInput {
                prev_tx_id: Some(outpoint.tx_id),
                out_index: outpoint.index as i32,
                signature: Vec::new(),
                pub_key: key_pair.public_key_bytes().to_vec(),
            })
            .collect();

        let mut outputs = vec![TxOutput::locked_to(to, amount)?];
        if accumulated > amount {
            outputs.push(TxOutput::locked_to(from, accumulated - amount)?);
        }

        let mut tx = Transaction::new(inputs, outputs);

        let mut prev_txs: HashMap<Hash, Transaction> = HashMap::new();
        for outpoint in &selected {
            if let Some(prev) = self.find_transaction(&outpoint.tx_id) {
                prev_txs.insert(outpoint.tx_id, prev.clone());
            }
        }
        tx.sign(key_pair, &prev_txs)?;

        Ok(tx)
    }

    /// Adopt a complete replacement chain downloaded from a peer.
    ///
    /// Used during bootstrap sync when the remote chain does not extend the
    /// local one (different genesis). The replacement must be strictly
    /// longer and validate from its genesis forward; on success the whole
    /// local state, memory and store, is rewritten.
    pub fn replace_chain(&mut self, blocks: Vec<Block>) -> Result<(), BlockchainError> {
        if blocks.len() as u64 <= self.height() {
            return Err(BlockchainError::ChainNotBetter);
        }
        let (utxos, bits) = audit_chain(&self.params, &blocks)?;

        self.store
            .rewrite(&blocks, bits, utxos.iter().map(|(op, out)| (*op, out.clone())))?;

        info!(
            "adopted replacement chain: {} blocks, difficulty {} bits",
            blocks.len(),
            bits
        );

        self.blocks = blocks;
        self.utxos = utxos;
        self.bits = bits;
        Ok(())
    }

    /// Audit the whole committed chain: linkage, proof-of-work, hashes and
    /// merkle roots for every block.
    pub fn validate_chain(&self) -> bool {
        for (i, block) in self.blocks.iter().enumerate() {
            if !pow::meets_target(&block.header.hash(), block.header.bits) {
                return false;
            }
            if !block.verify_hash() || !block.verify_merkle_root() {
                return false;
            }
            if i > 0 && block.header.prev_block_hash != self.blocks[i - 1].hash {
                return false;
            }
        }
        true
    }
}

/// Full validation of `block` on top of `blocks` with UTXO view `utxos`.
/// Returns the UTXO index as it stands after the block.
fn validate_block_against(
    blocks: &[Block],
    utxos: &UtxoSet,
    block: &Block,
) -> Result<UtxoSet, BlockchainError> {
    // Proof of work against the difficulty the block itself records
    if !pow::meets_target(&block.header.hash(), block.header.bits) {
        return Err(BlockchainError::InvalidProofOfWork);
    }

    if !block.verify_hash() {
        return Err(BlockchainError::HashMismatch);
    }

    if !block.verify_merkle_root() {
        return Err(BlockchainError::MerkleRootMismatch);
    }

    match blocks.last() {
        Some(tip) if block.header.prev_block_hash == tip.hash => {}
        Some(_) => return Err(BlockchainError::PrevHashMismatch),
        None if block.is_genesis() => {}
        None => return Err(BlockchainError::PrevHashMismatch),
    }

    let now = Utc::now().timestamp();
    if block.header.timestamp > now + MAX_FUTURE_DRIFT_SECS {
        return Err(BlockchainError::TimestampTooFarFuture);
    }

    validate_structure(block)?;

    // Transaction validation with intra-block visibility: an output created
    // earlier in the block is spendable by a later transaction.
    let mut overlay = utxos.clone();
    let mut pending: HashMap<Hash, Transaction> = HashMap::new();
    for tx in &block.transactions {
        if !tx.is_coinbase() {
            verify_tx_against(blocks, tx, &overlay, &pending)?;
        }
        overlay.apply(tx)?;
        pending.insert(tx.id, tx.clone());
    }

    Ok(overlay)
}

/// Structural checks: non-empty, exactly one coinbase, at index 0
fn validate_structure(block: &Block) -> Result<(), BlockchainError> {
    if block.transactions.is_empty() {
        return Err(BlockchainError::EmptyBlock);
    }
    if !block.transactions[0].is_coinbase() {
        return Err(BlockchainError::MissingCoinbase);
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(BlockchainError::MultipleCoinbase);
    }
    Ok(())
}

/// Verify a non-coinbase transaction against a UTXO view and a set of
/// not-yet-committed transactions: signatures, ownership, unspentness and
/// value conservation.
fn verify_tx_against(
    blocks: &[Block],
    tx: &Transaction,
    utxos: &UtxoSet,
    pending: &HashMap<Hash, Transaction>,
) -> Result<(), BlockchainError> {
    let mut prev_txs: HashMap<Hash, Transaction> = HashMap::new();
    let mut seen_inputs = std::collections::BTreeSet::new();
    let mut input_sum = 0i64;

    for input in &tx.inputs {
        let outpoint = input.outpoint().ok_or(TransactionError::UnknownPrevTx)?;
        // A repeated outpoint would double-count the spent value
        if !seen_inputs.insert(outpoint) {
            return Err(UtxoError::NoSuchUtxo.into());
        }
        let spent = utxos.get(&outpoint).ok_or(UtxoError::NoSuchUtxo)?;
        input_sum += spent.value;

        if !prev_txs.contains_key(&outpoint.tx_id) {
            let prev = pending
                .get(&outpoint.tx_id)
                .or_else(|| find_tx_in(blocks, &outpoint.tx_id))
                .ok_or(TransactionError::UnknownPrevTx)?;
            prev_txs.insert(outpoint.tx_id, prev.clone());
        }
    }

    tx.verify(&prev_txs)?;

    let output_sum = tx.total_output();
    if input_sum < output_sum {
        return Err(BlockchainError::ValueNotConserved {
            inputs: input_sum,
            outputs: output_sum,
        });
    }

    Ok(())
}

/// Difficulty bits in force after connecting `block` as block `new_height`.
///
/// Every `retarget_interval` applied blocks the window spanning the last
/// interval is compared against the expected duration: less than half
/// raises the difficulty by one bit, more than double lowers it, clamped to
/// [8, 32]. The new value takes effect on the next block.
fn retarget(
    params: &ChainParams,
    blocks: &[Block],
    current_bits: u32,
    block: &Block,
    new_height: u64,
) -> u32 {
    let interval = params.retarget_interval;
    if interval == 0 || new_height % interval != 0 || new_height < interval {
        return current_bits;
    }

    let window_start = &blocks[(new_height - interval) as usize];
    let elapsed = block.header.timestamp - window_start.header.timestamp;
    let expected = params.target_block_secs * interval as i64;

    if elapsed < expected / 2 && current_bits < MAX_TARGET_BITS {
        current_bits + 1
    } else if elapsed > expected * 2 && current_bits > MIN_TARGET_BITS {
        current_bits - 1
    } else {
        current_bits
    }
}

/// Validate an independent chain from genesis forward, returning the final
/// UTXO index and difficulty bits.
fn audit_chain(params: &ChainParams, blocks: &[Block]) -> Result<(UtxoSet, u32), BlockchainError> {
    let genesis = blocks.first().ok_or(BlockchainError::EmptyBlock)?;
    if !genesis.is_genesis() {
        return Err(BlockchainError::PrevHashMismatch);
    }

    let mut accepted: Vec<Block> = Vec::with_capacity(blocks.len());
    let mut utxos = validate_block_against(&accepted, &UtxoSet::new(), genesis)?;
    let mut bits = genesis.header.bits;
    accepted.push(genesis.clone());

    for block in &blocks[1..] {
        let next = validate_block_against(&accepted, &utxos, block)?;
        let new_height = accepted.len() as u64 + 1;
        bits = retarget(params, &accepted, bits, block, new_height);
        utxos = next;
        accepted.push(block.clone());
    }

    Ok((utxos, bits))
}

fn find_tx_in<'a>(blocks: &'a [Block], id: &Hash) -> Option<&'a Transaction> {
    blocks
        .iter()
        .flat_map(|b| b.transactions.iter())
        .find(|tx| &tx.id == id)
}

fn spent_outpoints(block: &Block) -> Vec<OutPoint> {
    block
        .transactions
        .iter()
        .filter(|tx| !tx.is_coinbase())
        .flat_map(|tx| tx.inputs.iter().filter_map(|input| input.outpoint()))
        .collect()
}

fn created_outputs(block: &Block) -> Vec<(OutPoint, TxOutput)> {
    block
        .transactions
        .iter()
        .flat_map(|tx| {
            tx.outputs.iter().enumerate().map(move |(index, output)| {
                (
                    OutPoint {
                        tx_id: tx.id,
                        index: index as u32,
                    },
                    output.clone(),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn test_params() -> ChainParams {
        ChainParams {
            target_bits: MIN_TARGET_BITS,
            ..ChainParams::default()
        }
    }

    fn fresh_chain(dir: &tempfile::TempDir, operator: &KeyPair) -> Blockchain {
        let store = ChainStore::open(dir.path().join("chain")).unwrap();
        Blockchain::open(store, &operator.address(), test_params()).unwrap()
    }

    #[test]
    fn test_genesis_creation() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let chain = fresh_chain(&dir, &operator);

        assert_eq!(chain.height(), 1);
        assert!(chain.tip().is_genesis());
        assert_eq!(chain.balance(&operator.address()).unwrap(), BLOCK_SUBSIDY);
        assert_eq!(chain.utxos().count(), 1);
        assert!(chain.validate_chain());
    }

    #[test]
    fn test_append_empty_block() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let mut chain = fresh_chain(&dir, &operator);

        let block = chain.append(vec![], &operator.address()).unwrap();

        assert_eq!(chain.height(), 2);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(
            chain.balance(&operator.address()).unwrap(),
            2 * BLOCK_SUBSIDY
        );
    }

    #[test]
    fn test_append_with_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let recipient = KeyPair::generate();
        let mut chain = fresh_chain(&dir, &operator);

        let tx = chain
            .create_transaction(
                &operator.address(),
                &recipient.address(),
                30 * 100_000_000,
                &operator,
            )
            .unwrap();
        chain.append(vec![tx], &operator.address()).unwrap();

        assert_eq!(
            chain.balance(&recipient.address()).unwrap(),
            30 * 100_000_000
        );
        // change + fresh subsidy
        assert_eq!(
            chain.balance(&operator.address()).unwrap(),
            20 * 100_000_000 + BLOCK_SUBSIDY
        );
        assert_eq!(chain.utxos().count(), 3);
    }

    #[test]
    fn test_intra_block_spend() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let middle = KeyPair::generate();
        let last = KeyPair::generate();
        let mut chain = fresh_chain(&dir, &operator);

        // First candidate pays `middle`; second spends that fresh output
        let first = chain
            .create_transaction(&operator.address(), &middle.address(), BLOCK_SUBSIDY, &operator)
            .unwrap();

        let input = TxInput {
            prev_tx_id: Some(first.id),
            out_index: 0,
            signature: Vec::new(),
            pub_key: middle.public_key_bytes().to_vec(),
        };
        let mut second = Transaction::new(
            vec![input],
            vec![TxOutput::locked_to(&last.address(), BLOCK_SUBSIDY).unwrap()],
        );
        let prev_txs = HashMap::from([(first.id, first.clone())]);
        second.sign(&middle, &prev_txs).unwrap();

        chain
            .append(vec![first, second], &operator.address())
            .unwrap();

        assert_eq!(chain.balance(&last.address()).unwrap(), BLOCK_SUBSIDY);
        assert_eq!(chain.balance(&middle.address()).unwrap(), 0);
    }

    #[test]
    fn test_filter_candidates_drops_stale() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let mut chain = fresh_chain(&dir, &operator);

        // Two transactions spending the same output: only the first survives
        let t1 = chain
            .create_transaction(&operator.address(), &a.address(), BLOCK_SUBSIDY, &operator)
            .unwrap();
        let t2 = chain
            .create_transaction(&operator.address(), &b.address(), BLOCK_SUBSIDY, &operator)
            .unwrap();

        let kept = chain.filter_candidates(vec![t1.clone(), t2]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, t1.id);

        chain.append(kept, &operator.address()).unwrap();
        assert_eq!(chain.balance(&a.address()).unwrap(), BLOCK_SUBSIDY);
    }

    #[test]
    fn test_receive_rejects_bad_prev_hash() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let mut chain = fresh_chain(&dir1, &operator);
        let mut other = fresh_chain(&dir2, &operator);

        // A block mined on a different chain does not extend our tip
        let foreign = other.append(vec![], &operator.address()).unwrap();
        let err = chain.receive(foreign).unwrap_err();
        assert!(matches!(err, BlockchainError::PrevHashMismatch));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn test_receive_drops_known_block() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let mut chain = fresh_chain(&dir, &operator);

        let block = chain.append(vec![], &operator.address()).unwrap();
        assert!(!chain.receive(block).unwrap());
        assert_eq!(chain.height(), 2);
    }

    #[test]
    fn test_receive_accepts_block_mined_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let mut chain = fresh_chain(&dir, &operator);

        let block = {
            let mut template = chain.build_template(vec![], &operator.address()).unwrap();
            pow::mine_block(&mut template);
            template
        };

        assert!(chain.receive(block.clone()).unwrap());
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.tip().hash, block.hash);
    }

    #[test]
    fn test_receive_rejects_tampered_merkle_root() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let mut chain = fresh_chain(&dir, &operator);

        let mut block = chain.build_template(vec![], &operator.address()).unwrap();
        block.header.merkle_root[0] ^= 0x01;
        pow::mine_block(&mut block);

        let err = chain.receive(block).unwrap_err();
        assert!(matches!(err, BlockchainError::MerkleRootMismatch));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn test_receive_rejects_future_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let mut chain = fresh_chain(&dir, &operator);

        let mut block = chain.build_template(vec![], &operator.address()).unwrap();
        block.header.timestamp = Utc::now().timestamp() + MAX_FUTURE_DRIFT_SECS + 60;
        pow::mine_block(&mut block);

        let err = chain.receive(block).unwrap_err();
        assert!(matches!(err, BlockchainError::TimestampTooFarFuture));
    }

    #[test]
    fn test_double_spend_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let mut chain = fresh_chain(&dir, &operator);

        let t1 = chain
            .create_transaction(&operator.address(), &a.address(), BLOCK_SUBSIDY, &operator)
            .unwrap();
        let t2 = chain
            .create_transaction(&operator.address(), &b.address(), BLOCK_SUBSIDY, &operator)
            .unwrap();

        chain.append(vec![t1], &operator.address()).unwrap();

        // The second spend of the same output must not be accepted
        let err = chain.verify_transaction(&t2).unwrap_err();
        assert!(matches!(err, BlockchainError::Utxo(UtxoError::NoSuchUtxo)));
        assert!(chain.append(vec![t2], &operator.address()).is_err());
    }

    #[test]
    fn test_value_conservation_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let recipient = KeyPair::generate();
        let mut chain = fresh_chain(&dir, &operator);

        // Hand-build a transaction creating more value than it spends
        let genesis_cb = chain.tip().transactions[0].clone();
        let input = TxInput {
            prev_tx_id: Some(genesis_cb.id),
            out_index: 0,
            signature: Vec::new(),
            pub_key: operator.public_key_bytes().to_vec(),
        };
        let mut tx = Transaction::new(
            vec![input],
            vec![TxOutput::locked_to(&recipient.address(), BLOCK_SUBSIDY * 2).unwrap()],
        );
        let prev_txs = HashMap::from([(genesis_cb.id, genesis_cb)]);
        tx.sign(&operator, &prev_txs).unwrap();

        let err = chain.append(vec![tx], &operator.address()).unwrap_err();
        assert!(matches!(err, BlockchainError::ValueNotConserved { .. }));
    }

    #[test]
    fn test_retarget_raises_difficulty_for_fast_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let store = ChainStore::open(dir.path().join("chain")).unwrap();
        let params = ChainParams {
            target_bits: MIN_TARGET_BITS,
            retarget_interval: 4,
            target_block_secs: 10,
            ..ChainParams::default()
        };
        let mut chain = Blockchain::open(store, &operator.address(), params).unwrap();

        for _ in 0..7 {
            chain.append(vec![], &operator.address()).unwrap();
        }

        // Blocks arrive far faster than 10s apart, so two windows have
        // passed and the difficulty rose twice
        assert_eq!(chain.current_bits(), MIN_TARGET_BITS + 2);
        assert!(chain.tip().header.bits >= MIN_TARGET_BITS + 1);
    }

    #[test]
    fn test_retarget_clamps_at_floor() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let store = ChainStore::open(dir.path().join("chain")).unwrap();
        let params = ChainParams {
            target_bits: MIN_TARGET_BITS,
            retarget_interval: 2,
            target_block_secs: 10,
            ..ChainParams::default()
        };
        let mut chain = Blockchain::open(store, &operator.address(), params).unwrap();
        let genesis_ts = chain.tip().header.timestamp;

        // Space block timestamps 100s apart: far slower than the 10s target,
        // so every window votes to lower the difficulty
        for k in 1..=4i64 {
            let mut block = chain.build_template(vec![], &operator.address()).unwrap();
            block.header.timestamp = genesis_ts + k * 100;
            pow::mine_block(&mut block);
            chain.connect(block).unwrap();
        }

        // 8 bits is the floor
        assert_eq!(chain.current_bits(), MIN_TARGET_BITS);
    }

    #[test]
    fn test_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let recipient = KeyPair::generate();

        let tip_hash;
        let operator_balance;
        {
            let mut chain = fresh_chain(&dir, &operator);
            let tx = chain
                .create_transaction(&operator.address(), &recipient.address(), 12345, &operator)
                .unwrap();
            chain.append(vec![tx], &operator.address()).unwrap();
            tip_hash = chain.tip().hash;
            operator_balance = chain.balance(&operator.address()).unwrap();
        }

        let store = ChainStore::open(dir.path().join("chain")).unwrap();
        let reloaded = Blockchain::open(store, &operator.address(), test_params()).unwrap();

        assert_eq!(reloaded.height(), 2);
        assert_eq!(reloaded.tip().hash, tip_hash);
        assert_eq!(reloaded.balance(&operator.address()).unwrap(), operator_balance);
        assert_eq!(reloaded.balance(&recipient.address()).unwrap(), 12345);
        assert!(reloaded.validate_chain());
    }

    #[test]
    fn test_replace_chain_adopts_longer_chain() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();

        let mut longer = fresh_chain(&dir1, &operator);
        for _ in 0..3 {
            longer.append(vec![], &operator.address()).unwrap();
        }

        let mut local = fresh_chain(&dir2, &operator);
        let foreign: Vec<Block> = longer.blocks_from(0, longer.height() as usize);
        local.replace_chain(foreign).unwrap();

        assert_eq!(local.height(), longer.height());
        assert_eq!(local.tip().hash, longer.tip().hash);
        assert_eq!(
            local.balance(&operator.address()).unwrap(),
            longer.balance(&operator.address()).unwrap()
        );
    }

    #[test]
    fn test_replace_chain_rejects_shorter() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();

        let short = fresh_chain(&dir1, &operator);
        let mut local = fresh_chain(&dir2, &operator);
        local.append(vec![], &operator.address()).unwrap();

        let foreign: Vec<Block> = short.blocks_from(0, 1);
        assert!(matches!(
            local.replace_chain(foreign),
            Err(BlockchainError::ChainNotBetter)
        ));
    }

    #[test]
    fn test_total_supply_equals_minted_subsidy() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let recipient = KeyPair::generate();
        let mut chain = fresh_chain(&dir, &operator);

        let tx = chain
            .create_transaction(&operator.address(), &recipient.address(), 7, &operator)
            .unwrap();
        chain.append(vec![tx], &operator.address()).unwrap();
        chain.append(vec![], &operator.address()).unwrap();

        // Value is created only by coinbase outputs and conserved after
        assert_eq!(chain.utxos().total_value(), 3 * BLOCK_SUBSIDY);
    }
}
