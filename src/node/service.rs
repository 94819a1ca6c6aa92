//! The node service: mempool admission, wallets, the mining worker and the
//! transport-agnostic query surface
//!
//! RPC front-ends call into this type; it owns everything above the chain
//! engine and below the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{Block, Blockchain, BlockchainError, ChainStats, OutPoint, Transaction, TxOutput};
use crate::crypto::{decode_address, Hash, KeyError};
use crate::mining::{Mempool, MempoolError, MiningWorker};
use crate::network::{Node, NodeEvent};
use crate::storage::{StorageError, WalletStore};
use crate::wallet::{Wallet, WalletInfo};

/// Per-subscriber buffer; delivery drops for a subscriber whose buffer is
/// full rather than blocking the producer
const SUBSCRIBER_BUFFER: usize = 16;

/// Node service errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),
    #[error("Deadline exceeded")]
    DeadlineExceeded,
    #[error("Mining is already running")]
    MiningAlreadyActive,
    #[error(transparent)]
    Chain(#[from] BlockchainError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Mempool(#[from] MempoolError),
}

/// Result of a transaction submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub tx_id: String,
    pub reason: Option<String>,
}

/// Mining status for the query surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningInfo {
    pub is_mining: bool,
    pub miner_address: Option<String>,
    pub blocks_mined: u64,
    pub current_difficulty: u32,
}

/// Node-level status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub height: u64,
    pub peers: usize,
    pub pending_txs: usize,
    pub is_mining: bool,
}

#[derive(Default)]
struct MiningState {
    miner_address: Option<String>,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// The orchestrating service above the chain engine
pub struct NodeService {
    chain: Arc<RwLock<Blockchain>>,
    mempool: Arc<RwLock<Mempool>>,
    wallet_store: Arc<WalletStore>,
    wallets: RwLock<HashMap<String, Wallet>>,
    network: RwLock<Option<Arc<Node>>>,
    mining: Mutex<MiningState>,
    blocks_mined: Arc<AtomicU64>,
    mined_tx: mpsc::Sender<Block>,
    mined_rx: StdMutex<Option<mpsc::Receiver<Block>>>,
    block_subs: StdMutex<Vec<mpsc::Sender<Block>>>,
    tx_subs: StdMutex<Vec<mpsc::Sender<Transaction>>>,
    cancel: CancellationToken,
}

impl NodeService {
    /// Build the service, loading stored wallets into memory
    pub fn new(
        chain: Arc<RwLock<Blockchain>>,
        mempool: Arc<RwLock<Mempool>>,
        wallet_store: Arc<WalletStore>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, NodeError> {
        let mut wallets = HashMap::new();
        for record in wallet_store.all()? {
            let wallet = Wallet::from_record(&record)?;
            wallets.insert(wallet.address(), wallet);
        }
        info!("loaded {} wallet(s)", wallets.len());

        let (mined_tx, mined_rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        Ok(Arc::new(Self {
            chain,
            mempool,
            wallet_store,
            wallets: RwLock::new(wallets),
            network: RwLock::new(None),
            mining: Mutex::new(MiningState::default()),
            blocks_mined: Arc::new(AtomicU64::new(0)),
            mined_tx,
            mined_rx: StdMutex::new(Some(mined_rx)),
            block_subs: StdMutex::new(Vec::new()),
            tx_subs: StdMutex::new(Vec::new()),
            cancel,
        }))
    }

    /// Wire in the P2P node used for broadcasting
    pub async fn attach_network(&self, node: Arc<Node>) {
        *self.network.write().await = Some(node);
    }

    /// Spawn the forwarding loops: network commits and locally mined blocks
    /// flow out to subscribers, mined blocks additionally to peers.
    pub fn spawn_event_loops(self: &Arc<Self>, mut network_events: mpsc::Receiver<NodeEvent>) {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = network_events.recv() => match event {
                        Some(NodeEvent::PeerBlock(block)) => service.notify_block(&block),
                        Some(NodeEvent::PeerTransaction(tx)) => service.notify_transaction(&tx),
                        None => break,
                    },
                    _ = service.cancel.cancelled() => break,
                }
            }
        });

        let mut mined_rx = self
            .mined_rx
            .lock()
            .expect("mined receiver lock poisoned")
            .take()
            .expect("event loops spawned twice");
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    block = mined_rx.recv() => match block {
                        Some(block) => {
                            service.notify_block(&block);
                            let network = service.network.read().await.clone();
                            if let Some(network) = network {
                                network.broadcast_block(block).await;
                            }
                        }
                        None => break,
                    },
                    _ = service.cancel.cancelled() => break,
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Read-only queries
    // ------------------------------------------------------------------

    pub async fn get_blockchain_info(&self) -> ChainStats {
        self.chain.read().await.stats()
    }

    pub async fn get_block_height(&self) -> u64 {
        self.chain.read().await.height()
    }

    pub async fn get_best_block_hash(&self) -> Hash {
        self.chain.read().await.tip().hash
    }

    pub async fn get_block_by_height(&self, height: u64) -> Result<Block, NodeError> {
        self.chain
            .read()
            .await
            .block_at(height)
            .cloned()
            .ok_or(NodeError::Chain(BlockchainError::NoSuchBlock))
    }

    pub async fn get_block_by_hash(&self, hash: &Hash) -> Result<Block, NodeError> {
        self.chain
            .read()
            .await
            .block_by_hash(hash)
            .cloned()
            .ok_or(NodeError::Chain(BlockchainError::NoSuchBlock))
    }

    /// Look up a transaction in the chain, then in the mempool
    pub async fn get_transaction(&self, id: &Hash) -> Option<Transaction> {
        if let Some(tx) = self.chain.read().await.find_transaction(id) {
            return Some(tx.clone());
        }
        self.mempool.read().await.get(id).cloned()
    }

    pub async fn get_mempool(&self) -> Vec<Transaction> {
        self.mempool.read().await.transactions()
    }

    pub async fn get_utxos(&self, address: &str) -> Result<Vec<(OutPoint, TxOutput)>, NodeError> {
        Ok(self
            .chain
            .read()
            .await
            .utxos()
            .all_for_address(address)
            .map_err(BlockchainError::from)?)
    }

    pub async fn get_balance(&self, address: &str) -> Result<i64, NodeError> {
        Ok(self.chain.read().await.balance(address)?)
    }

    pub async fn status(&self) -> NodeStatus {
        let peers = match self.network.read().await.as_ref() {
            Some(network) => network.peer_count().await,
            None => 0,
        };
        NodeStatus {
            height: self.chain.read().await.height(),
            peers,
            pending_txs: self.mempool.read().await.len(),
            is_mining: self.mining.lock().await.cancel.is_some(),
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Admit an externally built transaction: full verification against the
    /// current UTXO index, then the mempool, subscribers and peers.
    pub async fn submit_transaction(&self, tx: Transaction) -> SubmitOutcome {
        let tx_id = hex::encode(tx.id);

        if let Err(err) = self.chain.read().await.verify_transaction(&tx) {
            return SubmitOutcome {
                accepted: false,
                tx_id,
                reason: Some(err.to_string()),
            };
        }

        if let Err(err) = self.mempool.write().await.insert(tx.clone()) {
            return SubmitOutcome {
                accepted: false,
                tx_id,
                reason: Some(err.to_string()),
            };
        }

        debug!("transaction {} admitted to mempool", tx_id);
        self.notify_transaction(&tx);
        self.broadcast_transaction(tx).await;

        SubmitOutcome {
            accepted: true,
            tx_id,
            reason: None,
        }
    }

    /// Build, sign and submit a transfer from a stored wallet
    pub async fn send_transaction(
        &self,
        from: &str,
        to: &str,
        amount: i64,
    ) -> Result<String, NodeError> {
        let wallet = self
            .wallets
            .read()
            .await
            .get(from)
            .cloned()
            .ok_or_else(|| NodeError::WalletNotFound(from.to_string()))?;

        let tx = self
            .chain
            .read()
            .await
            .create_transaction(from, to, amount, wallet.key_pair())?;
        let tx_id = hex::encode(tx.id);

        self.mempool.write().await.insert(tx.clone())?;
        info!("wallet {} sent {} to {} ({})", from, amount, to, tx_id);

        self.notify_transaction(&tx);
        self.broadcast_transaction(tx).await;

        Ok(tx_id)
    }

    async fn broadcast_transaction(&self, tx: Transaction) {
        let network = self.network.read().await.clone();
        if let Some(network) = network {
            network.broadcast_transaction(tx).await;
        }
    }

    // ------------------------------------------------------------------
    // Mining
    // ------------------------------------------------------------------

    /// Start the background mining worker for the given address
    pub async fn start_mining(&self, miner_address: &str) -> Result<(), NodeError> {
        decode_address(miner_address).map_err(BlockchainError::from)?;

        let mut mining = self.mining.lock().await;
        if mining.cancel.is_some() {
            return Err(NodeError::MiningAlreadyActive);
        }

        let cancel = self.cancel.child_token();
        let worker = MiningWorker {
            chain: self.chain.clone(),
            mempool: self.mempool.clone(),
            miner_address: miner_address.to_string(),
            cancel: cancel.clone(),
            blocks_mined: self.blocks_mined.clone(),
            mined_blocks: self.mined_tx.clone(),
        };

        mining.miner_address = Some(miner_address.to_string());
        mining.cancel = Some(cancel);
        mining.handle = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Stop the mining worker cooperatively
    pub async fn stop_mining(&self) {
        let mut mining = self.mining.lock().await;
        if let Some(cancel) = mining.cancel.take() {
            cancel.cancel();
        }
        mining.miner_address = None;
        if let Some(handle) = mining.handle.take() {
            // The worker exits at its next cancellation point
            drop(handle);
        }
    }

    pub async fn get_mining_info(&self) -> MiningInfo {
        let mining = self.mining.lock().await;
        MiningInfo {
            is_mining: mining.cancel.is_some(),
            miner_address: mining.miner_address.clone(),
            blocks_mined: self.blocks_mined.load(Ordering::Relaxed),
            current_difficulty: self.chain.read().await.current_bits(),
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Receive every committed block. Best-effort: items are dropped for a
    /// subscriber whose buffer is full.
    pub fn subscribe_blocks(&self) -> mpsc::Receiver<Block> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.block_subs
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }

    /// Receive every admitted transaction, same delivery contract
    pub fn subscribe_transactions(&self) -> mpsc::Receiver<Transaction> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.tx_subs
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }

    fn notify_block(&self, block: &Block) {
        // Snapshot under the lock, deliver outside it
        let subs = self
            .block_subs
            .lock()
            .expect("subscriber lock poisoned")
            .clone();
        for sub in &subs {
            let _ = sub.try_send(block.clone());
        }
        self.block_subs
            .lock()
            .expect("subscriber lock poisoned")
            .retain(|sub| !sub.is_closed());
    }

    fn notify_transaction(&self, tx: &Transaction) {
        let subs = self
            .tx_subs
            .lock()
            .expect("subscriber lock poisoned")
            .clone();
        for sub in &subs {
            let _ = sub.try_send(tx.clone());
        }
        self.tx_subs
            .lock()
            .expect("subscriber lock poisoned")
            .retain(|sub| !sub.is_closed());
    }

    // ------------------------------------------------------------------
    // Wallets
    // ------------------------------------------------------------------

    /// Create a wallet, persist it and keep it in memory
    pub async fn create_wallet(&self) -> Result<WalletInfo, NodeError> {
        let wallet = Wallet::new();
        self.wallet_store.save(&wallet.record())?;

        let info = wallet.info();
        self.wallets
            .write()
            .await
            .insert(wallet.address(), wallet);
        info!("created wallet {}", info.address);
        Ok(info)
    }

    pub async fn get_wallet(&self, address: &str) -> Result<WalletInfo, NodeError> {
        self.wallets
            .read()
            .await
            .get(address)
            .map(|w| w.info())
            .ok_or_else(|| NodeError::WalletNotFound(address.to_string()))
    }

    pub async fn list_wallets(&self) -> Vec<WalletInfo> {
        self.wallets.read().await.values().map(|w| w.info()).collect()
    }

    pub async fn get_wallet_balance(&self, address: &str) -> Result<i64, NodeError> {
        if !self.wallets.read().await.contains_key(address) {
            return Err(NodeError::WalletNotFound(address.to_string()));
        }
        self.get_balance(address).await
    }

    /// Shut down the whole node: mining worker, event loops, and through
    /// the shared token every peer stream and sync task
    pub async fn shutdown(&self) {
        self.stop_mining().await;
        self.cancel.cancel();
    }
}

/// Run a query future under a caller-supplied deadline
pub async fn with_deadline<T, F>(deadline: Duration, future: F) -> Result<T, NodeError>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(deadline, future)
        .await
        .map_err(|_| NodeError::DeadlineExceeded)
}
