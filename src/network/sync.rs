//! Outbound chain synchronisation
//!
//! One-shot task run after a successful dial-out: probe the peer's height
//! and, when it is ahead, download the missing blocks and feed them through
//! the receive path in order. A node runs at most one outbound sync at a
//! time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, RwLock};

use crate::core::Blockchain;
use crate::mining::Mempool;
use crate::network::identity::NodeIdentity;
use crate::network::message::{Message, NetworkError};
use crate::network::node::{request, NodeEvent};
use crate::network::peer::NodeAddr;

/// Chain synchronisation driver
pub struct ChainSync {
    chain: Arc<RwLock<Blockchain>>,
    mempool: Arc<RwLock<Mempool>>,
    identity: NodeIdentity,
    events: mpsc::Sender<NodeEvent>,
    syncing: AtomicBool,
}

impl ChainSync {
    /// Most blocks served per `GetBlocks` request
    pub const BATCH_LIMIT: usize = 500;

    pub fn new(
        chain: Arc<RwLock<Blockchain>>,
        mempool: Arc<RwLock<Mempool>>,
        identity: NodeIdentity,
        events: mpsc::Sender<NodeEvent>,
    ) -> Self {
        Self {
            chain,
            mempool,
            identity,
            events,
            syncing: AtomicBool::new(false),
        }
    }

    /// Whether an outbound sync is currently running
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Synchronise with one peer. Returns the number of blocks accepted.
    /// Re-entrant calls short-circuit while a sync is already running.
    pub async fn sync_with_peer(&self, addr: &NodeAddr) -> Result<usize, NetworkError> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            debug!("sync already in progress, skipping {}", addr);
            return Ok(0);
        }

        let result = self.run(addr).await;
        self.syncing.store(false, Ordering::SeqCst);
        result
    }

    async fn run(&self, addr: &NodeAddr) -> Result<usize, NetworkError> {
        let reply = request(addr, Message::GetHeight, &self.identity).await?;
        let remote_height = match reply.message {
            Message::Height(height) => height,
            other => {
                return Err(NetworkError::InvalidEnvelope(format!(
                    "expected Height, got {}",
                    other.type_name()
                )))
            }
        };

        let local_height = self.chain.read().await.height();
        if remote_height <= local_height {
            debug!(
                "peer {} is not ahead ({} vs {})",
                addr, remote_height, local_height
            );
            return Ok(0);
        }

        info!(
            "syncing with {} (local {}, remote {})",
            addr, local_height, remote_height
        );

        // Fresh stream for the batch download
        let blocks = self.fetch_blocks(addr, local_height).await?;

        let mut accepted = Vec::new();
        {
            let mut chain = self.chain.write().await;
            for block in blocks {
                match chain.receive(block.clone()) {
                    Ok(true) => accepted.push(block),
                    Ok(false) => {}
                    Err(err) => {
                        warn!("stopping sync at invalid block: {}", err);
                        break;
                    }
                }
            }
        }

        // Nothing extended our tip although the peer is ahead: the chains
        // diverge at the root. Download the whole remote chain and adopt it
        // if it validates and is longer.
        if accepted.is_empty() {
            let full = self.fetch_blocks(addr, 0).await?;
            let mut chain = self.chain.write().await;
            match chain.replace_chain(full) {
                Ok(()) => {
                    info!("adopted chain from {}, height {}", addr, chain.height());
                    accepted = chain.blocks_from(0, chain.height() as usize);
                }
                Err(err) => {
                    warn!("could not adopt chain from {}: {}", addr, err);
                    return Ok(0);
                }
            }
        }

        // Committed spends may have invalidated pending transactions
        {
            let chain = self.chain.read().await;
            let mut mempool = self.mempool.write().await;
            for block in &accepted {
                mempool.remove_committed(block);
            }
            mempool.evict_conflicting(chain.utxos());
        }

        let count = accepted.len();
        for block in accepted {
            let _ = self.events.send(NodeEvent::PeerBlock(block)).await;
        }

        info!("sync with {} complete, {} blocks accepted", addr, count);
        Ok(count)
    }

    async fn fetch_blocks(
        &self,
        addr: &NodeAddr,
        from_height: u64,
    ) -> Result<Vec<crate::core::Block>, NetworkError> {
        let reply = request(addr, Message::GetBlocks { from_height }, &self.identity).await?;
        match reply.message {
            Message::Blocks(blocks) => Ok(blocks),
            other => Err(NetworkError::InvalidEnvelope(format!(
                "expected Blocks, got {}",
                other.type_name()
            ))),
        }
    }
}
