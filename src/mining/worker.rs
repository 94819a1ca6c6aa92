//! Background mining worker
//!
//! Repeatedly drains the mempool, assembles a candidate block, mines it off
//! the chain lock so readers stay responsive, and commits the result.
//! A batch that fails to commit is restored to the mempool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::{Block, Blockchain};
use crate::mining::mempool::Mempool;
use crate::mining::pow;

/// Pause between successful mining rounds, bounding busy cycles at low
/// difficulty
const MINE_PAUSE: Duration = Duration::from_secs(5);

/// Backoff after a failed round
const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

/// Statistics for one mined block
#[derive(Debug, Clone)]
pub struct MiningStats {
    pub hash_attempts: u64,
    pub time_ms: u128,
    pub hash_rate: f64,
}

/// The mining loop. Spawned by the node service; stopped cooperatively
/// through the cancellation token.
pub struct MiningWorker {
    pub chain: Arc<RwLock<Blockchain>>,
    pub mempool: Arc<RwLock<Mempool>>,
    pub miner_address: String,
    pub cancel: CancellationToken,
    pub blocks_mined: Arc<AtomicU64>,
    /// Committed blocks flow out here for subscriber delivery and broadcast
    pub mined_blocks: mpsc::Sender<Block>,
}

impl MiningWorker {
    pub async fn run(self) {
        info!("mining worker started for {}", self.miner_address);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let drained = self.mempool.write().await.drain();
            let (template, candidates) = {
                let chain = self.chain.read().await;
                let candidates = chain.filter_candidates(drained);
                match chain.build_template(candidates.clone(), &self.miner_address) {
                    Ok(template) => (template, candidates),
                    Err(err) => {
                        warn!("failed to build candidate block: {}", err);
                        drop(chain);
                        self.mempool.write().await.restore(candidates);
                        if !self.pause(FAILURE_BACKOFF).await {
                            break;
                        }
                        continue;
                    }
                }
            };

            // The proof-of-work search runs off the chain lock
            let started = Instant::now();
            let mining = tokio::task::spawn_blocking(move || {
                let mut block = template;
                let attempts = pow::mine_block(&mut block);
                (block, attempts)
            });

            let (block, attempts) = tokio::select! {
                result = mining => match result {
                    Ok(mined) => mined,
                    Err(err) => {
                        warn!("mining task failed: {}", err);
                        self.mempool.write().await.restore(candidates);
                        if !self.pause(FAILURE_BACKOFF).await {
                            break;
                        }
                        continue;
                    }
                },
                _ = self.cancel.cancelled() => {
                    self.mempool.write().await.restore(candidates);
                    break;
                }
            };

            let stats = stats_for(attempts, started.elapsed().as_millis());

            let commit = self.chain.write().await.connect(block.clone());
            match commit {
                Ok(()) => {
                    self.blocks_mined.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "mined block {} in {}ms ({} attempts, {:.2} H/s)",
                        hex::encode(block.hash),
                        stats.time_ms,
                        stats.hash_attempts,
                        stats.hash_rate
                    );

                    // Entries that arrived mid-mine may now be stale
                    {
                        let chain = self.chain.read().await;
                        let mut mempool = self.mempool.write().await;
                        mempool.remove_committed(&block);
                        mempool.evict_conflicting(chain.utxos());
                    }

                    let _ = self.mined_blocks.send(block).await;

                    if !self.pause(MINE_PAUSE).await {
                        break;
                    }
                }
                Err(err) => {
                    // Usually the tip moved under us; the batch goes back
                    warn!("mined block rejected: {}", err);
                    self.mempool.write().await.restore(candidates);
                    if !self.pause(FAILURE_BACKOFF).await {
                        break;
                    }
                }
            }
        }

        info!("mining worker stopped for {}", self.miner_address);
    }

    /// Sleep unless cancelled; returns false when the worker should exit
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}

fn stats_for(attempts: u64, time_ms: u128) -> MiningStats {
    let hash_rate = if time_ms > 0 {
        attempts as f64 / (time_ms as f64 / 1000.0)
    } else {
        attempts as f64
    };
    MiningStats {
        hash_attempts: attempts,
        time_ms,
        hash_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChainParams;
    use crate::crypto::KeyPair;
    use crate::storage::ChainStore;

    #[tokio::test]
    async fn test_worker_mines_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let operator = KeyPair::generate();
        let store = ChainStore::open(dir.path().join("chain")).unwrap();
        let params = ChainParams {
            target_bits: pow::MIN_TARGET_BITS,
            ..ChainParams::default()
        };
        let chain = Arc::new(RwLock::new(
            Blockchain::open(store, &operator.address(), params).unwrap(),
        ));
        let mempool = Arc::new(RwLock::new(Mempool::new()));
        let cancel = CancellationToken::new();
        let blocks_mined = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::channel(8);

        let worker = MiningWorker {
            chain: chain.clone(),
            mempool,
            miner_address: operator.address(),
            cancel: cancel.clone(),
            blocks_mined: blocks_mined.clone(),
            mined_blocks: tx,
        };
        let handle = tokio::spawn(worker.run());

        // The first block should land well within the timeout
        let mined = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("worker should mine a block")
            .expect("channel open");

        assert_eq!(chain.read().await.tip().hash, mined.hash);
        assert!(blocks_mined.load(Ordering::Relaxed) >= 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("worker should stop on cancel")
            .unwrap();
    }

    #[test]
    fn test_stats_hash_rate() {
        let stats = stats_for(1000, 500);
        assert!((stats.hash_rate - 2000.0).abs() < f64::EPSILON);
    }
}
