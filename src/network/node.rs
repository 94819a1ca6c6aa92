//! The P2P node: listener, inbound dispatch, broadcast
//!
//! Streams are one-shot: every outbound send opens a fresh connection,
//! writes one signed envelope and, for request/response protocols, reads
//! one reply. Inbound blocks and transactions run through the same
//! validation as local ones before anything else sees them.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::core::{Block, Blockchain, Transaction};
use crate::mining::Mempool;
use crate::network::codec::EnvelopeCodec;
use crate::network::identity::NodeIdentity;
use crate::network::message::{Envelope, Message, NetworkError};
use crate::network::peer::{NodeAddr, PeerManager};
use crate::network::sync::ChainSync;

/// Timeout for a single request/response exchange
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// P2P node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Interface to listen on
    pub listen_host: String,
    /// Listening port; 0 picks an ephemeral port
    pub listen_port: u16,
    /// Peers to dial at startup, multi-address or host:port form
    pub bootstrap_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 9333,
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Commits originating from the peer network, consumed by the node service
/// for subscriber delivery
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerBlock(Block),
    PeerTransaction(Transaction),
}

/// The peer-to-peer node
pub struct Node {
    config: NodeConfig,
    identity: NodeIdentity,
    chain: Arc<RwLock<Blockchain>>,
    mempool: Arc<RwLock<Mempool>>,
    peers: Arc<PeerManager>,
    sync: Arc<ChainSync>,
    events: mpsc::Sender<NodeEvent>,
    cancel: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        identity: NodeIdentity,
        chain: Arc<RwLock<Blockchain>>,
        mempool: Arc<RwLock<Mempool>>,
        events: mpsc::Sender<NodeEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let peers = Arc::new(PeerManager::new());
        let sync = Arc::new(ChainSync::new(
            chain.clone(),
            mempool.clone(),
            identity.clone(),
            events.clone(),
        ));

        Arc::new(Self {
            config,
            identity,
            chain,
            mempool,
            peers,
            sync,
            events,
            cancel,
            local_addr: OnceLock::new(),
        })
    }

    /// Bind the listener, spawn the accept loop and dial the bootstrap
    /// peers. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NetworkError> {
        let bind_to = format!("{}:{}", self.config.listen_host, self.config.listen_port);
        let listener = TcpListener::bind(&bind_to).await?;
        let local = listener.local_addr()?;
        let _ = self.local_addr.set(local);

        info!("node {} listening on {}", self.identity.node_id(), local);

        let node = self.clone();
        tokio::spawn(async move {
            node.accept_loop(listener).await;
        });

        for peer in self.config.bootstrap_peers.clone() {
            if let Err(err) = self.connect_to(&peer).await {
                warn!("failed to connect to bootstrap peer {}: {}", peer, err);
            }
        }

        Ok(local)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!("inbound connection from {}", remote);
                        let node = self.clone();
                        tokio::spawn(async move {
                            node.handle_connection(stream, remote).await;
                        });
                    }
                    Err(err) => {
                        warn!("accept error: {}", err);
                    }
                },
                _ = self.cancel.cancelled() => {
                    info!("listener shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let mut framed = Framed::new(stream, EnvelopeCodec);

        loop {
            let frame = tokio::select! {
                frame = framed.next() => frame,
                _ = self.cancel.cancelled() => return,
            };

            let envelope = match frame {
                Some(Ok(envelope)) => envelope,
                Some(Err(err)) => {
                    warn!("stream error from {}: {}", remote, err);
                    return;
                }
                None => return,
            };

            if let Err(err) = envelope.verify() {
                warn!("dropping unauthenticated envelope from {}: {}", remote, err);
                return;
            }

            self.dispatch(envelope, &mut framed, remote).await;
        }
    }

    async fn dispatch(
        &self,
        envelope: Envelope,
        framed: &mut Framed<TcpStream, EnvelopeCodec>,
        remote: SocketAddr,
    ) {
        debug!(
            "received {} from {} ({})",
            envelope.message.type_name(),
            envelope.origin,
            remote
        );

        match envelope.message {
            Message::NewBlock(block) => self.handle_new_block(block).await,
            Message::NewTransaction(tx) => self.handle_new_transaction(tx).await,
            Message::GetHeight => {
                let height = self.chain.read().await.height();
                self.respond(framed, Message::Height(height), remote).await;
            }
            Message::GetBlocks { from_height } => {
                let blocks = self
                    .chain
                    .read()
                    .await
                    .blocks_from(from_height, ChainSync::BATCH_LIMIT);
                self.respond(framed, Message::Blocks(blocks), remote).await;
            }
            Message::Ping(nonce) => {
                self.respond(framed, Message::Pong(nonce), remote).await;
            }
            // Responses arrive on the requester's own stream; unsolicited
            // copies are ignored
            Message::Height(_) | Message::Blocks(_) | Message::Pong(_) => {
                debug!("ignoring unsolicited response from {}", remote);
            }
        }
    }

    async fn respond(
        &self,
        framed: &mut Framed<TcpStream, EnvelopeCodec>,
        message: Message,
        remote: SocketAddr,
    ) {
        match Envelope::seal(message, &self.identity) {
            Ok(envelope) => {
                if let Err(err) = framed.send(envelope).await {
                    warn!("failed to respond to {}: {}", remote, err);
                }
            }
            Err(err) => warn!("failed to seal response: {}", err),
        }
    }

    /// Inbound block path: same validation as local append, drop on failure
    async fn handle_new_block(&self, block: Block) {
        if !self.peers.mark_seen(&block.hash) {
            return;
        }

        let accepted = self.chain.write().await.receive(block.clone());
        match accepted {
            Ok(true) => {
                info!("accepted block {} from network", hex::encode(block.hash));
                {
                    let chain = self.chain.read().await;
                    let mut mempool = self.mempool.write().await;
                    mempool.remove_committed(&block);
                    mempool.evict_conflicting(chain.utxos());
                }
                let _ = self.events.send(NodeEvent::PeerBlock(block)).await;
            }
            Ok(false) => {}
            Err(err) => {
                warn!("rejected block {}: {}", hex::encode(block.hash), err);
            }
        }
    }

    /// Inbound transaction path: full signature verification against the
    /// current UTXO index before mempool admission
    async fn handle_new_transaction(&self, tx: Transaction) {
        if !self.peers.mark_seen(&tx.id) {
            return;
        }

        let verdict = self.chain.read().await.verify_transaction(&tx);
        if let Err(err) = verdict {
            debug!("rejected transaction {}: {}", hex::encode(tx.id), err);
            return;
        }

        let inserted = self.mempool.write().await.insert(tx.clone());
        if inserted.is_ok() {
            let _ = self.events.send(NodeEvent::PeerTransaction(tx)).await;
        }
    }

    /// Dial a peer, record it and kick off a one-shot synchronisation
    pub async fn connect_to(self: &Arc<Self>, addr: &str) -> Result<(), NetworkError> {
        let addr: NodeAddr = addr.parse()?;

        // Probe liveness and learn the peer's identity
        let reply = request(&addr, Message::Ping(rand::random()), &self.identity).await?;
        let addr = NodeAddr::new(&addr.host, addr.port, Some(reply.origin.clone()));

        info!("connected to peer {}", addr);
        self.peers.add_peer(addr.clone()).await;

        let sync = self.sync.clone();
        tokio::spawn(async move {
            match sync.sync_with_peer(&addr).await {
                Ok(count) if count > 0 => info!("synced {} blocks from {}", count, addr),
                Ok(_) => {}
                Err(err) => warn!("sync with {} failed: {}", addr, err),
            }
        });

        Ok(())
    }

    /// Send a block to every current peer on one-shot streams. Failures are
    /// logged per peer and do not abort the others.
    pub async fn broadcast_block(&self, block: Block) {
        self.peers.mark_seen(&block.hash);
        self.broadcast(Message::NewBlock(block)).await;
    }

    /// Send a transaction to every current peer
    pub async fn broadcast_transaction(&self, tx: Transaction) {
        self.peers.mark_seen(&tx.id);
        self.broadcast(Message::NewTransaction(tx)).await;
    }

    async fn broadcast(&self, message: Message) {
        let envelope = match Envelope::seal(message, &self.identity) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("failed to seal broadcast: {}", err);
                return;
            }
        };

        for peer in self.peers.peers().await {
            let envelope = envelope.clone();
            tokio::spawn(async move {
                if let Err(err) = send_envelope(&peer.addr, envelope).await {
                    warn!("broadcast to {} failed: {}", peer.addr, err);
                }
            });
        }
    }

    /// The node's dialable multi-address, once the listener is bound
    pub fn local_multiaddr(&self) -> Option<String> {
        self.local_addr.get().map(|addr| {
            NodeAddr::new(
                &addr.ip().to_string(),
                addr.port(),
                Some(self.identity.node_id()),
            )
            .to_string()
        })
    }

    pub fn node_id(&self) -> String {
        self.identity.node_id()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.count().await
    }

    pub async fn is_syncing(&self) -> bool {
        self.sync.is_syncing()
    }
}

/// Open a one-shot stream, send one envelope and close
pub async fn send_envelope(addr: &NodeAddr, envelope: Envelope) -> Result<(), NetworkError> {
    let stream = TcpStream::connect(addr.socket_addr())
        .await
        .map_err(|e| NetworkError::PeerConnectFailed(e.to_string()))?;
    let mut framed = Framed::new(stream, EnvelopeCodec);
    framed.send(envelope).await?;
    Ok(())
}

/// Open a one-shot stream, send a request and wait for a single reply
pub async fn request(
    addr: &NodeAddr,
    message: Message,
    identity: &NodeIdentity,
) -> Result<Envelope, NetworkError> {
    let stream = TcpStream::connect(addr.socket_addr())
        .await
        .map_err(|e| NetworkError::PeerConnectFailed(e.to_string()))?;
    let mut framed = Framed::new(stream, EnvelopeCodec);
    framed.send(Envelope::seal(message, identity)?).await?;

    let reply = tokio::time::timeout(REQUEST_TIMEOUT, framed.next())
        .await
        .map_err(|_| NetworkError::RequestTimeout)?
        .ok_or_else(|| NetworkError::InvalidEnvelope("peer closed the stream".into()))??;

    reply.verify()?;
    Ok(reply)
}
