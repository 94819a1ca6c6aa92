//! Peer records, address parsing and the relay seen-cache

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::crypto::Hash;
use crate::network::message::NetworkError;

/// Bound on the relay seen-cache
const SEEN_CACHE_CAP: usize = 4096;

/// A peer's dialable address: transport, host, port and optional node ID.
///
/// Printed as `/ip4/<host>/tcp/<port>/p2p/<node-id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
    pub node_id: Option<String>,
}

impl NodeAddr {
    pub fn new(host: &str, port: u16, node_id: Option<String>) -> Self {
        Self {
            host: host.to_string(),
            port,
            node_id,
        }
    }

    /// The host:port form used for dialing
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(id) => write!(f, "/ip4/{}/tcp/{}/p2p/{}", self.host, self.port, id),
            None => write!(f, "/ip4/{}/tcp/{}", self.host, self.port),
        }
    }
}

impl FromStr for NodeAddr {
    type Err = NetworkError;

    /// Accepts the multi-address form and the plain `host:port` form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("/ip4/") {
            let parts: Vec<&str> = rest.split('/').collect();
            if parts.len() < 3 || parts[1] != "tcp" {
                return Err(NetworkError::InvalidPeerAddress(s.to_string()));
            }
            let host = parts[0].to_string();
            let port: u16 = parts[2]
                .parse()
                .map_err(|_| NetworkError::InvalidPeerAddress(s.to_string()))?;
            let node_id = match parts.get(3) {
                Some(&"p2p") => parts.get(4).map(|id| id.to_string()),
                _ => None,
            };
            return Ok(Self {
                host,
                port,
                node_id,
            });
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| NetworkError::InvalidPeerAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| NetworkError::InvalidPeerAddress(s.to_string()))?;
        Ok(Self {
            host: host.to_string(),
            port,
            node_id: None,
        })
    }
}

/// What the node remembers about a peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: NodeAddr,
    /// Unix seconds of the last successful exchange
    pub last_seen: i64,
}

/// The current peer set plus the relay seen-cache
#[derive(Default)]
pub struct PeerManager {
    peers: RwLock<HashMap<String, PeerInfo>>,
    seen: Mutex<SeenCache>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer, keyed by node ID when known, else by socket address
    pub async fn add_peer(&self, addr: NodeAddr) {
        let key = addr
            .node_id
            .clone()
            .unwrap_or_else(|| addr.socket_addr());
        let mut peers = self.peers.write().await;
        peers.insert(
            key,
            PeerInfo {
                addr,
                last_seen: Utc::now().timestamp(),
            },
        );
    }

    /// Refresh the last-seen stamp for a peer, inserting it if new
    pub async fn touch(&self, addr: NodeAddr) {
        self.add_peer(addr).await;
    }

    pub async fn remove_peer(&self, key: &str) {
        self.peers.write().await.remove(key);
    }

    /// Snapshot of the current peer set
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Record a block or transaction hash as seen. Returns true the first
    /// time, false for repeats: the guard against rebroadcast loops.
    pub fn mark_seen(&self, hash: &Hash) -> bool {
        self.seen.lock().expect("seen cache poisoned").insert(*hash)
    }

    pub fn already_seen(&self, hash: &Hash) -> bool {
        self.seen.lock().expect("seen cache poisoned").contains(hash)
    }
}

/// Bounded first-in-first-out set of recently relayed hashes
#[derive(Default)]
struct SeenCache {
    set: HashSet<Hash>,
    order: VecDeque<Hash>,
}

impl SeenCache {
    fn insert(&mut self, hash: Hash) -> bool {
        if self.set.contains(&hash) {
            return false;
        }
        self.set.insert(hash);
        self.order.push_back(hash);
        while self.order.len() > SEEN_CACHE_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.set.contains(hash)
    }
}
