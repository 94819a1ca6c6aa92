//! Peer-to-peer networking: identity, envelopes, framing, peers, sync

pub mod codec;
pub mod identity;
pub mod message;
pub mod node;
pub mod peer;
pub mod sync;

pub use codec::EnvelopeCodec;
pub use identity::{NodeIdentity, NODE_ID_VERSION};
pub use message::{
    Envelope, Message, NetworkError, BLOCK_PROTOCOL, PING_PROTOCOL, SYNC_PROTOCOL, TX_PROTOCOL,
};
pub use node::{Node, NodeConfig, NodeEvent};
pub use peer::{NodeAddr, PeerInfo, PeerManager};
pub use sync::ChainSync;
