//! P2P message types and the signed envelope
//!
//! Each logical protocol carries one message family: `block/1` for new
//! blocks, `tx/1` for new transactions, `sync/1` for height probes and
//! block batch downloads, `ping/1` for liveness. Every envelope is signed
//! with the sender's node key; receivers verify the signature and the
//! claimed origin before dispatching.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Block, Transaction};
use crate::crypto::{sha256, verify_signature, KeyError};
use crate::network::identity::{node_id_from_pubkey, NodeIdentity};

/// Protocol version carried in the frame header
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes prefixed to every frame
pub const MAGIC: [u8; 4] = *b"MCN1";

/// Stream protocol identifiers
pub const BLOCK_PROTOCOL: &str = "/minicoin/block/1";
pub const TX_PROTOCOL: &str = "/minicoin/tx/1";
pub const SYNC_PROTOCOL: &str = "/minicoin/sync/1";
pub const PING_PROTOCOL: &str = "/minicoin/ping/1";

/// Network layer errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Failed to connect to peer: {0}")]
    PeerConnectFailed(String),
    #[error("Stream error: {0}")]
    StreamError(#[from] std::io::Error),
    #[error("Message encoding error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("Invalid peer address: {0}")]
    InvalidPeerAddress(String),
    #[error("Request timed out")]
    RequestTimeout,
    #[error("Cancelled")]
    Cancelled,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Network message payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Announce a newly committed block
    NewBlock(Block),
    /// Announce a new transaction
    NewTransaction(Transaction),
    /// Ask a peer for its chain height
    GetHeight,
    /// Chain height response
    Height(u64),
    /// Ask for blocks starting at a position
    GetBlocks { from_height: u64 },
    /// Block batch response, ascending order
    Blocks(Vec<Block>),
    /// Liveness probe
    Ping(u64),
    /// Liveness response
    Pong(u64),
}

impl Message {
    /// Message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::NewBlock(_) => "NewBlock",
            Message::NewTransaction(_) => "NewTx",
            Message::GetHeight => "GetHeight",
            Message::Height(_) => "Height",
            Message::GetBlocks { .. } => "GetBlocks",
            Message::Blocks(_) => "Blocks",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
        }
    }

    /// The stream protocol this message family belongs to
    pub fn protocol(&self) -> &'static str {
        match self {
            Message::NewBlock(_) => BLOCK_PROTOCOL,
            Message::NewTransaction(_) => TX_PROTOCOL,
            Message::GetHeight
            | Message::Height(_)
            | Message::GetBlocks { .. }
            | Message::Blocks(_) => SYNC_PROTOCOL,
            Message::Ping(_) | Message::Pong(_) => PING_PROTOCOL,
        }
    }
}

/// Signed message envelope exchanged between peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message: Message,
    /// Unix seconds at send time
    pub timestamp: i64,
    /// Sender node ID
    pub origin: String,
    /// Sender node public key, uncompressed
    #[serde(with = "hex")]
    pub origin_pubkey: Vec<u8>,
    /// Node-key signature over the payload digest
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Wrap and sign a message with the local node identity
    pub fn seal(message: Message, identity: &NodeIdentity) -> Result<Self, NetworkError> {
        let timestamp = Utc::now().timestamp();
        let origin = identity.node_id();
        let digest = signing_digest(&message, timestamp, &origin)?;
        let signature = identity.sign(&digest)?;

        Ok(Self {
            message,
            timestamp,
            origin,
            origin_pubkey: identity.public_key_bytes().to_vec(),
            signature: signature.to_vec(),
        })
    }

    /// Check the envelope signature and that the embedded key hashes to the
    /// claimed origin ID
    pub fn verify(&self) -> Result<(), NetworkError> {
        if node_id_from_pubkey(&self.origin_pubkey) != self.origin {
            return Err(NetworkError::InvalidEnvelope(
                "origin does not match public key".into(),
            ));
        }

        let public_key = crate::crypto::public_key_from_bytes(&self.origin_pubkey)
            .map_err(|_| NetworkError::InvalidEnvelope("malformed public key".into()))?;
        let digest = signing_digest(&self.message, self.timestamp, &self.origin)?;
        if !verify_signature(&public_key, &digest, &self.signature)? {
            return Err(NetworkError::InvalidEnvelope("bad signature".into()));
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Digest covering the message body, timestamp and claimed origin
fn signing_digest(
    message: &Message,
    timestamp: i64,
    origin: &str,
) -> Result<[u8; 32], NetworkError> {
    let mut preimage = serde_json::to_vec(message)?;
    preimage.extend_from_slice(&timestamp.to_le_bytes());
    preimage.extend_from_slice(origin.as_bytes());
    Ok(sha256(&preimage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let identity = NodeIdentity::ephemeral();
        let envelope = Envelope::seal(Message::Ping(42), &identity).unwrap();

        let bytes = envelope.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();

        decoded.verify().unwrap();
        assert!(matches!(decoded.message, Message::Ping(42)));
        assert_eq!(decoded.origin, identity.node_id());
    }

    #[test]
    fn test_envelope_rejects_tampered_payload() {
        let identity = NodeIdentity::ephemeral();
        let mut envelope = Envelope::seal(Message::Ping(42), &identity).unwrap();
        envelope.message = Message::Ping(43);
        assert!(envelope.verify().is_err());
    }

    #[test]
    fn test_envelope_rejects_forged_origin() {
        let identity = NodeIdentity::ephemeral();
        let impostor = NodeIdentity::ephemeral();
        let mut envelope = Envelope::seal(Message::Ping(42), &identity).unwrap();
        envelope.origin = impostor.node_id();
        assert!(envelope.verify().is_err());
    }

    #[test]
    fn test_protocol_mapping() {
        assert_eq!(Message::GetHeight.protocol(), SYNC_PROTOCOL);
        assert_eq!(Message::Ping(1).protocol(), PING_PROTOCOL);
    }
}
