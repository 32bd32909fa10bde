//! Transport callback used to hand PDUs to the bearer.
//!
//! The core never talks to a radio. Every outbound proxy PDU goes through a
//! [`PduTransport`] supplied by the embedding application.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Remote device identity (device UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Peer(pub Uuid);

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer:{}", self.0)
    }
}

impl From<Uuid> for Peer {
    fn from(uuid: Uuid) -> Self {
        Peer(uuid)
    }
}

/// Transport failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Bearer is gone
    #[error("transport closed")]
    Closed,

    /// Write failed
    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound PDU sink
#[async_trait]
pub trait PduTransport: Send + Sync {
    /// Send one encoded proxy PDU to `peer`
    async fn send(&self, peer: &Peer, pdu: Bytes) -> Result<(), TransportError>;
}

/// Transport that forwards PDUs into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<(Peer, Bytes)>,
}

impl ChannelTransport {
    /// Create a transport and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Peer, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PduTransport for ChannelTransport {
    async fn send(&self, peer: &Peer, pdu: Bytes) -> Result<(), TransportError> {
        self.tx
            .send((*peer, pdu))
            .map_err(|_| TransportError::Closed)
    }
}
