//! Point-to-point connection seam. A `Connector` opens one connection per
//! session; the connection negotiates through offer/answer/candidate payloads
//! and reports channel activity on its event stream.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::ChannelMessage;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Negotiating,
    Open,
    Closed,
}

/// Reported by a connection, in order, on its event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A local candidate to relay to the remote side.
    LocalCandidate(IceCandidate),
    ChannelOpen,
    Message(ChannelMessage),
    ChannelClosed,
    Failed(String),
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// One negotiated, ordered and reliable data channel.
#[async_trait]
pub trait PeerConnection: Send {
    /// Initiator: create the outbound data channel and a local offer.
    async fn create_offer(&mut self) -> Result<SessionDescription, ConnectionError>;

    /// Responder: apply the remote offer and produce the local answer.
    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, ConnectionError>;

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), ConnectionError>;

    /// Only called after the remote description is applied.
    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    fn send(&mut self, message: ChannelMessage) -> Result<(), ConnectionError>;

    /// Bytes queued on the channel but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    fn close(&mut self);
}

/// Opens fresh connections. Shared by all sessions of a multiplexer.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        peer_id: &PeerId,
    ) -> Result<(Box<dyn PeerConnection>, ConnectionEvents), ConnectionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("data channel is not open")]
    NotOpen,
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
