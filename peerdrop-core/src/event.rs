//! Typed events fanned out from sessions to the multiplexer and from the
//! multiplexer to the application.

use uuid::Uuid;

use crate::chunk::ReceivedFile;
use crate::protocol::TransferRequest;
use crate::signaling::{PeerId, PeerInfo, RoomMembership, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// File currently moving; empty when only batch progress is known.
    pub file_name: String,
    /// Batch fraction, 0..=1.
    pub progress: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

/// Emitted by one Peer Session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Negotiation payload to relay to the remote peer.
    Signal(Signal),
    ChannelOpen,
    ChannelClosed,
    TransferRequest(TransferRequest),
    SendProgress(Progress),
    ReceiveProgress(Progress),
    FileReceived(ReceivedFile),
    /// Every file of a batch went through. Emitted on both sides.
    TransferComplete(Direction),
    TransferRejected { reason: Option<String> },
    TransferCanceled(Direction),
    TextReceived(String),
    DisplayNameChanged(String),
    /// Terminal failure; the session must be discarded.
    Error(String),
}

/// A session event tagged with its origin. `session_id` lets the
/// multiplexer drop events of sessions it already replaced.
#[derive(Debug, Clone)]
pub struct SessionEnvelope {
    pub peer_id: PeerId,
    pub session_id: Uuid,
    pub event: SessionEvent,
}

/// A peer as tracked by the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry {
    pub info: PeerInfo,
    /// Where signals to this peer are addressed.
    pub room: RoomMembership,
    /// Every room the peer is currently seen in.
    pub rooms: Vec<RoomMembership>,
}

/// Emitted by the multiplexer to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum MultiplexerEvent {
    ServerConnected,
    ServerDisconnected,
    Identity {
        peer_id: PeerId,
        display_name: String,
    },
    PeersUpdated(Vec<PeerEntry>),
    PeerJoined(PeerEntry),
    PeerLeft(PeerId),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    TransferRequest {
        peer_id: PeerId,
        request: TransferRequest,
        /// Set when the peer was seen in a paired device's room.
        room_secret: Option<String>,
    },
    SendProgress {
        peer_id: PeerId,
        progress: Progress,
    },
    ReceiveProgress {
        peer_id: PeerId,
        progress: Progress,
    },
    FileReceived {
        peer_id: PeerId,
        file: ReceivedFile,
    },
    TransferComplete {
        peer_id: PeerId,
        direction: Direction,
    },
    TransferRejected {
        peer_id: PeerId,
        reason: Option<String>,
    },
    TransferCanceled {
        peer_id: PeerId,
        direction: Direction,
    },
    TextReceived {
        peer_id: PeerId,
        text: String,
    },
    DisplayNameChanged {
        peer_id: PeerId,
        display_name: String,
    },
    Error {
        peer_id: PeerId,
        message: String,
    },
    PairDeviceInitiated {
        pair_key: String,
        room_secret: String,
    },
    PairDeviceJoined {
        room_secret: String,
        peer_id: PeerId,
    },
    PairDeviceJoinKeyInvalid,
    PairDeviceCanceled,
    SecretRoomDeleted {
        room_secret: String,
    },
}
