//! Relay (signaling) collaborator interface: peer identity, rooms, negotiation
//! payloads, and the event/command enums the multiplexer exchanges with a
//! signaling transport.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier the relay assigns to a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Discovery scope on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomType {
    /// Devices behind the same public IP.
    #[serde(rename = "ip")]
    Open,
    /// A pair of devices that completed a pairing exchange.
    #[serde(rename = "secret")]
    Secret,
}

/// The room a peer was seen in. Needed to address any signal to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomMembership {
    #[serde(rename = "roomType")]
    pub room_type: RoomType,
    #[serde(rename = "roomId")]
    pub room_id: String,
}

impl RoomMembership {
    pub fn open(room_id: impl Into<String>) -> Self {
        Self {
            room_type: RoomType::Open,
            room_id: room_id.into(),
        }
    }

    pub fn secret(room_secret: impl Into<String>) -> Self {
        Self {
            room_type: RoomType::Secret,
            room_id: room_secret.into(),
        }
    }

    /// The room secret, for secret rooms.
    pub fn room_secret(&self) -> Option<&str> {
        match self.room_type {
            RoomType::Secret => Some(&self.room_id),
            RoomType::Open => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

/// A device announced by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    #[serde(default)]
    pub name: PeerName,
    #[serde(default)]
    pub rtc_supported: bool,
}

impl PeerInfo {
    pub fn display_name(&self) -> &str {
        self.name
            .display_name
            .as_deref()
            .or(self.name.device_name.as_deref())
            .unwrap_or(self.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Offer or answer produced by a connection; opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Negotiation payload relayed between two sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Signal {
    Description { sdp: SessionDescription },
    Candidate { ice: IceCandidate },
}

/// Delivered by the signaling transport to the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Connected,
    Disconnected,
    /// The relay told us who we are.
    Identity {
        peer_id: PeerId,
        display_name: String,
    },
    /// Snapshot of a room we joined.
    Peers {
        room: RoomMembership,
        peers: Vec<PeerInfo>,
    },
    PeerJoined {
        room: RoomMembership,
        peer: PeerInfo,
    },
    PeerLeft {
        peer_id: PeerId,
        room: Option<RoomMembership>,
    },
    Signal {
        sender_id: PeerId,
        room: Option<RoomMembership>,
        signal: Signal,
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

/// Sent by the multiplexer to the signaling transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingCommand {
    Signal {
        to: PeerId,
        room: RoomMembership,
        signal: Signal,
    },
    /// Join (or re-join after reconnect) the secret rooms of paired devices.
    RoomSecrets(Vec<String>),
    DeleteRoomSecrets(Vec<String>),
    PairDeviceInitiate,
    PairDeviceJoin {
        pair_key: String,
    },
    PairDeviceCancel,
    Disconnect,
}
