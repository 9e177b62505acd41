//! Relay client: PairDrop-compatible WebSocket signaling. Translates relay
//! JSON messages to `SignalingEvent`s and `SignalingCommand`s back to JSON,
//! answers keepalive pings, and reconnects with backoff.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerdrop_core::signaling::{IceCandidate, SessionDescription};
use peerdrop_core::{PeerId, PeerInfo, RoomMembership, RoomType, Signal, SignalingCommand, SignalingEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DiscoveryMode;

const RECONNECT_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages the relay sends us.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ServerMessage {
    WsConfig,
    DisplayName {
        #[serde(rename = "displayName")]
        display_name: String,
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(rename = "peerIdHash", default)]
        peer_id_hash: Option<String>,
    },
    Peers {
        #[serde(default)]
        peers: Vec<PeerInfo>,
        #[serde(rename = "roomType", default)]
        room_type: Option<RoomType>,
        #[serde(rename = "roomId", default)]
        room_id: Option<String>,
    },
    PeerJoined {
        peer: PeerInfo,
        #[serde(rename = "roomType", default)]
        room_type: Option<RoomType>,
        #[serde(rename = "roomId", default)]
        room_id: Option<String>,
    },
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(rename = "roomType", default)]
        room_type: Option<RoomType>,
        #[serde(rename = "roomId", default)]
        room_id: Option<String>,
    },
    Signal {
        sender: Sender,
        #[serde(rename = "roomType", default)]
        room_type: Option<RoomType>,
        #[serde(rename = "roomId", default)]
        room_id: Option<String>,
        #[serde(default)]
        sdp: Option<SessionDescription>,
        #[serde(default)]
        ice: Option<IceCandidate>,
    },
    Ping,
    PairDeviceInitiated {
        #[serde(rename = "pairKey")]
        pair_key: String,
        #[serde(rename = "roomSecret")]
        room_secret: String,
    },
    PairDeviceJoined {
        #[serde(rename = "roomSecret")]
        room_secret: String,
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    PairDeviceJoinKeyInvalid,
    PairDeviceCanceled,
    SecretRoomDeleted {
        #[serde(rename = "roomSecret")]
        room_secret: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: PeerId,
}

/// Messages we send to the relay.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    JoinIpRoom,
    RoomSecrets {
        #[serde(rename = "roomSecrets")]
        room_secrets: Vec<String>,
    },
    RoomSecretsDeleted {
        #[serde(rename = "roomSecrets")]
        room_secrets: Vec<String>,
    },
    PairDeviceInitiate,
    PairDeviceJoin {
        #[serde(rename = "pairKey")]
        pair_key: String,
    },
    PairDeviceCancel,
    Signal {
        to: PeerId,
        #[serde(rename = "roomType")]
        room_type: RoomType,
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp: Option<SessionDescription>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ice: Option<IceCandidate>,
    },
    Pong,
    Disconnect,
}

fn room(room_type: Option<RoomType>, room_id: Option<String>) -> Option<RoomMembership> {
    Some(RoomMembership {
        room_type: room_type?,
        room_id: room_id?,
    })
}

impl From<SignalingCommand> for ClientMessage {
    fn from(cmd: SignalingCommand) -> Self {
        match cmd {
            SignalingCommand::Signal { to, room, signal } => {
                let (sdp, ice) = match signal {
                    Signal::Description { sdp } => (Some(sdp), None),
                    Signal::Candidate { ice } => (None, Some(ice)),
                };
                ClientMessage::Signal {
                    to,
                    room_type: room.room_type,
                    room_id: room.room_id,
                    sdp,
                    ice,
                }
            }
            SignalingCommand::RoomSecrets(room_secrets) => ClientMessage::RoomSecrets { room_secrets },
            SignalingCommand::DeleteRoomSecrets(room_secrets) => {
                ClientMessage::RoomSecretsDeleted { room_secrets }
            }
            SignalingCommand::PairDeviceInitiate => ClientMessage::PairDeviceInitiate,
            SignalingCommand::PairDeviceJoin { pair_key } => ClientMessage::PairDeviceJoin { pair_key },
            SignalingCommand::PairDeviceCancel => ClientMessage::PairDeviceCancel,
            SignalingCommand::Disconnect => ClientMessage::Disconnect,
        }
    }
}

/// Relay URL: `http(s)` becomes `ws(s)`, a bare host gets `wss://`, an
/// empty path becomes `/server`; a known identity is passed back so the
/// relay keeps our peer id across reconnects.
pub fn build_url(server: &str, identity: Option<&(PeerId, String)>) -> Result<Url, url::ParseError> {
    let server = server.trim();
    let with_scheme = if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else {
        format!("wss://{server}")
    };
    let mut url = Url::parse(with_scheme.trim_end_matches('/'))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/server");
    }
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("webrtc_supported", "true");
        if let Some((peer_id, hash)) = identity {
            query.append_pair("peer_id", peer_id.as_str());
            query.append_pair("peer_id_hash", hash);
        }
    }
    Ok(url)
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("invalid relay url: {0}")]
    Url(#[from] url::ParseError),
    #[error("relay unreachable after {0} attempts")]
    GaveUp(usize),
}

enum Outcome {
    /// Connection dropped; reconnect.
    Lost,
    /// Local shutdown; stop.
    Shutdown,
}

pub struct SignalingClient {
    server_url: String,
    discovery_mode: DiscoveryMode,
    events: mpsc::UnboundedSender<SignalingEvent>,
    /// Peer id and hash from the last `display-name`.
    identity: Option<(PeerId, String)>,
}

impl SignalingClient {
    pub fn new(
        server_url: &str,
        discovery_mode: DiscoveryMode,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Self {
        Self {
            server_url: server_url.to_string(),
            discovery_mode,
            events,
            identity: None,
        }
    }

    /// Connect and keep reconnecting until `Disconnect` arrives or the
    /// backoff schedule runs out.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SignalingCommand>,
    ) -> Result<(), SignalingError> {
        let mut attempt = 0;
        loop {
            let url = build_url(&self.server_url, self.identity.as_ref())?;
            info!(url = %url, "connecting to relay");
            match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str())).await {
                Ok(Ok((ws, _))) => {
                    attempt = 0;
                    let _ = self.events.send(SignalingEvent::Connected);
                    let outcome = self.serve(ws, &mut commands).await;
                    let _ = self.events.send(SignalingEvent::Disconnected);
                    if let Outcome::Shutdown = outcome {
                        return Ok(());
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "relay connection failed"),
                Err(_) => warn!(timeout = ?CONNECT_TIMEOUT, "relay connection timed out"),
            }
            let Some(delay) = RECONNECT_DELAYS.get(attempt).copied() else {
                return Err(SignalingError::GaveUp(attempt));
            };
            attempt += 1;
            info!(delay = ?delay, attempt, "reconnecting");
            let deadline = tokio::time::sleep(delay);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    cmd = commands.recv() => match cmd {
                        None | Some(SignalingCommand::Disconnect) => return Ok(()),
                        Some(cmd) => debug!(?cmd, "relay offline, dropping command"),
                    },
                }
            }
        }
    }

    async fn serve<S>(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        commands: &mut mpsc::UnboundedReceiver<SignalingCommand>,
    ) -> Outcome
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(_))) | None => return Outcome::Lost,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(error = %e, "relay connection error");
                            return Outcome::Lost;
                        }
                    };
                    let replies = self.on_server_text(text.as_str());
                    for reply in replies {
                        if let Err(e) = send(&mut sink, &reply).await {
                            warn!(error = %e, "relay write failed");
                            return Outcome::Lost;
                        }
                    }
                }
                cmd = commands.recv() => {
                    let cmd = cmd.unwrap_or(SignalingCommand::Disconnect);
                    let shutdown = cmd == SignalingCommand::Disconnect;
                    if let Err(e) = send(&mut sink, &ClientMessage::from(cmd)).await {
                        warn!(error = %e, "relay write failed");
                        return if shutdown { Outcome::Shutdown } else { Outcome::Lost };
                    }
                    if shutdown {
                        let _ = sink.close().await;
                        return Outcome::Shutdown;
                    }
                }
            }
        }
    }

    /// Handle one relay message; returns the replies to send.
    fn on_server_text(&mut self, text: &str) -> Vec<ClientMessage> {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "malformed relay message");
                return Vec::new();
            }
        };
        let mut replies = Vec::new();
        let event = match message {
            ServerMessage::Ping => {
                replies.push(ClientMessage::Pong);
                None
            }
            ServerMessage::WsConfig | ServerMessage::Unknown => None,
            ServerMessage::DisplayName {
                display_name,
                peer_id,
                peer_id_hash,
            } => {
                info!(peer_id = %peer_id, name = %display_name, "relay assigned identity");
                if let Some(hash) = peer_id_hash {
                    self.identity = Some((peer_id.clone(), hash));
                }
                if self.discovery_mode != DiscoveryMode::PairedOnly {
                    replies.push(ClientMessage::JoinIpRoom);
                }
                Some(SignalingEvent::Identity {
                    peer_id,
                    display_name,
                })
            }
            ServerMessage::Peers {
                peers,
                room_type,
                room_id,
            } => match room(room_type, room_id) {
                Some(room) => Some(SignalingEvent::Peers { room, peers }),
                None => {
                    warn!("peer list without a room, ignoring");
                    None
                }
            },
            ServerMessage::PeerJoined {
                peer,
                room_type,
                room_id,
            } => match room(room_type, room_id) {
                Some(room) => Some(SignalingEvent::PeerJoined { room, peer }),
                None => {
                    warn!(peer = %peer.id, "peer joined without a room, ignoring");
                    None
                }
            },
            ServerMessage::PeerLeft {
                peer_id,
                room_type,
                room_id,
            } => Some(SignalingEvent::PeerLeft {
                peer_id,
                room: room(room_type, room_id),
            }),
            ServerMessage::Signal {
                sender,
                room_type,
                room_id,
                sdp,
                ice,
            } => {
                let signal = match (sdp, ice) {
                    (Some(sdp), _) => Some(Signal::Description { sdp }),
                    (None, Some(ice)) => Some(Signal::Candidate { ice }),
                    (None, None) => None,
                };
                match signal {
                    Some(signal) => Some(SignalingEvent::Signal {
                        sender_id: sender.id,
                        room: room(room_type, room_id),
                        signal,
                    }),
                    None => {
                        debug!(peer = %sender.id, "signal without payload");
                        None
                    }
                }
            }
            ServerMessage::PairDeviceInitiated {
                pair_key,
                room_secret,
            } => Some(SignalingEvent::PairDeviceInitiated {
                pair_key,
                room_secret,
            }),
            ServerMessage::PairDeviceJoined {
                room_secret,
                peer_id,
            } => Some(SignalingEvent::PairDeviceJoined {
                room_secret,
                peer_id,
            }),
            ServerMessage::PairDeviceJoinKeyInvalid => Some(SignalingEvent::PairDeviceJoinKeyInvalid),
            ServerMessage::PairDeviceCanceled => Some(SignalingEvent::PairDeviceCanceled),
            ServerMessage::SecretRoomDeleted { room_secret } => {
                Some(SignalingEvent::SecretRoomDeleted { room_secret })
            }
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        replies
    }
}

async fn send<S>(sink: &mut S, message: &ClientMessage) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|e| {
        tokio_tungstenite::tungstenite::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    sink.send(WsMessage::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(mode: DiscoveryMode) -> (SignalingClient, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SignalingClient::new("pairdrop.net", mode, tx), rx)
    }

    #[test]
    fn url_normalization() {
        assert_eq!(
            build_url("pairdrop.net", None).unwrap().as_str(),
            "wss://pairdrop.net/server?webrtc_supported=true"
        );
        assert_eq!(
            build_url("http://localhost:3000/", None).unwrap().as_str(),
            "ws://localhost:3000/server?webrtc_supported=true"
        );
        assert_eq!(
            build_url("https://drop.example.com/custom", None).unwrap().as_str(),
            "wss://drop.example.com/custom?webrtc_supported=true"
        );
        let identity = (PeerId::from("abc"), "h4sh".to_string());
        assert_eq!(
            build_url("wss://pairdrop.net", Some(&identity)).unwrap().as_str(),
            "wss://pairdrop.net/server?webrtc_supported=true&peer_id=abc&peer_id_hash=h4sh"
        );
    }

    #[test]
    fn ping_gets_pong() {
        let (mut c, _rx) = client(DiscoveryMode::Auto);
        assert_eq!(c.on_server_text(r#"{"type":"ping"}"#), vec![ClientMessage::Pong]);
    }

    #[test]
    fn identity_joins_ip_room_unless_paired_only() {
        let hello = r#"{"type":"display-name","displayName":"Blue Fox","deviceName":"Linux","peerId":"p1","peerIdHash":"h"}"#;
        let (mut c, mut rx) = client(DiscoveryMode::Auto);
        assert_eq!(c.on_server_text(hello), vec![ClientMessage::JoinIpRoom]);
        assert_eq!(
            rx.try_recv().unwrap(),
            SignalingEvent::Identity {
                peer_id: PeerId::from("p1"),
                display_name: "Blue Fox".into()
            }
        );
        assert_eq!(c.identity, Some((PeerId::from("p1"), "h".to_string())));

        let (mut c, _rx) = client(DiscoveryMode::PairedOnly);
        assert!(c.on_server_text(hello).is_empty());
    }

    #[test]
    fn relay_events_carry_rooms() {
        let (mut c, mut rx) = client(DiscoveryMode::Auto);
        c.on_server_text(
            &json!({
                "type": "peers",
                "roomType": "secret",
                "roomId": "s1",
                "peers": [{"id": "p2", "name": {"displayName": "Red Owl"}, "rtcSupported": true}]
            })
            .to_string(),
        );
        match rx.try_recv().unwrap() {
            SignalingEvent::Peers { room, peers } => {
                assert_eq!(room, RoomMembership::secret("s1"));
                assert_eq!(peers[0].display_name(), "Red Owl");
            }
            other => panic!("unexpected {other:?}"),
        }

        c.on_server_text(
            &json!({
                "type": "signal",
                "sender": {"id": "p2", "rtcSupported": true},
                "roomType": "ip",
                "roomId": "1.2.3.4",
                "sdp": {"type": "offer", "sdp": "v=0"}
            })
            .to_string(),
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SignalingEvent::Signal {
                sender_id: PeerId::from("p2"),
                room: Some(RoomMembership::open("1.2.3.4")),
                signal: Signal::Description {
                    sdp: SessionDescription::offer("v=0")
                },
            }
        );

        c.on_server_text(r#"{"type":"peer-left","peerId":"p2"}"#);
        assert_eq!(
            rx.try_recv().unwrap(),
            SignalingEvent::PeerLeft {
                peer_id: PeerId::from("p2"),
                room: None
            }
        );
    }

    #[test]
    fn unknown_messages_are_ignored() {
        let (mut c, mut rx) = client(DiscoveryMode::Auto);
        assert!(c.on_server_text(r#"{"type":"request-ip-change","x":1}"#).is_empty());
        assert!(c.on_server_text("garbage").is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn outbound_signal_shape() {
        let msg = ClientMessage::from(SignalingCommand::Signal {
            to: PeerId::from("p2"),
            room: RoomMembership::secret("s1"),
            signal: Signal::Candidate {
                ice: IceCandidate {
                    candidate: "c".into(),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                },
            },
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "signal", "to": "p2", "roomType": "secret", "roomId": "s1", "ice": {"candidate": "c"}})
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::from(SignalingCommand::DeleteRoomSecrets(vec!["s1".into()])))
                .unwrap(),
            json!({"type": "room-secrets-deleted", "roomSecrets": ["s1"]})
        );
    }
}
