//! Session Multiplexer: owns the peer table (with each peer's rooms) and the
//! per-peer sessions, routes relay events to sessions and session signals back
//! to the relay, and re-emits session events for the application.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::ReceivedFile;
use crate::config::Config;
use crate::connection::{ConnectionState, Connector};
use crate::event::{MultiplexerEvent, PeerEntry, SessionEnvelope, SessionEvent};
use crate::session::{SessionError, SessionHandle};
use crate::signaling::{
    PeerId, PeerInfo, PeerName, RoomMembership, Signal, SignalingCommand, SignalingEvent,
};
use crate::storage::{self, Storage, StorageError};
use crate::transfer::OutgoingFile;

enum Command {
    PrepareSession {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<(SessionHandle, bool), MultiplexerError>>,
    },
    Session {
        peer_id: PeerId,
        reply: oneshot::Sender<Option<SessionHandle>>,
    },
    Peers(oneshot::Sender<Vec<PeerEntry>>),
    RoomSecretForPeer {
        peer_id: PeerId,
        reply: oneshot::Sender<Option<String>>,
    },
    UpdateRoomSecrets(Vec<String>),
    DeleteRoomSecret(String),
    /// Drop the peer's session if it is still `session_id`.
    DiscardSession {
        peer_id: PeerId,
        session_id: Uuid,
    },
    Relay(SignalingCommand),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to the multiplexer actor. Cheap to clone.
#[derive(Clone)]
pub struct Multiplexer {
    config: Config,
    storage: Arc<dyn Storage>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Multiplexer {
    /// Start the multiplexer. It reads relay events from `signaling_rx`,
    /// writes relay commands to `signaling_tx`, and reports to the returned
    /// receiver.
    pub fn spawn(
        config: Config,
        connector: Arc<dyn Connector>,
        storage: Arc<dyn Storage>,
        signaling_tx: mpsc::UnboundedSender<SignalingCommand>,
        signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<MultiplexerEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let actor = MultiplexerActor {
            room_secrets: config.room_secrets.clone(),
            config: config.clone(),
            connector,
            signaling: signaling_tx,
            events: events_tx,
            session_tx,
            peers: BTreeMap::new(),
            sessions: HashMap::new(),
            connected: false,
        };
        tokio::spawn(actor.run(commands_rx, signaling_rx, session_rx));
        let handle = Self {
            config,
            storage,
            commands: commands_tx,
        };
        (handle, events_rx)
    }

    /// Read `paths` from storage and send them as one batch.
    pub async fn send_files_to_peer(
        &self,
        peer_id: &PeerId,
        paths: &[String],
    ) -> Result<(), MultiplexerError> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let data = self.storage.read_binary(path).await?;
            files.push(OutgoingFile {
                descriptor: storage::describe(path, data.len() as u64, None),
                data,
            });
        }
        self.send_outgoing(peer_id, files).await
    }

    /// Send every file below `folder`, with paths relative to its parent.
    pub async fn send_folder_to_peer(
        &self,
        peer_id: &PeerId,
        folder: &str,
    ) -> Result<(), MultiplexerError> {
        let folder = folder.trim_end_matches('/');
        let base = storage::parent(folder);
        let mut files = Vec::new();
        for path in self.storage.list_files(folder).await? {
            let data = self.storage.read_binary(&path).await?;
            files.push(OutgoingFile {
                descriptor: storage::describe(&path, data.len() as u64, Some(base)),
                data,
            });
        }
        self.send_outgoing(peer_id, files).await
    }

    async fn send_outgoing(
        &self,
        peer_id: &PeerId,
        files: Vec<OutgoingFile>,
    ) -> Result<(), MultiplexerError> {
        let (session, created) = self
            .request(|reply| Command::PrepareSession {
                peer_id: peer_id.clone(),
                reply,
            })
            .await??;
        if let Err(e) = self.open_session(&session, created).await {
            debug!(peer = %peer_id, error = %e, "channel did not open, discarding session");
            let _ = self.command(Command::DiscardSession {
                peer_id: peer_id.clone(),
                session_id: session.session_id(),
            });
            return Err(e.into());
        }
        session.send_files(files).await?;
        Ok(())
    }

    async fn open_session(
        &self,
        session: &SessionHandle,
        created: bool,
    ) -> Result<(), SessionError> {
        if created {
            session.connect().await?;
        }
        session
            .wait_until_open(self.config.channel_open_timeout)
            .await
    }

    pub async fn accept_transfer(&self, peer_id: &PeerId) -> Result<(), MultiplexerError> {
        self.with_session(peer_id, |s| s.accept_transfer()).await
    }

    pub async fn reject_transfer(
        &self,
        peer_id: &PeerId,
        reason: Option<String>,
    ) -> Result<(), MultiplexerError> {
        self.with_session(peer_id, |s| s.reject_transfer(reason)).await
    }

    pub async fn cancel_transfer(&self, peer_id: &PeerId) -> Result<(), MultiplexerError> {
        self.with_session(peer_id, |s| s.cancel_transfer()).await
    }

    /// Save under the configured folder; returns the path written.
    pub async fn save_received_file(&self, file: &ReceivedFile) -> Result<String, MultiplexerError> {
        let path = storage::save_received_file(
            self.storage.as_ref(),
            &self.config.save_location,
            file,
            self.config.max_save_attempts,
        )
        .await?;
        info!(path = %path, "saved received file");
        Ok(path)
    }

    pub async fn peers(&self) -> Result<Vec<PeerEntry>, MultiplexerError> {
        self.request(Command::Peers).await
    }

    /// State of the session with `peer_id`, `None` when there is none.
    pub async fn connection_state(
        &self,
        peer_id: &PeerId,
    ) -> Result<Option<ConnectionState>, MultiplexerError> {
        let session = self
            .request(|reply| Command::Session {
                peer_id: peer_id.clone(),
                reply,
            })
            .await?;
        Ok(session.map(|s| s.state()))
    }

    /// The secret of the paired room `peer_id` was seen in, if any.
    pub async fn room_secret_for_peer(
        &self,
        peer_id: &PeerId,
    ) -> Result<Option<String>, MultiplexerError> {
        self.request(|reply| Command::RoomSecretForPeer {
            peer_id: peer_id.clone(),
            reply,
        })
        .await
    }

    /// Replace the paired room secrets and re-join them.
    pub fn update_room_secrets(&self, secrets: Vec<String>) -> Result<(), MultiplexerError> {
        self.command(Command::UpdateRoomSecrets(secrets))
    }

    pub fn pair_device_initiate(&self) -> Result<(), MultiplexerError> {
        self.command(Command::Relay(SignalingCommand::PairDeviceInitiate))
    }

    pub fn pair_device_join(&self, pair_key: &str) -> Result<(), MultiplexerError> {
        self.command(Command::Relay(SignalingCommand::PairDeviceJoin {
            pair_key: pair_key.to_string(),
        }))
    }

    pub fn pair_device_cancel(&self) -> Result<(), MultiplexerError> {
        self.command(Command::Relay(SignalingCommand::PairDeviceCancel))
    }

    /// Unpair: forget the secret locally and on the relay.
    pub fn delete_room_secret(&self, room_secret: &str) -> Result<(), MultiplexerError> {
        self.command(Command::DeleteRoomSecret(room_secret.to_string()))
    }

    /// Close every session, clear all peer state and leave the relay.
    pub async fn disconnect(&self) -> Result<(), MultiplexerError> {
        self.request(Command::Disconnect).await
    }

    async fn with_session(
        &self,
        peer_id: &PeerId,
        f: impl FnOnce(&SessionHandle) -> Result<(), SessionError>,
    ) -> Result<(), MultiplexerError> {
        let session = self
            .request(|reply| Command::Session {
                peer_id: peer_id.clone(),
                reply,
            })
            .await?;
        match session {
            Some(session) => {
                if let Err(e) = f(&session) {
                    debug!(peer = %peer_id, error = %e, "session gone");
                }
            }
            None => debug!(peer = %peer_id, "no session"),
        }
        Ok(())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MultiplexerError> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx))?;
        rx.await.map_err(|_| MultiplexerError::Closed)
    }

    fn command(&self, command: Command) -> Result<(), MultiplexerError> {
        self.commands
            .send(command)
            .map_err(|_| MultiplexerError::Closed)
    }
}

struct MultiplexerActor {
    config: Config,
    connector: Arc<dyn Connector>,
    signaling: mpsc::UnboundedSender<SignalingCommand>,
    events: mpsc::UnboundedSender<MultiplexerEvent>,
    session_tx: mpsc::UnboundedSender<SessionEnvelope>,
    peers: BTreeMap<PeerId, PeerRecord>,
    sessions: HashMap<PeerId, SessionHandle>,
    room_secrets: Vec<String>,
    connected: bool,
}

impl MultiplexerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signaling: mpsc::UnboundedReceiver<SignalingEvent>,
        mut session_events: mpsc::UnboundedReceiver<SessionEnvelope>,
    ) {
        let mut signaling_open = true;
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Disconnect(reply)) => {
                        self.disconnect();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.disconnect();
                        break;
                    }
                },
                ev = signaling.recv(), if signaling_open => match ev {
                    Some(ev) => self.on_signaling_event(ev),
                    None => {
                        signaling_open = false;
                        self.on_signaling_event(SignalingEvent::Disconnected);
                    }
                },
                Some(env) = session_events.recv() => self.on_session_event(env),
            }
        }
        debug!("multiplexer stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::PrepareSession { peer_id, reply } => {
                let _ = reply.send(self.prepare_session(peer_id));
            }
            Command::Session { peer_id, reply } => {
                let _ = reply.send(self.sessions.get(&peer_id).cloned());
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::RoomSecretForPeer { peer_id, reply } => {
                let secret = self
                    .peers
                    .get(&peer_id)
                    .and_then(PeerRecord::room_secret)
                    .map(str::to_string);
                let _ = reply.send(secret);
            }
            Command::UpdateRoomSecrets(secrets) => {
                self.room_secrets = secrets;
                self.join_secret_rooms();
            }
            Command::DeleteRoomSecret(secret) => {
                self.room_secrets.retain(|s| *s != secret);
                self.relay(SignalingCommand::DeleteRoomSecrets(vec![secret]));
            }
            Command::DiscardSession {
                peer_id,
                session_id,
            } => {
                let current = self.sessions.get(&peer_id).map(|s| s.session_id());
                if current == Some(session_id) {
                    if let Some(session) = self.sessions.remove(&peer_id) {
                        session.close();
                    }
                }
            }
            Command::Relay(cmd) => self.relay(cmd),
            Command::Disconnect(_) => {}
        }
    }

    /// Reuse a ready session or replace whatever is there with a fresh one.
    /// The flag is true when the caller must connect it.
    fn prepare_session(
        &mut self,
        peer_id: PeerId,
    ) -> Result<(SessionHandle, bool), MultiplexerError> {
        if !self.peers.contains_key(&peer_id) {
            return Err(MultiplexerError::UnknownPeer(peer_id));
        }
        if let Some(session) = self.sessions.get(&peer_id) {
            if session.is_ready() {
                return Ok((session.clone(), false));
            }
        }
        if let Some(stale) = self.sessions.remove(&peer_id) {
            debug!(peer = %peer_id, "discarding session that is not ready");
            stale.close();
        }
        Ok((self.spawn_session(peer_id), true))
    }

    fn spawn_session(&mut self, peer_id: PeerId) -> SessionHandle {
        let session = SessionHandle::spawn(
            peer_id.clone(),
            self.config.clone(),
            self.connector.clone(),
            self.session_tx.clone(),
        );
        self.sessions.insert(peer_id, session.clone());
        session
    }

    fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                info!("connected to relay");
                self.connected = true;
                self.emit(MultiplexerEvent::ServerConnected);
                self.join_secret_rooms();
            }
            SignalingEvent::Disconnected => {
                if self.connected {
                    info!("disconnected from relay");
                }
                self.connected = false;
                self.emit(MultiplexerEvent::ServerDisconnected);
            }
            SignalingEvent::Identity {
                peer_id,
                display_name,
            } => self.emit(MultiplexerEvent::Identity {
                peer_id,
                display_name,
            }),
            SignalingEvent::Peers { room, peers } => {
                let gone: Vec<PeerId> = self
                    .peers
                    .iter()
                    .filter(|(id, record)| {
                        record.rooms.contains(&room) && !peers.iter().any(|p| p.id == **id)
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                for peer_id in gone {
                    self.leave_room(&peer_id, &room);
                }
                for info in peers {
                    self.record_peer(info, room.clone());
                }
                debug!(room = %room.room_id, peers = self.peers.len(), "peer snapshot");
                self.emit(MultiplexerEvent::PeersUpdated(self.snapshot()));
            }
            SignalingEvent::PeerJoined { room, peer } => {
                debug!(peer = %peer.id, room = %room.room_id, "peer joined");
                let peer_id = peer.id.clone();
                self.record_peer(peer, room);
                if let Some(entry) = self.peers.get(&peer_id).and_then(PeerRecord::entry) {
                    self.emit(MultiplexerEvent::PeerJoined(entry));
                }
                self.emit(MultiplexerEvent::PeersUpdated(self.snapshot()));
            }
            SignalingEvent::PeerLeft { peer_id, room } => match room {
                Some(room) => self.leave_room(&peer_id, &room),
                None => {
                    debug!(peer = %peer_id, "peer left");
                    self.remove_peer(&peer_id);
                }
            },
            SignalingEvent::Signal {
                sender_id,
                room,
                signal,
            } => self.on_relayed_signal(sender_id, room, signal),
            SignalingEvent::PairDeviceInitiated {
                pair_key,
                room_secret,
            } => self.emit(MultiplexerEvent::PairDeviceInitiated {
                pair_key,
                room_secret,
            }),
            SignalingEvent::PairDeviceJoined {
                room_secret,
                peer_id,
            } => {
                info!(peer = %peer_id, "paired with device");
                if !self.room_secrets.contains(&room_secret) {
                    self.room_secrets.push(room_secret.clone());
                }
                self.emit(MultiplexerEvent::PairDeviceJoined {
                    room_secret,
                    peer_id,
                });
            }
            SignalingEvent::PairDeviceJoinKeyInvalid => {
                self.emit(MultiplexerEvent::PairDeviceJoinKeyInvalid)
            }
            SignalingEvent::PairDeviceCanceled => self.emit(MultiplexerEvent::PairDeviceCanceled),
            SignalingEvent::SecretRoomDeleted { room_secret } => {
                self.room_secrets.retain(|s| *s != room_secret);
                let room = RoomMembership::secret(room_secret.as_str());
                let gone: Vec<PeerId> = self
                    .peers
                    .iter()
                    .filter(|(_, record)| record.rooms.contains(&room))
                    .map(|(id, _)| id.clone())
                    .collect();
                for peer_id in gone {
                    self.leave_room(&peer_id, &room);
                }
                self.emit(MultiplexerEvent::SecretRoomDeleted { room_secret });
            }
        }
    }

    fn on_relayed_signal(
        &mut self,
        sender_id: PeerId,
        room: Option<RoomMembership>,
        signal: Signal,
    ) {
        match (self.peers.get_mut(&sender_id), room) {
            (Some(record), Some(room)) => {
                record.join(room.clone());
                record.last_signal = Some(room);
            }
            (Some(_), None) => {}
            (None, Some(room)) => {
                let info = PeerInfo {
                    id: sender_id.clone(),
                    name: PeerName::default(),
                    rtc_supported: true,
                };
                let mut record = PeerRecord::new(info, room.clone());
                record.last_signal = Some(room);
                self.peers.insert(sender_id.clone(), record);
            }
            (None, None) => {
                warn!(peer = %sender_id, "signal from a peer in no known room, dropping");
                return;
            }
        }
        let signal = match self.sessions.get(&sender_id).cloned() {
            Some(session) => match session.handle_signal(signal.clone()) {
                Ok(()) => return,
                Err(_) => {
                    debug!(peer = %sender_id, "session ended, replacing it with a responder");
                    self.sessions.remove(&sender_id);
                    signal
                }
            },
            None => {
                debug!(peer = %sender_id, "creating responder session");
                signal
            }
        };
        let session = self.spawn_session(sender_id.clone());
        if session.handle_signal(signal).is_err() {
            warn!(peer = %sender_id, "responder session ended before the signal arrived");
            self.sessions.remove(&sender_id);
        }
    }

    fn on_session_event(&mut self, env: SessionEnvelope) {
        let current = self
            .sessions
            .get(&env.peer_id)
            .map(|s| s.session_id());
        if current != Some(env.session_id) {
            debug!(peer = %env.peer_id, "dropping event of a replaced session");
            return;
        }
        let peer_id = env.peer_id;
        let event = match env.event {
            SessionEvent::Signal(signal) => {
                self.address_signal(peer_id, signal);
                return;
            }
            SessionEvent::ChannelOpen => MultiplexerEvent::PeerConnected(peer_id),
            SessionEvent::ChannelClosed => {
                self.sessions.remove(&peer_id);
                MultiplexerEvent::PeerDisconnected(peer_id)
            }
            SessionEvent::Error(message) => {
                if let Some(session) = self.sessions.remove(&peer_id) {
                    session.close();
                }
                MultiplexerEvent::Error { peer_id, message }
            }
            SessionEvent::TransferRequest(request) => {
                let room_secret = self
                    .peers
                    .get(&peer_id)
                    .and_then(PeerRecord::room_secret)
                    .map(str::to_string);
                MultiplexerEvent::TransferRequest {
                    peer_id,
                    request,
                    room_secret,
                }
            }
            SessionEvent::SendProgress(progress) => {
                MultiplexerEvent::SendProgress { peer_id, progress }
            }
            SessionEvent::ReceiveProgress(progress) => {
                MultiplexerEvent::ReceiveProgress { peer_id, progress }
            }
            SessionEvent::FileReceived(file) => MultiplexerEvent::FileReceived { peer_id, file },
            SessionEvent::TransferComplete(direction) => {
                MultiplexerEvent::TransferComplete { peer_id, direction }
            }
            SessionEvent::TransferRejected { reason } => {
                MultiplexerEvent::TransferRejected { peer_id, reason }
            }
            SessionEvent::TransferCanceled(direction) => {
                MultiplexerEvent::TransferCanceled { peer_id, direction }
            }
            SessionEvent::TextReceived(text) => MultiplexerEvent::TextReceived { peer_id, text },
            SessionEvent::DisplayNameChanged(display_name) => {
                MultiplexerEvent::DisplayNameChanged {
                    peer_id,
                    display_name,
                }
            }
        };
        self.emit(event);
    }

    /// Outbound signals always carry one of the peer's recorded rooms.
    fn address_signal(&mut self, peer_id: PeerId, signal: Signal) {
        let Some(room) = self
            .peers
            .get(&peer_id)
            .and_then(PeerRecord::preferred_room)
            .cloned()
        else {
            warn!(peer = %peer_id, "no room recorded for peer, dropping signal");
            return;
        };
        self.relay(SignalingCommand::Signal {
            to: peer_id,
            room,
            signal,
        });
    }

    /// Add `room` to the peer's rooms, refreshing its info.
    fn record_peer(&mut self, info: PeerInfo, room: RoomMembership) {
        match self.peers.get_mut(&info.id) {
            Some(record) => {
                record.info = info;
                record.join(room);
            }
            None => {
                self.peers
                    .insert(info.id.clone(), PeerRecord::new(info, room));
            }
        }
    }

    /// The peer is gone once it has left its last room.
    fn leave_room(&mut self, peer_id: &PeerId, room: &RoomMembership) {
        let Some(record) = self.peers.get_mut(peer_id) else {
            return;
        };
        if !record.rooms.contains(room) {
            debug!(peer = %peer_id, room = %room.room_id, "left a room it was not seen in");
            return;
        }
        record.leave(room);
        if record.rooms.is_empty() {
            debug!(peer = %peer_id, room = %room.room_id, "peer left its last room");
            self.remove_peer(peer_id);
        } else {
            debug!(peer = %peer_id, room = %room.room_id, rooms = record.rooms.len(), "peer left a room");
        }
    }

    fn snapshot(&self) -> Vec<PeerEntry> {
        self.peers.values().filter_map(PeerRecord::entry).collect()
    }

    fn remove_peer(&mut self, peer_id: &PeerId) {
        if let Some(session) = self.sessions.remove(peer_id) {
            session.close();
        }
        if self.peers.remove(peer_id).is_some() {
            self.emit(MultiplexerEvent::PeerLeft(peer_id.clone()));
        }
    }

    fn join_secret_rooms(&self) {
        if self.connected && !self.room_secrets.is_empty() {
            self.relay(SignalingCommand::RoomSecrets(self.room_secrets.clone()));
        }
    }

    fn disconnect(&mut self) {
        info!(sessions = self.sessions.len(), "disconnecting");
        for (_, session) in self.sessions.drain() {
            session.close();
        }
        self.peers.clear();
        self.relay(SignalingCommand::Disconnect);
        self.connected = false;
    }

    fn relay(&self, command: SignalingCommand) {
        if self.signaling.send(command).is_err() {
            debug!("relay connection gone, dropping command");
        }
    }

    fn emit(&self, event: MultiplexerEvent) {
        let _ = self.events.send(event);
    }
}

/// A peer and every room it is currently seen in.
struct PeerRecord {
    info: PeerInfo,
    rooms: Vec<RoomMembership>,
    /// Room its last relayed signal came through.
    last_signal: Option<RoomMembership>,
}

impl PeerRecord {
    fn new(info: PeerInfo, room: RoomMembership) -> Self {
        Self {
            info,
            rooms: vec![room],
            last_signal: None,
        }
    }

    fn join(&mut self, room: RoomMembership) {
        if !self.rooms.contains(&room) {
            self.rooms.push(room);
        }
    }

    fn leave(&mut self, room: &RoomMembership) {
        self.rooms.retain(|r| r != room);
        if self.last_signal.as_ref() == Some(room) {
            self.last_signal = None;
        }
    }

    /// The room the peer last signalled through, else its first secret room,
    /// else the room it was first seen in.
    fn preferred_room(&self) -> Option<&RoomMembership> {
        self.last_signal
            .as_ref()
            .or_else(|| self.rooms.iter().find(|r| r.room_secret().is_some()))
            .or_else(|| self.rooms.first())
    }

    fn room_secret(&self) -> Option<&str> {
        self.preferred_room()
            .and_then(RoomMembership::room_secret)
            .or_else(|| self.rooms.iter().find_map(RoomMembership::room_secret))
    }

    fn entry(&self) -> Option<PeerEntry> {
        Some(PeerEntry {
            info: self.info.clone(),
            room: self.preferred_room()?.clone(),
            rooms: self.rooms.clone(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MultiplexerError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("multiplexer stopped")]
    Closed,
}
