//! Peer Session: one actor per remote peer owning its connection, pending
//! candidates, timers and transfer engine. Callers talk to it through a
//! cloneable `SessionHandle`.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionEvents, ConnectionState, Connector,
    PeerConnection,
};
use crate::event::{SessionEnvelope, SessionEvent};
use crate::signaling::{IceCandidate, PeerId, SdpType, Signal};
use crate::transfer::{Action, OutgoingFile, TransferEngine, TransferError};

enum Command {
    Connect(oneshot::Sender<Result<(), SessionError>>),
    Signal(Signal),
    SendFiles(
        Vec<OutgoingFile>,
        oneshot::Sender<Result<(), TransferError>>,
    ),
    Accept,
    Reject(Option<String>),
    Cancel,
    Close,
}

#[derive(Clone)]
pub struct SessionHandle {
    peer_id: PeerId,
    session_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    /// Start the session actor. Events go to `events`, tagged with a fresh
    /// session id.
    pub fn spawn(
        peer_id: PeerId,
        config: Config,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<SessionEnvelope>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let actor = SessionActor {
            peer_id: peer_id.clone(),
            session_id,
            engine: TransferEngine::new(config.clone()),
            config,
            connector,
            connection: None,
            conn_events: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            state: state_tx,
            events,
            batch_reply: None,
            response_deadline: None,
            drain_deadline: None,
        };
        tokio::spawn(actor.run(commands_rx));
        Self {
            peer_id,
            session_id,
            commands: commands_tx,
            state: state_rx,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Initiator only: open the connection and emit an offer.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Connect(tx))?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Apply an offer, answer or candidate relayed from the peer.
    pub fn handle_signal(&self, signal: Signal) -> Result<(), SessionError> {
        self.command(Command::Signal(signal))
    }

    /// Send one batch and wait until the peer confirmed every file.
    pub async fn send_files(&self, files: Vec<OutgoingFile>) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::SendFiles(files, tx))?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    pub fn accept_transfer(&self) -> Result<(), SessionError> {
        self.command(Command::Accept)
    }

    pub fn reject_transfer(&self, reason: Option<String>) -> Result<(), SessionError> {
        self.command(Command::Reject(reason))
    }

    pub fn cancel_transfer(&self) -> Result<(), SessionError> {
        self.command(Command::Cancel)
    }

    /// True only while the data channel is open.
    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Resolve once the channel is open; fails if it closes or `timeout` passes first.
    pub async fn wait_until_open(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        let opened = tokio::time::timeout(
            timeout,
            state.wait_for(|s| matches!(s, ConnectionState::Open | ConnectionState::Closed)),
        )
        .await
        .map_err(|_| SessionError::OpenTimeout(timeout))?
        .map(|s| *s == ConnectionState::Open)
        .map_err(|_| SessionError::Closed)?;
        if opened {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }

    /// Cancel any transfer, close the connection and stop the actor.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed)
    }
}

enum Wake {
    Command(Option<Command>),
    Connection(Option<ConnectionEvent>),
    ResponseTimeout,
    DrainTick,
}

struct SessionActor {
    peer_id: PeerId,
    session_id: Uuid,
    config: Config,
    connector: Arc<dyn Connector>,
    connection: Option<Box<dyn PeerConnection>>,
    conn_events: Option<ConnectionEvents>,
    remote_description_set: bool,
    /// Candidates that arrived before the remote description.
    pending_candidates: Vec<IceCandidate>,
    engine: TransferEngine,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<SessionEnvelope>,
    batch_reply: Option<oneshot::Sender<Result<(), TransferError>>>,
    response_deadline: Option<Instant>,
    drain_deadline: Option<Instant>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!(peer = %self.peer_id, session = %self.session_id, "session started");
        loop {
            let wake = tokio::select! {
                cmd = commands.recv() => Wake::Command(cmd),
                ev = next_event(&mut self.conn_events) => Wake::Connection(ev),
                _ = sleep_until(self.response_deadline) => Wake::ResponseTimeout,
                _ = sleep_until(self.drain_deadline) => Wake::DrainTick,
            };
            let flow = match wake {
                Wake::Command(Some(cmd)) => self.on_command(cmd).await,
                Wake::Command(None) => ControlFlow::Break(()),
                Wake::Connection(Some(ev)) => self.on_connection_event(ev),
                Wake::Connection(None) => self.on_channel_closed(),
                Wake::ResponseTimeout => {
                    self.response_deadline = None;
                    let actions = self.engine.response_timed_out();
                    self.execute(actions)
                }
                Wake::DrainTick => {
                    self.drain_deadline = None;
                    let actions = self.engine.on_drain_tick(self.buffered_amount());
                    self.execute(actions)
                }
            };
            if flow.is_break() {
                break;
            }
        }
        self.shutdown();
        debug!(peer = %self.peer_id, session = %self.session_id, "session ended");
    }

    async fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect(reply) => {
                if self.connection.is_some() {
                    let _ = reply.send(Err(SessionError::AlreadyConnected));
                    return ControlFlow::Continue(());
                }
                match self.connect().await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                        ControlFlow::Continue(())
                    }
                    Err(e) => {
                        let flow = self.fail(&e.to_string());
                        let _ = reply.send(Err(e.into()));
                        flow
                    }
                }
            }
            Command::Signal(signal) => match self.handle_signal(signal).await {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => self.fail(&format!("signal handling failed: {e}")),
            },
            Command::SendFiles(files, reply) => {
                if *self.state.borrow() != ConnectionState::Open {
                    let _ = reply.send(Err(TransferError::ChannelNotOpen));
                    return ControlFlow::Continue(());
                }
                match self.engine.start_batch(files) {
                    Ok(actions) => {
                        self.batch_reply = Some(reply);
                        self.execute(actions)
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        ControlFlow::Continue(())
                    }
                }
            }
            Command::Accept => {
                let actions = self.engine.accept();
                self.execute(actions)
            }
            Command::Reject(reason) => {
                let actions = self.engine.reject(reason);
                self.execute(actions)
            }
            Command::Cancel => {
                let actions = self.engine.cancel();
                self.execute(actions)
            }
            Command::Close => ControlFlow::Break(()),
        }
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        let conn = self.open_connection()?;
        let offer = conn.create_offer().await?;
        info!(peer = %self.peer_id, "offering connection");
        self.emit(SessionEvent::Signal(Signal::Description { sdp: offer }));
        Ok(())
    }

    fn open_connection(&mut self) -> Result<&mut Box<dyn PeerConnection>, ConnectionError> {
        if self.connection.is_none() {
            let (conn, events) = self.connector.open(&self.peer_id)?;
            self.connection = Some(conn);
            self.conn_events = Some(events);
            self.set_state(ConnectionState::Negotiating);
        }
        self.connection.as_mut().ok_or(ConnectionError::Closed)
    }

    async fn handle_signal(&mut self, signal: Signal) -> Result<(), ConnectionError> {
        match signal {
            Signal::Description { sdp } => {
                match sdp.sdp_type {
                    SdpType::Offer => {
                        let conn = self.open_connection()?;
                        let answer = conn.accept_offer(sdp).await?;
                        debug!(peer = %self.peer_id, "answering offer");
                        self.emit(SessionEvent::Signal(Signal::Description { sdp: answer }));
                    }
                    SdpType::Answer => {
                        let conn = self
                            .connection
                            .as_mut()
                            .ok_or_else(|| ConnectionError::Negotiation("answer without offer".into()))?;
                        conn.accept_answer(sdp).await?;
                    }
                }
                self.remote_description_set = true;
                for candidate in std::mem::take(&mut self.pending_candidates) {
                    self.add_candidate(candidate).await?;
                }
            }
            Signal::Candidate { ice } => {
                if self.remote_description_set {
                    self.add_candidate(ice).await?;
                } else {
                    self.pending_candidates.push(ice);
                }
            }
        }
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let conn = self.connection.as_mut().ok_or(ConnectionError::Closed)?;
        conn.add_candidate(candidate).await
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) -> ControlFlow<()> {
        match event {
            ConnectionEvent::LocalCandidate(ice) => {
                self.emit(SessionEvent::Signal(Signal::Candidate { ice }));
                ControlFlow::Continue(())
            }
            ConnectionEvent::ChannelOpen => {
                info!(peer = %self.peer_id, "data channel open");
                self.set_state(ConnectionState::Open);
                self.emit(SessionEvent::ChannelOpen);
                ControlFlow::Continue(())
            }
            ConnectionEvent::Message(message) => {
                let actions = self.engine.on_message(message, self.buffered_amount());
                self.execute(actions)
            }
            ConnectionEvent::ChannelClosed => self.on_channel_closed(),
            ConnectionEvent::Failed(reason) => self.fail(&reason),
        }
    }

    fn on_channel_closed(&mut self) -> ControlFlow<()> {
        info!(peer = %self.peer_id, "data channel closed");
        let actions = self.engine.fail("channel closed");
        let _ = self.apply(actions);
        self.drop_connection();
        self.emit(SessionEvent::ChannelClosed);
        ControlFlow::Break(())
    }

    /// Terminal failure: exactly one error event, then the session stops.
    fn fail(&mut self, reason: &str) -> ControlFlow<()> {
        warn!(peer = %self.peer_id, reason, "session failed");
        let actions = self.engine.fail(reason);
        let reported = actions
            .iter()
            .any(|a| matches!(a, Action::Emit(SessionEvent::Error(_))));
        let _ = self.apply(actions);
        if !reported {
            self.emit(SessionEvent::Error(reason.to_string()));
        }
        self.drop_connection();
        ControlFlow::Break(())
    }

    /// Run engine actions; a failed send fails the session.
    fn execute(&mut self, actions: Vec<Action>) -> ControlFlow<()> {
        match self.apply(actions) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => self.fail(&format!("send failed: {e}")),
        }
    }

    fn apply(&mut self, actions: Vec<Action>) -> Result<(), ConnectionError> {
        for action in actions {
            match action {
                Action::Send(message) => {
                    let conn = self.connection.as_mut().ok_or(ConnectionError::NotOpen)?;
                    conn.send(message)?;
                }
                Action::Emit(event) => self.emit(event),
                Action::StartResponseTimer => {
                    self.response_deadline = Some(Instant::now() + self.config.response_timeout);
                }
                Action::StopResponseTimer => self.response_deadline = None,
                Action::PollDrain => {
                    self.drain_deadline = Some(Instant::now() + self.config.drain_poll_interval);
                }
                Action::BatchFinished(result) => {
                    self.drain_deadline = None;
                    if let Some(reply) = self.batch_reply.take() {
                        let _ = reply.send(result);
                    }
                }
            }
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.connection
            .as_ref()
            .map(|c| c.buffered_amount())
            .unwrap_or(0)
    }

    fn shutdown(&mut self) {
        let actions = self.engine.cancel();
        if let Err(e) = self.apply(actions) {
            debug!(peer = %self.peer_id, error = %e, "could not notify peer of cancel");
        }
        if let Some(reply) = self.batch_reply.take() {
            let _ = reply.send(Err(TransferError::SessionClosed));
        }
        self.drop_connection();
    }

    fn drop_connection(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
        self.conn_events = None;
        self.response_deadline = None;
        self.drain_deadline = None;
        self.set_state(ConnectionState::Closed);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(SessionEnvelope {
            peer_id: self.peer_id.clone(),
            session_id: self.session_id,
            event,
        });
    }
}

async fn next_event(events: &mut Option<ConnectionEvents>) -> Option<ConnectionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session already has a connection")]
    AlreadyConnected,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("data channel did not open within {0:?}")]
    OpenTimeout(Duration),
    #[error("session closed")]
    Closed,
}
