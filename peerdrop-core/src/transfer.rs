//! Transfer state machine for one peer. Sans-IO: the session feeds it channel
//! messages, local decisions and timer expiries, and executes the returned
//! actions.
//!
//! One outbound and one inbound batch may be in flight at a time. The sender
//! streams each file in partitions and pauses at every boundary until the
//! receiver acknowledges that exact offset.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::chunk::{Chunker, ChunkerEvent, DigestProgress, Digester, Unchunked};
use crate::config::Config;
use crate::event::{Direction, Progress, SessionEvent};
use crate::protocol::{ChannelMessage, FileDescriptor, Message, TransferRequest};

/// Reason relayed when a request arrives while another inbound batch is active.
pub const BUSY_REASON: &str = "busy";

/// Reason surfaced when the peer never answered a request.
pub const TIMEOUT_REASON: &str = "timeout";

/// A file queued for sending, already read into memory.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub descriptor: FileDescriptor,
    pub data: Bytes,
}

/// What the session must do after feeding an input to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(ChannelMessage),
    Emit(SessionEvent),
    StartResponseTimer,
    StopResponseTimer,
    /// Check the channel's buffered amount again after the poll interval.
    PollDrain,
    /// The outbound batch ended; resolves the pending `send_files` call.
    BatchFinished(Result<(), TransferError>),
}

enum Outgoing {
    Idle,
    AwaitingResponse {
        queue: VecDeque<OutgoingFile>,
        total_size: u64,
    },
    Sending(SendState),
}

struct SendState {
    descriptor: FileDescriptor,
    chunker: Chunker,
    phase: SendPhase,
    queue: VecDeque<OutgoingFile>,
    total_size: u64,
    /// Bytes of files the receiver already confirmed.
    bytes_before: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    Streaming,
    AwaitingAck { offset: u64 },
    AwaitingDrain,
    AwaitingFileComplete,
}

enum Incoming {
    Idle,
    RequestPending(TransferRequest),
    Accepted(ReceiveState),
    Receiving {
        digester: Digester,
        batch: ReceiveState,
    },
}

struct ReceiveState {
    /// Announced files whose header has not arrived yet.
    pending: VecDeque<FileDescriptor>,
    total_size: u64,
    /// Bytes of files already completed in this batch.
    bytes_received: u64,
}

pub struct TransferEngine {
    config: Config,
    outgoing: Outgoing,
    incoming: Incoming,
    last_reported_progress: f64,
}

impl TransferEngine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            outgoing: Outgoing::Idle,
            incoming: Incoming::Idle,
            last_reported_progress: 0.0,
        }
    }

    pub fn is_sending(&self) -> bool {
        !matches!(self.outgoing, Outgoing::Idle)
    }

    pub fn is_receiving(&self) -> bool {
        !matches!(self.incoming, Incoming::Idle)
    }

    pub fn has_pending_request(&self) -> bool {
        matches!(self.incoming, Incoming::RequestPending(_))
    }

    /// Send the batch header and wait for the peer's decision.
    pub fn start_batch(&mut self, files: Vec<OutgoingFile>) -> Result<Vec<Action>, TransferError> {
        if files.is_empty() {
            return Err(TransferError::EmptyBatch);
        }
        if self.is_sending() {
            return Err(TransferError::Busy);
        }
        let request = TransferRequest::new(files.iter().map(|f| f.descriptor.clone()).collect());
        info!(
            files = files.len(),
            total_size = request.total_size,
            "requesting transfer"
        );
        let mut actions = Vec::new();
        self.outgoing = Outgoing::AwaitingResponse {
            queue: files.into(),
            total_size: request.total_size,
        };
        send_control(&mut actions, Message::Request(request));
        actions.push(Action::StartResponseTimer);
        Ok(actions)
    }

    /// Feed one message from the data channel. `buffered` is the channel's
    /// current buffered amount.
    pub fn on_message(&mut self, message: ChannelMessage, buffered: usize) -> Vec<Action> {
        let mut actions = Vec::new();
        match message {
            ChannelMessage::Binary(chunk) => self.on_chunk(chunk, &mut actions),
            ChannelMessage::Text(text) => match Message::parse(&text) {
                Ok(msg) => self.on_control(msg, buffered, &mut actions),
                Err(e) => warn!(error = %e, "dropping malformed control message"),
            },
        }
        actions
    }

    /// Accept the pending inbound request. No-op when none is pending.
    pub fn accept(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let request = match std::mem::replace(&mut self.incoming, Incoming::Idle) {
            Incoming::RequestPending(request) => request,
            other => {
                self.incoming = other;
                debug!("accept without a pending request");
                return actions;
            }
        };
        info!(files = request.header.len(), "accepting transfer");
        self.last_reported_progress = 0.0;
        self.incoming = Incoming::Accepted(ReceiveState {
            pending: request.header.into(),
            total_size: request.total_size,
            bytes_received: 0,
        });
        send_control(
            &mut actions,
            Message::FilesTransferResponse {
                accepted: true,
                reason: None,
            },
        );
        actions
    }

    /// Decline the pending inbound request. No-op when none is pending.
    pub fn reject(&mut self, reason: Option<String>) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.has_pending_request() {
            debug!("reject without a pending request");
            return actions;
        }
        info!(reason = ?reason, "rejecting transfer");
        self.incoming = Incoming::Idle;
        send_control(
            &mut actions,
            Message::FilesTransferResponse {
                accepted: false,
                reason,
            },
        );
        actions
    }

    /// Abort every active direction and tell the peer once. Idempotent.
    pub fn cancel(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.is_sending() && !self.is_receiving() {
            return actions;
        }
        info!("canceling transfer");
        send_control(&mut actions, Message::TransferCanceled);
        self.abort_outgoing(TransferError::Canceled, &mut actions);
        self.abort_incoming(&mut actions);
        actions
    }

    /// The accept/reject wait expired; counts as a rejection.
    pub fn response_timed_out(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if !matches!(self.outgoing, Outgoing::AwaitingResponse { .. }) {
            return actions;
        }
        warn!(timeout = ?self.config.response_timeout, "no response to transfer request");
        self.outgoing = Outgoing::Idle;
        send_control(&mut actions, Message::TransferCanceled);
        actions.push(Action::Emit(SessionEvent::TransferRejected {
            reason: Some(TIMEOUT_REASON.to_string()),
        }));
        actions.push(Action::BatchFinished(Err(TransferError::ResponseTimeout(
            self.config.response_timeout,
        ))));
        actions
    }

    /// Drain poll fired. Resumes streaming once the buffer is low enough.
    pub fn on_drain_tick(&mut self, buffered: usize) -> Vec<Action> {
        let mut actions = Vec::new();
        let Outgoing::Sending(state) = &mut self.outgoing else {
            return actions;
        };
        if state.phase != SendPhase::AwaitingDrain {
            return actions;
        }
        if buffered > self.config.buffered_low_water_mark {
            actions.push(Action::PollDrain);
            return actions;
        }
        state.phase = SendPhase::Streaming;
        state.pump(&self.config, buffered, &mut actions);
        actions
    }

    /// The connection failed or closed. Partial data is discarded.
    pub fn fail(&mut self, reason: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.is_sending() && !self.is_receiving() {
            return actions;
        }
        warn!(reason, "transfer interrupted");
        if matches!(self.outgoing, Outgoing::AwaitingResponse { .. }) {
            actions.push(Action::StopResponseTimer);
        }
        if self.is_sending() {
            actions.push(Action::BatchFinished(Err(TransferError::ConnectionLost(
                reason.to_string(),
            ))));
        }
        self.outgoing = Outgoing::Idle;
        self.incoming = Incoming::Idle;
        actions.push(Action::Emit(SessionEvent::Error(reason.to_string())));
        actions
    }

    fn on_control(&mut self, message: Message, buffered: usize, actions: &mut Vec<Action>) {
        match message {
            Message::Request(request) => self.on_request(request, actions),
            Message::Header(descriptor) => self.on_header(descriptor, actions),
            Message::Partition { offset } => {
                send_control(actions, Message::PartitionReceived { offset });
            }
            Message::PartitionReceived { offset } => {
                self.on_partition_received(offset, buffered, actions)
            }
            Message::FilesTransferResponse { accepted, reason } => {
                self.on_response(accepted, reason, buffered, actions)
            }
            Message::Progress { progress } => self.on_remote_progress(progress, actions),
            Message::FileTransferComplete => self.on_file_complete(buffered, actions),
            Message::TransferCanceled => {
                info!("peer canceled the transfer");
                self.abort_outgoing(TransferError::Canceled, actions);
                self.abort_incoming(actions);
            }
            Message::Text { text } => actions.push(Action::Emit(SessionEvent::TextReceived(text))),
            Message::DisplayNameChanged { display_name } => {
                actions.push(Action::Emit(SessionEvent::DisplayNameChanged(display_name)))
            }
            Message::DisplayNameRequest => debug!("ignoring display name request"),
            Message::Unrecognized => debug!("ignoring unrecognized control message"),
        }
    }

    fn on_request(&mut self, request: TransferRequest, actions: &mut Vec<Action>) {
        if self.is_receiving() {
            warn!("transfer request while another is active, rejecting");
            send_control(
                actions,
                Message::FilesTransferResponse {
                    accepted: false,
                    reason: Some(BUSY_REASON.to_string()),
                },
            );
            return;
        }
        info!(
            files = request.header.len(),
            total_size = request.total_size,
            "incoming transfer request"
        );
        self.incoming = Incoming::RequestPending(request.clone());
        actions.push(Action::Emit(SessionEvent::TransferRequest(request)));
    }

    fn on_header(&mut self, descriptor: FileDescriptor, actions: &mut Vec<Action>) {
        let mut batch = match std::mem::replace(&mut self.incoming, Incoming::Idle) {
            Incoming::Accepted(batch) => batch,
            other => {
                self.incoming = other;
                warn!(name = %descriptor.name, "header outside an accepted batch, ignoring");
                return;
            }
        };
        match batch.pending.pop_front() {
            Some(expected) if expected != descriptor => warn!(
                expected = %expected.name,
                got = %descriptor.name,
                "header does not match the announced file"
            ),
            None => warn!(name = %descriptor.name, "header beyond the announced files"),
            Some(_) => {}
        }
        debug!(name = %descriptor.name, size = descriptor.size, "receiving file");
        let empty = descriptor.size == 0;
        let digester = Digester::new(descriptor, batch.total_size, batch.bytes_received);
        self.incoming = Incoming::Receiving { digester, batch };
        if empty {
            self.on_chunk(Bytes::new(), actions);
        }
    }

    fn on_chunk(&mut self, chunk: Bytes, actions: &mut Vec<Action>) {
        let Incoming::Receiving { digester, batch } = &mut self.incoming else {
            warn!(len = chunk.len(), "chunk outside a file, dropping");
            return;
        };
        let name = digester.descriptor().name.clone();
        let total_size = batch.total_size;
        match digester.unchunk(chunk) {
            Ok(Unchunked::InProgress(progress)) => {
                self.report_progress(&name, progress, total_size, actions);
            }
            Ok(Unchunked::Complete { progress, file }) => {
                self.report_progress(&name, progress, total_size, actions);
                let Incoming::Receiving { mut batch, .. } =
                    std::mem::replace(&mut self.incoming, Incoming::Idle)
                else {
                    return;
                };
                batch.bytes_received += file.descriptor.size;
                debug!(name = %file.descriptor.name, "file received");
                send_control(actions, Message::FileTransferComplete);
                actions.push(Action::Emit(SessionEvent::FileReceived(file)));
                if batch.pending.is_empty() {
                    info!(bytes = batch.bytes_received, "incoming batch complete");
                    actions.push(Action::Emit(SessionEvent::TransferComplete(
                        Direction::Receive,
                    )));
                } else {
                    self.incoming = Incoming::Accepted(batch);
                }
            }
            Err(e) => {
                warn!(error = %e, name = %name, "aborting incoming batch");
                self.incoming = Incoming::Idle;
                send_control(actions, Message::TransferCanceled);
                actions.push(Action::Emit(SessionEvent::Error(e.to_string())));
            }
        }
    }

    fn report_progress(
        &mut self,
        file_name: &str,
        progress: DigestProgress,
        total_size: u64,
        actions: &mut Vec<Action>,
    ) {
        let total = progress.total_progress;
        let finished = total >= 1.0 && self.last_reported_progress < 1.0;
        if total - self.last_reported_progress < self.config.progress_step && !finished {
            return;
        }
        self.last_reported_progress = total;
        send_control(actions, Message::Progress { progress: total });
        actions.push(Action::Emit(SessionEvent::ReceiveProgress(Progress {
            file_name: file_name.to_string(),
            progress: total,
            bytes_transferred: (total * total_size as f64).round() as u64,
            total_bytes: total_size,
        })));
    }

    fn on_response(
        &mut self,
        accepted: bool,
        reason: Option<String>,
        buffered: usize,
        actions: &mut Vec<Action>,
    ) {
        let (queue, total_size) = match std::mem::replace(&mut self.outgoing, Outgoing::Idle) {
            Outgoing::AwaitingResponse { queue, total_size } => (queue, total_size),
            other => {
                self.outgoing = other;
                debug!("transfer response without a pending request");
                return;
            }
        };
        actions.push(Action::StopResponseTimer);
        if !accepted {
            info!(reason = ?reason, "peer rejected the transfer");
            actions.push(Action::Emit(SessionEvent::TransferRejected {
                reason: reason.clone(),
            }));
            actions.push(Action::BatchFinished(Err(TransferError::Rejected { reason })));
            return;
        }
        info!(files = queue.len(), "peer accepted the transfer");
        self.start_next_file(queue, total_size, 0, buffered, actions);
    }

    fn start_next_file(
        &mut self,
        mut queue: VecDeque<OutgoingFile>,
        total_size: u64,
        bytes_before: u64,
        buffered: usize,
        actions: &mut Vec<Action>,
    ) {
        let Some(file) = queue.pop_front() else {
            info!(total_size, "outgoing batch complete");
            self.outgoing = Outgoing::Idle;
            actions.push(Action::Emit(SessionEvent::TransferComplete(Direction::Send)));
            actions.push(Action::BatchFinished(Ok(())));
            return;
        };
        debug!(name = %file.descriptor.name, size = file.descriptor.size, "sending file");
        send_control(actions, Message::Header(file.descriptor.clone()));
        let mut state = SendState {
            chunker: Chunker::with_sizes(
                file.data,
                self.config.chunk_size,
                self.config.partition_size,
            ),
            descriptor: file.descriptor,
            phase: SendPhase::Streaming,
            queue,
            total_size,
            bytes_before,
        };
        state.pump(&self.config, buffered, actions);
        self.outgoing = Outgoing::Sending(state);
    }

    fn on_partition_received(&mut self, offset: u64, buffered: usize, actions: &mut Vec<Action>) {
        let Outgoing::Sending(state) = &mut self.outgoing else {
            debug!(offset, "partition ack while not sending");
            return;
        };
        match state.phase {
            SendPhase::AwaitingAck { offset: expected } if expected == offset => {
                state.chunker.resume();
                state.phase = SendPhase::Streaming;
                state.pump(&self.config, buffered, actions);
            }
            phase => warn!(offset, ?phase, "unexpected partition ack"),
        }
    }

    fn on_file_complete(&mut self, buffered: usize, actions: &mut Vec<Action>) {
        let state = match std::mem::replace(&mut self.outgoing, Outgoing::Idle) {
            Outgoing::Sending(state) if state.chunker.offset() == state.chunker.len() => state,
            other => {
                self.outgoing = other;
                warn!("file completion before the file was sent");
                return;
            }
        };
        let bytes_before = state.bytes_before + state.descriptor.size;
        self.start_next_file(state.queue, state.total_size, bytes_before, buffered, actions);
    }

    fn on_remote_progress(&mut self, progress: f64, actions: &mut Vec<Action>) {
        let Outgoing::Sending(state) = &self.outgoing else {
            return;
        };
        let progress = progress.clamp(0.0, 1.0);
        actions.push(Action::Emit(SessionEvent::SendProgress(Progress {
            file_name: state.descriptor.name.clone(),
            progress,
            bytes_transferred: (progress * state.total_size as f64).round() as u64,
            total_bytes: state.total_size,
        })));
    }

    fn abort_outgoing(&mut self, error: TransferError, actions: &mut Vec<Action>) {
        match std::mem::replace(&mut self.outgoing, Outgoing::Idle) {
            Outgoing::Idle => return,
            Outgoing::AwaitingResponse { .. } => actions.push(Action::StopResponseTimer),
            Outgoing::Sending(_) => {}
        }
        actions.push(Action::Emit(SessionEvent::TransferCanceled(Direction::Send)));
        actions.push(Action::BatchFinished(Err(error)));
    }

    fn abort_incoming(&mut self, actions: &mut Vec<Action>) {
        if matches!(
            std::mem::replace(&mut self.incoming, Incoming::Idle),
            Incoming::Idle
        ) {
            return;
        }
        actions.push(Action::Emit(SessionEvent::TransferCanceled(
            Direction::Receive,
        )));
    }
}

impl SendState {
    /// Queue chunks until a partition boundary, the end of the file, or a
    /// full channel buffer.
    fn pump(&mut self, config: &Config, mut buffered: usize, actions: &mut Vec<Action>) {
        while self.phase == SendPhase::Streaming {
            if buffered > config.max_buffered_amount {
                self.phase = SendPhase::AwaitingDrain;
                actions.push(Action::PollDrain);
                return;
            }
            match self.chunker.next_event() {
                Some(ChunkerEvent::Chunk(chunk)) => {
                    buffered += chunk.len();
                    actions.push(Action::Send(ChannelMessage::Binary(chunk)));
                }
                Some(ChunkerEvent::PartitionEnd { offset }) => {
                    send_control(actions, Message::Partition { offset });
                    self.phase = SendPhase::AwaitingAck { offset };
                }
                Some(ChunkerEvent::FileEnd { .. }) => {
                    self.phase = SendPhase::AwaitingFileComplete;
                }
                None => return,
            }
        }
    }
}

fn send_control(actions: &mut Vec<Action>, message: Message) {
    match ChannelMessage::control(&message) {
        Ok(frame) => actions.push(Action::Send(frame)),
        Err(e) => warn!(error = %e, "failed to encode control message"),
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransferError {
    #[error("peer rejected the transfer: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Rejected { reason: Option<String> },
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),
    #[error("transfer canceled")]
    Canceled,
    #[error("an outbound transfer is already in progress")]
    Busy,
    #[error("no files to send")]
    EmptyBatch,
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("session closed")]
    SessionClosed,
}
