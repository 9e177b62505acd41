//! PeerDrop transfer engine.
//! Sessions and the multiplexer are actors; sockets, relay and disk are
//! supplied by the host through the `Connector`, signaling channels and
//! `Storage`.

pub mod chunk;
pub mod config;
pub mod connection;
pub mod event;
pub mod loopback;
pub mod multiplexer;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod storage;
pub mod transfer;
pub mod wire;

pub use chunk::{Chunker, ChunkerEvent, Digester, ReceivedFile};
pub use config::Config;
pub use connection::{ConnectionError, ConnectionEvent, ConnectionState, Connector, PeerConnection};
pub use event::{Direction, MultiplexerEvent, PeerEntry, Progress, SessionEvent};
pub use loopback::LoopbackNetwork;
pub use multiplexer::{Multiplexer, MultiplexerError};
pub use protocol::{ChannelMessage, FileDescriptor, Message, TransferRequest, CHUNK_SIZE, PARTITION_SIZE};
pub use session::{SessionError, SessionHandle};
pub use signaling::{PeerId, PeerInfo, RoomMembership, RoomType, Signal, SignalingCommand, SignalingEvent};
pub use storage::{MemoryStorage, Storage, StorageError};
pub use transfer::{OutgoingFile, TransferEngine, TransferError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
