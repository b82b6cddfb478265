//! Inter-peer plumbing: framing, wire schemas, the messaging hub and peer
//! discovery.

pub mod discovery;
pub mod frame;
pub mod hub;
pub mod proto;

pub use discovery::{Discovery, FileDiscovery, ServerDiscovery};
pub use frame::{encode_frame, read_frame, write_frame, FrameError};
pub use hub::{Hub, LocalHub, LocalNetwork, MessageHandler, NetError};
pub use proto::{
    decode_message, encode_message, AppendEntries, AppendStatus, ChunkInit, ChunkRef, LogEntry,
    LogEntryKind, Message, MultiChunkInfo, Payload, ProtoError, RaftInit, TxnQueryAction,
};
