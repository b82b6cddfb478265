//! Core domain types.
//!
//! Module hierarchy follows type dependency order:
//! - time: logical clock primitives
//! - identity: Id, ChunkId, ItemId, PeerId
//! - revision: versioned records and their wire codec
//! - container: per-chunk history store (RAM backend)
//! - block_store: per-chunk history store (disk overflow backend)
//! - error: core capability errors

pub mod block_store;
pub mod container;
pub mod error;
pub mod identity;
pub mod revision;
pub mod time;

pub use block_store::BlockChunkData;
pub use container::{ChunkData, History, HistoryMap, RamChunkData, RevisionMap};
pub use error::{CoreError, InvalidState, StructureMismatch, TypeMismatch};
pub use identity::{ChunkId, Id, InvalidId, ItemId, PeerId};
pub use revision::{
    decode_revision, encode_revision, FieldType, Revision, RevisionDecodeError, RevisionHandle,
    TrackeeMap, Value,
};
pub use time::{LogicalClock, LogicalTime};
