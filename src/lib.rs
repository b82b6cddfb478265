//! Peer-to-peer, chunk-sharded, multi-version datastore for collaborating
//! agents.
//!
//! Tables are split into chunks, the unit of replication, locking and
//! consistency. Every record version carries a timestamp from a shared
//! logical clock; reads are time-qualified and writes go through
//! multi-chunk transactions with optimistic concurrency control. Chunks
//! replicate either through a distributed read-write lock (legacy mode) or
//! through a per-chunk consensus log (fault-tolerant mode).
//!
//! Module hierarchy follows dependency order:
//! - core: time, identity, revisions, history containers
//! - net: framing, wire schemas, the messaging hub, discovery
//! - chunk: the distributed lock, legacy and consensus chunks
//! - table: chunk tables and the per-process manager
//! - txn: workspaces, transactions, caches
//! - archive: per-table persistence
//! - config / telemetry / process: ambient wiring

#![forbid(unsafe_code)]

pub mod archive;
pub mod chunk;
pub mod config;
pub mod core;
pub mod net;
pub mod process;
pub mod table;
pub mod telemetry;
pub mod txn;

pub use crate::archive::TableArchive;
pub use crate::chunk::{Chunk, ConsensusChunk, LegacyChunk, PeerTimeoutPolicy, RaftState};
pub use crate::config::{Config, DiscoveryMode};
pub use crate::core::{
    ChunkData, ChunkId, CoreError, FieldType, Id, ItemId, LogicalClock, LogicalTime, PeerId,
    Revision, RevisionHandle, TrackeeMap, Value,
};
pub use crate::net::{Discovery, Hub, LocalHub, LocalNetwork, Message, NetError, Payload};
pub use crate::process::Core;
pub use crate::table::{disjoint_fields_policy, NetTable, NetTableManager, TableDescriptor};
pub use crate::txn::{
    ConflictMap, Conflicts, ParallelCommit, RevisionCodec, Transaction, TransactionCache,
    Workspace,
};
