//! Chunks: the unit of replication, locking and peer membership.
//!
//! Two implementations behind one interface: the legacy distributed-RW-lock
//! chunk and the consensus (raft) chunk. `use_raft` in the configuration
//! selects which one a table creates.

pub mod legacy;
pub mod lock;
pub mod raft;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::container::{ChunkData, RevisionMap};
use crate::core::identity::{ChunkId, ItemId, PeerId};
use crate::core::revision::{Revision, RevisionHandle};
use crate::core::time::LogicalTime;

pub use legacy::{LegacyChunk, TriggerFn};
pub use lock::{DistributedRwLock, LockState, WriteAttempt};
pub use raft::{ConsensusChunk, RaftState};

/// What a legacy chunk does when a swarm peer stops answering while the
/// distributed lock is in play. Aborting matches the historical behavior;
/// dropping the peer trades consistency guarantees for liveness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerTimeoutPolicy {
    #[default]
    Abort,
    DropPeer,
}

/// A locally held chunk, either implementation.
#[derive(Clone)]
pub enum Chunk {
    Legacy(Arc<LegacyChunk>),
    Consensus(Arc<ConsensusChunk>),
}

impl Chunk {
    pub fn id(&self) -> ChunkId {
        match self {
            Chunk::Legacy(chunk) => chunk.id(),
            Chunk::Consensus(chunk) => chunk.id(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Chunk::Legacy(chunk) => chunk.table(),
            Chunk::Consensus(chunk) => chunk.table(),
        }
    }

    pub fn template(&self) -> &Revision {
        match self {
            Chunk::Legacy(chunk) => chunk.template(),
            Chunk::Consensus(chunk) => chunk.template(),
        }
    }

    pub fn write_lock(&self) {
        match self {
            Chunk::Legacy(chunk) => chunk.write_lock(),
            Chunk::Consensus(chunk) => chunk.write_lock(),
        }
    }

    pub fn read_lock(&self) {
        match self {
            Chunk::Legacy(chunk) => chunk.read_lock(),
            Chunk::Consensus(chunk) => chunk.read_lock(),
        }
    }

    pub fn is_write_locked(&self) -> bool {
        match self {
            Chunk::Legacy(chunk) => chunk.is_write_locked(),
            Chunk::Consensus(chunk) => chunk.is_write_locked(),
        }
    }

    pub fn unlock(&self) {
        match self {
            Chunk::Legacy(chunk) => chunk.unlock(),
            Chunk::Consensus(chunk) => chunk.unlock(),
        }
    }

    /// Transfer the held write lock to the calling thread; the write phase
    /// of a parallel commit runs on a background thread.
    pub fn adopt_write_lock(&self) {
        match self {
            Chunk::Legacy(chunk) => chunk.adopt_write_lock(),
            Chunk::Consensus(chunk) => chunk.adopt_write_lock(),
        }
    }

    /// Release after a failed commit check: queued consensus writes are
    /// discarded. Legacy chunks replicate eagerly, so there is nothing to
    /// discard.
    pub fn unlock_discard(&self) {
        match self {
            Chunk::Legacy(chunk) => chunk.unlock(),
            Chunk::Consensus(chunk) => chunk.unlock_discard(),
        }
    }

    pub fn insert(&self, time: LogicalTime, revision: Revision) {
        match self {
            Chunk::Legacy(chunk) => chunk.insert(time, revision),
            Chunk::Consensus(chunk) => chunk.insert(time, revision),
        }
    }

    pub fn bulk_insert_locked(&self, items: BTreeMap<ItemId, Revision>, time: LogicalTime) {
        match self {
            Chunk::Legacy(chunk) => chunk.bulk_insert_locked(items, time),
            Chunk::Consensus(chunk) => chunk.bulk_insert_locked(items, time),
        }
    }

    pub fn update_locked(&self, time: LogicalTime, revision: Revision) {
        match self {
            Chunk::Legacy(chunk) => chunk.update_locked(time, revision),
            Chunk::Consensus(chunk) => chunk.update_locked(time, revision),
        }
    }

    pub fn remove_locked(&self, time: LogicalTime, revision: Revision) {
        match self {
            Chunk::Legacy(chunk) => chunk.remove_locked(time, revision),
            Chunk::Consensus(chunk) => chunk.remove_locked(time, revision),
        }
    }

    pub fn dump(&self, time: LogicalTime) -> RevisionMap {
        match self {
            Chunk::Legacy(chunk) => chunk.dump(time),
            Chunk::Consensus(chunk) => chunk.dump(time),
        }
    }

    pub fn get_by_id(&self, id: &ItemId, time: LogicalTime) -> Option<RevisionHandle> {
        match self {
            Chunk::Legacy(chunk) => chunk.get_by_id(id, time),
            Chunk::Consensus(chunk) => chunk.get_by_id(id, time),
        }
    }

    pub fn num_items(&self, time: LogicalTime) -> usize {
        match self {
            Chunk::Legacy(chunk) => chunk.num_items(time),
            Chunk::Consensus(chunk) => chunk.num_items(time),
        }
    }

    pub fn update_times(&self) -> BTreeMap<ItemId, LogicalTime> {
        match self {
            Chunk::Legacy(chunk) => chunk.update_times(),
            Chunk::Consensus(chunk) => chunk.update_times(),
        }
    }

    pub fn with_data<R>(&self, action: impl FnOnce(&dyn ChunkData) -> R) -> R {
        match self {
            Chunk::Legacy(chunk) => chunk.with_data(action),
            Chunk::Consensus(chunk) => chunk.node().with_data(action),
        }
    }

    pub fn peer_size(&self) -> usize {
        match self {
            Chunk::Legacy(chunk) => chunk.peer_size(),
            Chunk::Consensus(chunk) => chunk.peer_size(),
        }
    }

    pub fn attach_trigger(&self, trigger: TriggerFn) {
        match self {
            Chunk::Legacy(chunk) => chunk.attach_trigger(trigger),
            Chunk::Consensus(chunk) => chunk.attach_trigger(trigger),
        }
    }

    pub fn request_participation(&self) -> usize {
        match self {
            Chunk::Legacy(chunk) => chunk.request_participation(),
            Chunk::Consensus(chunk) => chunk.request_participation(),
        }
    }

    pub fn request_participation_from(&self, peer: &PeerId) -> bool {
        match self {
            Chunk::Legacy(chunk) => chunk.request_participation_from(peer),
            Chunk::Consensus(chunk) => chunk.request_participation_from(peer),
        }
    }

    pub fn leave(&self) {
        match self {
            Chunk::Legacy(chunk) => chunk.leave(),
            Chunk::Consensus(chunk) => chunk.leave(),
        }
    }

    /// Archive-reload path: install a revision with its stored timestamps.
    pub fn restore_local(&self, revision: Revision) {
        match self {
            Chunk::Legacy(chunk) => chunk.restore_local(revision),
            Chunk::Consensus(chunk) => chunk.node().restore_local(revision),
        }
    }

    pub fn as_legacy(&self) -> Option<&Arc<LegacyChunk>> {
        match self {
            Chunk::Legacy(chunk) => Some(chunk),
            Chunk::Consensus(_) => None,
        }
    }

    pub fn as_consensus(&self) -> Option<&Arc<ConsensusChunk>> {
        match self {
            Chunk::Legacy(_) => None,
            Chunk::Consensus(chunk) => Some(chunk),
        }
    }
}
