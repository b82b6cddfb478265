//! Net table: the distributed table of chunks.
//!
//! Wraps the locally held chunks with a peer-lookup index, listener
//! push-out, acquisition callbacks, per-table auto-merge policies and
//! new-chunk trackers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Sender};

use crate::chunk::{Chunk, ConsensusChunk, LegacyChunk, PeerTimeoutPolicy};
use crate::core::container::RevisionMap;
use crate::core::identity::{ChunkId, ItemId, PeerId};
use crate::core::revision::Revision;
use crate::core::time::{LogicalClock, LogicalTime};
use crate::net::hub::Hub;
use crate::net::proto::{ChunkInit, ChunkRef, Payload};

use super::template::TableDescriptor;

const CHUNK_FETCH_LIMIT: Duration = Duration::from_secs(10);

/// Application conflict resolver: `(conflicting_new, original, local)`.
/// Returns whether the conflict was absorbed into `local`.
pub type AutoMergePolicy =
    Arc<dyn Fn(&Revision, &Revision, &mut Revision) -> bool + Send + Sync>;

/// Derives the tracking item of a tracker table from a trackee revision.
pub type TrackerExtractor = Arc<dyn Fn(&Revision) -> ItemId + Send + Sync>;

/// Chunk-level trigger with the chunk it fired on.
pub type TableTrigger =
    Arc<dyn Fn(&BTreeSet<ItemId>, &BTreeSet<ItemId>, ChunkId) + Send + Sync>;

pub type AcquisitionCallback = Arc<dyn Fn(&Chunk) + Send + Sync>;

/// Standard policy: concurrent edits on disjoint field sets merge by
/// folding the remote changes into the local draft.
pub fn disjoint_fields_policy() -> AutoMergePolicy {
    Arc::new(|conflicting_new, original, local| {
        let len = original.field_count();
        if conflicting_new.field_count() != len || local.field_count() != len {
            return false;
        }
        let mut remote_changed = Vec::new();
        for index in 0..len {
            let remote_diff = !conflicting_new.field_match(original, index);
            let local_diff = !local.field_match(original, index);
            if remote_diff && local_diff {
                return false;
            }
            if remote_diff {
                remote_changed.push(index);
            }
        }
        for index in remote_changed {
            if let Ok(Some(value)) = conflicting_new.get(index) {
                let value = value.clone();
                if local.set(index, value).is_err() {
                    return false;
                }
            }
        }
        true
    })
}

pub struct NetTable {
    descriptor: TableDescriptor,
    template: Revision,
    use_raft: bool,
    timeout_policy: PeerTimeoutPolicy,
    hub: Arc<dyn Hub>,
    clock: Arc<LogicalClock>,

    active: RwLock<BTreeMap<ChunkId, Chunk>>,
    // Which peers claim to hold which chunk.
    index: RwLock<BTreeMap<ChunkId, BTreeSet<PeerId>>>,
    listeners: Mutex<BTreeSet<PeerId>>,
    acquisition_callbacks: Mutex<Vec<AcquisitionCallback>>,
    merge_policies: Mutex<Vec<AutoMergePolicy>>,
    new_chunk_trackers: Mutex<BTreeMap<String, TrackerExtractor>>,
    future_triggers: Mutex<Vec<TableTrigger>>,

    arrival_mutex: Mutex<()>,
    arrival_cv: Condvar,
    fetch_tx: Mutex<Option<Sender<ChunkId>>>,
}

impl NetTable {
    pub fn new(
        descriptor: TableDescriptor,
        use_raft: bool,
        timeout_policy: PeerTimeoutPolicy,
        hub: Arc<dyn Hub>,
        clock: Arc<LogicalClock>,
    ) -> Self {
        let template = descriptor.template();
        Self {
            descriptor,
            template,
            use_raft,
            timeout_policy,
            hub,
            clock,
            active: RwLock::new(BTreeMap::new()),
            index: RwLock::new(BTreeMap::new()),
            listeners: Mutex::new(BTreeSet::new()),
            acquisition_callbacks: Mutex::new(Vec::new()),
            merge_policies: Mutex::new(Vec::new()),
            new_chunk_trackers: Mutex::new(BTreeMap::new()),
            future_triggers: Mutex::new(Vec::new()),
            arrival_mutex: Mutex::new(()),
            arrival_cv: Condvar::new(),
            fetch_tx: Mutex::new(None),
        }
    }

    /// One background fetcher per table pulls pushed chunk ids into local
    /// replicas without holding up the pushing peer's request.
    pub(crate) fn spawn_chunk_fetcher(self: &Arc<Self>) {
        let (tx, rx) = unbounded::<ChunkId>();
        {
            let mut slot = self.fetch_tx.lock().unwrap_or_else(|e| e.into_inner());
            assert!(slot.is_none(), "chunk fetcher spawned twice");
            *slot = Some(tx);
        }
        let table = Arc::clone(self);
        std::thread::spawn(move || {
            while let Ok(chunk_id) = rx.recv() {
                if table.has_chunk(&chunk_id) {
                    continue;
                }
                if table.get_chunk(&chunk_id).is_none() {
                    tracing::warn!(
                        chunk = %chunk_id,
                        table = table.name(),
                        "pushed chunk could not be fetched"
                    );
                }
            }
        });
    }

    pub(crate) fn stop_chunk_fetcher(&self) {
        self.fetch_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn template(&self) -> &Revision {
        &self.template
    }

    pub fn new_revision(&self) -> Revision {
        self.descriptor.template()
    }

    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    // =====================================================================
    // Chunk lifecycle
    // =====================================================================

    /// Create a chunk locally; this peer becomes the sole holder. The new
    /// chunk is pushed to every registered listener.
    pub fn new_chunk(&self, id: ChunkId) -> Chunk {
        let chunk = if self.use_raft {
            Chunk::Consensus(Arc::new(ConsensusChunk::create(
                id,
                self.name().to_string(),
                self.template.clone(),
                Arc::clone(&self.hub),
            )))
        } else {
            Chunk::Legacy(Arc::new(LegacyChunk::create(
                id,
                self.name().to_string(),
                self.template.clone(),
                Arc::clone(&self.hub),
                Arc::clone(&self.clock),
                self.timeout_policy,
            )))
        };
        self.install_chunk(chunk.clone());

        let listeners: Vec<PeerId> = {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().cloned().collect()
        };
        for listener in listeners {
            if !chunk.request_participation_from(&listener) {
                tracing::warn!(
                    %listener,
                    chunk = %id,
                    table = self.name(),
                    "listener did not accept new chunk"
                );
            }
        }
        chunk
    }

    pub fn new_chunk_with_generated_id(&self) -> Chunk {
        let id = ChunkId::generate(self.hub.own_peer().as_str());
        self.new_chunk(id)
    }

    fn install_chunk(&self, chunk: Chunk) {
        let id = chunk.id();
        {
            let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
            let previous = active.insert(id, chunk.clone());
            assert!(previous.is_none(), "chunk {id} installed twice");
        }
        self.register_holder(id, self.hub.own_peer().clone());

        let triggers: Vec<TableTrigger> = {
            let guard = self.future_triggers.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        for trigger in triggers {
            let chunk_id = id;
            let trigger = Arc::clone(&trigger);
            chunk.attach_trigger(Arc::new(move |insertions, updates| {
                trigger(insertions, updates, chunk_id);
            }));
        }

        let callbacks: Vec<AcquisitionCallback> = {
            let guard = self
                .acquisition_callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        for callback in callbacks {
            callback(&chunk);
        }

        let _guard = self.arrival_mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.arrival_cv.notify_all();
    }

    pub fn has_chunk(&self, id: &ChunkId) -> bool {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn local_chunk(&self, id: &ChunkId) -> Option<Chunk> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn active_chunks(&self) -> Vec<Chunk> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// The local chunk if present, else connect to a holder found through
    /// the index and wait for the replica to arrive.
    pub fn get_chunk(&self, id: &ChunkId) -> Option<Chunk> {
        if let Some(chunk) = self.local_chunk(id) {
            return Some(chunk);
        }
        let holders = self.chunk_holders(id);
        for holder in holders {
            if holder == *self.hub.own_peer() {
                continue;
            }
            if self.use_raft {
                let chunk_ref = ChunkRef {
                    table: self.name().to_string(),
                    chunk_id: *id,
                };
                match ConsensusChunk::join(
                    chunk_ref,
                    self.template.clone(),
                    &holder,
                    Arc::clone(&self.hub),
                ) {
                    Ok(chunk) => {
                        let chunk = Chunk::Consensus(Arc::new(chunk));
                        self.install_chunk(chunk.clone());
                        return Some(chunk);
                    }
                    Err(error) => {
                        tracing::warn!(%error, %holder, chunk = %id, "consensus join failed");
                    }
                }
            } else {
                let request = Payload::ChunkConnect {
                    chunk: ChunkRef {
                        table: self.name().to_string(),
                        chunk_id: *id,
                    },
                };
                match self.hub.request_ack(&holder, request) {
                    Ok(()) => {
                        // The holder now sends us an init; wait for it.
                        if let Some(chunk) = self.wait_for_chunk(id) {
                            return Some(chunk);
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, %holder, chunk = %id, "connect failed");
                    }
                }
            }
        }
        None
    }

    fn wait_for_chunk(&self, id: &ChunkId) -> Option<Chunk> {
        let deadline = Instant::now() + CHUNK_FETCH_LIMIT;
        let mut guard = self.arrival_mutex.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(chunk) = self.local_chunk(id) {
                return Some(chunk);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .arrival_cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = next;
        }
    }

    /// Read all locally held chunks at `time`.
    pub fn dump_active_chunks(&self, time: LogicalTime) -> RevisionMap {
        let mut result = RevisionMap::new();
        for chunk in self.active_chunks() {
            result.append(&mut chunk.dump(time));
        }
        result
    }

    pub fn leave_all_chunks(&self) {
        let chunks: Vec<Chunk> = {
            let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
            let chunks = active.values().cloned().collect();
            active.clear();
            chunks
        };
        for chunk in chunks {
            chunk.leave();
        }
    }

    // =====================================================================
    // Peer index & listeners
    // =====================================================================

    pub fn register_holder(&self, chunk: ChunkId, peer: PeerId) {
        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(chunk)
            .or_default()
            .insert(peer);
    }

    pub fn chunk_holders(&self, chunk: &ChunkId) -> Vec<PeerId> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(chunk)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget_holder(&self, peer: &PeerId) {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        for holders in index.values_mut() {
            holders.remove(peer);
        }
    }

    /// Register with `peers` so they push every chunk they create to us.
    pub fn announce_to_listeners(&self, peers: &[PeerId]) {
        for peer in peers {
            let payload = Payload::AnnounceToListeners {
                table: self.name().to_string(),
            };
            if let Err(error) = self.hub.request_ack(peer, payload) {
                tracing::warn!(%peer, %error, table = self.name(), "listener announcement failed");
            }
        }
    }

    pub fn add_listener(&self, peer: PeerId) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer);
    }

    pub fn attach_acquisition_callback(&self, callback: AcquisitionCallback) {
        self.acquisition_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// Attach `trigger` to every chunk currently held and every chunk
    /// acquired later.
    pub fn attach_trigger_to_current_and_future_chunks(&self, trigger: TableTrigger) {
        self.future_triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&trigger));
        for chunk in self.active_chunks() {
            let chunk_id = chunk.id();
            let trigger = Arc::clone(&trigger);
            chunk.attach_trigger(Arc::new(move |insertions, updates| {
                trigger(insertions, updates, chunk_id);
            }));
        }
    }

    // =====================================================================
    // Auto-merge policies & trackers
    // =====================================================================

    pub fn add_merge_policy(&self, policy: AutoMergePolicy) {
        self.merge_policies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(policy);
    }

    /// Run the table's policies in order until one absorbs the conflict.
    pub fn try_auto_merge(
        &self,
        conflicting_new: &Revision,
        original: &Revision,
        local: &mut Revision,
    ) -> bool {
        let policies: Vec<AutoMergePolicy> = {
            let guard = self.merge_policies.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        policies
            .iter()
            .any(|policy| policy(conflicting_new, original, local))
    }

    /// Declare that items of this table track new chunks of this table
    /// appearing in transactions: whenever a transaction creates a chunk
    /// here, the tracker item in `tracker_table` (determined per revision by
    /// `extractor`) gets the chunk id appended to its trackee map.
    pub fn push_new_chunk_ids_to_tracker(
        &self,
        tracker_table: &str,
        extractor: TrackerExtractor,
    ) {
        let previous = self
            .new_chunk_trackers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tracker_table.to_string(), extractor);
        assert!(
            previous.is_none(),
            "tracker for table {tracker_table} declared twice"
        );
    }

    pub fn new_chunk_trackers(&self) -> BTreeMap<String, TrackerExtractor> {
        self.new_chunk_trackers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // =====================================================================
    // Inbound handlers (routed by the manager)
    // =====================================================================

    pub fn handle_request(self: &Arc<Self>, sender: &PeerId, payload: &Payload) -> Payload {
        match payload {
            Payload::ChunkInit(init) => self.handle_init(sender, init),
            Payload::ChunkConnect { chunk } => match self.local_chunk(&chunk.chunk_id) {
                Some(Chunk::Legacy(legacy)) => legacy.handle_connect(sender.clone()),
                Some(Chunk::Consensus(_)) => Payload::Decline {
                    reason: "chunk is consensus-replicated, connect through the log".into(),
                },
                None => Payload::Decline {
                    reason: "chunk not held here".into(),
                },
            },
            Payload::ChunkInsert { chunk, revision } => {
                self.with_legacy(chunk, |legacy| legacy.handle_insert(revision))
            }
            Payload::ChunkUpdate { chunk, revision } => {
                self.with_legacy(chunk, |legacy| legacy.handle_update(revision))
            }
            Payload::ChunkLock {
                chunk,
                attempt_time,
            } => self.with_legacy(chunk, |legacy| legacy.handle_lock(sender, *attempt_time)),
            Payload::ChunkUnlock { chunk } => {
                self.with_legacy(chunk, |legacy| legacy.handle_unlock(sender))
            }
            Payload::ChunkNewPeer { chunk, peer } => {
                self.register_holder(chunk.chunk_id, peer.clone());
                self.with_legacy(chunk, |legacy| legacy.handle_new_peer(peer))
            }
            Payload::ChunkLeave { chunk } => {
                self.forget_holder(sender);
                self.with_legacy(chunk, |legacy| legacy.handle_leave(sender))
            }
            Payload::PushNewChunks { chunks, .. } => {
                for chunk_id in chunks {
                    self.register_holder(*chunk_id, sender.clone());
                }
                // Fetch off the handler thread; the pushing peer is waiting
                // for this ack.
                let queue = self
                    .fetch_tx
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                match queue {
                    Some(queue) => {
                        for chunk_id in chunks {
                            let _ = queue.send(*chunk_id);
                        }
                    }
                    None => {
                        tracing::warn!(table = self.name(), "chunk fetcher not running");
                    }
                }
                Payload::Ack
            }
            Payload::AnnounceToListeners { .. } => {
                self.add_listener(sender.clone());
                Payload::Ack
            }
            Payload::RoutedIndex { .. } | Payload::RoutedSpatial { .. } => Payload::Decline {
                reason: "routing collaborator not attached".into(),
            },
            // Consensus traffic targets the chunk's node.
            Payload::AppendEntries(append) => self.with_consensus(&append.chunk, sender, payload),
            Payload::Vote { chunk, .. }
            | Payload::QueryState { chunk }
            | Payload::RaftChunkLock { chunk, .. }
            | Payload::RaftChunkUnlock { chunk, .. }
            | Payload::RaftTxnInfo { chunk, .. }
            | Payload::RaftTxnQuery { chunk, .. }
            | Payload::RaftInsert { chunk, .. }
            | Payload::RaftLeave { chunk, .. }
            | Payload::RaftConnect { chunk } => self.with_consensus(chunk, sender, payload),
            other => {
                tracing::warn!(kind = other.kind(), table = self.name(), "unroutable request");
                Payload::Invalid
            }
        }
    }

    fn with_legacy(
        &self,
        chunk: &ChunkRef,
        action: impl FnOnce(&Arc<LegacyChunk>) -> Payload,
    ) -> Payload {
        match self.local_chunk(&chunk.chunk_id) {
            Some(Chunk::Legacy(legacy)) => action(&legacy),
            Some(Chunk::Consensus(_)) => Payload::Decline {
                reason: "chunk is consensus-replicated".into(),
            },
            None => Payload::Decline {
                reason: "chunk not held here".into(),
            },
        }
    }

    fn with_consensus(&self, chunk: &ChunkRef, sender: &PeerId, payload: &Payload) -> Payload {
        match self.local_chunk(&chunk.chunk_id) {
            Some(Chunk::Consensus(consensus)) => consensus.handle_request(sender, payload),
            Some(Chunk::Legacy(_)) => Payload::Decline {
                reason: "chunk is lock-replicated".into(),
            },
            None => Payload::Decline {
                reason: "chunk not held here".into(),
            },
        }
    }

    fn handle_init(&self, sender: &PeerId, init: &ChunkInit) -> Payload {
        if self.has_chunk(&init.chunk.chunk_id) {
            return Payload::Redundant;
        }
        let chunk = LegacyChunk::from_init(
            init,
            sender,
            self.template.clone(),
            Arc::clone(&self.hub),
            Arc::clone(&self.clock),
            self.timeout_policy,
        );
        for peer in &init.peers {
            if peer != self.hub.own_peer() {
                self.register_holder(init.chunk.chunk_id, peer.clone());
            }
        }
        self.install_chunk(Chunk::Legacy(Arc::new(chunk)));
        Payload::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::revision::{FieldType, Value};

    #[test]
    fn disjoint_fields_policy_merges_non_overlapping_edits() {
        let mut original = Revision::with_layout(&[FieldType::Int32, FieldType::Int32]);
        original.set(0, Value::Int32(1)).unwrap();
        original.set(1, Value::Int32(2)).unwrap();

        // Remote changed field 0, local changed field 1.
        let mut remote = original.clone();
        remote.set(0, Value::Int32(10)).unwrap();
        let mut local = original.clone();
        local.set(1, Value::Int32(20)).unwrap();

        let policy = disjoint_fields_policy();
        assert!(policy(&remote, &original, &mut local));
        assert_eq!(local.get(0).unwrap(), Some(&Value::Int32(10)));
        assert_eq!(local.get(1).unwrap(), Some(&Value::Int32(20)));
    }

    #[test]
    fn disjoint_fields_policy_rejects_overlapping_edits() {
        let mut original = Revision::with_layout(&[FieldType::Int32]);
        original.set(0, Value::Int32(1)).unwrap();
        let mut remote = original.clone();
        remote.set(0, Value::Int32(10)).unwrap();
        let mut local = original.clone();
        local.set(0, Value::Int32(20)).unwrap();

        let policy = disjoint_fields_policy();
        assert!(!policy(&remote, &original, &mut local));
        assert_eq!(local.get(0).unwrap(), Some(&Value::Int32(20)));
    }
}
