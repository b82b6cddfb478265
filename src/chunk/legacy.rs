//! Legacy chunk: distributed-RW-lock replication.
//!
//! Each holder keeps the full chunk state and grants a share of the
//! distributed write lock. Replication is broadcast-and-ack under that lock.
//! Legacy chunks are not robust to sudden connectivity loss; consensus
//! chunks are the fault-tolerant alternative.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::core::container::{ChunkData, RamChunkData, RevisionMap};
use crate::core::identity::{ChunkId, ItemId, PeerId};
use crate::core::revision::{
    decode_revision, encode_revision, Revision, RevisionHandle,
};
use crate::core::time::{LogicalClock, LogicalTime};
use crate::net::hub::{Hub, NetError};
use crate::net::proto::{ChunkInit, ChunkRef, Payload};

use super::lock::{DistributedRwLock, WriteAttempt};
use super::PeerTimeoutPolicy;

/// Post-commit callback `(insertions, updates)`, fired while the committer
/// still holds the write lock.
pub type TriggerFn = Arc<dyn Fn(&BTreeSet<ItemId>, &BTreeSet<ItemId>) + Send + Sync>;

pub struct LegacyChunk {
    id: ChunkId,
    table: String,
    template: Revision,
    data: RwLock<Box<dyn ChunkData>>,
    // Other holders; self is implicit.
    swarm: Mutex<BTreeSet<PeerId>>,
    lock: DistributedRwLock,
    // Peers must join one at a time: each joiner needs the full swarm list.
    add_peer_mutex: Mutex<()>,
    hub: Arc<dyn Hub>,
    clock: Arc<LogicalClock>,
    triggers: Mutex<Vec<TriggerFn>>,
    latest_commit: Mutex<LogicalTime>,
    relinquished: AtomicBool,
    timeout_policy: PeerTimeoutPolicy,
}

impl LegacyChunk {
    /// Create a brand-new chunk; this peer is the sole holder.
    pub fn create(
        id: ChunkId,
        table: String,
        template: Revision,
        hub: Arc<dyn Hub>,
        clock: Arc<LogicalClock>,
        timeout_policy: PeerTimeoutPolicy,
    ) -> Self {
        Self {
            id,
            table,
            template,
            data: RwLock::new(Box::new(RamChunkData::new())),
            swarm: Mutex::new(BTreeSet::new()),
            lock: DistributedRwLock::new(hub.own_peer().clone()),
            add_peer_mutex: Mutex::new(()),
            hub,
            clock,
            triggers: Mutex::new(Vec::new()),
            latest_commit: Mutex::new(LogicalTime::INVALID),
            relinquished: AtomicBool::new(false),
            timeout_policy,
        }
    }

    /// Join an existing chunk from a received init payload.
    pub fn from_init(
        init: &ChunkInit,
        sender: &PeerId,
        template: Revision,
        hub: Arc<dyn Hub>,
        clock: Arc<LogicalClock>,
        timeout_policy: PeerTimeoutPolicy,
    ) -> Self {
        let chunk = Self::create(
            init.chunk.chunk_id,
            init.chunk.table.clone(),
            template,
            hub,
            clock,
            timeout_policy,
        );
        {
            let mut swarm = chunk.swarm.lock().unwrap_or_else(|e| e.into_inner());
            for peer in &init.peers {
                if peer != chunk.hub.own_peer() {
                    swarm.insert(peer.clone());
                }
            }
            swarm.insert(sender.clone());
        }
        {
            let mut data = chunk.data.write().unwrap_or_else(|e| e.into_inner());
            for payload in &init.revisions {
                match decode_revision(payload) {
                    Ok(revision) => {
                        chunk.note_commit(revision.update_time());
                        data.patch(revision.into_handle());
                    }
                    Err(error) => {
                        tracing::error!(%error, chunk = %chunk.id, "dropping undecodable init revision");
                    }
                }
            }
        }
        chunk
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn template(&self) -> &Revision {
        &self.template
    }

    fn chunk_ref(&self) -> ChunkRef {
        ChunkRef {
            table: self.table.clone(),
            chunk_id: self.id,
        }
    }

    fn note_commit(&self, time: LogicalTime) {
        let mut latest = self.latest_commit.lock().unwrap_or_else(|e| e.into_inner());
        if time > *latest {
            *latest = time;
        }
    }

    pub fn latest_commit_time(&self) -> LogicalTime {
        *self.latest_commit.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn swarm_snapshot(&self) -> Vec<PeerId> {
        self.swarm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn peer_size(&self) -> usize {
        self.swarm.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Broadcast to the swarm in order; every holder must ack.
    fn broadcast_must_ack(&self, payload: Payload) {
        for peer in self.swarm_snapshot() {
            match self.hub.request_ack(&peer, payload.clone()) {
                Ok(()) => {}
                Err(NetError::PeerUnreachable { .. }) => self.peer_vanished(&peer),
                Err(error) => {
                    panic!(
                        "peer {peer} rejected replication for chunk {}: {error}",
                        self.id
                    );
                }
            }
        }
    }

    fn peer_vanished(&self, peer: &PeerId) {
        match self.timeout_policy {
            PeerTimeoutPolicy::Abort => {
                panic!("peer {peer} unreachable for chunk {}", self.id);
            }
            PeerTimeoutPolicy::DropPeer => {
                tracing::warn!(%peer, chunk = %self.id, "dropping unreachable peer from swarm");
                self.swarm
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(peer);
            }
        }
    }

    // =====================================================================
    // Distributed lock
    // =====================================================================

    /// Collect every member's lock slot in ascending peer order, the own
    /// slot at its own rank. The ordering is what makes concurrent
    /// acquisitions deadlock-free.
    pub fn write_lock(&self) {
        if self.lock.try_reenter() {
            return;
        }
        let attempt_time = self.clock.sample();
        let own = self.hub.own_peer().clone();
        let mut slots = self.swarm_snapshot();
        slots.push(own.clone());
        slots.sort();

        let payload = Payload::ChunkLock {
            chunk: self.chunk_ref(),
            attempt_time,
        };
        for peer in slots {
            if peer == own {
                match self.lock.start_write_attempt(attempt_time) {
                    WriteAttempt::Reentered => return,
                    WriteAttempt::MustRequest { .. } => {}
                }
                continue;
            }
            match self.hub.request_ack(&peer, payload.clone()) {
                Ok(()) => {}
                Err(NetError::PeerUnreachable { .. }) => self.peer_vanished(&peer),
                Err(error) => panic!(
                    "peer {peer} rejected lock request for chunk {}: {error}",
                    self.id
                ),
            }
        }
        self.lock.write_acquired();
    }

    pub fn read_lock(&self) {
        self.lock.read_lock();
    }

    /// Hand the held write lock to the calling thread (parallel commit).
    pub fn adopt_write_lock(&self) {
        self.lock.adopt_write_lock();
    }

    pub fn is_write_locked(&self) -> bool {
        self.lock.is_self_write_locked()
    }

    pub fn unlock(&self) {
        if self.lock.is_self_write_locked() {
            if self.lock.write_unlock() {
                let payload = Payload::ChunkUnlock {
                    chunk: self.chunk_ref(),
                };
                for peer in self.swarm_snapshot() {
                    match self.hub.request_ack(&peer, payload.clone()) {
                        Ok(()) => {}
                        Err(NetError::PeerUnreachable { .. }) => self.peer_vanished(&peer),
                        Err(error) => panic!(
                            "peer {peer} rejected unlock for chunk {}: {error}",
                            self.id
                        ),
                    }
                }
            }
        } else {
            self.lock.read_unlock();
        }
    }

    // =====================================================================
    // Reads
    // =====================================================================

    pub fn dump(&self, time: LogicalTime) -> RevisionMap {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.dump(time)
    }

    pub fn get_by_id(&self, id: &ItemId, time: LogicalTime) -> Option<RevisionHandle> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get_by_id(id, time)
    }

    pub fn num_items(&self, time: LogicalTime) -> usize {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.available_ids(time).len()
    }

    pub fn update_times(&self) -> BTreeMap<ItemId, LogicalTime> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.latest_update_times()
    }

    pub fn with_data<R>(&self, action: impl FnOnce(&dyn ChunkData) -> R) -> R {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        action(data.as_ref())
    }

    // =====================================================================
    // Writes (caller holds the distributed write lock)
    // =====================================================================

    /// Single insert outside a transaction: lock, apply, replicate, unlock.
    pub fn insert(&self, time: LogicalTime, mut revision: Revision) {
        self.write_lock();
        revision.set_chunk_id(self.id);
        revision.set_insert_time(time);
        revision.set_update_time(time);
        let mut map = BTreeMap::new();
        map.insert(revision.item_id(), revision);
        self.bulk_insert_locked(map, time);
        self.unlock();
    }

    pub fn bulk_insert_locked(&self, items: BTreeMap<ItemId, Revision>, time: LogicalTime) {
        assert!(self.lock.is_self_write_locked(), "bulk insert without lock");
        let mut insertions = BTreeSet::new();
        {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            let mut prepared = Vec::with_capacity(items.len());
            for (id, mut revision) in items {
                revision.set_chunk_id(self.id);
                revision.set_insert_time(time);
                revision.set_update_time(time);
                insertions.insert(id);
                prepared.push(revision);
            }
            let encoded: Vec<Vec<u8>> = prepared.iter().map(encode_revision).collect();
            data.bulk_insert(prepared)
                .expect("transaction staged an insert over an existing item");
            drop(data);
            for payload in encoded {
                self.broadcast_must_ack(Payload::ChunkInsert {
                    chunk: self.chunk_ref(),
                    revision: payload,
                });
            }
        }
        self.note_commit(time);
        self.dispatch_triggers(&insertions, &BTreeSet::new());
    }

    pub fn update_locked(&self, time: LogicalTime, mut revision: Revision) {
        assert!(self.lock.is_self_write_locked(), "update without lock");
        revision.set_chunk_id(self.id);
        revision.set_update_time(time);
        let id = revision.item_id();
        let encoded = encode_revision(&revision);
        {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            data.update(revision);
        }
        self.broadcast_must_ack(Payload::ChunkUpdate {
            chunk: self.chunk_ref(),
            revision: encoded,
        });
        self.note_commit(time);
        let mut updates = BTreeSet::new();
        updates.insert(id);
        self.dispatch_triggers(&BTreeSet::new(), &updates);
    }

    /// Removal is an update that carries the removed flag.
    pub fn remove_locked(&self, time: LogicalTime, mut revision: Revision) {
        revision.set_removed();
        self.update_locked(time, revision);
    }

    // =====================================================================
    // Swarm membership
    // =====================================================================

    /// Ask every hub peer not yet in the swarm to participate. Returns how
    /// many accepted.
    pub fn request_participation(&self) -> usize {
        self.write_lock();
        let mut added = 0;
        for peer in self.hub.ready_peers() {
            let already = {
                let swarm = self.swarm.lock().unwrap_or_else(|e| e.into_inner());
                swarm.contains(&peer)
            };
            if !already && self.add_peer(&peer) {
                added += 1;
            }
        }
        self.unlock();
        added
    }

    pub fn request_participation_from(&self, peer: &PeerId) -> bool {
        self.write_lock();
        let already = {
            let swarm = self.swarm.lock().unwrap_or_else(|e| e.into_inner());
            swarm.contains(peer)
        };
        let added = !already && self.add_peer(peer);
        self.unlock();
        added
    }

    /// Send the full chunk state to `peer` and announce it to the swarm.
    /// The write lock must be held; joins are serialized by `add_peer_mutex`.
    fn add_peer(&self, peer: &PeerId) -> bool {
        assert!(self.lock.is_self_write_locked(), "add_peer without lock");
        let _guard = self.add_peer_mutex.lock().unwrap_or_else(|e| e.into_inner());

        let mut peers = vec![self.hub.own_peer().clone()];
        peers.extend(self.swarm_snapshot());
        let revisions = self.full_history_payloads();
        let init = Payload::ChunkInit(ChunkInit {
            chunk: self.chunk_ref(),
            peers,
            revisions,
        });
        match self.hub.request_ack(peer, init) {
            Ok(()) => {}
            Err(NetError::Declined { reason }) => {
                tracing::info!(%peer, chunk = %self.id, %reason, "peer declined participation");
                return false;
            }
            Err(NetError::PeerUnreachable { .. }) => {
                self.peer_vanished(peer);
                return false;
            }
            Err(error) => panic!("init request to {peer} failed for chunk {}: {error}", self.id),
        }

        let announcement = Payload::ChunkNewPeer {
            chunk: self.chunk_ref(),
            peer: peer.clone(),
        };
        for other in self.swarm_snapshot() {
            if let Err(error) = self.hub.request_ack(&other, announcement.clone()) {
                tracing::warn!(%other, %error, chunk = %self.id, "new-peer announcement failed");
            }
        }
        self.swarm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.clone());
        true
    }

    /// Every revision of every item, oldest first, encoded for an init.
    fn full_history_payloads(&self) -> Vec<Vec<u8>> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let mut payloads = Vec::new();
        let max = LogicalTime::from_serialized(u64::MAX);
        for (id, _) in data.latest_update_times() {
            if let Some(history) = data.history(&id, max) {
                for revision in history.iter().rev() {
                    payloads.push(encode_revision(revision));
                }
            }
        }
        payloads
    }

    /// Install a revision with its original timestamps, bypassing the
    /// replication path. Archive reload only; the chunk must not be shared
    /// yet.
    pub fn restore_local(&self, revision: Revision) {
        assert_eq!(self.peer_size(), 0, "restore into a shared chunk");
        self.note_commit(revision.update_time());
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.patch(revision.into_handle());
    }

    /// Drop this chunk: announce departure and stop serving.
    pub fn leave(&self) {
        self.write_lock();
        let payload = Payload::ChunkLeave {
            chunk: self.chunk_ref(),
        };
        for peer in self.swarm_snapshot() {
            if let Err(error) = self.hub.request_ack(&peer, payload.clone()) {
                tracing::warn!(%peer, %error, chunk = %self.id, "leave announcement failed");
            }
        }
        self.relinquished.store(true, Ordering::Relaxed);
        self.unlock();
    }

    pub fn is_relinquished(&self) -> bool {
        self.relinquished.load(Ordering::Relaxed)
    }

    // =====================================================================
    // Triggers
    // =====================================================================

    pub fn attach_trigger(&self, trigger: TriggerFn) {
        self.triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(trigger);
    }

    fn dispatch_triggers(&self, insertions: &BTreeSet<ItemId>, updates: &BTreeSet<ItemId>) {
        if insertions.is_empty() && updates.is_empty() {
            return;
        }
        let triggers = {
            let guard = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        for trigger in triggers {
            trigger(insertions, updates);
        }
    }

    // =====================================================================
    // Handlers for swarm requests addressed at this chunk
    // =====================================================================

    pub fn handle_connect(self: &Arc<Self>, peer: PeerId) -> Payload {
        if self.is_relinquished() {
            return Payload::Decline {
                reason: "chunk relinquished".into(),
            };
        }
        let already = {
            let swarm = self.swarm.lock().unwrap_or_else(|e| e.into_inner());
            swarm.contains(&peer)
        };
        if already {
            return Payload::Redundant;
        }
        // Joining needs the write lock; grab it off the handler thread so the
        // connect reply is not held up behind the lock round.
        let chunk = Arc::clone(self);
        std::thread::spawn(move || {
            chunk.write_lock();
            let already = {
                let swarm = chunk.swarm.lock().unwrap_or_else(|e| e.into_inner());
                swarm.contains(&peer)
            };
            if !already {
                chunk.add_peer(&peer);
            }
            chunk.unlock();
        });
        Payload::Ack
    }

    pub fn handle_insert(&self, payload: &[u8]) -> Payload {
        match decode_revision(payload) {
            Ok(revision) => {
                let id = revision.item_id();
                self.note_commit(revision.update_time());
                {
                    let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
                    data.patch(revision.into_handle());
                }
                let mut insertions = BTreeSet::new();
                insertions.insert(id);
                self.dispatch_triggers(&insertions, &BTreeSet::new());
                Payload::Ack
            }
            Err(error) => {
                tracing::error!(%error, chunk = %self.id, "declining undecodable insert");
                Payload::Decline {
                    reason: error.to_string(),
                }
            }
        }
    }

    pub fn handle_update(&self, payload: &[u8]) -> Payload {
        match decode_revision(payload) {
            Ok(revision) => {
                let id = revision.item_id();
                self.note_commit(revision.update_time());
                {
                    let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
                    data.patch(revision.into_handle());
                }
                let mut updates = BTreeSet::new();
                updates.insert(id);
                self.dispatch_triggers(&BTreeSet::new(), &updates);
                Payload::Ack
            }
            Err(error) => {
                tracing::error!(%error, chunk = %self.id, "declining undecodable update");
                Payload::Decline {
                    reason: error.to_string(),
                }
            }
        }
    }

    pub fn handle_lock(&self, peer: &PeerId, attempt_time: LogicalTime) -> Payload {
        self.lock.grant_remote(peer, attempt_time);
        Payload::Ack
    }

    pub fn handle_unlock(&self, peer: &PeerId) -> Payload {
        self.lock.release_remote(peer);
        Payload::Ack
    }

    pub fn handle_new_peer(&self, peer: &PeerId) -> Payload {
        if peer == self.hub.own_peer() {
            return Payload::Redundant;
        }
        self.swarm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.clone());
        Payload::Ack
    }

    pub fn handle_leave(&self, peer: &PeerId) -> Payload {
        let removed = self
            .swarm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer);
        if removed {
            Payload::Ack
        } else {
            Payload::Redundant
        }
    }
}
