//! Consensus chunk: the fault-tolerant chunk implementation.
//!
//! All mutations travel as log entries through [`RaftNode`]; the distributed
//! chunk lock, swarm membership and revision inserts are replicated and
//! applied in the same order on every peer.

pub mod log;
pub mod node;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::core::container::RevisionMap;
use crate::core::identity::{ChunkId, Id, ItemId, PeerId};
use crate::core::revision::{encode_revision, Revision, RevisionHandle};
use crate::core::time::LogicalTime;
use crate::net::hub::{Hub, NetError};
use crate::net::proto::{ChunkRef, LogEntryKind, MultiChunkInfo, Payload, TxnQueryAction};

pub use node::{RaftNode, RaftState};

use super::legacy::TriggerFn;

const LOCK_ACQUIRE_LIMIT: Duration = Duration::from_secs(30);
const SUBMIT_RETRY_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct LockSession {
    thread: Option<ThreadId>,
    depth: usize,
    lock_index: u64,
}

pub struct ConsensusChunk {
    node: Arc<RaftNode>,
    template: Revision,
    hub: Arc<dyn Hub>,
    serial: AtomicU64,
    session: Mutex<LockSession>,
    session_cv: Condvar,
}

impl ConsensusChunk {
    pub fn create(
        id: ChunkId,
        table: String,
        template: Revision,
        hub: Arc<dyn Hub>,
    ) -> Self {
        let chunk_ref = ChunkRef {
            table,
            chunk_id: id,
        };
        let node = RaftNode::create(chunk_ref, Arc::clone(&hub));
        node.start();
        Self {
            node,
            template,
            hub,
            serial: AtomicU64::new(1),
            session: Mutex::new(LockSession::default()),
            session_cv: Condvar::new(),
        }
    }

    /// Join an existing consensus chunk through any peer that holds it.
    pub fn join(
        chunk: ChunkRef,
        template: Revision,
        seed: &PeerId,
        hub: Arc<dyn Hub>,
    ) -> Result<Self, NetError> {
        let mut target = seed.clone();
        let deadline = Instant::now() + LOCK_ACQUIRE_LIMIT;
        loop {
            let response = hub.request(&target, Payload::RaftConnect {
                chunk: chunk.clone(),
            })?;
            match response.payload {
                Payload::RaftConnectResponse(init) => {
                    let node = RaftNode::from_init(init, Arc::clone(&hub));
                    node.start();
                    return Ok(Self {
                        node,
                        template,
                        hub,
                        serial: AtomicU64::new(1),
                        session: Mutex::new(LockSession::default()),
                        session_cv: Condvar::new(),
                    });
                }
                Payload::NotLeader { leader: Some(peer) } => {
                    target = peer;
                }
                Payload::NotLeader { leader: None } => {
                    if Instant::now() >= deadline {
                        return Err(NetError::Declined {
                            reason: "no leader available to join through".into(),
                        });
                    }
                    std::thread::sleep(SUBMIT_RETRY_PAUSE);
                }
                Payload::Decline { reason } => {
                    return Err(NetError::Declined { reason });
                }
                other => {
                    tracing::warn!(kind = other.kind(), "unexpected connect response");
                    return Err(NetError::Invalid);
                }
            }
            if Instant::now() >= deadline {
                return Err(NetError::Declined {
                    reason: "join timed out".into(),
                });
            }
        }
    }

    pub fn id(&self) -> ChunkId {
        self.node.chunk_ref().chunk_id
    }

    pub fn table(&self) -> &str {
        &self.node.chunk_ref().table
    }

    pub fn template(&self) -> &Revision {
        &self.template
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    pub fn state(&self) -> RaftState {
        self.node.state()
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.node.leader()
    }

    pub fn term(&self) -> u64 {
        self.node.term()
    }

    pub fn give_up_leadership(&self) -> bool {
        self.node.give_up_leadership()
    }

    pub fn peer_size(&self) -> usize {
        self.node.num_peers()
    }

    fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::SeqCst)
    }

    fn chunk_ref(&self) -> ChunkRef {
        self.node.chunk_ref().clone()
    }

    /// Route a request to the current leader, following redirects. Returns
    /// the leader's response payload.
    fn submit_to_leader(&self, payload: Payload) -> Result<Payload, NetError> {
        let deadline = Instant::now() + LOCK_ACQUIRE_LIMIT;
        let mut target = self.node.leader().unwrap_or_else(|| self.hub.own_peer().clone());
        loop {
            let outcome = self.hub.request(&target, payload.clone());
            match outcome {
                Ok(response) => match response.payload {
                    Payload::NotLeader { leader: Some(peer) } => {
                        target = peer;
                    }
                    Payload::NotLeader { leader: None } => {
                        std::thread::sleep(SUBMIT_RETRY_PAUSE);
                        target = self
                            .node
                            .leader()
                            .unwrap_or_else(|| self.any_peer_or_self());
                    }
                    other => return Ok(other),
                },
                Err(NetError::PeerUnreachable { .. }) => {
                    std::thread::sleep(SUBMIT_RETRY_PAUSE);
                    target = self.any_peer_or_self();
                }
                Err(error) => return Err(error),
            }
            if Instant::now() >= deadline {
                return Err(NetError::Declined {
                    reason: "no leader reachable".into(),
                });
            }
        }
    }

    fn any_peer_or_self(&self) -> PeerId {
        if let Some(leader) = self.node.leader() {
            return leader;
        }
        self.node
            .peer_list()
            .into_iter()
            .next()
            .unwrap_or_else(|| self.hub.own_peer().clone())
    }

    /// Submit a log entry and wait until it is committed cluster-wide and
    /// applied locally. Returns the landed index.
    fn submit_entry(&self, payload: Payload) -> Result<u64, NetError> {
        match self.submit_to_leader(payload)? {
            Payload::RaftRequestResponse { entry_index } if entry_index > 0 => {
                if !self.node.wait_applied(entry_index) {
                    return Err(NetError::Declined {
                        reason: "entry not applied locally in time".into(),
                    });
                }
                Ok(entry_index)
            }
            Payload::RaftRequestResponse { .. } => Err(NetError::Declined {
                reason: "entry rejected".into(),
            }),
            Payload::Decline { reason } => Err(NetError::Declined { reason }),
            other => {
                tracing::warn!(kind = other.kind(), "unexpected entry response");
                Err(NetError::Invalid)
            }
        }
    }

    // =====================================================================
    // Distributed chunk lock
    // =====================================================================

    pub fn write_lock(&self) {
        {
            let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
            if session.thread == Some(thread::current().id()) {
                session.depth += 1;
                return;
            }
            // Another local thread holds the replicated lock; wait here
            // rather than queueing a second replicated acquisition.
            while session.thread.is_some() {
                session = self
                    .session_cv
                    .wait(session)
                    .unwrap_or_else(|e| e.into_inner());
            }
            session.thread = Some(thread::current().id());
            session.depth = 1;
            session.lock_index = 0;
        }

        let serial = self.next_serial();
        let index = self
            .submit_entry(Payload::RaftChunkLock {
                chunk: self.chunk_ref(),
                serial_id: serial,
            })
            .unwrap_or_else(|error| {
                panic!(
                    "chunk {} lock submission failed: {error}",
                    self.id()
                )
            });

        // The entry may have queued behind another holder; wait our turn.
        let deadline = Instant::now() + LOCK_ACQUIRE_LIMIT;
        let own = self.hub.own_peer().clone();
        loop {
            if self.node.chunk_lock_holder().as_ref() == Some(&own)
                && self.node.chunk_lock_index() == index
            {
                break;
            }
            if Instant::now() >= deadline {
                panic!("chunk {} lock never granted", self.id());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.lock_index = index;
    }

    pub fn is_write_locked(&self) -> bool {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.thread == Some(thread::current().id())
    }

    /// Hand the held lock session to the calling thread (parallel commit).
    pub fn adopt_write_lock(&self) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        assert!(
            session.thread.is_some() && session.depth > 0,
            "adopt_write_lock without holding the chunk lock"
        );
        session.thread = Some(thread::current().id());
    }

    /// Consensus chunks serve reads from locally applied state; a dedicated
    /// read lock is unnecessary.
    pub fn read_lock(&self) {}

    pub fn unlock(&self) {
        self.unlock_inner(true);
    }

    /// Release the lock discarding any queued (uncommitted-to-container)
    /// inserts; used when a commit check fails after staging.
    pub fn unlock_discard(&self) {
        self.unlock_inner(false);
    }

    fn unlock_inner(&self, proceed_commits: bool) {
        let lock_index = {
            let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
            assert!(
                session.thread == Some(thread::current().id()),
                "unlock of chunk {} by non-holder thread",
                self.id()
            );
            session.depth -= 1;
            if session.depth > 0 {
                return;
            }
            session.lock_index
        };

        let serial = self.next_serial();
        let result = self.submit_entry(Payload::RaftChunkUnlock {
            chunk: self.chunk_ref(),
            serial_id: serial,
            lock_index,
            proceed_commits,
        });
        if let Err(error) = result {
            panic!("chunk {} unlock submission failed: {error}", self.id());
        }

        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.thread = None;
        session.lock_index = 0;
        drop(session);
        self.session_cv.notify_all();
    }

    // =====================================================================
    // Writes (lock held; application deferred to the unlock entry)
    // =====================================================================

    fn submit_revision(&self, revision: &Revision) {
        let serial = self.next_serial();
        let payload = Payload::RaftInsert {
            chunk: self.chunk_ref(),
            serial_id: serial,
            revision: encode_revision(revision),
        };
        if let Err(error) = self.submit_entry(payload) {
            panic!(
                "chunk {} revision submission failed: {error}",
                self.id()
            );
        }
    }

    pub fn insert(&self, time: LogicalTime, mut revision: Revision) {
        self.write_lock();
        revision.set_chunk_id(self.id());
        revision.set_insert_time(time);
        revision.set_update_time(time);
        self.submit_revision(&revision);
        self.unlock();
    }

    pub fn bulk_insert_locked(&self, items: BTreeMap<ItemId, Revision>, time: LogicalTime) {
        assert!(self.is_write_locked(), "bulk insert without lock");
        for (_, mut revision) in items {
            revision.set_chunk_id(self.id());
            revision.set_insert_time(time);
            revision.set_update_time(time);
            self.submit_revision(&revision);
        }
    }

    pub fn update_locked(&self, time: LogicalTime, mut revision: Revision) {
        assert!(self.is_write_locked(), "update without lock");
        revision.set_chunk_id(self.id());
        revision.set_update_time(time);
        self.submit_revision(&revision);
    }

    pub fn remove_locked(&self, time: LogicalTime, mut revision: Revision) {
        revision.set_removed();
        self.update_locked(time, revision);
    }

    // =====================================================================
    // Reads
    // =====================================================================

    pub fn dump(&self, time: LogicalTime) -> RevisionMap {
        self.node.with_data(|data| data.dump(time))
    }

    pub fn get_by_id(&self, id: &ItemId, time: LogicalTime) -> Option<RevisionHandle> {
        self.node.with_data(|data| data.get_by_id(id, time))
    }

    pub fn num_items(&self, time: LogicalTime) -> usize {
        self.node.with_data(|data| data.available_ids(time).len())
    }

    pub fn update_times(&self) -> BTreeMap<ItemId, LogicalTime> {
        self.node.with_data(|data| data.latest_update_times())
    }

    pub fn attach_trigger(&self, trigger: TriggerFn) {
        self.node.attach_trigger(trigger);
    }

    // =====================================================================
    // Membership
    // =====================================================================

    /// Invite `peer` to replicate this chunk. The peer joins by connecting
    /// back through the consensus log.
    pub fn request_participation_from(&self, peer: &PeerId) -> bool {
        let payload = Payload::PushNewChunks {
            table: self.table().to_string(),
            chunks: vec![self.id()],
        };
        match self.hub.request_ack(peer, payload) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(%peer, %error, chunk = %self.id(), "participation push failed");
                false
            }
        }
    }

    pub fn request_participation(&self) -> usize {
        self.hub
            .ready_peers()
            .iter()
            .filter(|peer| self.request_participation_from(peer))
            .count()
    }

    /// Announced departure: a RemovePeer entry, then local shutdown.
    pub fn leave(&self) {
        let serial = self.next_serial();
        let payload = Payload::RaftLeave {
            chunk: self.chunk_ref(),
            serial_id: serial,
        };
        match self.submit_to_leader(payload) {
            Ok(Payload::RaftRequestResponse { .. }) | Ok(Payload::Ack) => {}
            Ok(Payload::Decline { reason }) => {
                tracing::warn!(%reason, chunk = %self.id(), "leave declined");
            }
            Ok(other) => {
                tracing::warn!(kind = other.kind(), "unexpected leave response");
            }
            Err(error) => {
                tracing::warn!(%error, chunk = %self.id(), "leave failed");
            }
        }
        self.node.stop();
    }

    pub fn stop(&self) {
        self.node.stop();
    }

    // =====================================================================
    // Multi-chunk two-phase commit
    // =====================================================================

    /// Replicate the participant list into this chunk's log. Lock must be
    /// held.
    pub fn announce_multi_chunk(&self, info: MultiChunkInfo) -> Result<(), NetError> {
        assert!(self.is_write_locked(), "transaction info without lock");
        let serial = self.next_serial();
        self.submit_entry(Payload::RaftTxnInfo {
            chunk: self.chunk_ref(),
            serial_id: serial,
            info,
        })
        .map(|_| ())
    }

    pub fn query_ready(&self, transaction_id: Id) -> bool {
        let payload = Payload::RaftTxnQuery {
            chunk: self.chunk_ref(),
            transaction_id,
            action: TxnQueryAction::ReadyToCommit,
        };
        matches!(self.submit_to_leader(payload), Ok(Payload::Ack))
    }

    pub fn notify_decision(&self, transaction_id: Id, commit: bool) {
        let payload = Payload::RaftTxnQuery {
            chunk: self.chunk_ref(),
            transaction_id,
            action: if commit {
                TxnQueryAction::Commit
            } else {
                TxnQueryAction::Abort
            },
        };
        if let Err(error) = self.submit_to_leader(payload) {
            tracing::warn!(%error, chunk = %self.id(), "decision notification failed");
        }
    }

    // =====================================================================
    // Inbound handlers (routed by the table manager)
    // =====================================================================

    pub fn handle_request(&self, sender: &PeerId, payload: &Payload) -> Payload {
        match payload {
            Payload::AppendEntries(append) => self.node.handle_append_entries(append),
            Payload::Vote {
                term,
                last_log_index,
                last_log_term,
                ..
            } => self
                .node
                .handle_vote(sender, *term, *last_log_index, *last_log_term),
            Payload::QueryState { .. } => self.node.handle_query_state(),
            Payload::RaftChunkLock { serial_id, .. } => self.node.handle_client_entry(
                sender,
                *serial_id,
                LogEntryKind::LockRequest {
                    peer: sender.clone(),
                },
            ),
            Payload::RaftChunkUnlock {
                serial_id,
                lock_index,
                proceed_commits,
                ..
            } => self.node.handle_client_entry(
                sender,
                *serial_id,
                LogEntryKind::UnlockRequest {
                    peer: sender.clone(),
                    lock_index: *lock_index,
                    proceed_commits: *proceed_commits,
                },
            ),
            Payload::RaftInsert {
                serial_id,
                revision,
                ..
            } => self.node.handle_client_entry(
                sender,
                *serial_id,
                LogEntryKind::InsertRevision {
                    revision: revision.clone(),
                },
            ),
            Payload::RaftTxnInfo {
                serial_id, info, ..
            } => self.node.handle_client_entry(
                sender,
                *serial_id,
                LogEntryKind::MultiChunkInfo(info.clone()),
            ),
            Payload::RaftTxnQuery {
                transaction_id,
                action,
                ..
            } => self.node.handle_txn_query(transaction_id, *action),
            Payload::RaftLeave { serial_id, .. } => self.node.handle_client_entry(
                sender,
                *serial_id,
                LogEntryKind::RemovePeer {
                    peer: sender.clone(),
                },
            ),
            Payload::RaftConnect { .. } => self.node.handle_connect(sender),
            other => {
                tracing::warn!(kind = other.kind(), "unroutable consensus request");
                Payload::Invalid
            }
        }
    }
}
