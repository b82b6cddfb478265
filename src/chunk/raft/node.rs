//! Per-chunk consensus node.
//!
//! Replicates a log of revision operations across the chunk's peer set:
//! leader election with randomized timeouts, AppendEntries replication with
//! back-up on mismatch, membership changes as log entries, and the
//! replicated single-holder chunk lock.
//!
//! Lock acquisition ordering, strictly: state -> log -> peers -> trackers ->
//! heartbeat. The apply mutex is independent and never held while taking any
//! of the above except log (briefly, to advance the commit index).

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::core::container::{ChunkData, RamChunkData};
use crate::core::identity::{Id, PeerId};
use crate::core::revision::{decode_revision, RevisionHandle};
use crate::net::hub::{Hub, NetError};
use crate::net::proto::{
    AppendEntries, AppendStatus, ChunkRef, LogEntry, LogEntryKind, MultiChunkInfo, Payload,
    RaftInit,
};

use super::log::RaftLog;
use crate::chunk::legacy::TriggerFn;

pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(20);
const MANAGER_TICK: Duration = Duration::from_millis(5);
const APPEND_BATCH_LIMIT: usize = 64;
const COMMIT_WAIT_LIMIT: Duration = Duration::from_secs(5);
/// Missed heartbeats before an unannounced leaver is evicted.
const EVICTION_FAILURE_LIMIT: u32 = 10;

fn random_election_timeout() -> Duration {
    Duration::from_millis(rand::rng().random_range(50..150))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaftState {
    Initializing,
    Joining,
    Follower,
    Candidate,
    Leader,
    LostConnection,
    Disconnecting,
}

#[derive(Debug)]
struct StateInfo {
    state: RaftState,
    term: u64,
    leader: Option<PeerId>,
    voted_in_term: u64,
    voted_for: Option<PeerId>,
}

struct FollowerTracker {
    run: Arc<AtomicBool>,
    replication_index: Arc<AtomicU64>,
    failures: Arc<AtomicU32>,
    eviction_pending: bool,
    handle: Option<JoinHandle<()>>,
}

/// Replicated single-holder chunk lock, driven purely by committed log
/// entries so every peer agrees on the holder.
#[derive(Debug, Default)]
struct ChunkLockState {
    holder: Option<PeerId>,
    lock_index: u64,
}

#[derive(Debug)]
struct MultiChunkTxn {
    info: MultiChunkInfo,
    decided: Option<bool>,
}

pub struct RaftNode {
    chunk: ChunkRef,
    hub: Arc<dyn Hub>,

    state: Mutex<StateInfo>,
    log: RwLock<RaftLog>,
    peers: Mutex<BTreeSet<PeerId>>,
    trackers: Mutex<BTreeMap<PeerId, FollowerTracker>>,
    last_heartbeat: Mutex<Instant>,
    election_timeout: Mutex<Duration>,

    data: RwLock<Box<dyn ChunkData>>,
    chunk_lock: Mutex<ChunkLockState>,
    lock_queue: Mutex<VecDeque<(PeerId, u64)>>,
    pending_inserts: Mutex<Vec<RevisionHandle>>,
    multi_chunk: Mutex<BTreeMap<Id, MultiChunkTxn>>,

    apply_mutex: Mutex<()>,
    progress: Mutex<(u64, u64)>, // (commit_index, applied_index) mirror for waiters
    progress_cv: Condvar,
    tracker_hint: Mutex<u64>,
    tracker_cv: Condvar,

    internal_serial: AtomicU64,
    running: AtomicBool,
    exiting: AtomicBool,
    manager: Mutex<Option<JoinHandle<()>>>,
    triggers: Mutex<Vec<TriggerFn>>,
}

impl RaftNode {
    pub fn create(chunk: ChunkRef, hub: Arc<dyn Hub>) -> Arc<Self> {
        Arc::new(Self::build(chunk, hub, RaftLog::new(), BTreeSet::new()))
    }

    /// Rebuild from a join snapshot: install the log, then replay the
    /// committed prefix through the normal apply path.
    pub fn from_init(init: RaftInit, hub: Arc<dyn Hub>) -> Arc<Self> {
        let own = hub.own_peer().clone();
        let commit_index = init.commit_index;
        let log = RaftLog::from_entries(init.entries, 0);
        let peers: BTreeSet<PeerId> = init.peers.into_iter().filter(|p| *p != own).collect();
        let node = Arc::new(Self::build(init.chunk, hub, log, peers));
        {
            let mut state = node.state.lock().unwrap_or_else(|e| e.into_inner());
            state.term = init.term;
            state.state = RaftState::Joining;
        }
        node.commit_and_apply(commit_index);
        node
    }

    fn build(
        chunk: ChunkRef,
        hub: Arc<dyn Hub>,
        log: RaftLog,
        peers: BTreeSet<PeerId>,
    ) -> Self {
        Self {
            chunk,
            hub,
            state: Mutex::new(StateInfo {
                state: RaftState::Initializing,
                term: 0,
                leader: None,
                voted_in_term: 0,
                voted_for: None,
            }),
            log: RwLock::new(log),
            peers: Mutex::new(peers),
            trackers: Mutex::new(BTreeMap::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            election_timeout: Mutex::new(random_election_timeout()),
            data: RwLock::new(Box::new(RamChunkData::new())),
            chunk_lock: Mutex::new(ChunkLockState::default()),
            lock_queue: Mutex::new(VecDeque::new()),
            pending_inserts: Mutex::new(Vec::new()),
            multi_chunk: Mutex::new(BTreeMap::new()),
            apply_mutex: Mutex::new(()),
            progress: Mutex::new((0, 0)),
            progress_cv: Condvar::new(),
            tracker_hint: Mutex::new(0),
            tracker_cv: Condvar::new(),
            internal_serial: AtomicU64::new(1),
            running: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            manager: Mutex::new(None),
            triggers: Mutex::new(Vec::new()),
        }
    }

    pub fn chunk_ref(&self) -> &ChunkRef {
        &self.chunk
    }

    pub fn own_peer(&self) -> &PeerId {
        self.hub.own_peer()
    }

    // =====================================================================
    // Lifecycle
    // =====================================================================

    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(state.state, RaftState::Initializing | RaftState::Joining) {
                state.state = RaftState::Follower;
            }
        }
        self.touch_heartbeat();
        self.running.store(true, Ordering::SeqCst);
        let node = Arc::clone(self);
        let handle = std::thread::spawn(move || node.state_manager_loop());
        *self.manager.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn stop(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        self.tracker_cv.notify_all();
        if let Some(handle) = self
            .manager
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
        self.shut_down_all_trackers();
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.exiting.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RaftState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn term(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).term
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .leader
            .clone()
    }

    pub fn num_peers(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn peer_list(&self) -> Vec<PeerId> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn with_data<R>(&self, action: impl FnOnce(&dyn ChunkData) -> R) -> R {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        action(data.as_ref())
    }

    pub fn attach_trigger(&self, trigger: TriggerFn) {
        self.triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(trigger);
    }

    pub fn chunk_lock_holder(&self) -> Option<PeerId> {
        self.chunk_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .holder
            .clone()
    }

    pub fn chunk_lock_index(&self) -> u64 {
        self.chunk_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .lock_index
    }

    fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    fn next_internal_serial(&self) -> u64 {
        self.internal_serial.fetch_add(1, Ordering::SeqCst)
    }

    // =====================================================================
    // State manager thread
    // =====================================================================

    fn state_manager_loop(self: Arc<Self>) {
        while !self.exiting.load(Ordering::SeqCst) {
            let state = self.state();
            match state {
                RaftState::Follower | RaftState::Candidate | RaftState::LostConnection => {
                    // Trackers of a lost leadership exit on their own; their
                    // handles are reaped here, off the tracker threads.
                    self.shut_down_all_trackers();
                    let timeout = *self
                        .election_timeout
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    if self.heartbeat_age() > timeout {
                        self.conduct_election();
                    }
                }
                RaftState::Leader => {
                    self.leader_duties();
                }
                RaftState::Disconnecting => break,
                RaftState::Initializing | RaftState::Joining => {}
            }
            std::thread::sleep(MANAGER_TICK);
        }
    }

    // =====================================================================
    // Leader election
    // =====================================================================

    fn conduct_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.state = RaftState::Candidate;
            state.term += 1;
            state.leader = None;
            state.voted_in_term = state.term;
            state.voted_for = Some(self.own_peer().clone());
            let term = state.term;
            drop(state);
            let log = self.log.read().unwrap_or_else(|e| e.into_inner());
            (term, log.last_index(), log.last_term())
        };
        self.touch_heartbeat();
        *self
            .election_timeout
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = random_election_timeout();

        let peers = self.peer_list();
        let mut votes = 1usize; // own vote
        let mut reachable = 0usize;
        for peer in &peers {
            let request = Payload::Vote {
                chunk: self.chunk.clone(),
                term,
                last_log_index,
                last_log_term,
            };
            match self.hub.request(peer, request) {
                Ok(response) => {
                    reachable += 1;
                    match response.payload {
                        Payload::VoteResponse {
                            term: remote_term,
                            granted,
                        } => {
                            if remote_term > term {
                                self.demote(remote_term);
                                return;
                            }
                            if granted {
                                votes += 1;
                            }
                        }
                        other => {
                            tracing::debug!(kind = other.kind(), "unexpected vote response");
                        }
                    }
                }
                Err(NetError::PeerUnreachable { .. }) => {}
                Err(error) => {
                    tracing::debug!(%error, %peer, "vote request failed");
                }
            }
        }

        if !peers.is_empty() && reachable == 0 {
            // Nobody answered at all: this side of the network is gone.
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.state == RaftState::Candidate && state.term == term {
                state.state = RaftState::LostConnection;
            }
            return;
        }

        let cluster = peers.len() + 1;
        if votes * 2 > cluster {
            self.become_leader(term);
        } else {
            tracing::debug!(
                chunk = %self.chunk.chunk_id,
                term,
                votes,
                cluster,
                "election lost, retrying after timeout"
            );
        }
    }

    fn become_leader(self: &Arc<Self>, term: u64) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.term != term || state.state != RaftState::Candidate {
                return;
            }
            state.state = RaftState::Leader;
            state.leader = Some(self.own_peer().clone());
        }
        tracing::info!(chunk = %self.chunk.chunk_id, term, "elected leader");
        for peer in self.peer_list() {
            self.launch_tracker(peer, term);
        }
        // An entry in the new term lets older entries commit.
        let own = self.own_peer().clone();
        let serial = self.next_internal_serial();
        self.leader_append(
            term,
            own,
            serial,
            LogEntryKind::Other {
                tag: "leader-ready".to_string(),
            },
        );
    }

    /// Fall back to follower in a newer term. Never joins tracker threads,
    /// so it is safe to call from a tracker itself; the manager thread reaps
    /// exited trackers.
    fn demote(&self, term: u64) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if term > state.term {
                state.term = term;
                state.voted_for = None;
            }
            if state.state == RaftState::Leader || state.state == RaftState::Candidate {
                state.state = RaftState::Follower;
                state.leader = None;
            }
        }
        self.touch_heartbeat();
    }

    /// Voluntary leadership hand-off: stop acting as leader and let the
    /// election timeout elect a successor.
    pub fn give_up_leadership(&self) -> bool {
        let stepped = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.state != RaftState::Leader {
                return false;
            }
            state.state = RaftState::Follower;
            state.leader = None;
            true
        };
        self.shut_down_all_trackers();
        self.touch_heartbeat();
        // Bias the next election toward another peer.
        *self
            .election_timeout
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Duration::from_millis(300);
        tracing::info!(chunk = %self.chunk.chunk_id, "gave up leadership");
        stepped
    }

    // =====================================================================
    // Follower trackers (leader side)
    // =====================================================================

    fn launch_tracker(self: &Arc<Self>, peer: PeerId, term: u64) {
        let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        if trackers.contains_key(&peer) {
            return;
        }
        let run = Arc::new(AtomicBool::new(true));
        let replication_index = Arc::new(AtomicU64::new(0));
        let failures = Arc::new(AtomicU32::new(0));
        let node = Arc::clone(self);
        let thread_peer = peer.clone();
        let thread_run = Arc::clone(&run);
        let thread_replication = Arc::clone(&replication_index);
        let thread_failures = Arc::clone(&failures);
        let handle = std::thread::spawn(move || {
            node.follower_tracker_loop(
                thread_peer,
                term,
                thread_run,
                thread_replication,
                thread_failures,
            );
        });
        trackers.insert(
            peer,
            FollowerTracker {
                run,
                replication_index,
                failures,
                eviction_pending: false,
                handle: Some(handle),
            },
        );
    }

    fn shut_down_tracker(&self, peer: &PeerId) {
        let tracker = {
            let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
            trackers.remove(peer)
        };
        if let Some(mut tracker) = tracker {
            tracker.run.store(false, Ordering::SeqCst);
            self.tracker_cv.notify_all();
            if let Some(handle) = tracker.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn shut_down_all_trackers(&self) {
        let peers: Vec<PeerId> = {
            let trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
            trackers.keys().cloned().collect()
        };
        for peer in peers {
            self.shut_down_tracker(&peer);
        }
    }

    fn follower_tracker_loop(
        self: Arc<Self>,
        peer: PeerId,
        term: u64,
        run: Arc<AtomicBool>,
        replication_index: Arc<AtomicU64>,
        failures: Arc<AtomicU32>,
    ) {
        while run.load(Ordering::SeqCst) && !self.exiting.load(Ordering::SeqCst) {
            {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.state != RaftState::Leader || state.term != term {
                    break;
                }
            }
            let (prev_log_index, prev_log_term, commit_index, entries) = {
                let log = self.log.read().unwrap_or_else(|e| e.into_inner());
                let next = replication_index.load(Ordering::SeqCst) + 1;
                let mut entries = log.entries_from(next);
                entries.truncate(APPEND_BATCH_LIMIT);
                (
                    next - 1,
                    log.term_of(next - 1),
                    log.commit_index(),
                    entries,
                )
            };
            let request = Payload::AppendEntries(AppendEntries {
                chunk: self.chunk.clone(),
                term,
                leader: self.own_peer().clone(),
                prev_log_index,
                prev_log_term,
                commit_index,
                entries,
            });
            match self.hub.request(&peer, request) {
                Ok(response) => match response.payload {
                    Payload::AppendResponse {
                        term: remote_term,
                        last_log_index,
                        status,
                        ..
                    } => {
                        failures.store(0, Ordering::SeqCst);
                        match status {
                            AppendStatus::Accepted => {
                                replication_index.store(last_log_index, Ordering::SeqCst);
                            }
                            AppendStatus::PreviousMismatch => {
                                // Back up; the follower's log ends earlier or
                                // diverges.
                                let backed = prev_log_index
                                    .saturating_sub(1)
                                    .min(last_log_index);
                                replication_index.store(backed, Ordering::SeqCst);
                            }
                            AppendStatus::StaleTerm => {
                                // State only; the manager thread reaps this
                                // tracker after it returns.
                                self.demote(remote_term);
                                return;
                            }
                        }
                    }
                    other => {
                        tracing::debug!(kind = other.kind(), "unexpected append response");
                    }
                },
                Err(NetError::PeerUnreachable { .. }) => {
                    failures.fetch_add(1, Ordering::SeqCst);
                }
                Err(error) => {
                    tracing::debug!(%error, %peer, "append entries failed");
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            }

            // Sleep one heartbeat or until a new entry arrives.
            let hint = self.tracker_hint.lock().unwrap_or_else(|e| e.into_inner());
            let _ = self
                .tracker_cv
                .wait_timeout(hint, HEARTBEAT_PERIOD)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn wake_trackers(&self) {
        let mut hint = self.tracker_hint.lock().unwrap_or_else(|e| e.into_inner());
        *hint += 1;
        drop(hint);
        self.tracker_cv.notify_all();
    }

    fn leader_duties(self: &Arc<Self>) {
        let term = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.state != RaftState::Leader {
                return;
            }
            state.term
        };

        // New peers learned through committed AddPeer entries need trackers.
        for peer in self.peer_list() {
            self.launch_tracker(peer, term);
        }

        // Majority replication index; own log counts as one voter.
        let own_last = {
            let log = self.log.read().unwrap_or_else(|e| e.into_inner());
            log.last_index()
        };
        let mut indices = vec![own_last];
        let mut evict = Vec::new();
        {
            let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
            for (peer, tracker) in trackers.iter_mut() {
                indices.push(tracker.replication_index.load(Ordering::SeqCst));
                if tracker.failures.load(Ordering::SeqCst) >= EVICTION_FAILURE_LIMIT
                    && !tracker.eviction_pending
                {
                    tracker.eviction_pending = true;
                    evict.push(peer.clone());
                }
            }
        }
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let majority_index = indices[indices.len() / 2];

        let commit_ready = {
            let log = self.log.read().unwrap_or_else(|e| e.into_inner());
            majority_index > log.commit_index() && log.term_of(majority_index) == term
        };
        if commit_ready {
            self.commit_and_apply(majority_index);
        }

        for peer in evict {
            tracing::warn!(
                %peer,
                chunk = %self.chunk.chunk_id,
                "peer stopped responding, evicting from swarm"
            );
            let own = self.own_peer().clone();
            let serial = self.next_internal_serial();
            self.leader_append(term, own, serial, LogEntryKind::RemovePeer { peer });
        }
    }

    // =====================================================================
    // Log handling
    // =====================================================================

    /// Append on the leader; returns the assigned index (or the existing one
    /// for a retried serial).
    fn leader_append(
        self: &Arc<Self>,
        term: u64,
        sender: PeerId,
        serial_id: u64,
        kind: LogEntryKind,
    ) -> u64 {
        let index = {
            let mut log = self.log.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = log.find_serial(&sender, serial_id) {
                return existing;
            }
            log.append(term, sender, serial_id, kind)
        };
        self.wake_trackers();
        if self.num_peers() == 0 {
            // Single-holder chunk: committed immediately.
            self.commit_and_apply(index);
        }
        index
    }

    /// Raise the commit index and run the per-kind handlers in index order.
    fn commit_and_apply(self: &Arc<Self>, to: u64) {
        let _guard = self.apply_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let newly = {
            let mut log = self.log.write().unwrap_or_else(|e| e.into_inner());
            log.commit_up_to(to)
        };
        for entry in &newly {
            self.apply_entry(entry);
            let mut log = self.log.write().unwrap_or_else(|e| e.into_inner());
            log.mark_applied(entry.index);
        }
        let (commit_index, applied_index) = {
            let log = self.log.read().unwrap_or_else(|e| e.into_inner());
            (log.commit_index(), log.applied_index())
        };
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        *progress = (commit_index, applied_index);
        drop(progress);
        self.progress_cv.notify_all();
    }

    fn apply_entry(self: &Arc<Self>, entry: &LogEntry) {
        match &entry.kind {
            LogEntryKind::AddPeer { peer } => {
                if peer == self.own_peer() {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    if state.state == RaftState::Joining {
                        state.state = RaftState::Follower;
                    }
                } else {
                    self.peers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(peer.clone());
                }
            }
            LogEntryKind::RemovePeer { peer } => {
                if peer == self.own_peer() {
                    tracing::info!(chunk = %self.chunk.chunk_id, "removed from swarm, disconnecting");
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.state = RaftState::Disconnecting;
                    self.exiting.store(true, Ordering::SeqCst);
                } else {
                    self.peers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(peer);
                    self.shut_down_tracker(peer);
                }
            }
            LogEntryKind::LockRequest { peer } => {
                let mut lock = self.chunk_lock.lock().unwrap_or_else(|e| e.into_inner());
                if lock.holder.is_none() {
                    lock.holder = Some(peer.clone());
                    lock.lock_index = entry.index;
                } else {
                    self.lock_queue
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_back((peer.clone(), entry.index));
                }
            }
            LogEntryKind::UnlockRequest {
                peer,
                lock_index,
                proceed_commits,
            } => {
                self.apply_unlock(peer, *lock_index, *proceed_commits);
            }
            LogEntryKind::InsertRevision { revision } => {
                let holder = self.chunk_lock_holder();
                if holder.as_ref() != Some(&entry.sender) {
                    tracing::warn!(
                        chunk = %self.chunk.chunk_id,
                        sender = %entry.sender,
                        "insert from non-holder skipped"
                    );
                    return;
                }
                match decode_revision(revision) {
                    Ok(revision) => {
                        self.pending_inserts
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(revision.into_handle());
                    }
                    Err(error) => {
                        tracing::error!(%error, chunk = %self.chunk.chunk_id, "undecodable committed revision");
                    }
                }
            }
            LogEntryKind::MultiChunkInfo(info) => {
                self.multi_chunk
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(
                        info.transaction_id,
                        MultiChunkTxn {
                            info: info.clone(),
                            decided: None,
                        },
                    );
            }
            LogEntryKind::Other { .. } => {}
        }
    }

    fn apply_unlock(&self, peer: &PeerId, lock_index: u64, proceed_commits: bool) {
        let mut lock = self.chunk_lock.lock().unwrap_or_else(|e| e.into_inner());
        if lock.holder.as_ref() != Some(peer) || lock.lock_index != lock_index {
            tracing::warn!(
                chunk = %self.chunk.chunk_id,
                %peer,
                "unlock from non-holder ignored"
            );
            return;
        }
        lock.holder = None;
        lock.lock_index = 0;
        let next = self
            .lock_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some((next_peer, index)) = next {
            lock.holder = Some(next_peer);
            lock.lock_index = index;
        }
        drop(lock);

        let staged = std::mem::take(
            &mut *self
                .pending_inserts
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        if !proceed_commits {
            if !staged.is_empty() {
                tracing::debug!(
                    chunk = %self.chunk.chunk_id,
                    discarded = staged.len(),
                    "unlock discarded queued inserts"
                );
            }
            return;
        }
        let mut insertions = BTreeSet::new();
        {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            for revision in staged {
                insertions.insert(revision.item_id());
                data.patch(revision);
            }
        }
        if !insertions.is_empty() {
            let triggers = {
                let guard = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
                guard.clone()
            };
            let updates = BTreeSet::new();
            for trigger in triggers {
                trigger(&insertions, &updates);
            }
        }
    }

    /// Wait until the entry at `index` is committed in `term`.
    fn wait_commit(&self, index: u64, term: u64) -> bool {
        let deadline = Instant::now() + COMMIT_WAIT_LIMIT;
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if progress.0 >= index {
                drop(progress);
                let log = self.log.read().unwrap_or_else(|e| e.into_inner());
                return log.term_of(index) == term;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, timeout) = self
                .progress_cv
                .wait_timeout(progress, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            progress = next;
            if timeout.timed_out() && progress.0 < index {
                return false;
            }
        }
    }

    /// Wait until the local state machine has applied through `index`.
    pub fn wait_applied(&self, index: u64) -> bool {
        let deadline = Instant::now() + COMMIT_WAIT_LIMIT;
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        while progress.1 < index {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .progress_cv
                .wait_timeout(progress, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            progress = next;
        }
        true
    }

    /// Install a revision with its original timestamps, bypassing the log.
    /// Archive reload only; the chunk must not be shared yet.
    pub fn restore_local(&self, revision: crate::core::revision::Revision) {
        assert_eq!(self.num_peers(), 0, "restore into a shared chunk");
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.patch(revision.into_handle());
    }

    pub fn commit_index(&self) -> u64 {
        self.log
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .commit_index()
    }

    pub fn last_log_index(&self) -> u64 {
        self.log
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_index()
    }

    // =====================================================================
    // Inbound handlers
    // =====================================================================

    pub fn handle_append_entries(self: &Arc<Self>, append: &AppendEntries) -> Payload {
        let mut stale = false;
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if append.term < state.term {
                stale = true;
            } else {
                if append.term > state.term {
                    state.term = append.term;
                    state.voted_for = None;
                }
                state.leader = Some(append.leader.clone());
                if matches!(
                    state.state,
                    RaftState::Candidate | RaftState::Leader | RaftState::LostConnection
                ) {
                    state.state = RaftState::Follower;
                }
            }
        }
        if stale {
            let (term, last_log_index, last_log_term, commit_index) = self.log_status();
            return Payload::AppendResponse {
                term,
                last_log_index,
                last_log_term,
                commit_index,
                status: AppendStatus::StaleTerm,
            };
        }
        self.touch_heartbeat();

        let accepted = {
            let mut log = self.log.write().unwrap_or_else(|e| e.into_inner());
            if append.prev_log_index > log.last_index()
                || log.term_of(append.prev_log_index) != append.prev_log_term
            {
                false
            } else {
                log.splice(append.prev_log_index, append.entries.clone());
                true
            }
        };
        if accepted {
            self.commit_and_apply(append.commit_index);
        }

        let (term, last_log_index, last_log_term, commit_index) = self.log_status();
        Payload::AppendResponse {
            term,
            last_log_index,
            last_log_term,
            commit_index,
            status: if accepted {
                AppendStatus::Accepted
            } else {
                AppendStatus::PreviousMismatch
            },
        }
    }

    fn log_status(&self) -> (u64, u64, u64, u64) {
        let term = self.term();
        let log = self.log.read().unwrap_or_else(|e| e.into_inner());
        (term, log.last_index(), log.last_term(), log.commit_index())
    }

    pub fn handle_vote(
        &self,
        candidate: &PeerId,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Payload {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if term < state.term {
            return Payload::VoteResponse {
                term: state.term,
                granted: false,
            };
        }
        if term > state.term {
            state.term = term;
            state.voted_for = None;
            if matches!(state.state, RaftState::Leader | RaftState::Candidate) {
                state.state = RaftState::Follower;
                state.leader = None;
            }
        }
        let (own_last_index, own_last_term) = {
            let log = self.log.read().unwrap_or_else(|e| e.into_inner());
            (log.last_index(), log.last_term())
        };
        let log_current_enough =
            (last_log_term, last_log_index) >= (own_last_term, own_last_index);
        let already_voted =
            state.voted_in_term == term && state.voted_for.as_ref() != Some(candidate);
        let granted = log_current_enough && !already_voted;
        if granted {
            state.voted_in_term = term;
            state.voted_for = Some(candidate.clone());
        }
        let response_term = state.term;
        drop(state);
        if granted {
            self.touch_heartbeat();
        }
        Payload::VoteResponse {
            term: response_term,
            granted,
        }
    }

    pub fn handle_query_state(&self) -> Payload {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let term = state.term;
        let leader = state.leader.clone();
        drop(state);
        let log = self.log.read().unwrap_or_else(|e| e.into_inner());
        Payload::QueryStateResponse {
            term,
            leader,
            last_log_index: log.last_index(),
            commit_index: log.commit_index(),
        }
    }

    fn leader_guard(&self) -> Result<(u64, PeerId), Payload> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.state == RaftState::Leader {
            Ok((state.term, self.own_peer().clone()))
        } else {
            Err(Payload::NotLeader {
                leader: state.leader.clone(),
            })
        }
    }

    /// Generic leader-side path for client-submitted log entries: dedupe,
    /// append, wait for commit, answer with the landed index.
    pub fn handle_client_entry(
        self: &Arc<Self>,
        sender: &PeerId,
        serial_id: u64,
        kind: LogEntryKind,
    ) -> Payload {
        let (term, _own) = match self.leader_guard() {
            Ok(ok) => ok,
            Err(response) => return response,
        };
        if let LogEntryKind::InsertRevision { .. } = &kind {
            let holder = self.chunk_lock_holder();
            if holder.as_ref() != Some(sender) {
                return Payload::Decline {
                    reason: "not the chunk lock holder".to_string(),
                };
            }
        }
        let index = self.leader_append(term, sender.clone(), serial_id, kind);
        if self.wait_commit(index, term) {
            Payload::RaftRequestResponse { entry_index: index }
        } else {
            Payload::Decline {
                reason: "entry failed to commit".to_string(),
            }
        }
    }

    /// Leader-side join: add the peer through the log, then ship the
    /// log + peer snapshot.
    pub fn handle_connect(self: &Arc<Self>, joiner: &PeerId) -> Payload {
        let (term, own) = match self.leader_guard() {
            Ok(ok) => ok,
            Err(response) => return response,
        };
        if self.peer_list().contains(joiner) {
            return Payload::Redundant;
        }
        let serial = self.next_internal_serial();
        let index = self.leader_append(
            term,
            own,
            serial,
            LogEntryKind::AddPeer {
                peer: joiner.clone(),
            },
        );
        if !self.wait_commit(index, term) {
            return Payload::Decline {
                reason: "membership change failed to commit".to_string(),
            };
        }
        let (entries, commit_index) = {
            let log = self.log.read().unwrap_or_else(|e| e.into_inner());
            (log.snapshot(), log.commit_index())
        };
        let mut peers = self.peer_list();
        peers.push(self.own_peer().clone());
        Payload::RaftConnectResponse(RaftInit {
            chunk: self.chunk.clone(),
            term: self.term(),
            commit_index,
            peers,
            entries,
        })
    }

    pub fn handle_txn_query(&self, transaction_id: &Id, action: crate::net::proto::TxnQueryAction) -> Payload {
        use crate::net::proto::TxnQueryAction;
        let mut registry = self.multi_chunk.lock().unwrap_or_else(|e| e.into_inner());
        let Some(txn) = registry.get_mut(transaction_id) else {
            return Payload::Decline {
                reason: "unknown multi-chunk transaction".to_string(),
            };
        };
        match action {
            TxnQueryAction::ReadyToCommit => {
                // Ready once the lock entry and the info entry have both
                // committed; the holder must be the initiator.
                let holder = self
                    .chunk_lock
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .holder
                    .clone();
                if holder.is_some() {
                    Payload::Ack
                } else {
                    Payload::Decline {
                        reason: "chunk lock not held".to_string(),
                    }
                }
            }
            TxnQueryAction::Commit => {
                txn.decided = Some(true);
                Payload::Ack
            }
            TxnQueryAction::Abort => {
                txn.decided = Some(false);
                Payload::Ack
            }
        }
    }

    pub fn multi_chunk_decision(&self, transaction_id: &Id) -> Option<bool> {
        self.multi_chunk
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(transaction_id)
            .and_then(|txn| txn.decided)
    }

    pub fn multi_chunk_participants(&self, transaction_id: &Id) -> Option<MultiChunkInfo> {
        self.multi_chunk
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(transaction_id)
            .map(|txn| txn.info.clone())
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.exiting.store(true, Ordering::SeqCst);
    }
}
