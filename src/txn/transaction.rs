//! Multi-chunk, multi-table transactions.
//!
//! Sub-transactions are kept in table-name order and each locks its chunks
//! in chunk-id order, giving the global lock ordering that prevents
//! deadlock. The commit time is sampled while every affected chunk is
//! write-locked, which makes it the transaction's single linearization
//! point.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::chunk::Chunk;
use crate::core::container::RevisionMap;
use crate::core::identity::{ChunkId, Id, ItemId};
use crate::core::revision::{Revision, RevisionHandle, TrackeeMap};
use crate::core::time::{LogicalClock, LogicalTime};
use crate::net::proto::{ChunkRef, MultiChunkInfo};
use crate::table::{NetTable, NetTableManager};

use super::chunk_txn::{CommitFuture, Conflicts};
use super::net_table_txn::NetTableTransaction;
use super::workspace::Workspace;

/// Unresolved conflicts per table, reported by the merge API.
pub type ConflictMap = BTreeMap<String, Conflicts>;

pub type TableFutures = BTreeMap<String, BTreeMap<ChunkId, CommitFuture>>;

/// Handle to a commit whose write phase runs in the background. The futures
/// expose the not-yet-applied effects to a successor transaction.
pub struct ParallelCommit {
    futures: TableFutures,
    handle: JoinHandle<()>,
}

impl ParallelCommit {
    pub fn futures(&self) -> &TableFutures {
        &self.futures
    }

    /// Block until the write phase has been applied and unlocked.
    pub fn join(self) {
        let _ = self.handle.join();
    }
}

pub struct Transaction {
    begin_time: LogicalTime,
    clock: Arc<LogicalClock>,
    manager: Arc<NetTableManager>,
    workspace: Arc<Workspace>,
    table_txns: BTreeMap<String, NetTableTransaction>,
    futures: TableFutures,
    commit_time: Option<LogicalTime>,
    chunk_tracking_disabled: bool,
    blame_commit: bool,
}

impl Transaction {
    pub fn begin(manager: Arc<NetTableManager>) -> Self {
        let workspace = Arc::new(Workspace::new());
        Self::begin_with(manager, workspace)
    }

    pub fn begin_with(manager: Arc<NetTableManager>, workspace: Arc<Workspace>) -> Self {
        let clock = Arc::clone(manager.clock());
        let begin_time = clock.sample();
        Self::build(manager, clock, workspace, begin_time, TableFutures::new())
    }

    pub fn begin_at(manager: Arc<NetTableManager>, begin_time: LogicalTime) -> Self {
        let clock = Arc::clone(manager.clock());
        assert!(
            begin_time < clock.sample(),
            "begin time must precede the present"
        );
        Self::build(
            manager,
            clock,
            Arc::new(Workspace::new()),
            begin_time,
            TableFutures::new(),
        )
    }

    /// Begin on top of a parallel commit: this transaction sees the
    /// predecessor's not-yet-applied writes.
    pub fn begin_on(manager: Arc<NetTableManager>, predecessor: &ParallelCommit) -> Self {
        let clock = Arc::clone(manager.clock());
        let begin_time = clock.sample();
        Self::build(
            manager,
            clock,
            Arc::new(Workspace::new()),
            begin_time,
            predecessor.futures().clone(),
        )
    }

    fn build(
        manager: Arc<NetTableManager>,
        clock: Arc<LogicalClock>,
        workspace: Arc<Workspace>,
        begin_time: LogicalTime,
        futures: TableFutures,
    ) -> Self {
        Self {
            begin_time,
            clock,
            manager,
            workspace,
            table_txns: BTreeMap::new(),
            futures,
            commit_time: None,
            chunk_tracking_disabled: false,
            blame_commit: false,
        }
    }

    pub fn begin_time(&self) -> LogicalTime {
        self.begin_time
    }

    pub fn commit_time(&self) -> Option<LogicalTime> {
        self.commit_time
    }

    pub fn disable_chunk_tracking(&mut self) {
        self.chunk_tracking_disabled = true;
    }

    pub fn set_blame_commit(&mut self, blame: bool) {
        self.blame_commit = blame;
    }

    fn txn_of(&mut self, table: &Arc<NetTable>) -> &mut NetTableTransaction {
        let name = table.name().to_string();
        let begin_time = self.begin_time;
        let workspace = Arc::clone(&self.workspace);
        let futures = self.futures.remove(&name).unwrap_or_default();
        self.table_txns
            .entry(name)
            .or_insert_with(|| {
                NetTableTransaction::with_futures(
                    begin_time,
                    Arc::clone(table),
                    workspace,
                    futures,
                )
            })
    }

    // =====================================================================
    // Reads & writes
    // =====================================================================

    pub fn insert(&mut self, table: &Arc<NetTable>, chunk: &Chunk, revision: Revision) {
        self.txn_of(table).insert(chunk, revision);
    }

    pub fn update(&mut self, table: &Arc<NetTable>, revision: Revision) {
        self.txn_of(table).update(revision);
    }

    pub fn remove(&mut self, table: &Arc<NetTable>, revision: Revision) {
        self.txn_of(table).remove(revision);
    }

    pub fn get_by_id(&mut self, table: &Arc<NetTable>, id: &ItemId) -> Option<RevisionHandle> {
        self.txn_of(table).get_by_id(id)
    }

    pub fn dump_chunk(&mut self, table: &Arc<NetTable>, chunk: &Chunk) -> RevisionMap {
        if !self.workspace.contains(table.name(), &chunk.id()) {
            return RevisionMap::new();
        }
        self.txn_of(table).dump_chunk(chunk)
    }

    pub fn dump_active_chunks(&mut self, table: &Arc<NetTable>) -> RevisionMap {
        if !self.workspace.contains_table(table.name()) {
            return RevisionMap::new();
        }
        self.txn_of(table).dump_active_chunks()
    }

    pub fn get_available_ids(&mut self, table: &Arc<NetTable>) -> Vec<ItemId> {
        self.txn_of(table).get_available_ids()
    }

    pub fn find_by_field(
        &mut self,
        table: &Arc<NetTable>,
        key: usize,
        value: &crate::core::revision::Value,
    ) -> RevisionMap {
        self.txn_of(table).find_by_field(key, value)
    }

    pub fn add_conflict_condition(
        &mut self,
        table: &Arc<NetTable>,
        chunk: &Chunk,
        key: usize,
        value: crate::core::revision::Value,
    ) {
        self.txn_of(table).add_conflict_condition(chunk, key, value);
    }

    /// Pull every chunk referenced by trackee maps of items in `table` into
    /// this peer. Returns whether all referenced chunks could be fetched.
    pub fn fetch_all_chunks_tracked_by_items_in(&mut self, table: &Arc<NetTable>) -> bool {
        let ids = self.get_available_ids(table);
        let mut complete = true;
        for id in ids {
            let Some(revision) = self.get_by_id(table, &id) else {
                continue;
            };
            complete &= self.fetch_trackees(&revision);
        }
        complete
    }

    fn fetch_trackees(&mut self, revision: &RevisionHandle) -> bool {
        let mut complete = true;
        for (table_name, chunks) in revision.trackees().tables() {
            let Some(tracked_table) = self.manager.get_table(table_name) else {
                tracing::warn!(table = %table_name, "trackee names unknown table");
                complete = false;
                continue;
            };
            for chunk_id in chunks {
                if tracked_table.get_chunk(chunk_id).is_none() {
                    complete = false;
                }
            }
        }
        complete
    }

    // =====================================================================
    // Commit
    // =====================================================================

    /// Two-phase commit over all affected chunks: lock in global order,
    /// validate, stamp, write, unlock. Returns false on conflict, leaving
    /// the data untouched.
    pub fn commit(&mut self) -> bool {
        self.prepare_commit();
        self.lock_all();

        let coordinator = self.multi_chunk_coordinator();
        if let Some(coordinator) = &coordinator {
            if !coordinator.announce() {
                self.unlock_all(false);
                return false;
            }
        }

        if !self.check_all() || !coordinator.as_ref().map_or(true, |c| c.all_ready()) {
            if let Some(coordinator) = &coordinator {
                coordinator.notify(false);
            }
            self.unlock_all(false);
            return false;
        }

        let commit_time = self.clock.sample();
        self.commit_time = Some(commit_time);
        tracing::debug!(begin = %self.begin_time, commit = %commit_time, "transaction committing");
        for txn in self.table_txns.values_mut() {
            txn.checked_commit(commit_time);
        }
        if let Some(coordinator) = &coordinator {
            coordinator.notify(true);
        }
        self.unlock_all(true);
        true
    }

    /// Lock-and-check synchronously, then hand the write-and-unlock phase to
    /// a background thread. A successor transaction built on the returned
    /// handle sees the pending writes. Returns `None` on conflict.
    pub fn commit_in_parallel(mut self) -> Option<ParallelCommit> {
        self.prepare_commit();
        self.lock_all();

        let coordinator = self.multi_chunk_coordinator();
        if let Some(coordinator) = &coordinator {
            if !coordinator.announce() {
                self.unlock_all(false);
                return None;
            }
        }
        if !self.check_all() || !coordinator.as_ref().map_or(true, |c| c.all_ready()) {
            if let Some(coordinator) = &coordinator {
                coordinator.notify(false);
            }
            self.unlock_all(false);
            return None;
        }

        let commit_time = self.clock.sample();
        self.commit_time = Some(commit_time);
        let futures: TableFutures = self
            .table_txns
            .iter()
            .map(|(name, txn)| (name.clone(), txn.materialize_futures(commit_time)))
            .collect();

        let handle = std::thread::spawn(move || {
            for txn in self.table_txns.values() {
                for chunk in txn.chunks() {
                    chunk.adopt_write_lock();
                }
            }
            for txn in self.table_txns.values_mut() {
                txn.checked_commit(commit_time);
            }
            if let Some(coordinator) = &coordinator {
                coordinator.notify(true);
            }
            self.unlock_all(true);
        });
        Some(ParallelCommit { futures, handle })
    }

    fn prepare_commit(&mut self) {
        if self.blame_commit {
            tracing::info!(
                backtrace = %std::backtrace::Backtrace::force_capture(),
                "transaction committed from"
            );
        }
        if !self.chunk_tracking_disabled {
            self.push_new_chunk_ids_to_trackers();
        }
    }

    fn lock_all(&self) {
        for txn in self.table_txns.values() {
            txn.lock();
        }
    }

    fn check_all(&mut self) -> bool {
        self.table_txns.values_mut().all(|txn| txn.check())
    }

    fn unlock_all(&self, success: bool) {
        for txn in self.table_txns.values().rev() {
            txn.unlock(success);
        }
    }

    pub fn num_changed_items(&self) -> usize {
        self.table_txns
            .values()
            .map(|txn| txn.num_changed_items())
            .sum()
    }

    fn multi_chunk_coordinator(&self) -> Option<MultiChunkCoordinator> {
        let mut participants = Vec::new();
        for txn in self.table_txns.values() {
            for chunk in txn.chunks() {
                if let Chunk::Consensus(consensus) = chunk {
                    participants.push(consensus);
                }
            }
        }
        if participants.len() < 2 {
            return None;
        }
        let refs: Vec<ChunkRef> = participants
            .iter()
            .map(|chunk| ChunkRef {
                table: chunk.table().to_string(),
                chunk_id: chunk.id(),
            })
            .collect();
        let salt: String = refs
            .first()
            .map(|c| c.chunk_id.to_hex())
            .unwrap_or_default();
        Some(MultiChunkCoordinator {
            info: MultiChunkInfo {
                transaction_id: Id::generate(&salt),
                chunks: refs,
            },
            participants,
        })
    }

    // =====================================================================
    // Merge
    // =====================================================================

    /// Route every non-conflicting change into `target` (a fresh
    /// transaction); leftover conflicts land in `conflicts` per table.
    pub fn merge_into(&mut self, target: &mut Transaction, conflicts: &mut ConflictMap) {
        conflicts.clear();
        for (name, txn) in self.table_txns.iter_mut() {
            let table = Arc::clone(txn.table());
            let target_txn = target.txn_of(&table);
            let mut sub_conflicts = Conflicts::new();
            txn.merge_into(target_txn, &mut sub_conflicts);
            if !sub_conflicts.is_empty() {
                conflicts.insert(name.clone(), sub_conflicts);
            }
        }
    }

    // =====================================================================
    // Chunk trackers
    // =====================================================================

    /// Add every chunk this transaction created items in to the trackee map
    /// of its tracking revisions (an implicit update per tracker). Running
    /// twice has the same effect as once: an unchanged trackee map stages no
    /// update.
    fn push_new_chunk_ids_to_trackers(&mut self) {
        // trackee table -> chunk -> tracker table -> tracking items
        let mut per_table: BTreeMap<String, BTreeMap<ChunkId, BTreeMap<String, Vec<ItemId>>>> =
            BTreeMap::new();
        for (name, txn) in &self.table_txns {
            let mut trackers = BTreeMap::new();
            txn.collect_chunk_trackers(&mut trackers);
            if !trackers.is_empty() {
                per_table.insert(name.clone(), trackers);
            }
        }

        // tracker table -> tracking item -> trackee table -> chunks
        let mut to_push: BTreeMap<String, BTreeMap<ItemId, TrackeeMap>> = BTreeMap::new();
        for (trackee_table, chunk_trackers) in per_table {
            for (chunk_id, trackers) in chunk_trackers {
                for (tracker_table, items) in trackers {
                    for item in items {
                        to_push
                            .entry(tracker_table.clone())
                            .or_default()
                            .entry(item)
                            .or_default()
                            .insert(&trackee_table, chunk_id);
                    }
                }
            }
        }

        for (tracker_table, items) in to_push {
            let Some(table) = self.manager.get_table(&tracker_table) else {
                panic!("tracker table {tracker_table} is not registered");
            };
            for (item, trackees) in items {
                let Some(original) = self.get_by_id(&table, &item) else {
                    panic!(
                        "invalid tracker item {item} for trackees in table {tracker_table}"
                    );
                };
                let mut updated = original.copy_for_write();
                if updated.trackees_mut().merge(&trackees) {
                    self.update(&table, updated);
                }
            }
        }
    }
}

/// Two-phase commit across multiple consensus chunks: replicate the
/// participant list into every chunk's log, collect ready votes, then
/// notify the outcome.
struct MultiChunkCoordinator {
    info: MultiChunkInfo,
    participants: Vec<Arc<crate::chunk::ConsensusChunk>>,
}

impl MultiChunkCoordinator {
    fn announce(&self) -> bool {
        for chunk in &self.participants {
            if let Err(error) = chunk.announce_multi_chunk(self.info.clone()) {
                tracing::warn!(%error, chunk = %chunk.id(), "multi-chunk announce failed");
                return false;
            }
        }
        true
    }

    fn all_ready(&self) -> bool {
        self.participants
            .iter()
            .all(|chunk| chunk.query_ready(self.info.transaction_id))
    }

    fn notify(&self, commit: bool) {
        for chunk in &self.participants {
            chunk.notify_decision(self.info.transaction_id, commit);
        }
    }
}
