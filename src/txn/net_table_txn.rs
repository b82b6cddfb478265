//! Per-table transaction: one chunk transaction per touched chunk, kept in
//! chunk-id order so lock acquisition follows the global ordering.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chunk::Chunk;
use crate::core::container::RevisionMap;
use crate::core::identity::{ChunkId, ItemId};
use crate::core::revision::{Revision, RevisionHandle};
use crate::core::time::LogicalTime;
use crate::table::{NetTable, TrackerExtractor};

use super::chunk_txn::{ChunkTransaction, CommitFuture, Conflicts};
use super::workspace::Workspace;

pub struct NetTableTransaction {
    begin_time: LogicalTime,
    table: Arc<NetTable>,
    workspace: Arc<Workspace>,
    chunk_txns: BTreeMap<ChunkId, ChunkTransaction>,
    // Commit futures of a predecessor transaction, consumed as chunk
    // transactions are opened.
    futures: BTreeMap<ChunkId, CommitFuture>,
    tracker_overrides: BTreeMap<String, TrackerExtractor>,
}

impl NetTableTransaction {
    pub fn new(begin_time: LogicalTime, table: Arc<NetTable>, workspace: Arc<Workspace>) -> Self {
        Self::with_futures(begin_time, table, workspace, BTreeMap::new())
    }

    pub fn with_futures(
        begin_time: LogicalTime,
        table: Arc<NetTable>,
        workspace: Arc<Workspace>,
        futures: BTreeMap<ChunkId, CommitFuture>,
    ) -> Self {
        Self {
            begin_time,
            table,
            workspace,
            chunk_txns: BTreeMap::new(),
            futures,
            tracker_overrides: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &Arc<NetTable> {
        &self.table
    }

    fn txn_of(&mut self, chunk: &Chunk) -> &mut ChunkTransaction {
        let id = chunk.id();
        let begin_time = self.begin_time;
        let future = self.futures.remove(&id);
        self.chunk_txns
            .entry(id)
            .or_insert_with(|| ChunkTransaction::new(begin_time, chunk.clone(), future))
    }

    // =====================================================================
    // Reads
    // =====================================================================

    fn latest_chunk_of(&self, id: &ItemId) -> Option<Chunk> {
        let now = LogicalTime::from_serialized(u64::MAX);
        for chunk in self.table.active_chunks() {
            if chunk.get_by_id(id, now).is_some() {
                return Some(chunk);
            }
        }
        None
    }

    pub fn get_by_id(&mut self, id: &ItemId) -> Option<RevisionHandle> {
        for txn in self.chunk_txns.values() {
            if let Some(revision) = txn.get_by_id_from_uncommitted(id) {
                return Some(revision);
            }
        }
        // An open chunk transaction may know the item through its original
        // view (including a predecessor's commit future).
        for txn in self.chunk_txns.values() {
            if let Some(revision) = txn.get_by_id(id) {
                return Some(revision);
            }
        }
        // Items pending in a not-yet-applied parallel commit exist only in
        // its future, not in the chunk itself yet.
        let pending = self
            .futures
            .iter()
            .find(|(_, future)| future.contains(id))
            .map(|(chunk_id, _)| *chunk_id);
        let chunk = match pending {
            Some(chunk_id) => self.table.local_chunk(&chunk_id)?,
            None => self.latest_chunk_of(id)?,
        };
        if !self.workspace.contains(self.table.name(), &chunk.id()) {
            return None;
        }
        self.txn_of(&chunk).get_by_id(id)
    }

    pub fn get_by_id_in_chunk(&mut self, id: &ItemId, chunk: &Chunk) -> Option<RevisionHandle> {
        if !self.workspace.contains(self.table.name(), &chunk.id()) {
            return None;
        }
        self.txn_of(chunk).get_by_id(id)
    }

    pub fn dump_chunk(&mut self, chunk: &Chunk) -> RevisionMap {
        if !self.workspace.contains(self.table.name(), &chunk.id()) {
            return RevisionMap::new();
        }
        self.txn_of(chunk).dump()
    }

    pub fn dump_active_chunks(&mut self) -> RevisionMap {
        let mut chunks = Vec::new();
        let workspace = Arc::clone(&self.workspace);
        workspace.for_each_chunk(&self.table, |chunk| chunks.push(chunk.clone()));
        let mut result = RevisionMap::new();
        for chunk in chunks {
            result.append(&mut self.txn_of(&chunk).dump());
        }
        result
    }

    pub fn get_available_ids(&mut self) -> Vec<ItemId> {
        self.dump_active_chunks().into_keys().collect()
    }

    /// Committed-state scan at begin time; uncommitted changes are not
    /// searched.
    pub fn find_by_field(
        &self,
        key: usize,
        value: &crate::core::revision::Value,
    ) -> RevisionMap {
        let mut result = RevisionMap::new();
        let begin_time = self.begin_time;
        self.workspace.for_each_chunk(&self.table, |chunk| {
            let mut found =
                chunk.with_data(|data| data.find_by_field(Some(key), value, begin_time));
            result.append(&mut found);
        });
        result
    }

    // =====================================================================
    // Writes
    // =====================================================================

    pub fn insert(&mut self, chunk: &Chunk, revision: Revision) {
        self.txn_of(chunk).insert(revision);
    }

    pub fn update(&mut self, revision: Revision) {
        let chunk = self
            .table
            .get_chunk(&revision.chunk_id())
            .unwrap_or_else(|| {
                panic!(
                    "update of item {} targets unheld chunk {}",
                    revision.item_id(),
                    revision.chunk_id()
                )
            });
        self.txn_of(&chunk).update(revision);
    }

    pub fn remove(&mut self, revision: Revision) {
        let chunk = self
            .table
            .get_chunk(&revision.chunk_id())
            .unwrap_or_else(|| {
                panic!(
                    "remove of item {} targets unheld chunk {}",
                    revision.item_id(),
                    revision.chunk_id()
                )
            });
        self.txn_of(&chunk).remove(revision);
    }

    pub fn add_conflict_condition(
        &mut self,
        chunk: &Chunk,
        key: usize,
        value: crate::core::revision::Value,
    ) {
        self.txn_of(chunk).add_conflict_condition(key, value);
    }

    // =====================================================================
    // Commit protocol (driven by the multi-table transaction)
    // =====================================================================

    /// Write-lock affected chunks in ascending chunk-id order.
    pub fn lock(&self) {
        for txn in self.chunk_txns.values() {
            txn.chunk().write_lock();
        }
    }

    pub fn check(&mut self) -> bool {
        let table = Arc::clone(&self.table);
        self.chunk_txns
            .values_mut()
            .all(|txn| txn.has_no_conflicts(&table))
    }

    pub fn checked_commit(&mut self, commit_time: LogicalTime) {
        for txn in self.chunk_txns.values_mut() {
            txn.checked_commit(commit_time);
        }
    }

    /// Unlock in reverse lock order. `success = false` discards queued
    /// consensus writes.
    pub fn unlock(&self, success: bool) {
        for txn in self.chunk_txns.values().rev() {
            if success {
                txn.chunk().unlock();
            } else {
                txn.chunk().unlock_discard();
            }
        }
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunk_txns.values().map(|txn| txn.chunk().clone()).collect()
    }

    pub fn num_changed_items(&self) -> usize {
        self.chunk_txns
            .values()
            .map(|txn| txn.num_changed_items())
            .sum()
    }

    pub fn materialize_futures(&self, commit_time: LogicalTime) -> BTreeMap<ChunkId, CommitFuture> {
        self.chunk_txns
            .iter()
            .map(|(id, txn)| (*id, txn.materialize_future(commit_time)))
            .collect()
    }

    pub fn merge_into(&mut self, target: &mut NetTableTransaction, conflicts: &mut Conflicts) {
        for (id, txn) in self.chunk_txns.iter_mut() {
            let chunk = txn.chunk().clone();
            let _ = id;
            let target_txn = target.txn_of(&chunk);
            txn.merge_into(target_txn, conflicts);
        }
    }

    // =====================================================================
    // Trackers
    // =====================================================================

    pub fn override_tracker_identification(
        &mut self,
        tracker_table: &str,
        extractor: TrackerExtractor,
    ) {
        assert!(
            self.table.new_chunk_trackers().contains_key(tracker_table),
            "override for a tracker table that is not tracked"
        );
        self.tracker_overrides
            .insert(tracker_table.to_string(), extractor);
    }

    /// `chunk id -> tracker table -> tracking items` for every chunk this
    /// transaction inserts into.
    pub fn collect_chunk_trackers(
        &self,
        out: &mut BTreeMap<ChunkId, BTreeMap<String, Vec<ItemId>>>,
    ) {
        let declarations = self.table.new_chunk_trackers();
        if declarations.is_empty() {
            return;
        }
        for (chunk_id, txn) in &self.chunk_txns {
            let mut trackers = BTreeMap::new();
            txn.collect_trackers(&declarations, &self.tracker_overrides, &mut trackers);
            if !trackers.is_empty() {
                out.insert(*chunk_id, trackers);
            }
        }
    }
}
