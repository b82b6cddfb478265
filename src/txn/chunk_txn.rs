//! One-chunk transaction: snapshot view, delta, conflict detection.
//!
//! Reads are layered: the pending delta over the transaction's own commit
//! history over the original view (chunk state at begin time, or a commit
//! future of a predecessor transaction).

use std::collections::BTreeMap;

use crate::chunk::Chunk;
use crate::core::container::RevisionMap;
use crate::core::identity::{ChunkId, ItemId};
use crate::core::revision::{Revision, RevisionHandle, Value};
use crate::core::time::LogicalTime;
use crate::table::{NetTable, TrackerExtractor};

/// Materialized effect of a parallel commit that has not yet been written to
/// the chunk. A successor transaction uses it as its original view, seeing
/// the predecessor's writes as if applied.
#[derive(Clone, Debug, Default)]
pub struct CommitFuture {
    // All items including removed ones; reads filter, conflict checks don't.
    items: BTreeMap<ItemId, RevisionHandle>,
}

impl CommitFuture {
    pub(crate) fn new(items: BTreeMap<ItemId, RevisionHandle>) -> Self {
        Self { items }
    }

    fn get(&self, id: &ItemId) -> Option<RevisionHandle> {
        self.items
            .get(id)
            .filter(|revision| !revision.is_removed())
            .cloned()
    }

    pub(crate) fn contains(&self, id: &ItemId) -> bool {
        self.items.contains_key(id)
    }

    fn dump(&self) -> RevisionMap {
        self.items
            .iter()
            .filter(|(_, revision)| !revision.is_removed())
            .map(|(id, revision)| (*id, revision.clone()))
            .collect()
    }

    fn discard_known_updates(&self, times: &mut BTreeMap<ItemId, LogicalTime>) {
        times.retain(|id, time| match self.items.get(id) {
            Some(known) => known.update_time() < *time,
            None => true,
        });
    }
}

enum OriginalView {
    Chunk { time: LogicalTime },
    Future(CommitFuture),
}

/// A `key == value` predicate that must match zero rows at commit time;
/// used to enforce uniqueness.
pub struct ConflictCondition {
    pub key: usize,
    pub value: Value,
}

/// An unresolved concurrent edit reported by the merge API.
#[derive(Clone, Debug)]
pub struct Conflict {
    pub ours: Option<RevisionHandle>,
    pub theirs: Option<RevisionHandle>,
}

pub type Conflicts = Vec<Conflict>;

/// Pending uncommitted changes of one chunk transaction.
#[derive(Default)]
struct Delta {
    insertions: BTreeMap<ItemId, Revision>,
    updates: BTreeMap<ItemId, Revision>,
    removes: BTreeMap<ItemId, Revision>,
}

impl Delta {
    fn num_changes(&self) -> usize {
        self.insertions.len() + self.updates.len() + self.removes.len()
    }

    fn get(&self, id: &ItemId) -> Option<Option<RevisionHandle>> {
        if self.removes.contains_key(id) {
            return Some(None);
        }
        if let Some(revision) = self.updates.get(id) {
            return Some(Some(revision.clone().into_handle()));
        }
        if let Some(revision) = self.insertions.get(id) {
            return Some(Some(revision.clone().into_handle()));
        }
        None
    }

    fn apply_to(&self, map: &mut RevisionMap) {
        for (id, revision) in &self.insertions {
            map.insert(*id, revision.clone().into_handle());
        }
        for (id, revision) in &self.updates {
            map.insert(*id, revision.clone().into_handle());
        }
        for id in self.removes.keys() {
            map.remove(id);
        }
    }
}

pub struct ChunkTransaction {
    begin_time: LogicalTime,
    chunk: Chunk,
    template: Revision,
    original: OriginalView,
    commit_history: BTreeMap<ItemId, RevisionHandle>,
    delta: Delta,
    conflict_conditions: Vec<ConflictCondition>,
    finalized: bool,
}

impl ChunkTransaction {
    pub fn new(begin_time: LogicalTime, chunk: Chunk, future: Option<CommitFuture>) -> Self {
        let template = chunk.template().clone();
        Self {
            begin_time,
            chunk,
            template,
            original: match future {
                Some(future) => OriginalView::Future(future),
                None => OriginalView::Chunk { time: begin_time },
            },
            commit_history: BTreeMap::new(),
            delta: Delta::default(),
            conflict_conditions: Vec::new(),
            finalized: false,
        }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk.id()
    }

    pub fn begin_time(&self) -> LogicalTime {
        self.begin_time
    }

    pub fn num_changed_items(&self) -> usize {
        assert!(
            self.conflict_conditions.is_empty(),
            "change count not compatible with conflict conditions"
        );
        self.delta.num_changes()
    }

    /// Detach from a predecessor's commit future, reading the chunk itself
    /// instead (after the predecessor's parallel commit landed).
    pub fn detach_future(&mut self) {
        self.original = OriginalView::Chunk {
            time: self.begin_time,
        };
    }

    // =====================================================================
    // Reads: delta over commit history over original
    // =====================================================================

    fn original_get(&self, id: &ItemId) -> Option<RevisionHandle> {
        match &self.original {
            OriginalView::Chunk { time } => self
                .chunk
                .get_by_id(id, *time)
                .filter(|revision| !revision.is_removed()),
            OriginalView::Future(future) => future.get(id),
        }
    }

    pub fn get_by_id(&self, id: &ItemId) -> Option<RevisionHandle> {
        if let Some(outcome) = self.delta.get(id) {
            return outcome;
        }
        if let Some(revision) = self.commit_history.get(id) {
            if revision.is_removed() {
                return None;
            }
            return Some(revision.clone());
        }
        self.original_get(id)
    }

    pub fn get_by_id_from_uncommitted(&self, id: &ItemId) -> Option<RevisionHandle> {
        self.delta.get(id).flatten()
    }

    pub fn dump(&self) -> RevisionMap {
        let mut map = match &self.original {
            OriginalView::Chunk { time } => self.chunk.dump(*time),
            OriginalView::Future(future) => future.dump(),
        };
        for (id, revision) in &self.commit_history {
            if revision.is_removed() {
                map.remove(id);
            } else {
                map.insert(*id, revision.clone());
            }
        }
        self.delta.apply_to(&mut map);
        map
    }

    pub fn available_ids(&self) -> Vec<ItemId> {
        self.dump().into_keys().collect()
    }

    // =====================================================================
    // Writes
    // =====================================================================

    pub fn insert(&mut self, mut revision: Revision) {
        assert!(!self.finalized, "insert into finalized transaction");
        assert!(
            revision.structure_match(&self.template),
            "revision structure does not match table template"
        );
        revision.set_chunk_id(self.chunk.id());
        let id = revision.item_id();
        let previous = self.delta.insertions.insert(id, revision);
        assert!(previous.is_none(), "item {id} staged for insert twice");
    }

    pub fn update(&mut self, revision: Revision) {
        assert!(!self.finalized, "update in finalized transaction");
        assert!(
            revision.structure_match(&self.template),
            "revision structure does not match table template"
        );
        let id = revision.item_id();
        if self.delta.insertions.contains_key(&id) {
            // Updating an uncommitted insert folds into the insert.
            self.delta.insertions.insert(id, revision);
        } else {
            self.delta.updates.insert(id, revision);
        }
    }

    pub fn remove(&mut self, revision: Revision) {
        assert!(!self.finalized, "remove in finalized transaction");
        let id = revision.item_id();
        if self.delta.insertions.remove(&id).is_some() {
            // Removing an uncommitted insert cancels it.
            return;
        }
        self.delta.updates.remove(&id);
        self.delta.removes.insert(id, revision);
    }

    pub fn add_conflict_condition(&mut self, key: usize, value: Value) {
        self.conflict_conditions.push(ConflictCondition { key, value });
    }

    // =====================================================================
    // Commit
    // =====================================================================

    /// Single-chunk convenience: lock, check, commit, unlock.
    pub fn commit(&mut self, table: &NetTable) -> bool {
        self.chunk.write_lock();
        if !self.has_no_conflicts(table) {
            self.chunk.unlock_discard();
            return false;
        }
        let commit_time = table.clock().sample();
        self.checked_commit(commit_time);
        self.chunk.unlock();
        true
    }

    fn discard_known_updates(&self, times: &mut BTreeMap<ItemId, LogicalTime>) {
        match &self.original {
            OriginalView::Chunk { time } => {
                let begin = *time;
                times.retain(|_, update_time| *update_time > begin);
            }
            OriginalView::Future(future) => {
                future.discard_known_updates(times);
            }
        }
        times.retain(|id, update_time| match self.commit_history.get(id) {
            Some(known) => known.update_time() < *update_time,
            None => true,
        });
    }

    /// Under the chunk's write lock: collect concurrent changes, discard
    /// those this transaction knows, auto-merge the rest against the delta's
    /// own updates, then evaluate conflict conditions.
    pub fn has_no_conflicts(&mut self, table: &NetTable) -> bool {
        assert!(!self.finalized, "conflict check may auto-merge");
        assert!(self.chunk.is_write_locked(), "conflict check without lock");
        let mut update_times = self.chunk.update_times();
        self.discard_known_updates(&mut update_times);

        let now = LogicalTime::from_serialized(u64::MAX);
        for (id, _time) in update_times {
            if !self.delta.updates.contains_key(&id) {
                // Changed concurrently and not part of our delta (or staged
                // as an insert/remove of a concurrently touched item):
                // unresolvable.
                tracing::debug!(item = %id, chunk = %self.chunk.id(), "commit conflict");
                return false;
            }
            let Some(conflicting_new) = self.chunk.get_by_id(&id, now) else {
                return false;
            };
            let Some(original) = self.original_get(&id) else {
                return false;
            };
            let local = self
                .delta
                .updates
                .get_mut(&id)
                .expect("update presence checked above");
            if !table.try_auto_merge(&conflicting_new, &original, local) {
                tracing::debug!(item = %id, chunk = %self.chunk.id(), "unmergeable conflict");
                return false;
            }
        }

        for condition in &self.conflict_conditions {
            let matched = self
                .chunk
                .with_data(|data| data.count_by_field(Some(condition.key), &condition.value, now));
            if matched > 0 {
                tracing::debug!(
                    key = condition.key,
                    chunk = %self.chunk.id(),
                    "conflict condition matched"
                );
                return false;
            }
        }
        true
    }

    /// Flush the delta into the chunk at `commit_time`. Lock must be held
    /// and the conflict check must have passed.
    pub fn checked_commit(&mut self, commit_time: LogicalTime) {
        assert!(self.chunk.is_write_locked(), "commit without lock");
        self.finalized = true;

        let insertions = std::mem::take(&mut self.delta.insertions);
        if !insertions.is_empty() {
            let mut staged = BTreeMap::new();
            for (id, mut revision) in insertions {
                revision.set_chunk_id(self.chunk.id());
                revision.set_insert_time(commit_time);
                revision.set_update_time(commit_time);
                self.commit_history
                    .insert(id, revision.clone().into_handle());
                staged.insert(id, revision);
            }
            self.chunk.bulk_insert_locked(staged, commit_time);
        }

        let updates = std::mem::take(&mut self.delta.updates);
        for (id, mut revision) in updates {
            revision.set_chunk_id(self.chunk.id());
            revision.set_update_time(commit_time);
            self.commit_history
                .insert(id, revision.clone().into_handle());
            self.chunk.update_locked(commit_time, revision);
        }

        let removes = std::mem::take(&mut self.delta.removes);
        for (id, mut revision) in removes {
            revision.set_chunk_id(self.chunk.id());
            revision.set_update_time(commit_time);
            revision.set_removed();
            self.commit_history
                .insert(id, revision.clone().into_handle());
            // The removed flag is already set on our copy.
            self.chunk.update_locked(commit_time, revision);
        }
    }

    /// Materialize the post-commit state for a successor transaction before
    /// the writes are physically applied. Lock must be held and the commit
    /// time already sampled.
    pub fn materialize_future(&self, commit_time: LogicalTime) -> CommitFuture {
        let now = LogicalTime::from_serialized(u64::MAX);
        let mut items: BTreeMap<ItemId, RevisionHandle> = self.chunk.with_data(|data| {
            let mut map = BTreeMap::new();
            for (id, _) in data.latest_update_times() {
                if let Some(revision) = data.get_by_id(&id, now) {
                    map.insert(id, revision);
                }
            }
            map
        });
        for (id, revision) in &self.commit_history {
            items.insert(*id, revision.clone());
        }
        let stamp = |mut revision: Revision| {
            revision.set_chunk_id(self.chunk.id());
            revision.set_update_time(commit_time);
            revision
        };
        for (id, revision) in &self.delta.insertions {
            let mut revision = stamp(revision.clone());
            revision.set_insert_time(commit_time);
            items.insert(*id, revision.into_handle());
        }
        for (id, revision) in &self.delta.updates {
            items.insert(*id, stamp(revision.clone()).into_handle());
        }
        for (id, revision) in &self.delta.removes {
            let mut revision = stamp(revision.clone());
            revision.set_removed();
            items.insert(*id, revision.into_handle());
        }
        CommitFuture::new(items)
    }

    // =====================================================================
    // Merge
    // =====================================================================

    /// Route every non-conflicting change into `target` (a fresh transaction
    /// on the same chunk); report the remainder.
    pub fn merge_into(&mut self, target: &mut ChunkTransaction, conflicts: &mut Conflicts) {
        assert!(
            self.conflict_conditions.is_empty(),
            "merge not compatible with conflict conditions"
        );
        self.chunk.read_lock();
        let mut update_times = self.chunk.update_times();
        self.discard_known_updates(&mut update_times);

        let now = LogicalTime::from_serialized(u64::MAX);
        let insertions = std::mem::take(&mut self.delta.insertions);
        for (_, revision) in insertions {
            target.insert_unchecked(revision);
        }
        let updates = std::mem::take(&mut self.delta.updates);
        for (id, revision) in updates {
            if update_times.contains_key(&id) {
                conflicts.push(Conflict {
                    ours: Some(revision.into_handle()),
                    theirs: self.chunk.get_by_id(&id, now),
                });
            } else {
                target.delta.updates.insert(id, revision);
            }
        }
        let removes = std::mem::take(&mut self.delta.removes);
        for (id, revision) in removes {
            if update_times.contains_key(&id) {
                conflicts.push(Conflict {
                    ours: Some(revision.into_handle()),
                    theirs: self.chunk.get_by_id(&id, now),
                });
            } else {
                target.delta.removes.insert(id, revision);
            }
        }
        self.chunk.unlock();
    }

    fn insert_unchecked(&mut self, revision: Revision) {
        let id = revision.item_id();
        self.delta.insertions.insert(id, revision);
    }

    // =====================================================================
    // Trackers
    // =====================================================================

    /// For each tracker declaration of the table, derive the tracking item
    /// of every staged insertion.
    pub fn collect_trackers(
        &self,
        declarations: &BTreeMap<String, TrackerExtractor>,
        overrides: &BTreeMap<String, TrackerExtractor>,
        out: &mut BTreeMap<String, Vec<ItemId>>,
    ) {
        for (tracker_table, default_extractor) in declarations {
            let extractor = overrides.get(tracker_table).unwrap_or(default_extractor);
            for revision in self.delta.insertions.values() {
                out.entry(tracker_table.clone())
                    .or_default()
                    .push(extractor(revision));
            }
        }
    }
}
