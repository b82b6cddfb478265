//! Per-chunk history store: item id → time-sorted revisions.
//!
//! Histories are newest-first. A read at time `t` returns the first entry
//! whose `update_time <= t`. Histories are short (one entry per commit), so
//! linear scans are fine; bulk scans iterate all ids and reuse the per-id
//! scan.

use std::collections::BTreeMap;

use crate::core::identity::{ChunkId, ItemId};
use crate::core::revision::{Revision, RevisionHandle, Value};
use crate::core::time::LogicalTime;
use crate::core::CoreError;

/// Time-ordered revisions of one item, newest first.
#[derive(Clone, Debug, Default)]
pub struct History {
    entries: Vec<RevisionHandle>,
}

impl History {
    /// First entry with `update_time <= time`, i.e. the version visible at
    /// `time`.
    pub fn latest_at(&self, time: LogicalTime) -> Option<&RevisionHandle> {
        self.entries.iter().find(|rev| rev.update_time() <= time)
    }

    /// Insert by `update_time`. Remote deliveries may be reordered, so the
    /// position is searched, not assumed to be the head. Two entries with the
    /// same `update_time` would make time-travel reads ambiguous; that is an
    /// integrity violation and aborts.
    pub fn place(&mut self, rev: RevisionHandle) {
        let time = rev.update_time();
        for (index, existing) in self.entries.iter().enumerate() {
            if existing.update_time() <= time {
                assert!(
                    existing.update_time() != time,
                    "duplicate update_time {} for item {}",
                    time,
                    rev.item_id()
                );
                if index != 0 {
                    tracing::warn!(item = %rev.item_id(), %time, "patching out of order");
                }
                self.entries.insert(index, rev);
                return;
            }
        }
        self.entries.push(rev);
    }

    pub fn head(&self) -> Option<&RevisionHandle> {
        self.entries.first()
    }

    /// All entries visible at `time`, newest first.
    pub fn up_to(&self, time: LogicalTime) -> Vec<RevisionHandle> {
        self.entries
            .iter()
            .filter(|rev| rev.update_time() <= time)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RevisionHandle> {
        self.entries.iter()
    }
}

pub type RevisionMap = BTreeMap<ItemId, RevisionHandle>;
pub type HistoryMap = BTreeMap<ItemId, Vec<RevisionHandle>>;

/// Backend-independent container semantics. Two implementations: in-memory
/// ([`RamChunkData`]) and overflow-to-disk ([`super::block_store::BlockChunkData`]).
pub trait ChunkData: Send + Sync {
    /// First version of a new item. Fails if the id exists.
    fn insert(&mut self, rev: Revision) -> Result<(), CoreError>;

    /// Insert several new items; nothing is written if any id exists.
    fn bulk_insert(&mut self, revs: Vec<Revision>) -> Result<(), CoreError>;

    /// Place a replicated revision by its timestamp.
    fn patch(&mut self, rev: RevisionHandle);

    /// A newer version of an existing item.
    fn update(&mut self, rev: Revision);

    /// Write a new version carrying the removed flag. The flag is never
    /// cleared; history stays readable.
    fn remove(&mut self, mut rev: Revision) {
        rev.set_removed();
        self.update(rev);
    }

    fn get_by_id(&self, id: &ItemId, time: LogicalTime) -> Option<RevisionHandle>;

    /// Latest visible revision per live item; `key = None` matches all, else
    /// field equality.
    fn find_by_field(
        &self,
        key: Option<usize>,
        value: &Value,
        time: LogicalTime,
    ) -> RevisionMap;

    fn count_by_field(&self, key: Option<usize>, value: &Value, time: LogicalTime) -> usize;

    /// Ids of items live (present, not removed) at `time`.
    fn available_ids(&self, time: LogicalTime) -> Vec<ItemId>;

    /// Full visible history of one item.
    fn history(&self, id: &ItemId, time: LogicalTime) -> Option<Vec<RevisionHandle>>;

    /// Histories of all items whose head belongs to `chunk_id`.
    fn chunk_history(&self, chunk_id: &ChunkId, time: LogicalTime) -> HistoryMap;

    /// Latest visible revision per live item.
    fn dump(&self, time: LogicalTime) -> RevisionMap;

    /// Newest `update_time` per item, commit-conflict support.
    fn latest_update_times(&self) -> BTreeMap<ItemId, LogicalTime>;

    fn clear(&mut self);

    fn item_count(&self) -> usize;
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct RamChunkData {
    data: BTreeMap<ItemId, History>,
}

impl RamChunkData {
    pub fn new() -> Self {
        Self::default()
    }

    fn for_each_found_at<F: FnMut(&ItemId, &RevisionHandle)>(
        &self,
        key: Option<usize>,
        value: &Value,
        time: LogicalTime,
        mut action: F,
    ) {
        for (id, history) in &self.data {
            let Some(latest) = history.latest_at(time) else {
                continue;
            };
            if latest.is_removed() {
                continue;
            }
            let matches = match key {
                None => true,
                Some(index) => latest.verify_equal(index, value),
            };
            if matches {
                action(id, latest);
            }
        }
    }
}

impl ChunkData for RamChunkData {
    fn insert(&mut self, rev: Revision) -> Result<(), CoreError> {
        let id = rev.item_id();
        if self.data.contains_key(&id) {
            return Err(CoreError::DuplicateInsert { item: id });
        }
        self.data.entry(id).or_default().place(rev.into_handle());
        Ok(())
    }

    fn bulk_insert(&mut self, revs: Vec<Revision>) -> Result<(), CoreError> {
        for rev in &revs {
            if self.data.contains_key(&rev.item_id()) {
                return Err(CoreError::DuplicateInsert {
                    item: rev.item_id(),
                });
            }
        }
        for rev in revs {
            let id = rev.item_id();
            self.data.entry(id).or_default().place(rev.into_handle());
        }
        Ok(())
    }

    fn patch(&mut self, rev: RevisionHandle) {
        self.data.entry(rev.item_id()).or_default().place(rev);
    }

    fn update(&mut self, rev: Revision) {
        self.patch(rev.into_handle());
    }

    fn get_by_id(&self, id: &ItemId, time: LogicalTime) -> Option<RevisionHandle> {
        self.data.get(id)?.latest_at(time).cloned()
    }

    fn find_by_field(
        &self,
        key: Option<usize>,
        value: &Value,
        time: LogicalTime,
    ) -> RevisionMap {
        let mut result = RevisionMap::new();
        self.for_each_found_at(key, value, time, |id, rev| {
            result.insert(*id, rev.clone());
        });
        result
    }

    fn count_by_field(&self, key: Option<usize>, value: &Value, time: LogicalTime) -> usize {
        let mut count = 0;
        self.for_each_found_at(key, value, time, |_, _| count += 1);
        count
    }

    fn available_ids(&self, time: LogicalTime) -> Vec<ItemId> {
        let mut ids = Vec::with_capacity(self.data.len());
        for (id, history) in &self.data {
            if let Some(latest) = history.latest_at(time) {
                if !latest.is_removed() {
                    ids.push(*id);
                }
            }
        }
        ids
    }

    fn history(&self, id: &ItemId, time: LogicalTime) -> Option<Vec<RevisionHandle>> {
        let history = self.data.get(id)?;
        Some(history.up_to(time))
    }

    fn chunk_history(&self, chunk_id: &ChunkId, time: LogicalTime) -> HistoryMap {
        let mut result = HistoryMap::new();
        for (id, history) in &self.data {
            let belongs = history
                .head()
                .map(|head| head.chunk_id() == *chunk_id)
                .unwrap_or(false);
            if belongs {
                let visible = history.up_to(time);
                if !visible.is_empty() {
                    result.insert(*id, visible);
                }
            }
        }
        result
    }

    fn dump(&self, time: LogicalTime) -> RevisionMap {
        let mut result = RevisionMap::new();
        for (id, history) in &self.data {
            if let Some(latest) = history.latest_at(time) {
                if !latest.is_removed() {
                    result.insert(*id, latest.clone());
                }
            }
        }
        result
    }

    fn latest_update_times(&self) -> BTreeMap<ItemId, LogicalTime> {
        self.data
            .iter()
            .filter_map(|(id, history)| history.head().map(|head| (*id, head.update_time())))
            .collect()
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn item_count(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::revision::FieldType;

    fn revision(id: ItemId, chunk: ChunkId, insert: u64, update: u64, field: i32) -> Revision {
        let mut rev = Revision::with_layout(&[FieldType::Int32]);
        rev.set_item_id(id);
        rev.set_chunk_id(chunk);
        rev.set_insert_time(LogicalTime::from_serialized(insert));
        rev.set_update_time(LogicalTime::from_serialized(update));
        rev.set(0, Value::Int32(field)).unwrap();
        rev
    }

    fn t(value: u64) -> LogicalTime {
        LogicalTime::from_serialized(value)
    }

    #[test]
    fn insert_then_get_at_later_time() {
        let mut data = RamChunkData::new();
        let id = ItemId::generate("t:1");
        let chunk = ChunkId::generate("t:1");
        data.insert(revision(id, chunk, 2, 2, 42)).unwrap();

        assert!(data.get_by_id(&id, t(1)).is_none(), "not visible before insert");
        let rev = data.get_by_id(&id, t(5)).unwrap();
        assert_eq!(rev.get(0).unwrap(), Some(&Value::Int32(42)));
        assert_eq!(data.item_count(), 1);
    }

    #[test]
    fn insert_rejects_existing_id() {
        let mut data = RamChunkData::new();
        let id = ItemId::generate("t:1");
        let chunk = ChunkId::generate("t:1");
        data.insert(revision(id, chunk, 2, 2, 1)).unwrap();
        assert!(matches!(
            data.insert(revision(id, chunk, 3, 3, 2)),
            Err(CoreError::DuplicateInsert { .. })
        ));
    }

    #[test]
    fn bulk_insert_is_all_or_nothing() {
        let mut data = RamChunkData::new();
        let chunk = ChunkId::generate("t:1");
        let a = ItemId::generate("t:1");
        let b = ItemId::generate("t:1");
        data.insert(revision(b, chunk, 2, 2, 1)).unwrap();
        let err = data.bulk_insert(vec![
            revision(a, chunk, 3, 3, 2),
            revision(b, chunk, 3, 3, 3),
        ]);
        assert!(err.is_err());
        assert!(data.get_by_id(&a, t(10)).is_none());
    }

    #[test]
    fn time_travel_reads_see_each_version() {
        let mut data = RamChunkData::new();
        let id = ItemId::generate("t:1");
        let chunk = ChunkId::generate("t:1");
        data.insert(revision(id, chunk, 2, 2, 42)).unwrap();
        data.update(revision(id, chunk, 2, 5, 21));
        data.update(revision(id, chunk, 2, 9, 84));

        assert_eq!(
            data.get_by_id(&id, t(3)).unwrap().get(0).unwrap(),
            Some(&Value::Int32(42))
        );
        assert_eq!(
            data.get_by_id(&id, t(6)).unwrap().get(0).unwrap(),
            Some(&Value::Int32(21))
        );
        assert_eq!(
            data.get_by_id(&id, t(20)).unwrap().get(0).unwrap(),
            Some(&Value::Int32(84))
        );
        assert_eq!(data.history(&id, t(20)).unwrap().len(), 3);
        assert_eq!(data.history(&id, t(6)).unwrap().len(), 2);
    }

    #[test]
    fn out_of_order_patch_lands_by_timestamp() {
        let mut data = RamChunkData::new();
        let id = ItemId::generate("t:1");
        let chunk = ChunkId::generate("t:1");
        data.insert(revision(id, chunk, 2, 2, 1)).unwrap();
        data.patch(revision(id, chunk, 2, 9, 3).into_handle());
        // Arrives late but must sort between the existing two.
        data.patch(revision(id, chunk, 2, 5, 2).into_handle());

        let history = data.history(&id, t(20)).unwrap();
        let times: Vec<u64> = history.iter().map(|r| r.update_time().serialize()).collect();
        assert_eq!(times, vec![9, 5, 2]);
    }

    #[test]
    #[should_panic(expected = "duplicate update_time")]
    fn duplicate_update_time_aborts() {
        let mut data = RamChunkData::new();
        let id = ItemId::generate("t:1");
        let chunk = ChunkId::generate("t:1");
        data.insert(revision(id, chunk, 2, 5, 1)).unwrap();
        data.patch(revision(id, chunk, 2, 5, 2).into_handle());
    }

    #[test]
    fn removed_items_leave_dump_and_available_ids() {
        let mut data = RamChunkData::new();
        let id = ItemId::generate("t:1");
        let chunk = ChunkId::generate("t:1");
        data.insert(revision(id, chunk, 2, 2, 1)).unwrap();
        data.remove(revision(id, chunk, 2, 7, 1));

        assert_eq!(data.available_ids(t(5)), vec![id]);
        assert!(data.available_ids(t(10)).is_empty());
        assert!(data.dump(t(10)).is_empty());
        // History still answers.
        assert_eq!(data.history(&id, t(10)).unwrap().len(), 2);
    }

    #[test]
    fn find_by_field_filters_on_value() {
        let mut data = RamChunkData::new();
        let chunk = ChunkId::generate("t:1");
        let a = ItemId::generate("t:1");
        let b = ItemId::generate("t:1");
        data.insert(revision(a, chunk, 2, 2, 42)).unwrap();
        data.insert(revision(b, chunk, 2, 3, 21)).unwrap();

        let found = data.find_by_field(Some(0), &Value::Int32(42), t(10));
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&a));
        assert_eq!(data.count_by_field(Some(0), &Value::Int32(21), t(10)), 1);
        assert_eq!(data.count_by_field(None, &Value::Int32(0), t(10)), 2);
    }
}
