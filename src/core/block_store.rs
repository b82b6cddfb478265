//! Overflow-to-disk container backend.
//!
//! Revisions are serialized into fixed-size blocks in a single spill file;
//! memory keeps only `(offset, len)` references plus the per-entry metadata
//! needed for time-qualified lookups. Semantics are identical to
//! [`RamChunkData`](super::container::RamChunkData).

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::core::container::{ChunkData, HistoryMap, RevisionMap};
use crate::core::identity::{ChunkId, ItemId};
use crate::core::revision::{decode_revision, encode_revision, Revision, RevisionHandle, Value};
use crate::core::time::LogicalTime;
use crate::core::CoreError;

pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug)]
struct BlockRef {
    offset: u64,
    len: u32,
}

#[derive(Clone, Copy, Debug)]
struct StoredRevision {
    update_time: LogicalTime,
    removed: bool,
    location: BlockRef,
}

/// Fixed-size-block spill file. Appends fill the current block; a block is
/// written out once full, padded to the block size.
struct BlockFile {
    file: Mutex<File>,
    block_size: usize,
    flushed_blocks: u64,
    current: Vec<u8>,
}

impl BlockFile {
    fn create(path: &Path, block_size: usize) -> std::io::Result<Self> {
        assert!(block_size > 0, "block size must be positive");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            flushed_blocks: 0,
            current: Vec::with_capacity(block_size),
        })
    }

    fn append(&mut self, payload: &[u8]) -> std::io::Result<BlockRef> {
        if self.current.len() + payload.len() > self.block_size && !self.current.is_empty() {
            self.flush_current()?;
        }
        let offset = self.flushed_blocks * self.block_size as u64 + self.current.len() as u64;
        self.current.extend_from_slice(payload);
        // Oversized payloads occupy consecutive whole blocks.
        while self.current.len() >= self.block_size {
            self.flush_current()?;
        }
        Ok(BlockRef {
            offset,
            len: payload.len() as u32,
        })
    }

    fn flush_current(&mut self) -> std::io::Result<()> {
        let mut block = std::mem::take(&mut self.current);
        let written_blocks = block.len().div_ceil(self.block_size).max(1) as u64;
        block.resize(written_blocks as usize * self.block_size, 0);
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(self.flushed_blocks * self.block_size as u64))?;
        file.write_all(&block)?;
        self.flushed_blocks += written_blocks;
        Ok(())
    }

    fn read(&self, location: BlockRef) -> std::io::Result<Vec<u8>> {
        let flushed_len = self.flushed_blocks * self.block_size as u64;
        if location.offset >= flushed_len {
            // Still in the unflushed block.
            let start = (location.offset - flushed_len) as usize;
            let end = start + location.len as usize;
            return Ok(self.current[start..end].to_vec());
        }
        let mut buf = vec![0u8; location.len as usize];
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(location.offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Disk-backed implementation of [`ChunkData`].
pub struct BlockChunkData {
    blocks: BlockFile,
    // Newest first, mirroring the in-memory history order.
    index: BTreeMap<ItemId, Vec<StoredRevision>>,
    chunk_of: BTreeMap<ItemId, ChunkId>,
}

impl BlockChunkData {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Self::with_block_size(path, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(path: &Path, block_size: usize) -> std::io::Result<Self> {
        Ok(Self {
            blocks: BlockFile::create(path, block_size)?,
            index: BTreeMap::new(),
            chunk_of: BTreeMap::new(),
        })
    }

    fn store(&mut self, rev: &Revision) -> StoredRevision {
        let payload = encode_revision(rev);
        let location = self
            .blocks
            .append(&payload)
            .expect("spill file write failed");
        StoredRevision {
            update_time: rev.update_time(),
            removed: rev.is_removed(),
            location,
        }
    }

    fn load(&self, stored: &StoredRevision) -> RevisionHandle {
        let payload = self.blocks.read(stored.location).expect("spill file read failed");
        decode_revision(&payload)
            .expect("spill file holds undecodable revision")
            .into_handle()
    }

    fn place(&mut self, rev: &Revision) {
        let id = rev.item_id();
        if let Some(previous) = self.chunk_of.get(&id) {
            assert!(
                *previous == rev.chunk_id(),
                "chunk id changed for item {}",
                id
            );
        } else {
            self.chunk_of.insert(id, rev.chunk_id());
        }
        let stored = self.store(rev);
        let history = self.index.entry(id).or_default();
        let time = stored.update_time;
        for (index, existing) in history.iter().enumerate() {
            if existing.update_time <= time {
                assert!(
                    existing.update_time != time,
                    "duplicate update_time {} for item {}",
                    time,
                    id
                );
                history.insert(index, stored);
                return;
            }
        }
        history.push(stored);
    }

    fn latest_at(&self, id: &ItemId, time: LogicalTime) -> Option<&StoredRevision> {
        self.index
            .get(id)?
            .iter()
            .find(|stored| stored.update_time <= time)
    }

    fn for_each_found_at<F: FnMut(&ItemId, RevisionHandle)>(
        &self,
        key: Option<usize>,
        value: &Value,
        time: LogicalTime,
        mut action: F,
    ) {
        for id in self.index.keys() {
            let Some(stored) = self.latest_at(id, time) else {
                continue;
            };
            if stored.removed {
                continue;
            }
            let rev = self.load(stored);
            let matches = match key {
                None => true,
                Some(index) => rev.verify_equal(index, value),
            };
            if matches {
                action(id, rev);
            }
        }
    }
}

impl ChunkData for BlockChunkData {
    fn insert(&mut self, rev: Revision) -> Result<(), CoreError> {
        let id = rev.item_id();
        if self.index.contains_key(&id) {
            return Err(CoreError::DuplicateInsert { item: id });
        }
        self.place(&rev);
        Ok(())
    }

    fn bulk_insert(&mut self, revs: Vec<Revision>) -> Result<(), CoreError> {
        for rev in &revs {
            if self.index.contains_key(&rev.item_id()) {
                return Err(CoreError::DuplicateInsert {
                    item: rev.item_id(),
                });
            }
        }
        for rev in revs {
            self.place(&rev);
        }
        Ok(())
    }

    fn patch(&mut self, rev: RevisionHandle) {
        self.place(&rev);
    }

    fn update(&mut self, rev: Revision) {
        self.place(&rev);
    }

    fn get_by_id(&self, id: &ItemId, time: LogicalTime) -> Option<RevisionHandle> {
        self.latest_at(id, time).map(|stored| self.load(stored))
    }

    fn find_by_field(
        &self,
        key: Option<usize>,
        value: &Value,
        time: LogicalTime,
    ) -> RevisionMap {
        let mut result = RevisionMap::new();
        self.for_each_found_at(key, value, time, |id, rev| {
            result.insert(*id, rev);
        });
        result
    }

    fn count_by_field(&self, key: Option<usize>, value: &Value, time: LogicalTime) -> usize {
        let mut count = 0;
        self.for_each_found_at(key, value, time, |_, _| count += 1);
        count
    }

    fn available_ids(&self, time: LogicalTime) -> Vec<ItemId> {
        self.index
            .keys()
            .filter(|id| {
                self.latest_at(id, time)
                    .map(|stored| !stored.removed)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    fn history(&self, id: &ItemId, time: LogicalTime) -> Option<Vec<RevisionHandle>> {
        let history = self.index.get(id)?;
        Some(
            history
                .iter()
                .filter(|stored| stored.update_time <= time)
                .map(|stored| self.load(stored))
                .collect(),
        )
    }

    fn chunk_history(&self, chunk_id: &ChunkId, time: LogicalTime) -> HistoryMap {
        let mut result = HistoryMap::new();
        for (id, owner) in &self.chunk_of {
            if owner != chunk_id {
                continue;
            }
            if let Some(visible) = self.history(id, time) {
                if !visible.is_empty() {
                    result.insert(*id, visible);
                }
            }
        }
        result
    }

    fn dump(&self, time: LogicalTime) -> RevisionMap {
        let mut result = RevisionMap::new();
        for id in self.index.keys() {
            if let Some(stored) = self.latest_at(id, time) {
                if !stored.removed {
                    result.insert(*id, self.load(stored));
                }
            }
        }
        result
    }

    fn latest_update_times(&self) -> BTreeMap<ItemId, LogicalTime> {
        self.index
            .iter()
            .filter_map(|(id, history)| history.first().map(|head| (*id, head.update_time)))
            .collect()
    }

    fn clear(&mut self) {
        self.index.clear();
        self.chunk_of.clear();
    }

    fn item_count(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::revision::FieldType;

    fn revision(id: ItemId, chunk: ChunkId, insert: u64, update: u64, field: i64) -> Revision {
        let mut rev = Revision::with_layout(&[FieldType::Int64]);
        rev.set_item_id(id);
        rev.set_chunk_id(chunk);
        rev.set_insert_time(LogicalTime::from_serialized(insert));
        rev.set_update_time(LogicalTime::from_serialized(update));
        rev.set(0, Value::Int64(field)).unwrap();
        rev
    }

    fn t(value: u64) -> LogicalTime {
        LogicalTime::from_serialized(value)
    }

    #[test]
    fn round_trips_through_disk_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = BlockChunkData::with_block_size(&dir.path().join("spill"), 128).unwrap();
        let chunk = ChunkId::generate("t:1");
        let id = ItemId::generate("t:1");
        data.insert(revision(id, chunk, 2, 2, 42)).unwrap();
        data.update(revision(id, chunk, 2, 6, 84));

        let rev = data.get_by_id(&id, t(4)).unwrap();
        assert_eq!(rev.get(0).unwrap(), Some(&Value::Int64(42)));
        let rev = data.get_by_id(&id, t(9)).unwrap();
        assert_eq!(rev.get(0).unwrap(), Some(&Value::Int64(84)));
    }

    #[test]
    fn small_blocks_force_flushes_and_reads_still_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = BlockChunkData::with_block_size(&dir.path().join("spill"), 64).unwrap();
        let chunk = ChunkId::generate("t:1");
        let mut ids = Vec::new();
        for i in 0..32 {
            let id = ItemId::generate("t:1");
            data.insert(revision(id, chunk, 2, 2 + i, i as i64)).unwrap();
            ids.push(id);
        }
        for (i, id) in ids.iter().enumerate() {
            let rev = data.get_by_id(id, t(100)).unwrap();
            assert_eq!(rev.get(0).unwrap(), Some(&Value::Int64(i as i64)));
        }
        assert_eq!(data.item_count(), 32);
        assert_eq!(data.dump(t(100)).len(), 32);
    }

    #[test]
    fn matches_ram_semantics_for_out_of_order_patch() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = BlockChunkData::create(&dir.path().join("spill")).unwrap();
        let chunk = ChunkId::generate("t:1");
        let id = ItemId::generate("t:1");
        data.insert(revision(id, chunk, 2, 2, 1)).unwrap();
        data.patch(revision(id, chunk, 2, 9, 3).into_handle());
        data.patch(revision(id, chunk, 2, 5, 2).into_handle());

        let history = data.history(&id, t(20)).unwrap();
        let times: Vec<u64> = history.iter().map(|r| r.update_time().serialize()).collect();
        assert_eq!(times, vec![9, 5, 2]);
    }
}
