//! Write-through object caches over a table.
//!
//! Applications work with typed objects; the cache converts between objects
//! and revisions through a codec and stages the dirty set into a
//! transaction at commit preparation. An optional `requires_update`
//! predicate keeps trivially-equal writes from flushing.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chunk::Chunk;
use crate::core::identity::ItemId;
use crate::core::revision::{Revision, RevisionHandle};
use crate::table::NetTable;

use super::transaction::Transaction;

pub trait RevisionCodec<O>: Send + Sync {
    fn object_from_revision(&self, revision: &Revision) -> O;
    fn object_to_revision(&self, object: &O, revision: &mut Revision);

    /// Whether a changed object is different enough to write back.
    fn requires_update(&self, new: &O, old: &O) -> bool {
        let _ = (new, old);
        true
    }
}

enum Entry<O> {
    Cached {
        original_revision: RevisionHandle,
        original: O,
        current: O,
    },
    Fresh {
        chunk: Chunk,
        current: O,
    },
    Erased {
        original_revision: RevisionHandle,
    },
}

pub struct TransactionCache<O> {
    table: Arc<NetTable>,
    codec: Arc<dyn RevisionCodec<O>>,
    entries: BTreeMap<ItemId, Entry<O>>,
}

impl<O: Clone> TransactionCache<O> {
    pub fn new(table: Arc<NetTable>, codec: Arc<dyn RevisionCodec<O>>) -> Self {
        Self {
            table,
            codec,
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, entry)| !matches!(entry, Entry::Erased { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(&mut self, txn: &mut Transaction, id: &ItemId) -> bool {
        if self.entries.contains_key(id) {
            return true;
        }
        let Some(revision) = txn.get_by_id(&self.table, id) else {
            return false;
        };
        let object = self.codec.object_from_revision(&revision);
        self.entries.insert(
            *id,
            Entry::Cached {
                original_revision: revision,
                original: object.clone(),
                current: object,
            },
        );
        true
    }

    pub fn get(&mut self, txn: &mut Transaction, id: &ItemId) -> Option<&O> {
        if !self.load(txn, id) {
            return None;
        }
        match self.entries.get(id) {
            Some(Entry::Cached { current, .. }) | Some(Entry::Fresh { current, .. }) => {
                Some(current)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, txn: &mut Transaction, id: &ItemId) -> Option<&mut O> {
        if !self.load(txn, id) {
            return None;
        }
        match self.entries.get_mut(id) {
            Some(Entry::Cached { current, .. }) | Some(Entry::Fresh { current, .. }) => {
                Some(current)
            }
            _ => None,
        }
    }

    /// Stage a new object, to be inserted into `chunk` on commit.
    pub fn insert(&mut self, chunk: &Chunk, id: ItemId, object: O) {
        let previous = self.entries.insert(
            id,
            Entry::Fresh {
                chunk: chunk.clone(),
                current: object,
            },
        );
        assert!(previous.is_none(), "object {id} cached twice");
    }

    pub fn erase(&mut self, txn: &mut Transaction, id: &ItemId) -> bool {
        if !self.load(txn, id) {
            return false;
        }
        match self.entries.remove(id) {
            Some(Entry::Cached {
                original_revision, ..
            }) => {
                self.entries.insert(
                    *id,
                    Entry::Erased { original_revision },
                );
                true
            }
            Some(Entry::Fresh { .. }) => true, // never written; just forget
            Some(entry @ Entry::Erased { .. }) => {
                self.entries.insert(*id, entry);
                true
            }
            None => false,
        }
    }

    /// Convert the dirty set to revisions and stage them into `txn`. Call
    /// immediately before `txn.commit()`.
    pub fn prepare_for_commit(&mut self, txn: &mut Transaction) {
        for (id, entry) in &self.entries {
            match entry {
                Entry::Fresh { chunk, current } => {
                    let mut revision = self.table.new_revision();
                    revision.set_item_id(*id);
                    self.codec.object_to_revision(current, &mut revision);
                    txn.insert(&self.table, chunk, revision);
                }
                Entry::Cached {
                    original_revision,
                    original,
                    current,
                } => {
                    if self.codec.requires_update(current, original) {
                        let mut draft = original_revision.copy_for_write();
                        self.codec.object_to_revision(current, &mut draft);
                        txn.update(&self.table, draft);
                    }
                }
                Entry::Erased { original_revision } => {
                    let draft = original_revision.copy_for_write();
                    txn.remove(&self.table, draft);
                }
            }
        }
    }
}
