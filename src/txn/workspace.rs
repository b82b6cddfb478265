//! Workspaces: scoped visibility filters for reads.
//!
//! Two table filters (blacklist, whitelist) and two chunk filters with the
//! same precedence: whitelists win, and an empty whitelist admits everything
//! its level covers. Workspaces never restrict writes.

use std::collections::BTreeSet;

use crate::chunk::Chunk;
use crate::core::identity::ChunkId;
use crate::core::revision::{Revision, TrackeeMap};
use crate::table::NetTable;

#[derive(Clone, Debug, Default)]
pub struct Workspace {
    table_blacklist: BTreeSet<String>,
    table_whitelist: BTreeSet<String>,
    chunk_blacklist: TrackeeMap,
    chunk_whitelist: TrackeeMap,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table_filters(
        blacklist: impl IntoIterator<Item = String>,
        whitelist: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            table_blacklist: blacklist.into_iter().collect(),
            table_whitelist: whitelist.into_iter().collect(),
            chunk_blacklist: TrackeeMap::new(),
            chunk_whitelist: TrackeeMap::new(),
        }
    }

    pub fn contains_table(&self, table: &str) -> bool {
        let whitelisted =
            self.table_whitelist.is_empty() || self.table_whitelist.contains(table);
        whitelisted && !self.table_blacklist.contains(table)
    }

    pub fn contains(&self, table: &str, chunk: &ChunkId) -> bool {
        if !self.contains_table(table) {
            return false;
        }
        let whitelisted =
            self.chunk_whitelist.is_empty() || self.chunk_whitelist.contains(table, chunk);
        whitelisted && !self.chunk_blacklist.contains(table, chunk)
    }

    /// Fold a revision's trackees, and its own chunk, into the blacklist.
    pub fn merge_trackees_into_blacklist(&mut self, revision: &Revision, tracker_table: &str) {
        self.chunk_blacklist.merge(revision.trackees());
        self.chunk_blacklist
            .insert(tracker_table, revision.chunk_id());
    }

    /// Fold a revision's trackees, and its own chunk, into the whitelist.
    pub fn merge_trackees_into_whitelist(&mut self, revision: &Revision, tracker_table: &str) {
        self.chunk_whitelist.merge(revision.trackees());
        self.chunk_whitelist
            .insert(tracker_table, revision.chunk_id());
    }

    /// Run `action` over the table's locally held chunks that pass the
    /// filters.
    pub fn for_each_chunk(&self, table: &NetTable, mut action: impl FnMut(&Chunk)) {
        if !self.contains_table(table.name()) {
            return;
        }
        for chunk in table.active_chunks() {
            if self.contains(table.name(), &chunk.id()) {
                action(&chunk);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::ChunkId;
    use crate::core::revision::FieldType;

    fn chunk_id() -> ChunkId {
        ChunkId::generate("w:1")
    }

    #[test]
    fn empty_workspace_admits_everything() {
        let workspace = Workspace::new();
        assert!(workspace.contains_table("poses"));
        assert!(workspace.contains("poses", &chunk_id()));
    }

    #[test]
    fn table_whitelist_excludes_others() {
        let workspace =
            Workspace::with_table_filters(Vec::new(), vec!["poses".to_string()]);
        assert!(workspace.contains_table("poses"));
        assert!(!workspace.contains_table("vertices"));
    }

    #[test]
    fn blacklist_applies_after_whitelist_test() {
        let workspace =
            Workspace::with_table_filters(vec!["poses".to_string()], vec!["poses".to_string()]);
        assert!(!workspace.contains_table("poses"));
    }

    #[test]
    fn chunk_filters_apply_below_table_filters() {
        let mut workspace = Workspace::new();
        let listed = chunk_id();
        let other = chunk_id();
        let mut revision = Revision::with_layout(&[FieldType::Bool]);
        revision.set_chunk_id(listed);
        workspace.merge_trackees_into_whitelist(&revision, "poses");

        assert!(workspace.contains("poses", &listed));
        assert!(!workspace.contains("poses", &other), "whitelist now exclusive");
    }

    #[test]
    fn chunk_blacklist_excludes() {
        let mut workspace = Workspace::new();
        let listed = chunk_id();
        let mut revision = Revision::with_layout(&[FieldType::Bool]);
        revision.set_chunk_id(listed);
        workspace.merge_trackees_into_blacklist(&revision, "poses");

        assert!(!workspace.contains("poses", &listed));
        assert!(workspace.contains("poses", &chunk_id()));
    }
}
