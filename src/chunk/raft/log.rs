//! Replicated log of a consensus chunk.
//!
//! Indices are sequential from 1. The leader overwrites follower suffixes
//! where (index, term) disagrees. Entries at or below the commit index are
//! immutable.

use crate::core::identity::PeerId;
use crate::net::proto::{LogEntry, LogEntryKind};

#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    commit_index: u64,
    applied_index: u64,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<LogEntry>, commit_index: u64) -> Self {
        for (offset, entry) in entries.iter().enumerate() {
            assert_eq!(
                entry.index,
                offset as u64 + 1,
                "log entries must be sequential from 1"
            );
        }
        Self {
            entries,
            commit_index,
            applied_index: 0,
        }
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|entry| entry.term).unwrap_or(0)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 || index > self.last_index() {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    pub fn term_of(&self, index: u64) -> u64 {
        if index == 0 {
            0
        } else {
            self.entry(index).map(|entry| entry.term).unwrap_or(0)
        }
    }

    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        if index == 0 || index > self.last_index() {
            return Vec::new();
        }
        self.entries[index as usize - 1..].to_vec()
    }

    /// Index of an already-appended `(sender, serial_id)` submission, for
    /// exactly-once under client retry.
    pub fn find_serial(&self, sender: &PeerId, serial_id: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.serial_id == serial_id && entry.sender == *sender)
            .map(|entry| entry.index)
    }

    /// Leader-side append; assigns the next index.
    pub fn append(&mut self, term: u64, sender: PeerId, serial_id: u64, kind: LogEntryKind) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            index,
            term,
            sender,
            serial_id,
            kind,
        });
        index
    }

    /// Follower-side append after the previous-entry check. Entries that
    /// conflict with the incoming ones are discarded; committed entries may
    /// never change.
    pub fn splice(&mut self, prev_log_index: u64, incoming: Vec<LogEntry>) {
        for entry in incoming {
            debug_assert!(entry.index > prev_log_index);
            match self.entry(entry.index) {
                Some(existing) if existing.term == entry.term => continue,
                Some(_) => {
                    assert!(
                        entry.index > self.commit_index,
                        "leader tried to overwrite committed entry {}",
                        entry.index
                    );
                    self.entries.truncate(entry.index as usize - 1);
                    self.entries.push(entry);
                }
                None => {
                    assert_eq!(entry.index, self.last_index() + 1, "log gap on splice");
                    self.entries.push(entry);
                }
            }
        }
    }

    /// Raise the commit index (never lowers). Returns entries that became
    /// committed, in index order, ready to be applied.
    pub fn commit_up_to(&mut self, index: u64) -> Vec<LogEntry> {
        let target = index.min(self.last_index());
        if target <= self.commit_index {
            return Vec::new();
        }
        let from = self.commit_index as usize;
        self.commit_index = target;
        self.entries[from..target as usize].to_vec()
    }

    pub fn mark_applied(&mut self, index: u64) {
        debug_assert!(index <= self.commit_index);
        if index > self.applied_index {
            self.applied_index = index;
        }
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    fn other(tag: &str) -> LogEntryKind {
        LogEntryKind::Other {
            tag: tag.to_string(),
        }
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let mut log = RaftLog::new();
        assert_eq!(log.append(1, peer("a:1"), 1, other("x")), 1);
        assert_eq!(log.append(1, peer("a:1"), 2, other("y")), 2);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn find_serial_is_per_sender() {
        let mut log = RaftLog::new();
        log.append(1, peer("a:1"), 7, other("x"));
        assert_eq!(log.find_serial(&peer("a:1"), 7), Some(1));
        assert_eq!(log.find_serial(&peer("b:1"), 7), None);
    }

    #[test]
    fn splice_truncates_conflicting_suffix() {
        let mut log = RaftLog::new();
        log.append(1, peer("a:1"), 1, other("x"));
        log.append(1, peer("a:1"), 2, other("y"));
        log.append(1, peer("a:1"), 3, other("z"));

        let replacement = vec![LogEntry {
            index: 2,
            term: 2,
            sender: peer("b:1"),
            serial_id: 9,
            kind: other("w"),
        }];
        log.splice(1, replacement);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_of(2), 2);
    }

    #[test]
    fn splice_is_idempotent_for_matching_entries() {
        let mut log = RaftLog::new();
        log.append(1, peer("a:1"), 1, other("x"));
        let copy = log.entries_from(1);
        log.splice(0, copy);
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn commit_up_to_returns_newly_committed_once() {
        let mut log = RaftLog::new();
        log.append(1, peer("a:1"), 1, other("x"));
        log.append(1, peer("a:1"), 2, other("y"));

        let committed = log.commit_up_to(1);
        assert_eq!(committed.len(), 1);
        assert!(log.commit_up_to(1).is_empty(), "no double commit");
        let committed = log.commit_up_to(5);
        assert_eq!(committed.len(), 1, "clamped to last index");
        assert_eq!(log.commit_index(), 2);
    }

    #[test]
    #[should_panic(expected = "overwrite committed")]
    fn splice_refuses_to_touch_committed_entries() {
        let mut log = RaftLog::new();
        log.append(1, peer("a:1"), 1, other("x"));
        log.commit_up_to(1);
        log.splice(
            0,
            vec![LogEntry {
                index: 1,
                term: 2,
                sender: peer("b:1"),
                serial_id: 1,
                kind: other("w"),
            }],
        );
    }
}
