//! In-memory replicated log.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::topology::Membership;
use crate::error::RaftError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Appended by every new leader so entries of earlier terms can commit.
    Noop,
    /// Opaque proposal bytes owned by the consistency service.
    Normal(Vec<u8>),
    /// Voting configuration that takes effect as soon as it is appended.
    Config(Membership),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub kind: EntryKind,
}

#[derive(Debug)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Rebuilds a log from persisted entries, which must run contiguously
    /// from index 1.
    pub fn restore(entries: impl IntoIterator<Item = LogEntry>) -> Result<Self, RaftError> {
        let mut log = Self::new();
        for entry in entries {
            log.append(entry)?;
        }
        Ok(log)
    }

    pub fn last_index(&self) -> u64 {
        self.entries.back().map_or(0, |entry| entry.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.back().map_or(0, |entry| entry.term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<(), RaftError> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(RaftError::LogGap {
                expected,
                got: entry.index,
            });
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|entry| entry.term)
    }

    /// Up to `limit` entries starting at `start`.
    pub fn entries_from(&self, start: u64, limit: usize) -> Vec<LogEntry> {
        let start = start.max(1);
        if start > self.last_index() {
            return Vec::new();
        }
        self.entries
            .iter()
            .skip((start - 1) as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Removes `index` and everything after it.
    pub fn truncate_from(&mut self, index: u64) {
        self.entries.truncate(index.saturating_sub(1) as usize);
    }

    pub fn matches(&self, prev_index: u64, prev_term: u64) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Election restriction: a candidate's log must be at least as complete.
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        let our_term = self.last_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_index())
    }

    /// First index holding `term`, scanning back from `from`. Used as the
    /// conflict hint in a rejected append.
    pub fn first_index_of_term(&self, term: u64, from: u64) -> u64 {
        let mut index = from;
        while index > 1 && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    /// Most recent configuration entry, committed or not.
    pub fn latest_config(&self) -> Option<&Membership> {
        self.entries.iter().rev().find_map(|entry| match &entry.kind {
            EntryKind::Config(membership) => Some(membership),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            kind: EntryKind::Noop,
        }
    }

    #[test]
    fn append_rejects_gaps() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1)).unwrap();
        assert_eq!(
            log.append(entry(1, 3)),
            Err(RaftError::LogGap {
                expected: 2,
                got: 3
            })
        );
    }

    #[test]
    fn restore_requires_contiguous_entries() {
        let log = RaftLog::restore([entry(1, 1), entry(2, 2)]).unwrap();
        assert_eq!((log.last_index(), log.last_term()), (2, 2));
        assert!(RaftLog::restore([entry(1, 2)]).is_err());
    }

    #[test]
    fn truncate_and_match() {
        let mut log = RaftLog::new();
        for (term, index) in [(1, 1), (1, 2), (2, 3), (2, 4)] {
            log.append(entry(term, index)).unwrap();
        }
        assert!(log.matches(0, 0));
        assert!(log.matches(3, 2));
        assert!(!log.matches(3, 1));
        assert!(!log.matches(9, 2));
        assert_eq!(log.first_index_of_term(2, 4), 3);

        log.truncate_from(3);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
        assert_eq!(log.entries_from(2, 10).len(), 1);
    }

    #[test]
    fn up_to_date_compares_term_then_length() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1)).unwrap();
        log.append(entry(2, 2)).unwrap();
        assert!(log.is_up_to_date(2, 2));
        assert!(log.is_up_to_date(1, 3));
        assert!(!log.is_up_to_date(5, 1));
        assert!(!log.is_up_to_date(1, 2));
    }
}
