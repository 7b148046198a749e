//! Log storage boundary.
//!
//! The engine only requires an ordered, append-only entry store with
//! truncate-and-compact support; the physical format belongs to the
//! implementation behind [`LogStore`]. [`MemoryLog`] is the in-process
//! implementation used by tests and single-process deployments.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::types::{LogEntry, LogIndex, Term};

/// Durable ordered log of replicated entries.
///
/// Implementations may block on I/O; the engine never calls these while
/// holding its state locks. A failure from `append`/`truncate_from` is
/// treated as fatal to the node.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append one entry. The entry's index must be exactly `last_index + 1`.
    async fn append(&self, entry: LogEntry) -> Result<LogIndex>;

    /// Append a batch in index order, same contract as `append`.
    async fn append_batch(&self, entries: Vec<LogEntry>) -> Result<()>;

    /// Entry at `index`, or `None` if absent (compacted or never written).
    async fn entry_at(&self, index: LogIndex) -> Result<Option<LogEntry>>;

    /// Entries in `[from, to)`, ascending.
    async fn range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>>;

    /// Term of the entry at `index`. Unlike `entry_at`, this still answers
    /// at the compaction boundary so consistency checks keep working.
    async fn term_at(&self, index: LogIndex) -> Result<Option<Term>>;

    /// Index of the most recent entry, `ZERO` when empty.
    async fn last_index(&self) -> LogIndex;

    /// Term of the most recent entry, `ZERO` when empty.
    async fn last_term(&self) -> Term;

    /// First retained index, `ZERO` when nothing was compacted away.
    async fn first_index(&self) -> LogIndex;

    /// Remove all entries with index >= `from` (conflict resolution).
    async fn truncate_from(&self, from: LogIndex) -> Result<()>;

    /// Drop entries with index < `before` (size management). The boundary
    /// term is retained for consistency checks.
    async fn compact_before(&self, before: LogIndex) -> Result<()>;

    /// Number of retained entries.
    async fn len(&self) -> u64;
}

struct MemoryLogInner {
    entries: BTreeMap<LogIndex, LogEntry>,
    /// Index and term of the newest compacted-away entry.
    compacted: (LogIndex, Term),
    bytes: u64,
}

/// Heap-backed [`LogStore`].
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<RwLock<MemoryLogInner>>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryLogInner {
                entries: BTreeMap::new(),
                compacted: (LogIndex::ZERO, Term::ZERO),
                bytes: 0,
            })),
        }
    }

    /// Approximate retained size in bytes, as the entries would serialize.
    pub fn size_bytes(&self) -> u64 {
        self.inner.read().bytes
    }

    fn entry_size(entry: &LogEntry) -> u64 {
        bincode::serialized_size(entry).unwrap_or(0)
    }

    fn check_contiguous(inner: &MemoryLogInner, entry: &LogEntry) -> Result<()> {
        let last = inner
            .entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(inner.compacted.0);
        if entry.index != last.next() {
            return Err(RaftError::Storage {
                reason: format!(
                    "non-contiguous append: index {} after {}",
                    entry.index, last
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemoryLog {
    async fn append(&self, entry: LogEntry) -> Result<LogIndex> {
        let mut inner = self.inner.write();
        Self::check_contiguous(&inner, &entry)?;
        let index = entry.index;
        inner.bytes += Self::entry_size(&entry);
        inner.entries.insert(index, entry);
        Ok(index)
    }

    async fn append_batch(&self, entries: Vec<LogEntry>) -> Result<()> {
        let mut inner = self.inner.write();
        for entry in entries {
            Self::check_contiguous(&inner, &entry)?;
            inner.bytes += Self::entry_size(&entry);
            inner.entries.insert(entry.index, entry);
        }
        Ok(())
    }

    async fn entry_at(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        Ok(self.inner.read().entries.get(&index).cloned())
    }

    async fn range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>> {
        let inner = self.inner.read();
        Ok(inner.entries.range(from..to).map(|(_, e)| e.clone()).collect())
    }

    async fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        let inner = self.inner.read();
        if index == inner.compacted.0 && index != LogIndex::ZERO {
            return Ok(Some(inner.compacted.1));
        }
        Ok(inner.entries.get(&index).map(|e| e.term))
    }

    async fn last_index(&self) -> LogIndex {
        let inner = self.inner.read();
        inner
            .entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(inner.compacted.0)
    }

    async fn last_term(&self) -> Term {
        let inner = self.inner.read();
        inner
            .entries
            .values()
            .next_back()
            .map(|e| e.term)
            .unwrap_or(inner.compacted.1)
    }

    async fn first_index(&self) -> LogIndex {
        let inner = self.inner.read();
        inner
            .entries
            .keys()
            .next()
            .copied()
            .unwrap_or(LogIndex::ZERO)
    }

    async fn truncate_from(&self, from: LogIndex) -> Result<()> {
        let mut inner = self.inner.write();
        let removed = inner.entries.split_off(&from);
        for entry in removed.values() {
            inner.bytes = inner.bytes.saturating_sub(Self::entry_size(entry));
        }
        Ok(())
    }

    async fn compact_before(&self, before: LogIndex) -> Result<()> {
        let mut inner = self.inner.write();
        let retained = inner.entries.split_off(&before);
        let dropped = std::mem::replace(&mut inner.entries, retained);
        if let Some((index, entry)) = dropped.iter().next_back() {
            inner.compacted = (*index, entry.term);
        }
        for entry in dropped.values() {
            inner.bytes = inner.bytes.saturating_sub(Self::entry_size(entry));
        }
        Ok(())
    }

    async fn len(&self) -> u64 {
        self.inner.read().entries.len() as u64
    }
}
