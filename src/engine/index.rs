//! CINDER - Key Index
//! In-memory ordered map from key to the locator of its newest record.
//!
//! The map sits behind an `Arc` and is copied on write, so taking a
//! snapshot for iteration is O(1) and the snapshot keeps a consistent
//! point-in-time view no matter what writers do afterwards.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::types::{Key, Locator, Record, RecordKind};

/// What the index knows about a key's newest record.
/// Kind and expiry are cached so liveness checks need no disk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub locator: Locator,
    pub kind: RecordKind,
    pub expires_at: Option<u64>,
}

impl IndexEntry {
    pub fn for_record(record: &Record, locator: Locator) -> Self {
        Self {
            locator,
            kind: record.kind,
            expires_at: record.expires_at,
        }
    }

    /// A key is present when its newest record is a put that has not expired.
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.kind == RecordKind::Put && !self.is_expired(now_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}

/// Ordered key index. Tombstones stay indexed until compaction drops them.
#[derive(Debug, Clone, Default)]
pub struct KeyIndex {
    entries: Arc<BTreeMap<Key, IndexEntry>>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed keys, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of keys that are currently readable.
    pub fn live_len(&self, now_ms: u64) -> usize {
        self.entries.values().filter(|e| e.is_live(now_ms)).count()
    }

    pub fn get(&self, key: &[u8]) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    /// Point `key` at a newer record, returning the previous entry.
    pub fn insert(&mut self, key: Key, entry: IndexEntry) -> Option<IndexEntry> {
        Arc::make_mut(&mut self.entries).insert(key, entry)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<IndexEntry> {
        Arc::make_mut(&mut self.entries).remove(key)
    }

    /// Move `key` to `new` only if it still points at `expected`.
    pub fn repoint(&mut self, key: &[u8], expected: &Locator, new: Locator) -> bool {
        if self.entries.get(key).map(|e| &e.locator) != Some(expected) {
            return false;
        }
        if let Some(entry) = Arc::make_mut(&mut self.entries).get_mut(key) {
            entry.locator = new;
        }
        true
    }

    /// Forget `key` only if it still points at `expected`.
    pub fn remove_if_at(&mut self, key: &[u8], expected: &Locator) -> bool {
        if self.entries.get(key).map(|e| &e.locator) != Some(expected) {
            return false;
        }
        Arc::make_mut(&mut self.entries).remove(key);
        true
    }

    /// Drop entries for expired puts. Returns how many were removed.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let expired = self
            .entries
            .values()
            .filter(|e| e.kind == RecordKind::Put && e.is_expired(now_ms))
            .count();
        if expired > 0 {
            Arc::make_mut(&mut self.entries)
                .retain(|_, e| !(e.kind == RecordKind::Put && e.is_expired(now_ms)));
        }
        expired
    }

    /// True while a snapshot or clone still holds the map, so the next
    /// write has to copy it.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.entries) > 1
    }

    /// Cheap point-in-time view for iteration.
    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Frozen view of the index taken at a single instant.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    entries: Arc<BTreeMap<Key, IndexEntry>>,
}

impl IndexSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lazy traversal of the keys within `(lower, upper)`.
    pub fn cursor(self, lower: Bound<Key>, upper: Bound<Key>, reverse: bool) -> IndexCursor {
        let done = !bounds_ordered(&lower, &upper);
        IndexCursor {
            entries: self.entries,
            lower,
            upper,
            reverse,
            done,
        }
    }
}

/// Pull-based walk over an `IndexSnapshot`. Each step narrows the
/// remaining range past the key just returned, so it never borrows the map.
#[derive(Debug)]
pub struct IndexCursor {
    entries: Arc<BTreeMap<Key, IndexEntry>>,
    lower: Bound<Key>,
    upper: Bound<Key>,
    reverse: bool,
    done: bool,
}

impl Iterator for IndexCursor {
    type Item = (Key, IndexEntry);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let found = {
            let mut range = self
                .entries
                .range::<[u8], _>((as_slice(&self.lower), as_slice(&self.upper)));
            let item = if self.reverse {
                range.next_back()
            } else {
                range.next()
            };
            item.map(|(k, e)| (k.clone(), *e))
        };
        match found {
            Some((key, entry)) => {
                if self.reverse {
                    self.upper = Bound::Excluded(key.clone());
                } else {
                    self.lower = Bound::Excluded(key.clone());
                }
                Some((key, entry))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

fn as_slice(bound: &Bound<Key>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// `BTreeMap::range` panics on inverted or empty-exclusive ranges.
fn bounds_ordered(lower: &Bound<Key>, upper: &Bound<Key>) -> bool {
    match (lower, upper) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
        (Bound::Included(l), Bound::Included(u)) => l <= u,
        (Bound::Included(l), Bound::Excluded(u)) | (Bound::Excluded(l), Bound::Included(u)) => {
            l < u
        }
        (Bound::Excluded(l), Bound::Excluded(u)) => l < u,
    }
}
