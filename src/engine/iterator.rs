//! CINDER - Ordered Iteration
//! Lazy, pull-based iterators over a point-in-time snapshot of the index,
//! plus the visitor-style `ascend`/`descend` family built on top of them.
//!
//! An iterator captures the index and the open segment handles when it
//! is created. Later writes, deletes and merges are not visible to it,
//! and dropping it part-way has no side effects.

use std::ops::{Bound, ControlFlow};

use crate::error::Result;
use crate::types::{now_ms, Key, Value};

use super::index::IndexCursor;
use super::{segment_for, Cinder, SegmentTable};

/// Range and direction of an iteration.
#[derive(Debug, Clone)]
pub struct IterOptions {
    lower: Bound<Key>,
    upper: Bound<Key>,
    reverse: bool,
}

impl Default for IterOptions {
    fn default() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            reverse: false,
        }
    }
}

impl IterOptions {
    /// Full scan in ascending order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit bounds, in the form `BTreeMap::range` takes them.
    pub fn range(mut self, lower: Bound<Key>, upper: Bound<Key>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    /// Start at `key` (inclusive).
    pub fn from(mut self, key: impl Into<Key>) -> Self {
        self.lower = Bound::Included(key.into());
        self
    }

    /// Start just past `key`.
    pub fn after(mut self, key: impl Into<Key>) -> Self {
        self.lower = Bound::Excluded(key.into());
        self
    }

    /// Stop before `key`.
    pub fn until(mut self, key: impl Into<Key>) -> Self {
        self.upper = Bound::Excluded(key.into());
        self
    }

    /// Stop at `key` (inclusive).
    pub fn through(mut self, key: impl Into<Key>) -> Self {
        self.upper = Bound::Included(key.into());
        self
    }

    /// Only keys starting with `prefix`.
    pub fn prefix(mut self, prefix: impl Into<Key>) -> Self {
        let prefix = prefix.into();
        self.upper = match prefix_successor(&prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        self.lower = Bound::Included(prefix);
        self
    }

    /// Walk from the upper bound down.
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// Smallest key greater than every key that starts with `prefix`.
/// `None` when no such key exists (empty or all-0xFF prefix).
fn prefix_successor(prefix: &[u8]) -> Option<Key> {
    let last = prefix.iter().rposition(|&b| b != 0xFF)?;
    let mut end = prefix[..=last].to_vec();
    end[last] += 1;
    Some(end)
}

/// Iterator over live `(key, value)` pairs.
///
/// Values are read from disk one at a time as the iterator advances.
pub struct Iter {
    cursor: IndexCursor,
    segments: SegmentTable,
    now: u64,
}

impl Iterator for Iter {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, entry) = self.cursor.next()?;
            if !entry.is_live(self.now) {
                continue;
            }
            let record = segment_for(&self.segments, entry.locator.segment_id)
                .and_then(|segment| segment.read_record(&entry.locator));
            return Some(record.map(|record| (key, record.value)));
        }
    }
}

/// Iterator over live keys only. Never touches disk.
pub struct Keys {
    cursor: IndexCursor,
    now: u64,
}

impl Iterator for Keys {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        loop {
            let (key, entry) = self.cursor.next()?;
            if entry.is_live(self.now) {
                return Some(key);
            }
        }
    }
}

impl Cinder {
    /// Lazy iterator over the live pairs selected by `opts`.
    pub fn iter(&self, opts: IterOptions) -> Result<Iter> {
        self.ensure_open()?;
        let (snapshot, segments) = {
            let view = self.shared.view.read();
            (view.index.snapshot(), view.segments.clone())
        };
        self.shared.metrics.record_scan();
        Ok(Iter {
            cursor: snapshot.cursor(opts.lower, opts.upper, opts.reverse),
            segments,
            now: now_ms(),
        })
    }

    /// Lazy iterator over the live keys selected by `opts`.
    pub fn keys(&self, opts: IterOptions) -> Result<Keys> {
        self.ensure_open()?;
        let snapshot = self.shared.view.read().index.snapshot();
        self.shared.metrics.record_scan();
        Ok(Keys {
            cursor: snapshot.cursor(opts.lower, opts.upper, opts.reverse),
            now: now_ms(),
        })
    }

    /// Visit every live pair in ascending key order.
    pub fn ascend<F>(&self, visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.visit(IterOptions::new(), visitor)
    }

    /// Visit every live pair in descending key order.
    pub fn descend<F>(&self, visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.visit(IterOptions::new().reverse(), visitor)
    }

    /// Visit live pairs with `start <= key <= end`, ascending.
    pub fn ascend_range<F>(&self, start: &[u8], end: &[u8], visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.visit(IterOptions::new().from(start).through(end), visitor)
    }

    /// Visit live pairs with `start <= key <= end`, descending from `end`.
    pub fn descend_range<F>(&self, start: &[u8], end: &[u8], visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.visit(IterOptions::new().from(start).through(end).reverse(), visitor)
    }

    /// Visit live keys `>= start` (or all keys), ascending.
    pub fn ascend_keys<F>(&self, start: Option<&[u8]>, visitor: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        let mut opts = IterOptions::new();
        if let Some(start) = start {
            opts = opts.from(start);
        }
        self.visit_keys(opts, visitor)
    }

    /// Visit live keys `<= start` (or all keys), descending.
    pub fn descend_keys<F>(&self, start: Option<&[u8]>, visitor: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        let mut opts = IterOptions::new().reverse();
        if let Some(start) = start {
            opts = opts.through(start);
        }
        self.visit_keys(opts, visitor)
    }

    fn visit<F>(&self, opts: IterOptions, mut visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        for item in self.iter(opts)? {
            let (key, value) = item?;
            if visitor(&key, &value).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn visit_keys<F>(&self, opts: IterOptions, mut visitor: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        for key in self.keys(opts)? {
            if visitor(&key).is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn seeded(dir: &std::path::Path) -> Cinder {
        let engine = Cinder::open(Config::new(dir)).unwrap();
        for key in ["apple", "apricot", "banana", "cherry", "date"] {
            engine
                .put(key.as_bytes().to_vec(), key.to_uppercase().into_bytes())
                .unwrap();
        }
        engine
    }

    fn collect_keys(keys: Keys) -> Vec<String> {
        keys.map(|k| String::from_utf8(k).unwrap()).collect()
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(&[b'a', 0xFF]), Some(b"b".to_vec()));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_successor(b""), None);
    }

    #[test]
    fn test_prefix_scan() {
        let dir = tempfile::tempdir().unwrap();
        let engine = seeded(dir.path());
        let keys = collect_keys(engine.keys(IterOptions::new().prefix("ap")).unwrap());
        assert_eq!(keys, vec!["apple", "apricot"]);
    }

    #[test]
    fn test_bounds_and_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let engine = seeded(dir.path());

        let half_open = collect_keys(
            engine
                .keys(IterOptions::new().from("apricot").until("cherry"))
                .unwrap(),
        );
        assert_eq!(half_open, vec!["apricot", "banana"]);

        let reversed = collect_keys(
            engine
                .keys(IterOptions::new().after("apple").through("cherry").reverse())
                .unwrap(),
        );
        assert_eq!(reversed, vec!["cherry", "banana", "apricot"]);
    }

    #[test]
    fn test_iter_reads_values_and_skips_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = seeded(dir.path());
        engine.delete(b"banana").unwrap();

        let pairs: Vec<(Key, Value)> = engine
            .iter(IterOptions::new().from("b"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            pairs,
            vec![
                (b"cherry".to_vec(), b"CHERRY".to_vec()),
                (b"date".to_vec(), b"DATE".to_vec()),
            ]
        );
    }

    #[test]
    fn test_iterator_sees_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let engine = seeded(dir.path());
        let mut iter = engine.iter(IterOptions::new()).unwrap();
        engine.put(b"aardvark".to_vec(), b"new".to_vec()).unwrap();
        engine.delete(b"date").unwrap();

        let (first, _) = iter.next().unwrap().unwrap();
        assert_eq!(first, b"apple".to_vec());
        let rest: Vec<Key> = iter.map(|item| item.unwrap().0).collect();
        assert_eq!(rest.last(), Some(&b"date".to_vec()));
    }

    #[test]
    fn test_visitor_stops_on_break() {
        let dir = tempfile::tempdir().unwrap();
        let engine = seeded(dir.path());
        let mut seen = Vec::new();
        engine
            .descend(|key, _| {
                seen.push(key.to_vec());
                if seen.len() == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(seen, vec![b"date".to_vec(), b"cherry".to_vec()]);
    }

    #[test]
    fn test_key_visitors_with_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = seeded(dir.path());

        let mut up = Vec::new();
        engine
            .ascend_keys(Some(b"banana"), |k| {
                up.push(k.to_vec());
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(up, vec![b"banana".to_vec(), b"cherry".to_vec(), b"date".to_vec()]);

        let mut down = Vec::new();
        engine
            .descend_keys(Some(b"apricot"), |k| {
                down.push(k.to_vec());
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(down, vec![b"apricot".to_vec(), b"apple".to_vec()]);
    }

    #[test]
    fn test_range_visitors_are_closed_intervals() {
        let dir = tempfile::tempdir().unwrap();
        let engine = seeded(dir.path());
        let mut seen = Vec::new();
        engine
            .descend_range(b"banana", b"date", |k, v| {
                seen.push((k.to_vec(), v.to_vec()));
                ControlFlow::Continue(())
            })
            .unwrap();
        let keys: Vec<Key> = seen.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"date".to_vec(), b"cherry".to_vec(), b"banana".to_vec()]);
        assert_eq!(seen[0].1, b"DATE".to_vec());
    }
}
