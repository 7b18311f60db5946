//! CINDER - Crash Recovery
//! Rebuilds the in-memory index by replaying every segment in id order.
//!
//! Only the newest segment may legitimately end in a partial record (a
//! write cut short by a crash); it is truncated back to its last valid
//! record. A damaged record that has bytes after it, or a bad record in
//! any older segment, means the log is corrupt and opening fails.
//!
//! Records between `BatchBegin` and `BatchEnd` markers are buffered and
//! only indexed once the closing marker is seen. A batch still open at
//! the end of the newest segment was never committed and is cut off.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{CinderError, Result};
use crate::types::{Locator, Record, RecordKind, SegmentId};

use super::index::{IndexEntry, KeyIndex};
use super::segment::{self, ScanFault, Segment};

/// State reconstructed from disk.
pub struct Recovered {
    pub index: KeyIndex,
    pub segments: BTreeMap<SegmentId, Arc<Segment>>,
    /// Segment that receives new appends.
    pub active: Arc<Segment>,
    /// Valid length of the active segment.
    pub active_size: u64,
    /// Records replayed.
    pub records: u64,
}

/// A batch whose closing marker has not been read yet.
struct OpenBatch {
    /// Offset of the `BatchBegin` marker.
    start: u64,
    expected: u32,
    records: Vec<(Record, Locator)>,
}

/// Index state built up while replaying.
#[derive(Default)]
struct Replay {
    index: KeyIndex,
    records: u64,
    batch: Option<OpenBatch>,
}

impl Replay {
    fn apply(&mut self, record: Record, locator: Locator) {
        let entry = IndexEntry::for_record(&record, locator);
        self.index.insert(record.key, entry);
        self.records += 1;
    }

    fn replay(&mut self, record: Record, locator: Locator) -> std::result::Result<(), String> {
        match record.kind {
            RecordKind::BatchBegin => {
                if self.batch.is_some() {
                    return Err("batch opened inside another batch".into());
                }
                let expected = record.marker_count().ok_or("malformed batch marker")?;
                self.batch = Some(OpenBatch {
                    start: locator.offset,
                    expected,
                    records: Vec::new(),
                });
            }
            RecordKind::BatchEnd => {
                let batch = self.batch.take().ok_or("batch end without a batch")?;
                let count = record.marker_count().ok_or("malformed batch marker")?;
                if count != batch.expected || batch.records.len() != count as usize {
                    return Err(format!(
                        "batch declared {} records but holds {}",
                        batch.expected,
                        batch.records.len()
                    ));
                }
                for (record, locator) in batch.records {
                    self.apply(record, locator);
                }
            }
            RecordKind::Put | RecordKind::Delete => match &mut self.batch {
                Some(batch) => batch.records.push((record, locator)),
                None => self.apply(record, locator),
            },
        }
        Ok(())
    }
}

fn corrupt(segment: SegmentId, offset: u64, reason: impl ToString) -> CinderError {
    CinderError::CorruptLog {
        segment,
        offset,
        reason: reason.to_string(),
    }
}

pub fn rebuild(config: &Config) -> Result<Recovered> {
    let dir = &config.data_dir;
    let ids = segment::list_segments(dir)?;
    let Some(&last) = ids.last() else {
        let active = Arc::new(Segment::create(dir, SegmentId(1))?);
        log::debug!("No segments found in {:?}, created {}", dir, active.id());
        return Ok(Recovered {
            index: KeyIndex::new(),
            segments: BTreeMap::from([(active.id(), Arc::clone(&active))]),
            active,
            active_size: 0,
            records: 0,
        });
    };

    let mut replay = Replay::default();
    let mut segments = BTreeMap::new();
    let mut active_size = 0u64;

    for id in ids {
        let segment = Arc::new(Segment::open(dir, id)?);
        let len = segment.len()?;
        let mut scanner = segment.scan(len);
        for item in &mut scanner {
            match item {
                Ok((record, locator)) => {
                    replay
                        .replay(record, locator)
                        .map_err(|reason| corrupt(id, locator.offset, reason))?;
                }
                Err(ScanFault::Io(e)) => return Err(e.into()),
                Err(ScanFault::Invalid {
                    offset,
                    reason,
                    reaches_end: true,
                }) if id == last => {
                    log::warn!(
                        "Truncating segment {} from {} to {} bytes: {}",
                        id,
                        len,
                        offset,
                        reason
                    );
                    segment.truncate(offset)?;
                }
                Err(ScanFault::Invalid { offset, reason, .. }) => {
                    return Err(corrupt(id, offset, reason));
                }
            }
        }

        let mut valid_len = scanner.offset();
        if let Some(batch) = replay.batch.take() {
            if id != last {
                return Err(corrupt(id, batch.start, "batch never committed"));
            }
            log::warn!(
                "Discarding uncommitted batch of {} records in segment {} at offset {}",
                batch.records.len(),
                id,
                batch.start
            );
            segment.truncate(batch.start)?;
            valid_len = batch.start;
        }
        if id == last {
            active_size = valid_len;
        }
        segments.insert(id, segment);
    }

    let Replay { index, records, .. } = replay;
    let active = Arc::clone(&segments[&last]);
    log::info!(
        "Recovered {} records from {} segments ({} keys indexed)",
        records,
        segments.len(),
        index.len()
    );
    Ok(Recovered {
        index,
        segments,
        active,
        active_size,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::record;
    use crate::types::Record;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn write_segment(dir: &std::path::Path, id: u64, records: &[Record]) {
        let segment = Segment::create(dir, SegmentId(id)).unwrap();
        for r in records {
            segment.append(&record::encode(r)).unwrap();
        }
    }

    fn append_raw(dir: &std::path::Path, id: u64, bytes: &[u8]) {
        let path = dir.join(segment::segment_filename(SegmentId(id)));
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
    }

    #[test]
    fn test_empty_dir_creates_first_segment() {
        let dir = tempfile::tempdir().unwrap();
        let recovered = rebuild(&Config::new(dir.path())).unwrap();
        assert_eq!(recovered.active.id(), SegmentId(1));
        assert!(recovered.index.is_empty());
        assert_eq!(recovered.segments.len(), 1);
    }

    #[test]
    fn test_newest_record_wins_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(
            dir.path(),
            1,
            &[
                Record::put(b"a".to_vec(), b"1".to_vec()),
                Record::put(b"b".to_vec(), b"1".to_vec()),
            ],
        );
        write_segment(
            dir.path(),
            2,
            &[
                Record::put(b"a".to_vec(), b"2".to_vec()),
                Record::delete(b"b".to_vec()),
            ],
        );

        let recovered = rebuild(&Config::new(dir.path())).unwrap();
        assert_eq!(recovered.records, 4);
        assert_eq!(recovered.active.id(), SegmentId(2));
        let a = recovered.index.get(b"a").unwrap();
        assert_eq!(a.locator.segment_id, SegmentId(2));
        assert!(!recovered.index.get(b"b").unwrap().is_live(0));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), 1, &[Record::put(b"k".to_vec(), b"v".to_vec())]);
        let valid = record::encoded_len(1, 1) as u64;
        let torn = record::encode(&Record::put(b"x".to_vec(), b"yyyy".to_vec()));
        append_raw(dir.path(), 1, &torn[..torn.len() - 3]);

        let recovered = rebuild(&Config::new(dir.path())).unwrap();
        assert_eq!(recovered.records, 1);
        assert_eq!(recovered.active_size, valid);
        assert_eq!(recovered.active.len().unwrap(), valid);
        assert!(recovered.index.get(b"x").is_none());
    }

    #[test]
    fn test_checksum_failure_before_valid_records_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(
            dir.path(),
            1,
            &[
                Record::put(b"a".to_vec(), b"1".to_vec()),
                Record::put(b"b".to_vec(), b"2".to_vec()),
                Record::put(b"c".to_vec(), b"3".to_vec()),
            ],
        );
        let path = dir.path().join(segment::segment_filename(SegmentId(1)));
        let mut bytes = std::fs::read(&path).unwrap();
        let original_len = bytes.len() as u64;
        bytes[record::HEADER_SIZE + 1] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        match rebuild(&Config::new(dir.path())) {
            Err(CinderError::CorruptLog { segment, offset, .. }) => {
                assert_eq!(segment, SegmentId(1));
                assert_eq!(offset, 0);
            }
            other => panic!("expected CorruptLog, got {:?}", other.map(|r| r.records)),
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), original_len);
    }

    #[test]
    fn test_damaged_last_record_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(
            dir.path(),
            1,
            &[
                Record::put(b"a".to_vec(), b"1".to_vec()),
                Record::put(b"b".to_vec(), b"2".to_vec()),
            ],
        );
        let path = dir.path().join(segment::segment_filename(SegmentId(1)));
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let recovered = rebuild(&Config::new(dir.path())).unwrap();
        assert_eq!(recovered.records, 1);
        assert_eq!(recovered.active_size, record::encoded_len(1, 1) as u64);
        assert!(recovered.index.get(b"b").is_none());
    }

    #[test]
    fn test_committed_batch_is_indexed() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(
            dir.path(),
            1,
            &[
                Record::batch_marker(RecordKind::BatchBegin, 2),
                Record::put(b"a".to_vec(), b"1".to_vec()),
                Record::delete(b"b".to_vec()),
                Record::batch_marker(RecordKind::BatchEnd, 2),
            ],
        );

        let recovered = rebuild(&Config::new(dir.path())).unwrap();
        assert_eq!(recovered.records, 2);
        assert!(recovered.index.get(b"a").unwrap().is_live(0));
        assert!(recovered.index.get(b"").is_none());
    }

    #[test]
    fn test_uncommitted_batch_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(
            dir.path(),
            1,
            &[
                Record::put(b"k".to_vec(), b"v".to_vec()),
                Record::batch_marker(RecordKind::BatchBegin, 2),
                Record::put(b"a".to_vec(), b"1".to_vec()),
                Record::put(b"b".to_vec(), b"2".to_vec()),
            ],
        );
        let committed = record::encoded_len(1, 1) as u64;

        let recovered = rebuild(&Config::new(dir.path())).unwrap();
        assert_eq!(recovered.records, 1);
        assert_eq!(recovered.active_size, committed);
        assert_eq!(recovered.active.len().unwrap(), committed);
        assert!(recovered.index.get(b"a").is_none());
        assert!(recovered.index.get(b"b").is_none());
    }

    #[test]
    fn test_unterminated_batch_in_sealed_segment_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(
            dir.path(),
            1,
            &[
                Record::batch_marker(RecordKind::BatchBegin, 1),
                Record::put(b"a".to_vec(), b"1".to_vec()),
            ],
        );
        write_segment(dir.path(), 2, &[Record::put(b"z".to_vec(), b"v".to_vec())]);

        assert!(matches!(
            rebuild(&Config::new(dir.path())),
            Err(CinderError::CorruptLog { segment: SegmentId(1), offset: 0, .. })
        ));
    }

    #[test]
    fn test_corruption_in_sealed_segment_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), 1, &[Record::put(b"k".to_vec(), b"v".to_vec())]);
        append_raw(dir.path(), 1, &[0xAB; 30]);
        write_segment(dir.path(), 2, &[Record::put(b"z".to_vec(), b"v".to_vec())]);

        match rebuild(&Config::new(dir.path())) {
            Err(CinderError::CorruptLog { segment, offset, .. }) => {
                assert_eq!(segment, SegmentId(1));
                assert_eq!(offset, record::encoded_len(1, 1) as u64);
            }
            other => panic!("expected CorruptLog, got {:?}", other.map(|r| r.records)),
        }
    }
}
