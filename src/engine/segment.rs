//! CINDER - Segment Files
//! A segment is one append-only file of the log, named by its id
//! (e.g. `0000000001.seg`). Reads are positional so any number of
//! readers can share a handle with the appender.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{CinderError, Result};
use crate::types::{Locator, Record, SegmentId};

use super::record::{self, DecodeError, HEADER_SIZE};

/// Extension of live segment files.
pub const SEGMENT_EXT: &str = "seg";
/// Extension of compaction scratch files awaiting rename.
pub const SCRATCH_EXT: &str = "compact";

/// Generate a segment filename, e.g. `0000000001.seg`.
pub fn segment_filename(id: SegmentId) -> String {
    format!("{id}.{SEGMENT_EXT}")
}

/// Generate a compaction scratch filename, e.g. `0000000001.seg.compact`.
pub fn scratch_filename(id: SegmentId) -> String {
    format!("{id}.{SEGMENT_EXT}.{SCRATCH_EXT}")
}

/// Return every segment id found in `dir`, ascending.
pub fn list_segments(dir: &Path) -> io::Result<Vec<SegmentId>> {
    let suffix = format!(".{SEGMENT_EXT}");
    let mut ids: Vec<SegmentId> = fs::read_dir(dir)?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name().into_string().ok()?;
            let stem = name.strip_suffix(&suffix)?;
            stem.parse::<u64>().ok().map(SegmentId)
        })
        .collect();
    ids.sort();
    Ok(ids)
}

/// Delete scratch files left behind by an interrupted compaction.
pub fn remove_scratch_files(dir: &Path) -> io::Result<usize> {
    let suffix = format!(".{SEGMENT_EXT}.{SCRATCH_EXT}");
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_scratch = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(&suffix));
        if is_scratch {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Handle to one segment file.
#[derive(Debug)]
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    file: File,
}

impl Segment {
    /// Create a new, empty segment file. Fails if it already exists.
    pub fn create(dir: &Path, id: SegmentId) -> io::Result<Self> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self { id, path, file })
    }

    /// Create (or reset) the compaction scratch file for `id`.
    pub fn create_scratch(dir: &Path, id: SegmentId) -> io::Result<Self> {
        let path = dir.join(scratch_filename(id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { id, path, file })
    }

    /// Record that the file now lives at `path` (after a rename).
    pub(crate) fn relocate(&mut self, path: PathBuf) {
        self.path = path;
    }

    /// Open an existing segment file.
    pub fn open(dir: &Path, id: SegmentId) -> io::Result<Self> {
        Self::open_path(dir.join(segment_filename(id)), id)
    }

    /// Open a segment stored at an explicit path (used for scratch files).
    pub fn open_path(path: PathBuf, id: SegmentId) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        Ok(Self { id, path, file })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length in bytes.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Append raw bytes at the end of the file.
    pub fn append(&self, bytes: &[u8]) -> io::Result<()> {
        (&self.file).write_all(bytes)
    }

    /// Force appended bytes to persistent storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Cut the file back to `len` bytes (drops a torn tail).
    pub fn truncate(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()
    }

    /// Read into `buf` starting at `offset`, returning the bytes read.
    #[cfg(unix)]
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)
    }

    /// Fill `buf` from `offset` or fail with `UnexpectedEof`.
    pub fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read and verify the record at `locator`.
    pub fn read_record(&self, locator: &Locator) -> Result<Record> {
        let mut buf = vec![0u8; locator.len as usize];
        self.read_exact_at(&mut buf, locator.offset)?;
        record::decode(&buf).map_err(|reason| CinderError::CorruptLog {
            segment: self.id,
            offset: locator.offset,
            reason: reason.to_string(),
        })
    }

    /// Sequentially decode the first `len` bytes of this segment.
    pub fn scan(self: &Arc<Self>, len: u64) -> SegmentScanner {
        SegmentScanner {
            id: self.id,
            reader: BufReader::new(SegmentCursor {
                segment: Arc::clone(self),
                pos: 0,
            }),
            offset: 0,
            len,
            stopped: false,
        }
    }
}

/// `Read` adapter over positional reads, so scans never disturb the appender.
struct SegmentCursor {
    segment: Arc<Segment>,
    pos: u64,
}

impl Read for SegmentCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.segment.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Why a scan stopped before the end of the segment.
#[derive(Debug)]
pub enum ScanFault {
    /// Bytes at `offset` do not form a complete, valid record.
    /// `reaches_end` is set when the bad record runs to (or past) the end
    /// of the scanned range, i.e. nothing valid could follow it.
    Invalid {
        offset: u64,
        reason: DecodeError,
        reaches_end: bool,
    },
    Io(io::Error),
}

/// Iterator over the records of a segment in write order.
/// Fuses after the first fault.
pub struct SegmentScanner {
    id: SegmentId,
    reader: BufReader<SegmentCursor>,
    offset: u64,
    len: u64,
    stopped: bool,
}

impl SegmentScanner {
    /// Offset just past the last record returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn invalid(
        &mut self,
        reason: DecodeError,
        reaches_end: bool,
    ) -> Option<std::result::Result<(Record, Locator), ScanFault>> {
        self.stopped = true;
        Some(Err(ScanFault::Invalid {
            offset: self.offset,
            reason,
            reaches_end,
        }))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> std::result::Result<(), ScanFault> {
        self.reader.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ScanFault::Invalid {
                    offset: self.offset,
                    reason: DecodeError::Truncated,
                    reaches_end: true,
                }
            } else {
                ScanFault::Io(e)
            }
        })
    }
}

impl Iterator for SegmentScanner {
    type Item = std::result::Result<(Record, Locator), ScanFault>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped || self.offset >= self.len {
            return None;
        }
        let remaining = self.len - self.offset;
        if remaining < HEADER_SIZE as u64 {
            return self.invalid(DecodeError::Truncated, true);
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        if let Err(fault) = self.read_exact(&mut header_bytes) {
            self.stopped = true;
            return Some(Err(fault));
        }
        let header = match record::decode_header(&header_bytes) {
            Ok(header) => header,
            Err(reason) => {
                let reaches_end =
                    record::declared_len(&header_bytes).map_or(true, |len| len >= remaining);
                return self.invalid(reason, reaches_end);
            }
        };
        let total = header.record_len();
        let len = match u32::try_from(total) {
            Ok(len) if total <= remaining => len,
            _ => return self.invalid(DecodeError::Truncated, true),
        };

        let mut buf = vec![0u8; total as usize];
        buf[..HEADER_SIZE].copy_from_slice(&header_bytes);
        if let Err(fault) = self.read_exact(&mut buf[HEADER_SIZE..]) {
            self.stopped = true;
            return Some(Err(fault));
        }
        let record = match record::decode(&buf) {
            Ok(record) => record,
            Err(reason) => return self.invalid(reason, total == remaining),
        };

        let locator = Locator::new(self.id, self.offset, len);
        self.offset += total;
        Some(Ok((record, locator)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_records(segment: &Segment, records: &[Record]) -> Vec<u64> {
        let mut offsets = Vec::new();
        let mut offset = 0;
        for r in records {
            let bytes = record::encode(r);
            offsets.push(offset);
            offset += bytes.len() as u64;
            segment.append(&bytes).unwrap();
        }
        offsets
    }

    #[test]
    fn test_filename_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(segment_filename(SegmentId(7)), "0000000007.seg");
        Segment::create(dir.path(), SegmentId(3)).unwrap();
        Segment::create(dir.path(), SegmentId(1)).unwrap();
        fs::write(dir.path().join("LOCK"), b"").unwrap();
        fs::write(dir.path().join(scratch_filename(SegmentId(1))), b"x").unwrap();

        let ids = list_segments(dir.path()).unwrap();
        assert_eq!(ids, vec![SegmentId(1), SegmentId(3)]);
        assert_eq!(remove_scratch_files(dir.path()).unwrap(), 1);
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = tempfile::tempdir().unwrap();
        Segment::create(dir.path(), SegmentId(1)).unwrap();
        assert!(Segment::create(dir.path(), SegmentId(1)).is_err());
    }

    #[test]
    fn test_read_record_at_locator() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Segment::create(dir.path(), SegmentId(1)).unwrap();
        let records = vec![
            Record::put(b"a".to_vec(), b"1".to_vec()),
            Record::put(b"b".to_vec(), b"22".to_vec()),
        ];
        let offsets = write_records(&segment, &records);

        let len = record::encoded_len(1, 2) as u32;
        let got = segment
            .read_record(&Locator::new(SegmentId(1), offsets[1], len))
            .unwrap();
        assert_eq!(got, records[1]);
    }

    #[test]
    fn test_scan_stops_at_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Arc::new(Segment::create(dir.path(), SegmentId(1)).unwrap());
        write_records(
            &segment,
            &[
                Record::put(b"a".to_vec(), b"1".to_vec()),
                Record::delete(b"a".to_vec()),
            ],
        );
        let good_len = segment.len().unwrap();
        let torn = record::encode(&Record::put(b"c".to_vec(), b"333".to_vec()));
        segment.append(&torn[..torn.len() - 2]).unwrap();

        let mut scanner = segment.scan(segment.len().unwrap());
        assert!(scanner.next().unwrap().is_ok());
        let (tomb, _) = scanner.next().unwrap().unwrap();
        assert!(tomb.is_tombstone());
        match scanner.next() {
            Some(Err(ScanFault::Invalid {
                offset,
                reason,
                reaches_end,
            })) => {
                assert_eq!(offset, good_len);
                assert_eq!(reason, DecodeError::Truncated);
                assert!(reaches_end);
            }
            other => panic!("expected torn tail, got {other:?}"),
        }
        assert!(scanner.next().is_none());
        assert_eq!(scanner.offset(), good_len);
    }

    #[test]
    fn test_checksum_failure_before_valid_records() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Arc::new(Segment::create(dir.path(), SegmentId(1)).unwrap());
        let mut first = record::encode(&Record::put(b"a".to_vec(), b"1".to_vec()));
        first[HEADER_SIZE + 1] ^= 0x01;
        segment.append(&first).unwrap();
        segment
            .append(&record::encode(&Record::put(b"b".to_vec(), b"2".to_vec())))
            .unwrap();

        let mut scanner = segment.scan(segment.len().unwrap());
        match scanner.next() {
            Some(Err(ScanFault::Invalid {
                offset: 0,
                reason: DecodeError::Checksum { .. },
                reaches_end: false,
            })) => {}
            other => panic!("expected mid-segment checksum failure, got {other:?}"),
        }
    }
}
