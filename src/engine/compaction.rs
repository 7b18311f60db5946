//! CINDER - Merge / Compaction
//! Reclaims space held by overwritten, deleted and expired records.
//!
//! ## Algorithm
//! 1. Pick the oldest contiguous run of sealed segments (the active
//!    segment is never touched).
//! 2. Scan them oldest first. A record survives if the index still points
//!    at it, it is a put, and it has not expired. Survivors are packed into
//!    scratch files that reuse the input ids; a record read from segment
//!    `s` is always written to an output id `<= s`, so replaying the
//!    directory still sees every key's versions in write order.
//! 3. Sync the scratch files, then rename them over the inputs in
//!    ascending id order and remove inputs that received no output.
//! 4. Swap the segment handles and repoint the index, but only for keys
//!    whose entry still equals the locator that was scanned.
//!
//! Readers holding older snapshots keep their `Arc<Segment>` handles,
//! which stay readable after the files are replaced.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crate::error::{CinderError, Result};
use crate::types::{now_ms, Key, Locator, RecordKind, SegmentId};

use super::record;
use super::segment::{self, ScanFault, Segment};
use super::{Cinder, Shared};

/// Trait defining which sealed segments a merge pass rewrites.
pub trait CompactionStrategy {
    /// Choose segments to merge from `sealed` (ascending by id).
    /// The result must be a prefix of `sealed`; anything else is rejected.
    fn select(&self, sealed: &[SegmentInfo]) -> Vec<SegmentId>;

    /// Returns the human-readable name of this strategy.
    fn name(&self) -> &str;
}

/// Metadata about a sealed segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: SegmentId,
    /// Size in bytes.
    pub size: u64,
}

/// Merge every sealed segment except the `keep_recent` newest.
#[derive(Debug, Clone, Copy)]
pub struct OldestSealed {
    keep_recent: usize,
}

impl OldestSealed {
    pub fn new(keep_recent: usize) -> Self {
        Self { keep_recent }
    }
}

impl CompactionStrategy for OldestSealed {
    fn select(&self, sealed: &[SegmentInfo]) -> Vec<SegmentId> {
        let take = sealed.len().saturating_sub(self.keep_recent);
        sealed[..take].iter().map(|info| info.id).collect()
    }

    fn name(&self) -> &str {
        "OldestSealed"
    }
}

/// Outcome of one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub segments_in: usize,
    pub segments_out: usize,
    pub records_kept: u64,
    pub records_dropped: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl CompactionStats {
    pub fn reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Releases the "merge running" flag when the pass ends.
struct MergeTicket {
    shared: Arc<Shared>,
}

impl MergeTicket {
    fn acquire(shared: &Arc<Shared>) -> Result<Self> {
        shared
            .merging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CinderError::MergeRunning)?;
        Ok(Self {
            shared: Arc::clone(shared),
        })
    }
}

impl Drop for MergeTicket {
    fn drop(&mut self) {
        self.shared.merging.store(false, Ordering::Release);
    }
}

/// Survivor moved to a new location.
struct Moved {
    key: Key,
    from: Locator,
    to: Locator,
}

/// Index entry whose record is discarded (tombstone or expired put).
struct Dropped {
    key: Key,
    at: Locator,
}

/// Result of copying survivors, before any input is replaced.
struct Rewritten {
    outputs: Vec<(Segment, u64)>,
    moved: Vec<Moved>,
    dropped: Vec<Dropped>,
}

/// Packs surviving records into scratch files named after input ids.
struct OutputWriter<'a> {
    dir: &'a Path,
    ids: &'a [SegmentId],
    segment_size: u64,
    /// Index into `ids` of the output being written.
    slot: usize,
    current: Option<(Segment, u64)>,
    finished: Vec<(Segment, u64)>,
}

impl<'a> OutputWriter<'a> {
    fn new(dir: &'a Path, ids: &'a [SegmentId], segment_size: u64) -> Self {
        Self {
            dir,
            ids,
            segment_size,
            slot: 0,
            current: None,
            finished: Vec::new(),
        }
    }

    /// Write one encoded record that was read from `ids[source]`.
    fn write(&mut self, bytes: &[u8], source: usize) -> io::Result<Locator> {
        let full = matches!(&self.current, Some((_, size)) if *size >= self.segment_size);
        if full && self.slot < source {
            if let Some(sealed) = self.current.take() {
                self.finished.push(sealed);
            }
            self.slot += 1;
        }
        let (segment, size) = match &mut self.current {
            Some(current) => current,
            empty => empty.insert((Segment::create_scratch(self.dir, self.ids[self.slot])?, 0)),
        };
        segment.append(bytes)?;
        let locator = Locator::new(segment.id(), *size, bytes.len() as u32);
        *size += bytes.len() as u64;
        Ok(locator)
    }

    /// Sync every output and hand them back in id order with their sizes.
    fn finish(mut self) -> io::Result<Vec<(Segment, u64)>> {
        if let Some(last) = self.current.take() {
            self.finished.push(last);
        }
        for (segment, _) in &self.finished {
            segment.sync()?;
        }
        Ok(self.finished)
    }
}

/// Remove scratch files for `ids`, ignoring ones that never existed.
fn discard_scratch(dir: &Path, ids: &[SegmentId]) {
    for &id in ids {
        match fs::remove_file(dir.join(segment::scratch_filename(id))) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::error!("Failed to remove scratch file for segment {}: {}", id, e),
        }
    }
}

fn aborted(e: CinderError) -> CinderError {
    match e {
        CinderError::CompactionAborted(_) => e,
        other => CinderError::CompactionAborted(other.to_string()),
    }
}

impl Cinder {
    /// Run a merge pass. With `blocking` false the pass runs on a
    /// background thread and this returns once it has been started.
    /// Fails with `MergeRunning` if another pass is in progress.
    pub fn merge(&self, blocking: bool) -> Result<()> {
        self.ensure_open()?;
        let ticket = MergeTicket::acquire(&self.shared)?;
        if blocking {
            return self.run_merge(ticket).map(|_| ());
        }
        let engine = self.clone();
        let handle = thread::Builder::new()
            .name("cinder-merge".into())
            .spawn(move || {
                if let Err(e) = engine.run_merge(ticket) {
                    log::error!("Background merge failed: {}", e);
                }
            })?;
        self.track_worker(handle);
        Ok(())
    }

    /// Run a merge pass on the calling thread and report what it did.
    pub fn compact(&self) -> Result<CompactionStats> {
        self.ensure_open()?;
        let ticket = MergeTicket::acquire(&self.shared)?;
        self.run_merge(ticket)
    }

    fn run_merge(&self, _ticket: MergeTicket) -> Result<CompactionStats> {
        let _running = self.shared.merge_lock.lock();
        self.ensure_open()?;
        let strategy = OldestSealed::new(self.shared.config.merge_keep_recent);
        let stats = self.compact_with(&strategy)?;
        self.shared.metrics.record_merge(stats.reclaimed());
        log::info!(
            "Merged {} segments into {} ({} records kept, {} dropped, {} bytes reclaimed)",
            stats.segments_in,
            stats.segments_out,
            stats.records_kept,
            stats.records_dropped,
            stats.reclaimed()
        );
        Ok(stats)
    }

    fn compact_with(&self, strategy: &dyn CompactionStrategy) -> Result<CompactionStats> {
        let sealed: Vec<Arc<Segment>> = {
            let active = self.shared.log.lock().active_id();
            let view = self.shared.view.read();
            view.segments
                .range(..active)
                .map(|(_, segment)| Arc::clone(segment))
                .collect()
        };
        let mut infos = Vec::with_capacity(sealed.len());
        for segment in &sealed {
            infos.push(SegmentInfo {
                id: segment.id(),
                size: segment.len()?,
            });
        }

        let selected = strategy.select(&infos);
        let is_prefix = selected.len() <= infos.len()
            && selected.iter().zip(&infos).all(|(id, info)| *id == info.id);
        if !is_prefix {
            return Err(CinderError::CompactionAborted(format!(
                "{} selected a non-prefix run of segments",
                strategy.name()
            )));
        }
        if selected.is_empty() {
            return Ok(CompactionStats::default());
        }
        let inputs = &sealed[..selected.len()];
        log::debug!(
            "{} merging segments {}..={}",
            strategy.name(),
            selected[0],
            selected[selected.len() - 1]
        );

        let dir = self.shared.config.data_dir.as_path();
        let mut stats = CompactionStats {
            segments_in: inputs.len(),
            bytes_before: infos[..inputs.len()].iter().map(|i| i.size).sum(),
            ..Default::default()
        };

        let rewritten = match self.rewrite(inputs, &selected, &mut stats) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                discard_scratch(dir, &selected);
                return Err(aborted(e));
            }
        };
        stats.segments_out = rewritten.outputs.len();
        stats.bytes_after = rewritten.outputs.iter().map(|(_, size)| size).sum();

        let outputs = swap_files(dir, &selected, rewritten.outputs).map_err(|e| {
            discard_scratch(dir, &selected);
            log::error!("Merge stopped while replacing segment files: {}", e);
            aborted(e.into())
        })?;

        let mut view = self.shared.view.write();
        let segments = Arc::make_mut(&mut view.segments);
        for id in &selected {
            segments.remove(id);
        }
        for segment in outputs {
            segments.insert(segment.id(), Arc::new(segment));
        }
        for m in &rewritten.moved {
            view.index.repoint(&m.key, &m.from, m.to);
        }
        for d in &rewritten.dropped {
            view.index.remove_if_at(&d.key, &d.at);
        }
        Ok(stats)
    }

    /// Copy survivors into scratch files.
    fn rewrite(
        &self,
        inputs: &[Arc<Segment>],
        ids: &[SegmentId],
        stats: &mut CompactionStats,
    ) -> Result<Rewritten> {
        let dir = self.shared.config.data_dir.as_path();
        let mut writer = OutputWriter::new(dir, ids, self.shared.config.segment_size);
        let mut moved = Vec::new();
        let mut dropped = Vec::new();
        let now = now_ms();

        for (source, input) in inputs.iter().enumerate() {
            let len = input.len()?;
            for item in input.scan(len) {
                let (record, at) = item.map_err(|fault| match fault {
                    ScanFault::Io(e) => CinderError::Io(e),
                    ScanFault::Invalid { offset, reason, .. } => CinderError::CorruptLog {
                        segment: input.id(),
                        offset,
                        reason: reason.to_string(),
                    },
                })?;
                if record.kind.is_marker() {
                    // Survivors are written as standalone records.
                    continue;
                }

                let current = self.shared.view.read().index.get(&record.key).copied();
                if current.map(|e| e.locator) != Some(at) {
                    // Superseded by a newer record.
                    stats.records_dropped += 1;
                    continue;
                }
                if record.kind == RecordKind::Put && !record.is_expired(now) {
                    let to = writer.write(&record::encode(&record), source)?;
                    moved.push(Moved {
                        key: record.key,
                        from: at,
                        to,
                    });
                    stats.records_kept += 1;
                } else {
                    dropped.push(Dropped {
                        key: record.key,
                        at,
                    });
                    stats.records_dropped += 1;
                }
            }
        }
        Ok(Rewritten {
            outputs: writer.finish()?,
            moved,
            dropped,
        })
    }
}

/// Rename outputs over their inputs in ascending id order and remove
/// inputs that produced nothing. Outputs always hold the lowest ids.
/// An input already gone from disk (an earlier pass failed after
/// removing it) counts as removed.
fn swap_files(
    dir: &Path,
    ids: &[SegmentId],
    outputs: Vec<(Segment, u64)>,
) -> io::Result<Vec<Segment>> {
    let mut outputs: Vec<Segment> = outputs.into_iter().map(|(segment, _)| segment).collect();
    for (i, &id) in ids.iter().enumerate() {
        let target = dir.join(segment::segment_filename(id));
        match outputs.get_mut(i) {
            Some(output) => {
                fs::rename(output.path(), &target)?;
                output.relocate(target);
            }
            None => match fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log::debug!("Segment {} was already removed", id);
                }
                Err(e) => return Err(e),
            },
        }
    }
    Ok(outputs)
}
