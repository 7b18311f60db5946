//! CINDER - Segment Log (write side)
//! Owns the active segment and serializes appends to it.
//! Rotation is the only place a new segment is created: once the active
//! segment reaches `segment_size` it is synced, sealed, and replaced
//! before the next write proceeds.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, SyncPolicy};
use crate::error::Result;
use crate::types::{Locator, SegmentId};

use super::segment::Segment;

/// Appender for the active segment.
pub struct SegmentLog {
    dir: PathBuf,
    active: Arc<Segment>,
    /// Bytes written to the active segment.
    active_size: u64,
    next_id: u64,
    segment_size: u64,
    sync: SyncPolicy,
    /// Appends not yet forced to disk.
    dirty: bool,
}

impl SegmentLog {
    /// Resume appending to `active`, whose valid length is `active_size`.
    pub fn new(config: &Config, active: Arc<Segment>, active_size: u64) -> Self {
        let next_id = active.id().0 + 1;
        Self {
            dir: config.data_dir.clone(),
            active,
            active_size,
            next_id,
            segment_size: config.segment_size,
            sync: config.sync,
            dirty: false,
        }
    }

    pub fn active(&self) -> &Arc<Segment> {
        &self.active
    }

    pub fn active_id(&self) -> SegmentId {
        self.active.id()
    }

    pub fn active_size(&self) -> u64 {
        self.active_size
    }

    /// Seal the active segment if it is full and open its successor.
    /// Returns the new segment so the caller can publish it to readers.
    pub fn rotate_if_full(&mut self) -> Result<Option<Arc<Segment>>> {
        if self.active_size < self.segment_size {
            return Ok(None);
        }
        self.active.sync()?;
        let id = SegmentId(self.next_id);
        let segment = Arc::new(Segment::create(&self.dir, id)?);
        log::debug!(
            "Sealed segment {} at {} bytes, active is now {}",
            self.active.id(),
            self.active_size,
            id
        );
        self.next_id += 1;
        self.active = Arc::clone(&segment);
        self.active_size = 0;
        self.dirty = false;
        Ok(Some(segment))
    }

    /// Append one encoded record to the tail of the active segment.
    /// On failure the tail is cut back so the write leaves no trace.
    pub fn append(&mut self, bytes: &[u8]) -> Result<Locator> {
        let offset = self.active_size;
        let written = self.active.append(bytes).and_then(|()| {
            if self.sync == SyncPolicy::Always {
                self.active.sync()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(cut) = self.active.truncate(offset) {
                log::error!(
                    "Failed to cut torn write in segment {} at {}: {}",
                    self.active.id(),
                    offset,
                    cut
                );
                self.active_size = self.active.len().unwrap_or(offset);
            }
            return Err(e.into());
        }

        self.active_size += bytes.len() as u64;
        self.dirty = self.sync != SyncPolicy::Always;
        Ok(Locator::new(self.active.id(), offset, bytes.len() as u32))
    }

    /// Hand out the active segment if it has unsynced appends.
    /// Lets the periodic syncer fsync without holding the write lock.
    pub fn take_unsynced(&mut self) -> Option<Arc<Segment>> {
        if self.dirty {
            self.dirty = false;
            Some(Arc::clone(&self.active))
        } else {
            None
        }
    }

    /// Force the active segment to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.active.sync()?;
        self.dirty = false;
        Ok(())
    }
}
