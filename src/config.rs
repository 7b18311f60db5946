//! CINDER - Engine Configuration
//! Defines tunable parameters for the log-structured storage engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CinderError, Result};

/// When appended records are forced to persistent storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPolicy {
    /// fsync after every write before it is acknowledged.
    Always,
    /// fsync from a background thread at the given interval.
    Periodic(Duration),
    /// Leave flushing to the OS page cache.
    Never,
}

/// Configuration for the Cinder storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the numbered segment files.
    pub data_dir: PathBuf,

    /// Size in bytes at which the active segment is sealed and a new one started.
    pub segment_size: u64,

    /// Durability policy for appends.
    pub sync: SyncPolicy,

    /// Maximum key length in bytes.
    pub max_key_size: usize,

    /// Maximum value length in bytes.
    pub max_value_size: usize,

    /// Most distinct keys a single write batch may touch.
    pub max_batch_size: usize,

    /// Capacity of the watch queues. Zero disables watching.
    pub watch_queue_size: usize,

    /// Number of most recent sealed segments that merge leaves alone.
    pub merge_keep_recent: usize,

    /// Run a merge in the background at this interval.
    pub auto_merge_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            segment_size: 64 * 1024 * 1024, // 64 MB
            sync: SyncPolicy::Never,
            max_key_size: 64 * 1024,
            max_value_size: 16 * 1024 * 1024,
            max_batch_size: 10_000,
            watch_queue_size: 0,
            merge_keep_recent: 0,
            auto_merge_interval: None,
        }
    }
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the segment rotation threshold.
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_sync(mut self, sync: SyncPolicy) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_max_key_size(mut self, size: usize) -> Self {
        self.max_key_size = size;
        self
    }

    pub fn with_max_value_size(mut self, size: usize) -> Self {
        self.max_value_size = size;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Enable watching with the given queue capacity.
    pub fn with_watch_queue_size(mut self, size: usize) -> Self {
        self.watch_queue_size = size;
        self
    }

    pub fn with_merge_keep_recent(mut self, count: usize) -> Self {
        self.merge_keep_recent = count;
        self
    }

    /// Merge automatically every `interval`.
    pub fn with_auto_merge(mut self, interval: Duration) -> Self {
        self.auto_merge_interval = Some(interval);
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(CinderError::Config("data_dir is empty".into()));
        }
        if self.segment_size == 0 {
            return Err(CinderError::Config(
                "segment_size must be greater than 0".into(),
            ));
        }
        if self.max_key_size == 0 {
            return Err(CinderError::Config(
                "max_key_size must be greater than 0".into(),
            ));
        }
        if self.max_batch_size == 0 || self.max_batch_size > u32::MAX as usize {
            return Err(CinderError::Config(
                "max_batch_size must be between 1 and u32::MAX".into(),
            ));
        }
        // A whole record (header + key + value + crc) must fit a u32 locator length.
        let largest_record = self.max_key_size as u64 + self.max_value_size as u64 + 21;
        if largest_record > u32::MAX as u64 {
            return Err(CinderError::Config(
                "max_key_size + max_value_size exceeds the record size limit".into(),
            ));
        }
        if let SyncPolicy::Periodic(interval) = self.sync {
            if interval.is_zero() {
                return Err(CinderError::Config("sync interval must be non-zero".into()));
            }
        }
        if matches!(self.auto_merge_interval, Some(interval) if interval.is_zero()) {
            return Err(CinderError::Config(
                "auto merge interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}
