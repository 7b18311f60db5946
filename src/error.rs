//! CINDER - Custom Error Types
//! Defines the error hierarchy for the log-structured storage engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::SegmentId;

/// Custom Result type for the Cinder engine.
pub type Result<T> = std::result::Result<T, CinderError>;

/// Error types for the Cinder storage engine.
#[derive(Error, Debug)]
pub enum CinderError {
    /// I/O errors from segment files. A write that fails with this error
    /// is not committed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key is absent, deleted or expired.
    #[error("Key not found")]
    KeyNotFound,

    /// Keys must contain at least one byte.
    #[error("Key is empty")]
    EmptyKey,

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    /// A record failed its checksum somewhere other than the log tail.
    #[error("Corrupt log in segment {segment} at offset {offset}: {reason}")]
    CorruptLog {
        segment: SegmentId,
        offset: u64,
        reason: String,
    },

    /// Merge failed; segments and index are unchanged.
    #[error("Compaction aborted: {0}")]
    CompactionAborted(String),

    /// A write batch holds more keys than `max_batch_size` allows.
    #[error("Batch too large (max {max} keys)")]
    BatchTooLarge { max: usize },

    /// Another merge is already in progress.
    #[error("Merge already running")]
    MergeRunning,

    /// Watching was requested but the watch queue size is zero.
    #[error("Watch is disabled (watch_queue_size = 0)")]
    WatchDisabled,

    /// The data directory is held by another engine instance.
    #[error("Database directory is locked: {0:?}")]
    DatabaseLocked(PathBuf),

    /// The engine has been closed.
    #[error("Engine is closed")]
    Closed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
