//! CINDER - Core Type Definitions
//! Defines fundamental types used across the storage engine.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Key type for the storage engine.
/// Using Vec<u8> allows arbitrary binary keys.
pub type Key = Vec<u8>;

/// Value type for the storage engine.
/// Using Vec<u8> allows arbitrary binary values.
pub type Value = Vec<u8>;

/// Identifier of a segment file. Ids order segments by write order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010}", self.0)
    }
}

/// Physical location of a record: segment, byte offset, encoded length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locator {
    pub segment_id: SegmentId,
    pub offset: u64,
    pub len: u32,
}

impl Locator {
    pub fn new(segment_id: SegmentId, offset: u64, len: u32) -> Self {
        Self {
            segment_id,
            offset,
            len,
        }
    }
}

/// Kind byte stored in every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    Put = 1,
    Delete = 2,
    /// Opens an atomic write batch.
    BatchBegin = 3,
    /// Commits the batch opened by the matching `BatchBegin`.
    BatchEnd = 4,
}

impl RecordKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Put),
            2 => Some(Self::Delete),
            3 => Some(Self::BatchBegin),
            4 => Some(Self::BatchEnd),
            _ => None,
        }
    }

    /// Batch framing rather than a key mutation.
    pub fn is_marker(self) -> bool {
        matches!(self, Self::BatchBegin | Self::BatchEnd)
    }
}

/// A single immutable entry of the segment log.
/// A `Delete` record is a tombstone and carries an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub value: Value,
    pub kind: RecordKind,
    /// Absolute expiry as Unix epoch milliseconds.
    pub expires_at: Option<u64>,
}

impl Record {
    /// Create a record for a PUT operation.
    pub fn put(key: Key, value: Value) -> Self {
        Self {
            key,
            value,
            kind: RecordKind::Put,
            expires_at: None,
        }
    }

    /// Create a PUT record that expires at `expires_at` (ms since epoch).
    pub fn put_expiring(key: Key, value: Value, expires_at: u64) -> Self {
        Self {
            key,
            value,
            kind: RecordKind::Put,
            expires_at: Some(expires_at),
        }
    }

    /// Create a tombstone record (DELETE operation).
    pub fn delete(key: Key) -> Self {
        Self {
            key,
            value: Vec::new(),
            kind: RecordKind::Delete,
            expires_at: None,
        }
    }

    /// Batch framing record carrying the number of records in the batch.
    /// Markers have an empty key, which no user write can produce.
    pub fn batch_marker(kind: RecordKind, count: u32) -> Self {
        Self {
            key: Vec::new(),
            value: count.to_le_bytes().to_vec(),
            kind,
            expires_at: None,
        }
    }

    /// Record count carried by a batch marker.
    pub fn marker_count(&self) -> Option<u32> {
        if !self.kind.is_marker() {
            return None;
        }
        let bytes: [u8; 4] = self.value.as_slice().try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Returns true if this record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.kind == RecordKind::Delete
    }

    /// Returns true if the record carries an expiry at or before `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
