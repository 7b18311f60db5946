//! CINDER - Record Codec
//! Binary encoding of the records appended to segment files.
//!
//! ## Binary Format (per record)
//! ```text
//! [key_len: 4 (LE)][val_len: 4 (LE)][kind: 1][expires_at: 8 (LE), 0 = none][key][value][crc32: 4 (LE)]
//! ```
//! The CRC covers every byte that precedes it.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::types::{Record, RecordKind};

/// Fixed-size prefix of every record.
pub const HEADER_SIZE: usize = 4 + 4 + 1 + 8;
/// Trailing checksum size.
pub const CRC_SIZE: usize = 4;

/// Reasons a byte range is not a valid record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record truncated")]
    Truncated,
    #[error("checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    Checksum { stored: u32, computed: u32 },
    #[error("unknown record kind {0}")]
    BadKind(u8),
}

/// Decoded fixed-size record prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub key_len: u32,
    pub value_len: u32,
    pub kind: RecordKind,
    pub expires_at: Option<u64>,
}

impl Header {
    /// Total encoded length of the record this header starts.
    pub fn record_len(&self) -> u64 {
        encoded_len(self.key_len as usize, self.value_len as usize) as u64
    }
}

/// Encoded size of a record with the given key and value lengths.
pub fn encoded_len(key_len: usize, value_len: usize) -> usize {
    HEADER_SIZE + key_len + value_len + CRC_SIZE
}

/// Framed length announced by a raw header, read without validating the
/// kind byte. Lets a scan tell how far a damaged record reaches.
pub fn declared_len(mut header: &[u8]) -> Option<u64> {
    if header.len() < 8 {
        return None;
    }
    let key_len = header.get_u32_le() as u64;
    let value_len = header.get_u32_le() as u64;
    Some((HEADER_SIZE + CRC_SIZE) as u64 + key_len + value_len)
}

/// Serialize a record including its trailing checksum.
pub fn encode(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(record.key.len(), record.value.len()));
    buf.put_u32_le(record.key.len() as u32);
    buf.put_u32_le(record.value.len() as u32);
    buf.put_u8(record.kind as u8);
    buf.put_u64_le(record.expires_at.unwrap_or(0));
    buf.put_slice(&record.key);
    buf.put_slice(&record.value);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf
}

/// Parse the fixed-size header at the start of `buf`.
pub fn decode_header(mut buf: &[u8]) -> Result<Header, DecodeError> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated);
    }
    let key_len = buf.get_u32_le();
    let value_len = buf.get_u32_le();
    let kind_byte = buf.get_u8();
    let kind = RecordKind::from_byte(kind_byte).ok_or(DecodeError::BadKind(kind_byte))?;
    let expires_at = match buf.get_u64_le() {
        0 => None,
        at => Some(at),
    };
    Ok(Header {
        key_len,
        value_len,
        kind,
        expires_at,
    })
}

/// Decode one complete record, verifying its checksum.
/// `buf` must hold exactly the record's bytes.
pub fn decode(buf: &[u8]) -> Result<Record, DecodeError> {
    let header = decode_header(buf)?;
    let total = header.record_len() as usize;
    if buf.len() < total {
        return Err(DecodeError::Truncated);
    }

    let body_end = total - CRC_SIZE;
    let stored = (&buf[body_end..total]).get_u32_le();
    let computed = crc32fast::hash(&buf[..body_end]);
    if stored != computed {
        return Err(DecodeError::Checksum { stored, computed });
    }

    let key_end = HEADER_SIZE + header.key_len as usize;
    Ok(Record {
        key: buf[HEADER_SIZE..key_end].to_vec(),
        value: buf[key_end..body_end].to_vec(),
        kind: header.kind,
        expires_at: header.expires_at,
    })
}
