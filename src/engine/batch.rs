//! CINDER - Atomic Write Batches
//! Buffers puts, deletes and TTL changes and commits them as one unit.
//!
//! ## On disk
//! ```text
//! [BatchBegin n][record 1]..[record n][BatchEnd n]
//! ```
//! The whole frame is appended with a single write under the log lock.
//! Recovery only indexes a batch once its `BatchEnd` marker is read, so a
//! crash part-way through the frame leaves none of its writes visible.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{CinderError, Result};
use crate::types::{now_ms, Key, Record, Value};

use super::ttl::deadline_after;
use super::Cinder;

/// Last staged operation for a key.
#[derive(Debug)]
enum Pending {
    Put(Record),
    Delete,
    /// Keep the stored value, replace its expiry.
    Retime(Option<u64>),
}

/// A set of writes applied all-or-nothing by [`Batch::commit`].
///
/// Only the last operation staged for each key is kept. Committed records
/// are appended in key order. Dropping a batch without committing it
/// discards it.
pub struct Batch {
    engine: Cinder,
    pending: BTreeMap<Key, Pending>,
}

impl Batch {
    /// Stage a put.
    pub fn put(&mut self, key: Key, value: Value) -> Result<()> {
        self.engine.validate(&key, Some(&value))?;
        let record = Record::put(key.clone(), value);
        self.stage(key, Pending::Put(record))
    }

    /// Stage a put that expires `ttl` after it is staged.
    pub fn put_with_ttl(&mut self, key: Key, value: Value, ttl: Duration) -> Result<()> {
        self.engine.validate(&key, Some(&value))?;
        let record = Record::put_expiring(key.clone(), value, deadline_after(ttl, now_ms()));
        self.stage(key, Pending::Put(record))
    }

    /// Stage a delete. Deleting a key that is absent at commit writes nothing.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.engine.validate(key, None)?;
        self.stage(key.to_vec(), Pending::Delete)
    }

    /// Stage a new TTL for a key that exists now or is put by this batch.
    pub fn expire(&mut self, key: &[u8], ttl: Duration) -> Result<()> {
        self.engine.validate(key, None)?;
        self.retime(key, Some(deadline_after(ttl, now_ms())))
    }

    /// Stage removal of a key's TTL.
    pub fn persist(&mut self, key: &[u8]) -> Result<()> {
        self.engine.validate(key, None)?;
        self.retime(key, None)
    }

    /// Number of keys with a staged operation.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply every staged operation atomically.
    ///
    /// Fails with `KeyNotFound` and writes nothing if a key staged for
    /// `expire`/`persist` was removed before the commit.
    pub fn commit(self) -> Result<()> {
        let Batch { engine, pending } = self;
        if pending.is_empty() {
            return Ok(());
        }
        let mut log = engine.lock_log()?;

        let mut records = Vec::with_capacity(pending.len());
        for (key, op) in pending {
            match op {
                Pending::Put(record) => records.push(record),
                Pending::Delete => {
                    if engine.is_live(&key) {
                        records.push(Record::delete(key));
                    }
                }
                Pending::Retime(expires_at) => {
                    let current = engine.read_live(&key)?.ok_or(CinderError::KeyNotFound)?;
                    if current.expires_at != expires_at {
                        records.push(Record {
                            expires_at,
                            ..current
                        });
                    }
                }
            }
        }

        let written = records.len();
        engine.append_batch_locked(&mut log, records)?;
        engine.shared.metrics.record_batch();
        log::debug!("Committed batch of {} records", written);
        Ok(())
    }

    /// Discard every staged operation.
    pub fn rollback(self) {
        log::debug!("Rolled back batch of {} operations", self.pending.len());
    }

    fn stage(&mut self, key: Key, op: Pending) -> Result<()> {
        let max = self.engine.shared.config.max_batch_size;
        if self.pending.len() >= max && !self.pending.contains_key(&key) {
            return Err(CinderError::BatchTooLarge { max });
        }
        self.pending.insert(key, op);
        Ok(())
    }

    fn retime(&mut self, key: &[u8], expires_at: Option<u64>) -> Result<()> {
        match self.pending.get_mut(key) {
            Some(Pending::Put(record)) => {
                record.expires_at = expires_at;
                Ok(())
            }
            Some(Pending::Retime(at)) => {
                *at = expires_at;
                Ok(())
            }
            Some(Pending::Delete) => Err(CinderError::KeyNotFound),
            None => {
                self.engine.ensure_open()?;
                if !self.engine.is_live(key) {
                    return Err(CinderError::KeyNotFound);
                }
                self.stage(key.to_vec(), Pending::Retime(expires_at))
            }
        }
    }
}

impl Cinder {
    /// Start an empty write batch.
    pub fn batch(&self) -> Result<Batch> {
        self.ensure_open()?;
        Ok(Batch {
            engine: self.clone(),
            pending: BTreeMap::new(),
        })
    }
}
