//! CINDER - Time-To-Live (TTL) Support
//! Key expiration similar to Redis EXPIRE / TTL / PERSIST.
//!
//! Expiry is stored in the record itself as an absolute Unix epoch
//! millisecond timestamp, and cached in the index entry so reads can
//! hide expired keys without touching disk. Expired records are
//! physically removed by the next merge that covers their segment.

use std::time::Duration;

use crate::error::{CinderError, Result};
use crate::types::{now_ms, Key, Record, Value};

use super::Cinder;

/// Absolute expiry for a TTL starting at `now_ms`.
pub fn deadline_after(ttl: Duration, now_ms: u64) -> u64 {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    // 0 on disk means "no expiry", so the earliest deadline is 1.
    now_ms.saturating_add(ttl_ms).max(1)
}

/// Time left until `expires_at`. Zero once the deadline has passed.
pub fn remaining(expires_at: u64, now_ms: u64) -> Duration {
    Duration::from_millis(expires_at.saturating_sub(now_ms))
}

impl Cinder {
    /// Insert a key that disappears after `ttl`.
    pub fn put_with_ttl(&self, key: Key, value: Value, ttl: Duration) -> Result<()> {
        self.validate(&key, Some(&value))?;
        let deadline = deadline_after(ttl, now_ms());
        self.commit(Record::put_expiring(key, value, deadline))
    }

    /// Set a new TTL on an existing key, keeping its value.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> Result<()> {
        self.validate(key, None)?;
        let mut log = self.lock_log()?;
        let current = self.read_live(key)?.ok_or(CinderError::KeyNotFound)?;
        let deadline = deadline_after(ttl, now_ms());
        self.append_locked(
            &mut log,
            Record::put_expiring(current.key, current.value, deadline),
        )
    }

    /// Remaining lifetime of `key`; `None` if it never expires.
    pub fn ttl(&self, key: &[u8]) -> Result<Option<Duration>> {
        self.ensure_open()?;
        let now = now_ms();
        let view = self.shared.view.read();
        match view.index.get(key) {
            Some(entry) if entry.is_live(now) => {
                Ok(entry.expires_at.map(|at| remaining(at, now)))
            }
            _ => Err(CinderError::KeyNotFound),
        }
    }

    /// Remove the TTL from a key so it never expires.
    pub fn persist(&self, key: &[u8]) -> Result<()> {
        self.validate(key, None)?;
        let mut log = self.lock_log()?;
        let current = self.read_live(key)?.ok_or(CinderError::KeyNotFound)?;
        if current.expires_at.is_none() {
            return Ok(());
        }
        self.append_locked(&mut log, Record::put(current.key, current.value))
    }

    /// Forget expired keys in the index now instead of waiting for a merge.
    /// Their bytes stay on disk until the covering segment is merged.
    pub fn purge_expired(&self) -> Result<usize> {
        self.ensure_open()?;
        let purged = self.shared.view.write().index.purge_expired(now_ms());
        if purged > 0 {
            log::debug!("Purged {} expired keys from the index", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::thread;

    fn open(dir: &std::path::Path) -> Cinder {
        Cinder::open(Config::new(dir)).unwrap()
    }

    #[test]
    fn test_deadline_and_remaining() {
        assert_eq!(deadline_after(Duration::from_millis(250), 1_000), 1_250);
        assert_eq!(deadline_after(Duration::ZERO, 0), 1);
        assert_eq!(deadline_after(Duration::MAX, 5), u64::MAX);
        assert_eq!(remaining(1_250, 1_000), Duration::from_millis(250));
        assert_eq!(remaining(1_000, 2_000), Duration::ZERO);
    }

    #[test]
    fn test_short_ttl_expires() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine
            .put_with_ttl(b"short".to_vec(), b"v".to_vec(), Duration::from_millis(50))
            .unwrap();
        assert_eq!(engine.get(b"short").unwrap(), b"v".to_vec());

        thread::sleep(Duration::from_millis(100));
        assert!(matches!(engine.get(b"short"), Err(CinderError::KeyNotFound)));
        assert!(!engine.exists(b"short").unwrap());
        assert!(matches!(engine.ttl(b"short"), Err(CinderError::KeyNotFound)));
    }

    #[test]
    fn test_expire_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(engine.ttl(b"k").unwrap(), None);

        engine.expire(b"k", Duration::from_secs(60)).unwrap();
        let left = engine.ttl(b"k").unwrap().unwrap();
        assert!(left > Duration::from_secs(58) && left <= Duration::from_secs(60));

        engine.persist(b"k").unwrap();
        assert_eq!(engine.ttl(b"k").unwrap(), None);
        assert_eq!(engine.get(b"k").unwrap(), b"v".to_vec());
    }

    #[test]
    fn test_ttl_ops_on_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        assert!(matches!(
            engine.expire(b"nope", Duration::from_secs(1)),
            Err(CinderError::KeyNotFound)
        ));
        assert!(matches!(engine.persist(b"nope"), Err(CinderError::KeyNotFound)));
    }

    #[test]
    fn test_purge_expired() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine
            .put_with_ttl(b"gone".to_vec(), b"v".to_vec(), Duration::from_millis(10))
            .unwrap();
        engine.put(b"kept".to_vec(), b"v".to_vec()).unwrap();
        thread::sleep(Duration::from_millis(30));

        assert_eq!(engine.purge_expired().unwrap(), 1);
        assert_eq!(engine.purge_expired().unwrap(), 0);
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_ttl_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = open(dir.path());
            engine
                .put_with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::from_secs(120))
                .unwrap();
            engine.close().unwrap();
        }
        let engine = open(dir.path());
        assert!(engine.ttl(b"k").unwrap().is_some());
    }
}
