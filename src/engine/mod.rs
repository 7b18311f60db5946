//! CINDER - Storage Engine Module
//! Top-level module tying the segment log, key index, recovery,
//! compaction, TTL and watch components into one engine handle.

pub mod batch;
pub mod compaction;
pub mod index;
pub mod iterator;
pub mod metrics;
pub mod record;
pub mod recovery;
pub mod segment;
pub mod segment_log;
pub mod ttl;
pub mod watch;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fs2::FileExt;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::config::{Config, SyncPolicy};
use crate::error::{CinderError, Result};
use crate::types::{now_ms, Key, Locator, Record, RecordKind, SegmentId, Value};

use self::index::{IndexEntry, KeyIndex};
use self::metrics::EngineMetrics;
use self::segment::Segment;
use self::segment_log::SegmentLog;
use self::watch::{WatchEvent, WatchHub, Watcher};

/// Advisory lock file guarding the data directory.
const LOCK_FILE: &str = "LOCK";

/// Segments that locators may resolve against, keyed by id.
pub(crate) type SegmentTable = Arc<BTreeMap<SegmentId, Arc<Segment>>>;

/// Read-side state. Both halves are copy-on-write so readers can take
/// a consistent snapshot with two `Arc` clones.
#[derive(Clone)]
pub(crate) struct View {
    pub(crate) index: KeyIndex,
    pub(crate) segments: SegmentTable,
}

/// Stop signal shared with background threads.
#[derive(Default)]
struct Shutdown {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    fn signal(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    /// Sleep up to `timeout`; returns true once shutdown was signalled.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        self.wake
            .wait_while_for(&mut stopped, |stopped| !*stopped, timeout);
        *stopped
    }
}

pub(crate) struct Shared {
    config: Config,
    /// Write path: exactly one appender at a time.
    log: Mutex<SegmentLog>,
    view: RwLock<View>,
    /// Held for the whole of a compaction pass.
    merge_lock: Mutex<()>,
    merging: AtomicBool,
    watch: Option<WatchHub>,
    metrics: EngineMetrics,
    closed: AtomicBool,
    shutdown: Arc<Shutdown>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    lock_file: File,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.shutdown.signal();
        if let Err(e) = self.log.get_mut().sync() {
            log::error!("Failed to sync active segment on drop: {}", e);
        }
        if let Some(hub) = &self.watch {
            hub.close();
        }
    }
}

/// Statistics of the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Readable keys.
    pub keys: usize,
    pub segments: usize,
    /// Total size of all segment files in bytes.
    pub disk_size: u64,
}

/// The Cinder storage engine.
///
/// An append-only segment log on disk plus an ordered in-memory index
/// of record locators. The handle is cheap to clone and safe to share
/// between threads; all clones refer to the same engine.
///
/// ## Example
/// ```no_run
/// use cinder::{config::Config, engine::Cinder};
///
/// let engine = Cinder::open(Config::new("./data")).unwrap();
/// engine.put(b"key".to_vec(), b"value".to_vec()).unwrap();
/// assert_eq!(engine.get(b"key").unwrap(), b"value".to_vec());
/// engine.close().unwrap();
/// ```
#[derive(Clone)]
pub struct Cinder {
    shared: Arc<Shared>,
}

impl Cinder {
    /// Open or create a Cinder engine in `config.data_dir`.
    ///
    /// Replays every segment to rebuild the index. A torn record at the
    /// tail of the newest segment is cut off; corruption anywhere else
    /// fails with `CorruptLog`.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;
        let lock_file = lock_dir(&config.data_dir)?;

        let scratch = segment::remove_scratch_files(&config.data_dir)?;
        if scratch > 0 {
            log::warn!(
                "Removed {} scratch files from an interrupted merge",
                scratch
            );
        }

        let recovered = recovery::rebuild(&config)?;
        let metrics = EngineMetrics::new();
        metrics.record_recovery(recovered.records);

        let log = SegmentLog::new(&config, Arc::clone(&recovered.active), recovered.active_size);
        let watch = match config.watch_queue_size {
            0 => None,
            capacity => Some(WatchHub::start(capacity)?),
        };
        let keys = recovered.index.live_len(now_ms());
        let segments = recovered.segments.len();

        let shared = Arc::new(Shared {
            log: Mutex::new(log),
            view: RwLock::new(View {
                index: recovered.index,
                segments: Arc::new(recovered.segments),
            }),
            merge_lock: Mutex::new(()),
            merging: AtomicBool::new(false),
            watch,
            metrics,
            closed: AtomicBool::new(false),
            shutdown: Arc::new(Shutdown::default()),
            workers: Mutex::new(Vec::new()),
            lock_file,
            config,
        });
        let engine = Self { shared };
        engine.spawn_background()?;

        log::info!(
            "Cinder engine opened at {:?} ({} keys, {} segments recovered)",
            engine.shared.config.data_dir,
            keys,
            segments
        );
        Ok(engine)
    }

    /// Insert a key-value pair into the storage engine.
    /// The write path: segment log (disk) -> index (memory) -> watchers.
    pub fn put(&self, key: Key, value: Value) -> Result<()> {
        self.validate(&key, Some(&value))?;
        self.commit(Record::put(key, value))
    }

    /// Get the value stored under `key`.
    /// Deleted and expired keys fail with `KeyNotFound`.
    pub fn get(&self, key: &[u8]) -> Result<Value> {
        self.ensure_open()?;
        let value = self.read_live(key)?.map(|record| record.value);
        self.shared
            .metrics
            .record_get(value.as_ref().map(|v| v.len()));
        value.ok_or(CinderError::KeyNotFound)
    }

    /// Delete a key by appending a tombstone.
    /// Absent or expired keys fail with `KeyNotFound` and nothing is written.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.validate(key, None)?;
        let mut log = self.lock_log()?;
        if !self.is_live(key) {
            return Err(CinderError::KeyNotFound);
        }
        self.append_locked(&mut log, Record::delete(key.to_vec()))
    }

    /// Check whether `key` currently holds a value.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.is_live(key))
    }

    /// Subscribe to committed mutations.
    pub fn watch(&self) -> Result<Watcher> {
        self.ensure_open()?;
        self.shared
            .watch
            .as_ref()
            .map(WatchHub::subscribe)
            .ok_or(CinderError::WatchDisabled)
    }

    /// Force the active segment to persistent storage.
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.log.lock().sync()
    }

    /// Number of readable keys.
    pub fn len(&self) -> usize {
        self.shared.view.read().index.live_len(now_ms())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stat(&self) -> Result<Stat> {
        self.ensure_open()?;
        let (segments, keys) = {
            let view = self.shared.view.read();
            (Arc::clone(&view.segments), view.index.live_len(now_ms()))
        };
        let mut disk_size = 0;
        for segment in segments.values() {
            disk_size += segment.len()?;
        }
        Ok(Stat {
            keys,
            segments: segments.len(),
            disk_size,
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.shared.metrics
    }

    /// Flush pending writes, stop background work and end all watch
    /// subscriptions with `Notification::Closed`. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.shutdown.signal();
        let workers = std::mem::take(&mut *self.shared.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                log::error!("Background worker panicked");
            }
        }

        let _merge = self.shared.merge_lock.lock();
        self.shared.log.lock().sync()?;
        if let Some(hub) = &self.shared.watch {
            hub.close();
        }
        FileExt::unlock(&self.shared.lock_file)?;

        log::info!("Cinder engine closed at {:?}", self.shared.config.data_dir);
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            Err(CinderError::Closed)
        } else {
            Ok(())
        }
    }

    /// Reject bad keys and values before any I/O happens.
    pub(crate) fn validate(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let config = &self.shared.config;
        if key.is_empty() {
            return Err(CinderError::EmptyKey);
        }
        if key.len() > config.max_key_size {
            return Err(CinderError::KeyTooLarge {
                size: key.len(),
                max: config.max_key_size,
            });
        }
        if let Some(value) = value {
            if value.len() > config.max_value_size {
                return Err(CinderError::ValueTooLarge {
                    size: value.len(),
                    max: config.max_value_size,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn is_live(&self, key: &[u8]) -> bool {
        let now = now_ms();
        self.shared
            .view
            .read()
            .index
            .get(key)
            .is_some_and(|e| e.is_live(now))
    }

    /// Load the newest record for `key` if it is a live put.
    pub(crate) fn read_live(&self, key: &[u8]) -> Result<Option<Record>> {
        let now = now_ms();
        let (entry, segment) = {
            let view = self.shared.view.read();
            let Some(entry) = view.index.get(key).copied() else {
                return Ok(None);
            };
            if !entry.is_live(now) {
                return Ok(None);
            }
            (entry, segment_for(&view.segments, entry.locator.segment_id)?)
        };
        segment.read_record(&entry.locator).map(Some)
    }

    /// Take the write lock, failing once the engine is closed.
    pub(crate) fn lock_log(&self) -> Result<MutexGuard<'_, SegmentLog>> {
        let log = self.shared.log.lock();
        self.ensure_open()?;
        Ok(log)
    }

    pub(crate) fn commit(&self, record: Record) -> Result<()> {
        let mut log = self.lock_log()?;
        self.append_locked(&mut log, record)
    }

    /// Append `record`, publish its locator, then notify watchers.
    /// Runs under the log lock, so index updates and watch events
    /// follow append order.
    pub(crate) fn append_locked(&self, log: &mut SegmentLog, record: Record) -> Result<()> {
        let bytes = record::encode(&record);
        self.rotate_locked(log)?;
        let locator = log.append(&bytes)?;
        self.apply(vec![(record, locator)]);
        Ok(())
    }

    /// Append `records` framed by batch markers in a single write.
    /// A failed write is cut back whole, and recovery ignores a batch
    /// whose closing marker never reached disk.
    pub(crate) fn append_batch_locked(
        &self,
        log: &mut SegmentLog,
        records: Vec<Record>,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let count = u32::try_from(records.len())
            .map_err(|_| CinderError::BatchTooLarge { max: u32::MAX as usize })?;

        let mut buf = record::encode(&Record::batch_marker(RecordKind::BatchBegin, count));
        let mut frames = Vec::with_capacity(records.len());
        for record in &records {
            let bytes = record::encode(record);
            frames.push((buf.len() as u64, bytes.len() as u32));
            buf.extend_from_slice(&bytes);
        }
        buf.extend_from_slice(&record::encode(&Record::batch_marker(
            RecordKind::BatchEnd,
            count,
        )));

        self.rotate_locked(log)?;
        let base = log.append(&buf)?;
        let placed = records
            .into_iter()
            .zip(frames)
            .map(|(record, (offset, len))| {
                let locator = Locator::new(base.segment_id, base.offset + offset, len);
                (record, locator)
            })
            .collect();
        self.apply(placed);
        Ok(())
    }

    /// Seal a full active segment and make its successor readable.
    fn rotate_locked(&self, log: &mut SegmentLog) -> Result<()> {
        if let Some(segment) = log.rotate_if_full()? {
            let mut view = self.shared.view.write();
            Arc::make_mut(&mut view.segments).insert(segment.id(), segment);
        }
        Ok(())
    }

    /// Index appended records in one step, then count and publish them.
    fn apply(&self, placed: Vec<(Record, Locator)>) {
        {
            let mut view = self.shared.view.write();
            for (record, locator) in &placed {
                let entry = IndexEntry::for_record(record, *locator);
                view.index.insert(record.key.clone(), entry);
            }
        }

        let metrics = &self.shared.metrics;
        for (record, _) in placed {
            if record.is_tombstone() {
                metrics.record_delete();
            } else {
                metrics.record_put(record.key.len(), record.value.len());
            }
            if let Some(hub) = &self.shared.watch {
                if !hub.publish(WatchEvent::from_record(record)) {
                    metrics.record_watch_drop();
                }
            }
        }
    }

    /// fsync the active segment if the periodic policy left it dirty.
    fn sync_unsynced(&self) {
        let pending = self.shared.log.lock().take_unsynced();
        if let Some(segment) = pending {
            if let Err(e) = segment.sync() {
                log::error!("Periodic sync of segment {} failed: {}", segment.id(), e);
            }
        }
    }

    fn spawn_background(&self) -> Result<()> {
        if let SyncPolicy::Periodic(interval) = self.shared.config.sync {
            self.spawn_worker("cinder-sync", interval, Cinder::sync_unsynced)?;
        }
        if let Some(interval) = self.shared.config.auto_merge_interval {
            self.spawn_worker("cinder-auto-merge", interval, |engine| {
                match engine.merge(true) {
                    Ok(()) | Err(CinderError::MergeRunning) | Err(CinderError::Closed) => {}
                    Err(e) => log::error!("Automatic merge failed: {}", e),
                }
            })?;
        }
        Ok(())
    }

    /// Run `task` every `interval` until shutdown. The worker only holds
    /// a weak reference between runs so dropping the engine stops it.
    fn spawn_worker<F>(&self, name: &str, interval: Duration, task: F) -> Result<()>
    where
        F: Fn(&Cinder) + Send + 'static,
    {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let shutdown = Arc::clone(&self.shared.shutdown);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                if shutdown.wait(interval) {
                    break;
                }
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                task(&Cinder { shared });
            })?;
        self.track_worker(handle);
        Ok(())
    }

    pub(crate) fn track_worker(&self, handle: JoinHandle<()>) {
        let mut workers = self.shared.workers.lock();
        workers.retain(|w| !w.is_finished());
        workers.push(handle);
    }
}

/// Resolve a segment id against a segment table.
pub(crate) fn segment_for(segments: &SegmentTable, id: SegmentId) -> Result<Arc<Segment>> {
    segments.get(&id).cloned().ok_or_else(|| {
        CinderError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("segment {id} is not open"),
        ))
    })
}

/// Take the exclusive directory lock.
fn lock_dir(dir: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join(LOCK_FILE))?;
    file.try_lock_exclusive()
        .map_err(|_| CinderError::DatabaseLocked(dir.to_path_buf()))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> Cinder {
        Cinder::open(Config::new(dir).with_segment_size(256)).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());

        engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), b"v".to_vec());
        engine.delete(b"k").unwrap();
        assert!(matches!(engine.get(b"k"), Err(CinderError::KeyNotFound)));
        assert!(matches!(engine.delete(b"k"), Err(CinderError::KeyNotFound)));
    }

    #[test]
    fn test_validation_happens_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path())
            .with_max_key_size(4)
            .with_max_value_size(8);
        let engine = Cinder::open(config).unwrap();

        assert!(matches!(
            engine.put(Vec::new(), b"v".to_vec()),
            Err(CinderError::EmptyKey)
        ));
        assert!(matches!(
            engine.put(b"too-long".to_vec(), b"v".to_vec()),
            Err(CinderError::KeyTooLarge { size: 8, max: 4 })
        ));
        assert!(matches!(
            engine.put(b"k".to_vec(), vec![0; 9]),
            Err(CinderError::ValueTooLarge { size: 9, max: 8 })
        ));
        assert_eq!(engine.stat().unwrap().disk_size, 0);
    }

    #[test]
    fn test_rotation_registers_segments() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        for i in 0..50 {
            engine
                .put(format!("key_{i:03}").into_bytes(), vec![b'x'; 32])
                .unwrap();
        }
        let stat = engine.stat().unwrap();
        assert!(stat.segments > 1);
        assert_eq!(stat.keys, 50);
        assert_eq!(engine.get(b"key_000").unwrap(), vec![b'x'; 32]);
    }

    #[test]
    fn test_closed_engine_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        engine.close().unwrap();
        engine.close().unwrap();

        assert!(matches!(engine.get(b"k"), Err(CinderError::Closed)));
        assert!(matches!(
            engine.put(b"k".to_vec(), b"v".to_vec()),
            Err(CinderError::Closed)
        ));
    }

    #[test]
    fn test_directory_lock() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        assert!(matches!(
            Cinder::open(Config::new(dir.path())),
            Err(CinderError::DatabaseLocked(_))
        ));
        engine.close().unwrap();
        let reopened = Cinder::open(Config::new(dir.path())).unwrap();
        reopened.close().unwrap();
    }

    #[test]
    fn test_stat_counts_live_keys_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        engine.delete(b"a").unwrap();
        engine
            .put_with_ttl(b"c".to_vec(), b"3".to_vec(), Duration::ZERO)
            .unwrap();

        let stat = engine.stat().unwrap();
        assert_eq!(stat.keys, 1);
        assert_eq!(stat.segments, 1);
        assert_eq!(
            stat.disk_size,
            (3 * record::encoded_len(1, 1) + record::encoded_len(1, 0)) as u64
        );
        // stat only borrows the index, so the next write mutates it in place.
        assert!(!engine.shared.view.read().index.is_shared());
    }

    #[test]
    fn test_clones_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let clone = engine.clone();
        clone.put(b"shared".to_vec(), b"data".to_vec()).unwrap();
        assert_eq!(engine.get(b"shared").unwrap(), b"data".to_vec());
    }
}
