//! CINDER - Log-Structured Key-Value Storage Engine
//!
//! An embedded, crash-recoverable key-value store built on an append-only
//! segment log with an in-memory ordered index.
//!
//! ## Features
//! - **Segment Log**: Append-only files with CRC32-checked records
//! - **Ordered Index**: Copy-on-write BTreeMap with snapshot iteration
//! - **Recovery**: Index rebuilt by replay; torn tail writes are cut off
//! - **Batches**: All-or-nothing multi-key writes
//! - **Merge**: Background compaction that reclaims dead records
//! - **TTL Support**: Redis-like key expiration
//! - **Watch**: Bounded change notifications that never block writers
//! - **Metrics**: Lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use std::time::Duration;
//! use cinder::{config::Config, engine::Cinder};
//!
//! let engine = Cinder::open(Config::new("./data")).unwrap();
//!
//! engine.put(b"key".to_vec(), b"value".to_vec()).unwrap();
//! assert_eq!(engine.get(b"key").unwrap(), b"value".to_vec());
//!
//! engine.put_with_ttl(b"session".to_vec(), b"token".to_vec(), Duration::from_secs(30)).unwrap();
//! engine.close().unwrap();
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use config::{Config, SyncPolicy};
pub use engine::batch::Batch;
pub use engine::iterator::IterOptions;
pub use engine::watch::{Notification, WatchAction, WatchEvent, Watcher};
pub use engine::{Cinder, Stat};
pub use error::{CinderError, Result};
