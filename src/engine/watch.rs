//! CINDER - Watch Queue
//! Delivers committed mutations to subscribers without ever blocking
//! the write path.
//!
//! ## Flow
//! ```text
//! writer --try_send--> [dispatch channel] --> dispatcher thread --> [subscriber inbox] --> Watcher
//! ```
//! Both hops are bounded by `watch_queue_size`. When either is full the
//! event is dropped and counted; the affected subscriber later receives
//! `Notification::Lagged { missed }` at the position of the gap.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::types::{now_ms, Key, Record, RecordKind, Value};

/// What kind of mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchAction {
    Put,
    Delete,
}

/// One committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: Key,
    /// `None` for deletes.
    pub value: Option<Value>,
    pub expires_at: Option<u64>,
    /// Commit time in Unix epoch milliseconds.
    pub timestamp_ms: u64,
}

impl WatchEvent {
    pub(crate) fn from_record(record: Record) -> Self {
        let (action, value) = match record.kind {
            RecordKind::Put => (WatchAction::Put, Some(record.value)),
            // Batch markers are never published.
            RecordKind::Delete | RecordKind::BatchBegin | RecordKind::BatchEnd => {
                (WatchAction::Delete, None)
            }
        };
        Self {
            action,
            key: record.key,
            value,
            expires_at: record.expires_at,
            timestamp_ms: now_ms(),
        }
    }
}

/// Item received by a `Watcher`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Event(WatchEvent),
    /// `missed` events were dropped at this point in the stream.
    Lagged { missed: u64 },
    /// The engine was closed; nothing follows.
    Closed,
}

struct Dispatch {
    event: WatchEvent,
    /// Events dropped at the channel just before this one.
    missed_before: u64,
}

#[derive(Default)]
struct Inbox {
    queue: VecDeque<Notification>,
    /// Events (not markers) currently queued.
    events: usize,
    /// Drops not yet reported with a `Lagged` marker.
    pending_lag: u64,
    closed: bool,
}

impl Inbox {
    fn pop(&mut self) -> Option<Notification> {
        if let Some(item) = self.queue.pop_front() {
            if matches!(item, Notification::Event(_)) {
                self.events -= 1;
            }
            return Some(item);
        }
        if self.pending_lag > 0 {
            let missed = std::mem::take(&mut self.pending_lag);
            return Some(Notification::Lagged { missed });
        }
        self.closed.then_some(Notification::Closed)
    }
}

struct Subscription {
    inbox: Mutex<Inbox>,
    ready: Condvar,
    capacity: usize,
}

impl Subscription {
    fn new(capacity: usize) -> Self {
        Self {
            inbox: Mutex::new(Inbox::default()),
            ready: Condvar::new(),
            capacity,
        }
    }

    fn lag(&self, missed: u64) {
        self.inbox.lock().pending_lag += missed;
        self.ready.notify_one();
    }

    fn push(&self, event: WatchEvent) {
        let mut inbox = self.inbox.lock();
        if inbox.closed {
            return;
        }
        if inbox.events >= self.capacity {
            inbox.pending_lag += 1;
            return;
        }
        if inbox.pending_lag > 0 {
            let missed = std::mem::take(&mut inbox.pending_lag);
            inbox.queue.push_back(Notification::Lagged { missed });
        }
        inbox.queue.push_back(Notification::Event(event));
        inbox.events += 1;
        drop(inbox);
        self.ready.notify_one();
    }

    fn close(&self) {
        self.inbox.lock().closed = true;
        self.ready.notify_all();
    }
}

type Subscribers = Arc<Mutex<Vec<Arc<Subscription>>>>;

/// Engine-side end of the watch machinery.
pub(crate) struct WatchHub {
    sender: Mutex<Option<SyncSender<Dispatch>>>,
    subscribers: Subscribers,
    /// Events dropped at the dispatch channel and not yet forwarded.
    missed: Arc<AtomicU64>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
}

impl WatchHub {
    pub(crate) fn start(capacity: usize) -> io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        let subscribers: Subscribers = Arc::default();
        let missed = Arc::new(AtomicU64::new(0));

        let dispatcher = {
            let subscribers = Arc::clone(&subscribers);
            let missed = Arc::clone(&missed);
            thread::Builder::new()
                .name("cinder-watch".into())
                .spawn(move || dispatch(receiver, subscribers, missed))?
        };

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            subscribers,
            missed,
            dispatcher: Mutex::new(Some(dispatcher)),
            capacity,
        })
    }

    pub(crate) fn subscribe(&self) -> Watcher {
        let subscription = Arc::new(Subscription::new(self.capacity));
        // Registered under the sender lock, so `close` cannot slip between
        // the check and the push.
        let sender = self.sender.lock();
        if sender.is_none() {
            subscription.close();
        } else {
            self.subscribers.lock().push(Arc::clone(&subscription));
        }
        drop(sender);
        Watcher { subscription }
    }

    /// Queue an event for delivery. Returns false if it had to be dropped.
    pub(crate) fn publish(&self, event: WatchEvent) -> bool {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return true;
        };
        let missed_before = self.missed.swap(0, Ordering::AcqRel);
        match sender.try_send(Dispatch {
            event,
            missed_before,
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(dispatch)) => {
                self.missed
                    .fetch_add(dispatch.missed_before + 1, Ordering::AcqRel);
                log::warn!("Watch queue full, dropped event for key {:?}", dispatch.event.key);
                false
            }
            Err(TrySendError::Disconnected(_)) => true,
        }
    }

    /// Stop dispatching and end every subscription with `Closed`.
    pub(crate) fn close(&self) {
        drop(self.sender.lock().take());
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            if dispatcher.join().is_err() {
                log::error!("Watch dispatcher panicked");
            }
        }
    }
}

fn dispatch(receiver: Receiver<Dispatch>, subscribers: Subscribers, missed: Arc<AtomicU64>) {
    for Dispatch {
        event,
        missed_before,
    } in receiver.iter()
    {
        let mut subscribers = subscribers.lock();
        // Dropped watchers leave the hub as the only owner.
        subscribers.retain(|s| Arc::strong_count(s) > 1);
        for subscription in subscribers.iter() {
            if missed_before > 0 {
                subscription.lag(missed_before);
            }
            subscription.push(event.clone());
        }
    }

    let leftover = missed.swap(0, Ordering::AcqRel);
    for subscription in subscribers.lock().drain(..) {
        if leftover > 0 {
            subscription.lag(leftover);
        }
        subscription.close();
    }
}

/// Subscriber handle returned by `Cinder::watch`.
///
/// Iterating yields notifications until the engine closes.
pub struct Watcher {
    subscription: Arc<Subscription>,
}

impl Watcher {
    /// Block until the next notification.
    pub fn recv(&self) -> Notification {
        let mut inbox = self.subscription.inbox.lock();
        loop {
            if let Some(item) = inbox.pop() {
                return item;
            }
            self.subscription.ready.wait(&mut inbox);
        }
    }

    /// Like `recv`, giving up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        let deadline = Instant::now() + timeout;
        let mut inbox = self.subscription.inbox.lock();
        loop {
            if let Some(item) = inbox.pop() {
                return Some(item);
            }
            if self
                .subscription
                .ready
                .wait_until(&mut inbox, deadline)
                .timed_out()
            {
                return inbox.pop();
            }
        }
    }

    pub fn try_recv(&self) -> Option<Notification> {
        self.subscription.inbox.lock().pop()
    }
}

impl Iterator for Watcher {
    type Item = Notification;

    fn next(&mut self) -> Option<Notification> {
        match self.recv() {
            Notification::Closed => None,
            item => Some(item),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn event(key: &[u8]) -> WatchEvent {
        WatchEvent::from_record(Record::put(key.to_vec(), b"v".to_vec()))
    }

    fn key_of(item: Option<Notification>) -> Key {
        match item {
            Some(Notification::Event(e)) => e.key,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_events_arrive_in_order() {
        let hub = WatchHub::start(16).unwrap();
        let watcher = hub.subscribe();
        for key in [b"a", b"b", b"c"] {
            assert!(hub.publish(event(key)));
        }
        assert_eq!(key_of(watcher.recv_timeout(WAIT)), b"a".to_vec());
        assert_eq!(key_of(watcher.recv_timeout(WAIT)), b"b".to_vec());
        assert_eq!(key_of(watcher.recv_timeout(WAIT)), b"c".to_vec());
        hub.close();
        assert_eq!(watcher.recv_timeout(WAIT), Some(Notification::Closed));
    }

    #[test]
    fn test_delete_event_has_no_value() {
        let event = WatchEvent::from_record(Record::delete(b"k".to_vec()));
        assert_eq!(event.action, WatchAction::Delete);
        assert_eq!(event.value, None);
    }

    #[test]
    fn test_full_inbox_reports_lag() {
        let hub = WatchHub::start(2).unwrap();
        let watcher = hub.subscribe();
        // Feed the inbox directly to keep the test deterministic.
        let subscription = Arc::clone(&watcher.subscription);
        for key in [b"1", b"2", b"3", b"4"] {
            subscription.push(event(key));
        }
        assert_eq!(key_of(watcher.try_recv()), b"1".to_vec());
        subscription.push(event(b"5"));

        assert_eq!(key_of(watcher.try_recv()), b"2".to_vec());
        assert_eq!(watcher.try_recv(), Some(Notification::Lagged { missed: 2 }));
        assert_eq!(key_of(watcher.try_recv()), b"5".to_vec());
        assert_eq!(watcher.try_recv(), None);
        hub.close();
    }

    #[test]
    fn test_iterator_ends_on_close() {
        let hub = WatchHub::start(4).unwrap();
        let watcher = hub.subscribe();
        hub.publish(event(b"x"));
        hub.close();
        let items: Vec<_> = watcher.collect();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_subscribe_racing_close_always_ends() {
        for _ in 0..50 {
            let hub = Arc::new(WatchHub::start(4).unwrap());
            let subscribers: Vec<_> = (0..4)
                .map(|_| {
                    let hub = Arc::clone(&hub);
                    thread::spawn(move || hub.subscribe())
                })
                .collect();
            hub.close();
            for handle in subscribers {
                let watcher = handle.join().unwrap();
                assert_eq!(watcher.recv_timeout(WAIT), Some(Notification::Closed));
            }
        }
    }

    #[test]
    fn test_subscribe_after_close() {
        let hub = WatchHub::start(4).unwrap();
        hub.close();
        let watcher = hub.subscribe();
        assert_eq!(watcher.try_recv(), Some(Notification::Closed));
    }
}
