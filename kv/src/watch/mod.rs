use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{CResult, Error};
use crate::kvstore::KeyRecord;

pub type WatchId = i64;

/// Default bound on a single watch's outstanding-event channel. A watcher
/// that can't keep up past this many buffered batches is cancelled rather
/// than allowed to grow unbounded memory.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// Filters that exclude whole classes of event from a watch's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    NoPut,
    NoDelete,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub key: Vec<u8>,
    pub record: Option<KeyRecord>,
    pub prev_record: Option<KeyRecord>,
}

/// One message delivered to a watch's receiver: a batch of events from a
/// single revision, or notice that the watch was cancelled.
#[derive(Debug, Clone)]
pub enum WatchUpdate {
    Events { revision: i64, events: Vec<Event> },
    Canceled { reason: String },
}

struct WatcherEntry {
    key: Vec<u8>,
    range_end: Vec<u8>,
    filters: Vec<Filter>,
    sender: mpsc::Sender<WatchUpdate>,
}

impl WatcherEntry {
    fn matches_key(&self, key: &[u8]) -> bool {
        use crate::kvstore::keyspace::to_bounds;
        use std::ops::Bound;
        let (start, end) = to_bounds(&self.key, &self.range_end);
        let after_start = match &start {
            Bound::Included(s) => key >= s.as_slice(),
            Bound::Excluded(s) => key > s.as_slice(),
            Bound::Unbounded => true,
        };
        let before_end = match &end {
            Bound::Included(e) => key <= e.as_slice(),
            Bound::Excluded(e) => key < e.as_slice(),
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    fn passes_filters(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Put => !self.filters.contains(&Filter::NoPut),
            EventKind::Delete => !self.filters.contains(&Filter::NoDelete),
        }
    }
}

/// Owns every live watch and fans committed mutations out to them.
///
/// A watch only ever observes the current revision onward: since the store
/// keeps no historical versions, a caller asking to replay from an older
/// revision cannot be served and gets `Error::Compacted` at watch-creation
/// time rather than a stream of synthetic catch-up events.
pub struct WatchManager {
    id_gen: AtomicI64,
    watchers: Mutex<HashMap<WatchId, WatcherEntry>>,
}

impl Default for WatchManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchManager {
    pub fn new() -> Self {
        Self { id_gen: AtomicI64::new(1), watchers: Mutex::new(HashMap::new()) }
    }

    /// Registers a new watch over `[key, range_end)`. `start_revision`, if
    /// given, must equal `current_revision` -- anything older has already
    /// been discarded, anything newer doesn't exist yet.
    pub fn watch(
        &self,
        key: Vec<u8>,
        range_end: Vec<u8>,
        start_revision: Option<i64>,
        current_revision: i64,
        filters: Vec<Filter>,
    ) -> CResult<(WatchId, mpsc::Receiver<WatchUpdate>)> {
        if let Some(start) = start_revision {
            if start > current_revision {
                return Err(Error::FutureRev { current_revision });
            }
            if start != current_revision {
                return Err(Error::Compacted { compact_revision: current_revision });
            }
        }

        let (sender, receiver) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let id = self.id_gen.fetch_add(1, Ordering::SeqCst);
        let entry = WatcherEntry { key, range_end, filters, sender };
        self.watchers.lock().expect("watch map poisoned").insert(id, entry);
        Ok((id, receiver))
    }

    /// Cancels a watch, returning whether it existed.
    pub fn cancel(&self, id: WatchId) -> bool {
        self.watchers.lock().expect("watch map poisoned").remove(&id).is_some()
    }

    /// Delivers one revision's worth of events to every watch whose range
    /// matches at least one affected key. A watcher whose channel is full is
    /// treated as a slow consumer and dropped rather than allowed to block
    /// the apply loop or buffer unboundedly.
    pub fn notify(&self, revision: i64, events: &[Event]) {
        let mut watchers = self.watchers.lock().expect("watch map poisoned");
        let mut dead = Vec::new();

        for (&id, watcher) in watchers.iter() {
            let matched: Vec<Event> = events
                .iter()
                .filter(|e| watcher.matches_key(&e.key) && watcher.passes_filters(e.kind))
                .cloned()
                .collect();
            if matched.is_empty() {
                continue;
            }
            match watcher.sender.try_send(WatchUpdate::Events { revision, events: matched }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => dead.push(id),
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        for id in dead {
            if let Some(watcher) = watchers.remove(&id) {
                let _ = watcher.sender.try_send(WatchUpdate::Canceled {
                    reason: "slow consumer: watch channel exceeded capacity".to_string(),
                });
            }
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watchers.lock().expect("watch map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_event(key: &[u8]) -> Event {
        Event {
            kind: EventKind::Put,
            key: key.to_vec(),
            record: Some(KeyRecord { value: vec![1], create_revision: 1, mod_revision: 1, version: 1, lease: 0 }),
            prev_record: None,
        }
    }

    #[test]
    fn watch_at_current_revision_is_allowed() {
        let mgr = WatchManager::new();
        assert!(mgr.watch(b"a".to_vec(), vec![], Some(5), 5, vec![]).is_ok());
    }

    #[test]
    fn watch_at_older_revision_is_compacted() {
        let mgr = WatchManager::new();
        let err = mgr.watch(b"a".to_vec(), vec![], Some(3), 5, vec![]).unwrap_err();
        assert!(matches!(err, Error::Compacted { compact_revision: 5 }));
    }

    #[test]
    fn watch_at_future_revision_is_rejected_distinctly() {
        let mgr = WatchManager::new();
        let err = mgr.watch(b"a".to_vec(), vec![], Some(9), 5, vec![]).unwrap_err();
        assert!(matches!(err, Error::FutureRev { current_revision: 5 }));
    }

    #[tokio::test]
    async fn matching_event_is_delivered() {
        let mgr = WatchManager::new();
        let (_, mut rx) = mgr.watch(b"a".to_vec(), vec![], None, 0, vec![]).unwrap();
        mgr.notify(1, &[put_event(b"a")]);

        match rx.recv().await.unwrap() {
            WatchUpdate::Events { revision, events } => {
                assert_eq!(revision, 1);
                assert_eq!(events.len(), 1);
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_matching_event_is_not_delivered() {
        let mgr = WatchManager::new();
        let (_, mut rx) = mgr.watch(b"a".to_vec(), vec![], None, 0, vec![]).unwrap();
        mgr.notify(1, &[put_event(b"b")]);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn filter_excludes_put_events() {
        let mgr = WatchManager::new();
        let (_, mut rx) = mgr.watch(b"a".to_vec(), vec![], None, 0, vec![Filter::NoPut]).unwrap();
        mgr.notify(1, &[put_event(b"a")]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancel_removes_the_watch() {
        let mgr = WatchManager::new();
        let (id, _rx) = mgr.watch(b"a".to_vec(), vec![], None, 0, vec![]).unwrap();
        assert!(mgr.cancel(id));
        assert!(!mgr.cancel(id));
        assert_eq!(mgr.watch_count(), 0);
    }

    #[tokio::test]
    async fn slow_consumer_is_cancelled_when_channel_is_full() {
        let mgr = WatchManager::new();
        let (id, _rx) = mgr.watch(b"a".to_vec(), vec![], None, 0, vec![]).unwrap();
        // Fill the channel without ever polling the receiver.
        for rev in 0..DEFAULT_CHANNEL_CAPACITY as i64 + 2 {
            mgr.notify(rev, &[put_event(b"a")]);
        }
        assert!(!mgr.cancel(id));
    }

    #[tokio::test]
    async fn open_ended_range_watch_matches_any_key_at_or_after_start() {
        let mgr = WatchManager::new();
        let (_, mut rx) = mgr.watch(b"b".to_vec(), vec![0], None, 0, vec![]).unwrap();
        mgr.notify(1, &[put_event(b"a"), put_event(b"z")]);

        match rx.recv().await.unwrap() {
            WatchUpdate::Events { events, .. } => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].key, b"z".to_vec());
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }
}
