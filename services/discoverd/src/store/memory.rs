//! In-process store.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{Node, Snapshot, Store, StoreAction, StoreEvent, StoreResult, WatchStream};
use crate::StoreError;

/// Mutations retained for watchers that start behind the head.
pub const DEFAULT_HISTORY: usize = 1000;

/// Events buffered per watcher before it is considered lagged.
pub const DEFAULT_WATCH_BUFFER: usize = 256;

#[derive(Debug)]
struct Entry {
    value: String,
    created_index: u64,
    modified_index: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn node(&self, key: &str) -> Node {
        Node {
            key: key.to_string(),
            value: self.value.clone(),
            created_index: self.created_index,
            modified_index: self.modified_index,
        }
    }
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<StoreEvent>,
    lagged: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    index: u64,
    entries: BTreeMap<String, Entry>,
    history: VecDeque<StoreEvent>,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn commit(&mut self, action: StoreAction, node: Node, prev_value: Option<String>, history: usize) {
        let event = StoreEvent {
            index: node.modified_index,
            action,
            node,
            prev_value,
        };

        self.history.push_back(event.clone());
        while self.history.len() > history {
            self.history.pop_front();
        }

        self.watchers.retain(|w| {
            if !event.node.key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            match w.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(prefix = %w.prefix, index = event.index, "Dropping lagged watcher");
                    w.lagged.store(true, Ordering::Release);
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    /// Removes every key whose TTL has passed, emitting expire events.
    fn expire(&mut self, now: Instant, history: usize) -> usize {
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &due {
            if let Some(entry) = self.entries.remove(key) {
                let index = self.next_index();
                let mut node = entry.node(key);
                node.modified_index = index;
                let prev = Some(entry.value);
                self.commit(StoreAction::Expire, node, prev, history);
            }
        }
        due.len()
    }
}

/// A store held entirely in memory.
///
/// TTLs are checked on every operation and by the sweeper started with
/// [`MemoryStore::spawn_expiry`], so expire events reach watchers even when
/// the store is otherwise idle.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    history: usize,
    watch_buffer: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_HISTORY, DEFAULT_WATCH_BUFFER)
    }

    pub fn with_limits(history: usize, watch_buffer: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            history: history.max(1),
            watch_buffer: watch_buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Index of the latest mutation.
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    /// Expires every key whose TTL has passed. Returns how many expired.
    pub fn expire_due(&self) -> usize {
        let mut inner = self.lock();
        inner.expire(Instant::now(), self.history)
    }

    /// Disconnects every watcher as though it had fallen behind.
    pub fn drop_watchers(&self) {
        let mut inner = self.lock();
        for w in inner.watchers.drain(..) {
            w.lagged.store(true, Ordering::Release);
        }
    }

    /// Starts a task that expires keys every `period`. The task stops once
    /// the store is dropped.
    pub fn spawn_expiry(store: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(store);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                let expired = store.expire_due();
                if expired > 0 {
                    debug!(expired, "Expired keys");
                }
            }
        })
    }

    fn write(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
        must_exist: bool,
    ) -> StoreResult<Node> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.expire(now, self.history);

        let existing = inner.entries.get(key);
        if must_exist && existing.is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let prev_value = existing.map(|e| e.value.clone());
        let created = existing.map(|e| e.created_index);
        let value = match (value, &prev_value) {
            (Some(v), _) => v.to_string(),
            (None, Some(prev)) => prev.clone(),
            (None, None) => return Err(StoreError::NotFound(key.to_string())),
        };

        let index = inner.next_index();
        let entry = Entry {
            value,
            created_index: created.unwrap_or(index),
            modified_index: index,
            expires_at: ttl.filter(|t| !t.is_zero()).map(|t| now + t),
        };
        let node = entry.node(key);
        inner.entries.insert(key.to_string(), entry);

        let action = if must_exist {
            StoreAction::Update
        } else {
            StoreAction::Set
        };
        inner.commit(action, node.clone(), prev_value, self.history);
        Ok(node)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Node> {
        self.write(key, Some(value), ttl, false)
    }

    async fn update(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Node> {
        self.write(key, Some(value), ttl, true)
    }

    async fn refresh(&self, key: &str, ttl: Option<Duration>) -> StoreResult<Node> {
        self.write(key, None, ttl, true)
    }

    async fn delete(&self, key: &str) -> StoreResult<Node> {
        let mut inner = self.lock();
        inner.expire(Instant::now(), self.history);

        let entry = inner
            .entries
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let index = inner.next_index();
        let mut node = entry.node(key);
        node.modified_index = index;
        inner.commit(StoreAction::Delete, node.clone(), Some(entry.value), self.history);
        Ok(node)
    }

    async fn get(&self, prefix: &str) -> StoreResult<Snapshot> {
        let mut inner = self.lock();
        inner.expire(Instant::now(), self.history);

        let nodes = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| e.node(k))
            .collect();
        Ok(Snapshot {
            index: inner.index,
            nodes,
        })
    }

    async fn watch(&self, prefix: &str, after_index: u64) -> StoreResult<WatchStream> {
        let mut inner = self.lock();
        inner.expire(Instant::now(), self.history);

        let backlog: Vec<StoreEvent> = if after_index < inner.index {
            let oldest = inner.history.front().map_or(inner.index + 1, |e| e.index);
            if after_index + 1 < oldest {
                return Err(StoreError::IndexCleared {
                    requested: after_index,
                    oldest,
                });
            }
            inner
                .history
                .iter()
                .filter(|e| e.index > after_index && e.node.key.starts_with(prefix))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let (tx, rx) = mpsc::channel(self.watch_buffer + backlog.len());
        for event in backlog {
            // Capacity covers the backlog.
            let _ = tx.try_send(event);
        }
        let lagged = Arc::new(AtomicBool::new(false));
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
            lagged: lagged.clone(),
        });

        let stream = stream::unfold((rx, lagged, false), |(mut rx, lagged, done)| async move {
            if done {
                return None;
            }
            match rx.recv().await {
                Some(event) => Some((Ok(event), (rx, lagged, false))),
                None if lagged.load(Ordering::Acquire) => {
                    Some((Err(StoreError::WatcherLagged), (rx, lagged, true)))
                }
                None => None,
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_keeps_created_index() {
        let store = MemoryStore::new();

        let first = store.put("/a/x", "1", None).await.unwrap();
        let second = store.put("/a/x", "2", None).await.unwrap();
        let updated = store.update("/a/x", "3", None).await.unwrap();

        assert_eq!(first.created_index, 1);
        assert_eq!(second.created_index, 1);
        assert_eq!(second.modified_index, 2);
        assert_eq!(updated.created_index, 1);
        assert_eq!(updated.value, "3");
    }

    #[tokio::test]
    async fn test_update_and_refresh_require_key() {
        let store = MemoryStore::new();

        assert_eq!(
            store.update("/a/x", "1", None).await,
            Err(StoreError::NotFound("/a/x".into()))
        );
        assert!(store.refresh("/a/x", None).await.unwrap_err().to_string().contains("/a/x"));
        assert!(matches!(store.delete("/a/x").await, Err(StoreError::NotFound(_))));
        assert_eq!(store.index(), 0);
    }

    #[tokio::test]
    async fn test_get_is_prefix_scoped() {
        let store = MemoryStore::new();
        store.put("/svc/a/1", "{}", None).await.unwrap();
        store.put("/svc/ab/1", "{}", None).await.unwrap();
        store.put("/svc/a/2", "{}", None).await.unwrap();

        let snapshot = store.get("/svc/a/").await.unwrap();

        assert_eq!(snapshot.index, 3);
        let keys: Vec<_> = snapshot.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["/svc/a/1", "/svc/a/2"]);
    }

    #[tokio::test]
    async fn test_watch_replays_history_after_index() {
        let store = MemoryStore::new();
        store.put("/p/a", "1", None).await.unwrap();
        let snapshot = store.get("/p/").await.unwrap();
        store.put("/p/b", "1", None).await.unwrap();
        store.put("/other", "1", None).await.unwrap();
        store.delete("/p/a").await.unwrap();

        let mut watch = store.watch("/p/", snapshot.index).await.unwrap();
        let first = watch.next().await.unwrap().unwrap();
        let second = watch.next().await.unwrap().unwrap();

        assert_eq!((first.index, first.action), (2, StoreAction::Set));
        assert_eq!((second.index, second.action), (4, StoreAction::Delete));
        assert_eq!(second.prev_value.as_deref(), Some("1"));

        store.update("/p/b", "2", None).await.unwrap();
        let live = watch.next().await.unwrap().unwrap();
        assert_eq!(live.action, StoreAction::Update);
        assert_eq!(live.prev_value.as_deref(), Some("1"));
        assert_eq!(live.node.value, "2");
    }

    #[tokio::test]
    async fn test_watch_behind_history_is_cleared() {
        let store = MemoryStore::with_limits(2, 16);
        for n in 0..5 {
            store.put(&format!("/p/{n}"), "v", None).await.unwrap();
        }

        let err = store.watch("/p/", 1).await.err().unwrap();
        assert_eq!(err, StoreError::IndexCleared { requested: 1, oldest: 4 });
        assert!(err.needs_resync());
        assert!(store.watch("/p/", 3).await.is_ok());
    }

    #[tokio::test]
    async fn test_lagged_watcher_gets_terminal_error() {
        let store = MemoryStore::with_limits(100, 2);
        let mut watch = store.watch("/p/", 0).await.unwrap();

        for n in 0..4 {
            store.put(&format!("/p/{n}"), "v", None).await.unwrap();
        }

        assert!(watch.next().await.unwrap().is_ok());
        assert!(watch.next().await.unwrap().is_ok());
        assert_eq!(watch.next().await.unwrap(), Err(StoreError::WatcherLagged));
        assert!(watch.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_emits_expire() {
        let store = Arc::new(MemoryStore::new());
        let sweeper = MemoryStore::spawn_expiry(&store, Duration::from_millis(100));
        store
            .put("/p/a", "v", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        let mut watch = store.watch("/p/", store.index()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        store.refresh("/p/a", Some(Duration::from_secs(2))).await.unwrap();
        let refreshed = watch.next().await.unwrap().unwrap();
        assert_eq!(refreshed.action, StoreAction::Update);
        assert_eq!(refreshed.prev_value.as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let expired = watch.next().await.unwrap().unwrap();
        assert_eq!(expired.action, StoreAction::Expire);
        assert_eq!(expired.node.key, "/p/a");
        assert!(store.get("/p/").await.unwrap().nodes.is_empty());

        sweeper.abort();
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let store = MemoryStore::new();
        store.put("/p/a", "v", Some(Duration::ZERO)).await.unwrap();
        assert_eq!(store.expire_due(), 0);
        assert_eq!(store.get("/p/").await.unwrap().nodes.len(), 1);
    }
}
