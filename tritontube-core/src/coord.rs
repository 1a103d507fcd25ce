//! Coordination store client.
//!
//! Linearisable key-value store with revision-based compare-and-swap
//! transactions and prefix watches. This is the in-memory stand-in the
//! deployment tooling swaps for a real etcd endpoint; every mutation runs
//! under a single mutex, which also defines the linearisation order.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::error::Result;

const WATCH_BUFFER: usize = 8;

/// A value stored in the coordination store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub mod_revision: i64,
}

/// Result of a read.
#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// Result of a transaction commit.
#[derive(Debug, Clone)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub revision: i64,
}

/// Mutation kind observed by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single observed mutation.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: String,
    pub mod_revision: i64,
}

/// A batch of events delivered to one watcher.
#[derive(Debug, Clone)]
pub struct WatchResponse {
    pub events: Vec<WatchEvent>,
    pub revision: i64,
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    mod_revision: i64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<WatchResponse>,
}

#[derive(Default)]
struct Inner {
    revision: i64,
    kv: BTreeMap<String, StoredValue>,
    watchers: Vec<Watcher>,
}

/// Coordination store handle. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct CoordStore {
    inner: Mutex<Inner>,
}

enum CoordOp {
    Put { key: String, value: String },
    Delete { key: String },
}

struct RevisionCompare {
    key: String,
    mod_revision: i64,
}

/// Conditional mutation builder mirroring the store's transaction API.
pub struct CoordTxn<'a> {
    store: &'a CoordStore,
    compares: Vec<RevisionCompare>,
    ops: Vec<CoordOp>,
}

impl CoordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn get(&self, key: &str) -> Result<GetResponse> {
        let inner = self.locked();
        let mut resp = GetResponse {
            kvs: Vec::new(),
            revision: inner.revision,
        };
        if let Some(stored) = inner.kv.get(key) {
            resp.kvs.push(KeyValue {
                key: key.to_string(),
                value: stored.value.clone(),
                mod_revision: stored.mod_revision,
            });
        }
        Ok(resp)
    }

    pub async fn get_prefix(&self, prefix: &str) -> Result<GetResponse> {
        let inner = self.locked();
        let mut resp = GetResponse {
            kvs: Vec::new(),
            revision: inner.revision,
        };
        for (key, stored) in inner.kv.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            resp.kvs.push(KeyValue {
                key: key.clone(),
                value: stored.value.clone(),
                mod_revision: stored.mod_revision,
            });
        }
        Ok(resp)
    }

    /// Unconditional put, a one-op transaction.
    pub async fn put(&self, key: &str, value: &str) -> Result<TxnResponse> {
        self.txn().put(key, value).commit().await
    }

    /// Unconditional delete, a one-op transaction.
    pub async fn delete(&self, key: &str) -> Result<TxnResponse> {
        self.txn().delete(key).commit().await
    }

    pub fn txn(&self) -> CoordTxn<'_> {
        CoordTxn {
            store: self,
            compares: Vec::new(),
            ops: Vec::new(),
        }
    }

    /// Subscribes to every mutation under `prefix`. Dropping the receiver
    /// unsubscribes; a watcher that cannot keep up loses events instead of
    /// blocking the store.
    pub fn watch(&self, prefix: &str) -> mpsc::Receiver<WatchResponse> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut inner = self.locked();
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        rx
    }
}

impl Inner {
    fn notify(&mut self, events: &[WatchEvent]) {
        let revision = self.revision;
        self.watchers.retain(|watcher| {
            let mut alive = true;
            for event in events {
                if !event.key.starts_with(&watcher.prefix) {
                    continue;
                }
                match watcher.tx.try_send(WatchResponse {
                    events: vec![event.clone()],
                    revision,
                }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        alive = false;
                        break;
                    }
                }
            }
            alive
        });
    }
}

impl CoordTxn<'_> {
    /// Guards the transaction on `mod_revision(key) == mod_revision`.
    /// An absent key has revision 0.
    pub fn compare_mod_revision(mut self, key: &str, mod_revision: i64) -> Self {
        self.compares.push(RevisionCompare {
            key: key.to_string(),
            mod_revision,
        });
        self
    }

    pub fn put(mut self, key: &str, value: &str) -> Self {
        self.ops.push(CoordOp::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn delete(mut self, key: &str) -> Self {
        self.ops.push(CoordOp::Delete {
            key: key.to_string(),
        });
        self
    }

    /// Applies the operations atomically iff every compare holds.
    pub async fn commit(self) -> Result<TxnResponse> {
        let mut inner = self.store.locked();

        let succeeded = self.compares.iter().all(|compare| {
            let current = inner
                .kv
                .get(&compare.key)
                .map(|stored| stored.mod_revision)
                .unwrap_or(0);
            current == compare.mod_revision
        });

        if !succeeded {
            return Ok(TxnResponse {
                succeeded: false,
                revision: inner.revision,
            });
        }

        let mut events = Vec::with_capacity(self.ops.len());
        for op in self.ops {
            match op {
                CoordOp::Put { key, value } => {
                    inner.revision += 1;
                    let mod_revision = inner.revision;
                    inner.kv.insert(
                        key.clone(),
                        StoredValue {
                            value: value.clone(),
                            mod_revision,
                        },
                    );
                    events.push(WatchEvent {
                        kind: EventKind::Put,
                        key,
                        value,
                        mod_revision,
                    });
                }
                CoordOp::Delete { key } => {
                    if inner.kv.remove(&key).is_some() {
                        inner.revision += 1;
                        let mod_revision = inner.revision;
                        events.push(WatchEvent {
                            kind: EventKind::Delete,
                            key,
                            value: String::new(),
                            mod_revision,
                        });
                    }
                }
            }
        }

        if !events.is_empty() {
            inner.notify(&events);
        }

        Ok(TxnResponse {
            succeeded: true,
            revision: inner.revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = CoordStore::new();
        store.put("a/1", "one").await.unwrap();
        store.put("a/2", "two").await.unwrap();

        let resp = store.get("a/1").await.unwrap();
        assert_eq!(resp.kvs.len(), 1);
        assert_eq!(resp.kvs[0].value, "one");

        let prefix = store.get_prefix("a/").await.unwrap();
        assert_eq!(prefix.kvs.len(), 2);

        store.delete("a/1").await.unwrap();
        assert!(store.get("a/1").await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn test_txn_revision_compare() {
        let store = CoordStore::new();
        let first = store.put("k", "v1").await.unwrap();

        // Stale revision: compare fails, nothing is written.
        let stale = store
            .txn()
            .compare_mod_revision("k", first.revision - 1)
            .put("k", "v2")
            .commit()
            .await
            .unwrap();
        assert!(!stale.succeeded);
        assert_eq!(store.get("k").await.unwrap().kvs[0].value, "v1");

        // Matching revision: the write lands.
        let fresh = store
            .txn()
            .compare_mod_revision("k", first.revision)
            .put("k", "v2")
            .commit()
            .await
            .unwrap();
        assert!(fresh.succeeded);
        assert_eq!(store.get("k").await.unwrap().kvs[0].value, "v2");
    }

    #[tokio::test]
    async fn test_compare_absent_key_is_revision_zero() {
        let store = CoordStore::new();
        let resp = store
            .txn()
            .compare_mod_revision("missing", 0)
            .put("missing", "v")
            .commit()
            .await
            .unwrap();
        assert!(resp.succeeded);
    }

    #[tokio::test]
    async fn test_watch_delivers_prefix_events() {
        let store = CoordStore::new();
        let mut watch = store.watch("ring/");

        store.put("ring/state", "s1").await.unwrap();
        store.put("other/key", "x").await.unwrap();
        store.delete("ring/state").await.unwrap();

        let first = watch.recv().await.unwrap();
        assert_eq!(first.events[0].kind, EventKind::Put);
        assert_eq!(first.events[0].key, "ring/state");

        let second = watch.recv().await.unwrap();
        assert_eq!(second.events[0].kind, EventKind::Delete);
    }

    #[tokio::test]
    async fn test_dropped_watcher_is_pruned() {
        let store = CoordStore::new();
        let watch = store.watch("p/");
        drop(watch);
        store.put("p/x", "1").await.unwrap();
        assert!(store.locked().watchers.is_empty());
    }
}
