//! Relational store client.
//!
//! Serialisable-transaction key-value table with per-row monotonic versions
//! and prefix listing. Optimistic concurrency: every row read is recorded
//! with its version, and commit re-validates the read set against the shared
//! table, failing with [`TritonError::Serialization`] on any anomaly. This is
//! the in-memory stand-in a deployment swaps for a SERIALIZABLE Postgres
//! pool; the metadata service only depends on the transaction surface.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, TritonError};

/// A metadata row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: String,
    pub attributes: HashMap<String, String>,
    pub version: i64,
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Shared table backing every pool handed to a service.
#[derive(Default)]
pub struct RelationalStore {
    entries: RwLock<BTreeMap<String, Record>>,
}

impl RelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Record>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Record>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Begin-transaction handle, analogous to a connection pool.
#[derive(Clone)]
pub struct RelationalPool {
    store: Arc<RelationalStore>,
}

impl RelationalPool {
    pub fn new(store: Arc<RelationalStore>) -> Self {
        Self { store }
    }

    /// Starts a SERIALIZABLE transaction in the requested access mode.
    pub async fn begin(&self, access: AccessMode) -> Result<RelationalTx> {
        Ok(RelationalTx {
            store: self.store.clone(),
            access,
            writes: BTreeMap::new(),
            deletes: BTreeSet::new(),
            readset: HashMap::new(),
        })
    }
}

/// An in-flight serialisable transaction. Dropping it without calling
/// [`RelationalTx::commit`] discards every staged change.
pub struct RelationalTx {
    store: Arc<RelationalStore>,
    access: AccessMode,
    writes: BTreeMap<String, Record>,
    deletes: BTreeSet<String>,
    readset: HashMap<String, i64>,
}

impl RelationalTx {
    fn ensure_writable(&self) -> Result<()> {
        if self.access == AccessMode::ReadOnly {
            return Err(TritonError::InvalidRequest(
                "transaction is read-only".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads one row, staged writes taking precedence over the table.
    pub async fn get(&mut self, key: &str) -> Result<Option<Record>> {
        if let Some(record) = self.writes.get(key) {
            return Ok(Some(record.clone()));
        }
        if self.deletes.contains(key) {
            return Ok(None);
        }
        let entries = self.store.read();
        match entries.get(key) {
            Some(record) => {
                self.readset.insert(key.to_string(), record.version);
                Ok(Some(record.clone()))
            }
            None => {
                self.readset.insert(key.to_string(), 0);
                Ok(None)
            }
        }
    }

    /// Stages an upsert of the given row.
    pub async fn put(&mut self, record: Record) -> Result<()> {
        self.ensure_writable()?;
        self.deletes.remove(&record.key);
        self.writes.insert(record.key.clone(), record);
        Ok(())
    }

    /// Stages a row deletion.
    pub async fn delete(&mut self, key: &str) -> Result<()> {
        self.ensure_writable()?;
        self.writes.remove(key);
        self.deletes.insert(key.to_string());
        Ok(())
    }

    /// Lists committed rows with the prefix, strictly greater than
    /// `start_after` when non-empty, ascending, up to `limit`.
    pub async fn list(
        &mut self,
        prefix: &str,
        start_after: &str,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let entries = self.store.read();
        let mut out = Vec::new();
        for (key, record) in entries.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if !start_after.is_empty() && key.as_str() <= start_after {
                continue;
            }
            self.readset.insert(key.clone(), record.version);
            out.push(record.clone());
            if limit > 0 && out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    /// Validates the read set and applies staged changes atomically.
    pub async fn commit(self) -> Result<()> {
        let mut entries = self.store.write();
        for (key, expected_version) in &self.readset {
            let current = entries.get(key).map(|record| record.version).unwrap_or(0);
            if current != *expected_version {
                return Err(TritonError::Serialization);
            }
        }
        for key in &self.deletes {
            entries.remove(key);
        }
        for (key, record) in self.writes {
            entries.insert(key, record);
        }
        Ok(())
    }

    /// Discards the transaction. Provided for symmetry with the real client;
    /// dropping the transaction has the same effect.
    pub async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &str, version: i64) -> Record {
        Record {
            key: key.to_string(),
            value: value.to_string(),
            attributes: HashMap::new(),
            version,
        }
    }

    fn pool() -> RelationalPool {
        RelationalPool::new(Arc::new(RelationalStore::new()))
    }

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let pool = pool();
        let mut tx = pool.begin(AccessMode::ReadWrite).await.unwrap();
        tx.put(record("video/1", "{}", 1)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = pool.begin(AccessMode::ReadOnly).await.unwrap();
        let row = tx.get("video/1").await.unwrap().unwrap();
        assert_eq!(row.version, 1);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let pool = pool();
        let mut tx = pool.begin(AccessMode::ReadOnly).await.unwrap();
        let err = tx.put(record("k", "v", 1)).await.unwrap_err();
        assert!(matches!(err, TritonError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_conflicting_commit_fails_serialization() {
        let pool = pool();

        let mut seed = pool.begin(AccessMode::ReadWrite).await.unwrap();
        seed.put(record("k", "v1", 1)).await.unwrap();
        seed.commit().await.unwrap();

        let mut first = pool.begin(AccessMode::ReadWrite).await.unwrap();
        let mut second = pool.begin(AccessMode::ReadWrite).await.unwrap();

        let row = first.get("k").await.unwrap().unwrap();
        second.get("k").await.unwrap();

        first
            .put(record("k", "v2", row.version + 1))
            .await
            .unwrap();
        first.commit().await.unwrap();

        second.put(record("k", "v2'", 2)).await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, TritonError::Serialization));
    }

    #[tokio::test]
    async fn test_phantom_insert_invalidates_absent_read() {
        let pool = pool();

        let mut reader = pool.begin(AccessMode::ReadWrite).await.unwrap();
        assert!(reader.get("new-key").await.unwrap().is_none());

        let mut writer = pool.begin(AccessMode::ReadWrite).await.unwrap();
        writer.put(record("new-key", "v", 1)).await.unwrap();
        writer.commit().await.unwrap();

        reader.put(record("new-key", "v'", 1)).await.unwrap();
        assert!(matches!(
            reader.commit().await.unwrap_err(),
            TritonError::Serialization
        ));
    }

    #[tokio::test]
    async fn test_list_prefix_pagination() {
        let pool = pool();
        let mut tx = pool.begin(AccessMode::ReadWrite).await.unwrap();
        for i in 0..5 {
            tx.put(record(&format!("video/{}", i), "{}", 1)).await.unwrap();
        }
        tx.put(record("segment/a", "{}", 1)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = pool.begin(AccessMode::ReadOnly).await.unwrap();
        let page = tx.list("video/", "", 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].key, "video/0");
        assert_eq!(page[1].key, "video/1");

        let rest = tx.list("video/", "video/1", 10).await.unwrap();
        let keys: Vec<_> = rest.iter().map(|record| record.key.as_str()).collect();
        assert_eq!(keys, vec!["video/2", "video/3", "video/4"]);
    }
}
