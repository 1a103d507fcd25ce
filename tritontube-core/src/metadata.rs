//! Metadata service: strongly consistent catalog of `(key -> item)` records.
//!
//! Writes run a two-layer protocol: a SERIALIZABLE relational transaction
//! carrying the new per-key version commits first, then a coordination-store
//! transaction mirrors the encoded item guarded by a revision compare. The
//! relational store is authoritative for versions; the mirror exists for
//! watchers and cross-process races. If the mirror write fails after the
//! relational commit the stores diverge for that key until the caller
//! retries with the fresh expected version.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::coord::CoordStore;
use crate::error::{Result, TritonError};
use crate::relational::{AccessMode, Record, RelationalPool};

pub const DEFAULT_KEY_PREFIX: &str = "metadata/";
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// One catalog entry. `version` starts at 1 and increments by exactly one on
/// every successful update of the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PutMetadataRequest {
    pub item: MetadataItem,
    /// When set, the row must exist with exactly this version.
    pub expected_version: Option<i64>,
    /// When set, the mirror key must have exactly this mod revision
    /// (0 means "absent").
    pub expected_revision: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PutMetadataResponse {
    pub item: MetadataItem,
    pub revision: i64,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteMetadataRequest {
    pub key: String,
    pub expected_version: Option<i64>,
    pub expected_revision: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct DeleteMetadataResponse {
    pub revision: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ListMetadataRequest {
    pub prefix: String,
    /// 0 means the default of [`DEFAULT_LIST_LIMIT`].
    pub limit: usize,
    /// Exclusive lower bound on returned keys.
    pub page_token: String,
}

#[derive(Debug, Clone)]
pub struct ListMetadataResponse {
    pub items: Vec<MetadataItem>,
    pub next_page_token: String,
}

pub struct MetadataServiceConfig {
    pub write_pool: RelationalPool,
    /// Defaults to the write pool when absent.
    pub read_pool: Option<RelationalPool>,
    pub coord: Arc<CoordStore>,
    pub key_prefix: String,
    pub max_retries: u32,
}

impl MetadataServiceConfig {
    pub fn new(write_pool: RelationalPool, coord: Arc<CoordStore>) -> Self {
        Self {
            write_pool,
            read_pool: None,
            coord,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

pub struct MetadataService {
    write_pool: RelationalPool,
    read_pool: RelationalPool,
    coord: Arc<CoordStore>,
    key_prefix: String,
    max_retries: u32,
}

impl MetadataService {
    pub fn new(config: MetadataServiceConfig) -> Self {
        let read_pool = config.read_pool.unwrap_or_else(|| config.write_pool.clone());
        let key_prefix = if config.key_prefix.is_empty() {
            DEFAULT_KEY_PREFIX.to_string()
        } else {
            config.key_prefix
        };
        let max_retries = config.max_retries.max(1);
        Self {
            write_pool: config.write_pool,
            read_pool,
            coord: config.coord,
            key_prefix,
            max_retries,
        }
    }

    fn mirror_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Conditional upsert: relational transaction first, mirror CAS second.
    pub async fn put_metadata(&self, req: PutMetadataRequest) -> Result<PutMetadataResponse> {
        if req.item.key.is_empty() {
            return Err(TritonError::InvalidRequest("key is required".to_string()));
        }

        let record = self
            .retry(|| self.put_txn(&req.item, req.expected_version))
            .await?;

        let mut item = req.item.clone();
        item.version = record.version;
        let encoded = serde_json::to_string(&item)?;

        let mirror_key = self.mirror_key(&item.key);
        let mut txn = self.coord.txn();
        if let Some(revision) = req.expected_revision {
            txn = txn.compare_mod_revision(&mirror_key, revision);
        }
        let resp = txn.put(&mirror_key, &encoded).commit().await?;
        if !resp.succeeded {
            return Err(TritonError::RevisionConflict(item.key));
        }

        Ok(PutMetadataResponse {
            item,
            revision: resp.revision,
        })
    }

    async fn put_txn(&self, item: &MetadataItem, expected_version: Option<i64>) -> Result<Record> {
        let mut tx = self.write_pool.begin(AccessMode::ReadWrite).await?;
        let existing = tx.get(&item.key).await?;

        if let Some(expected) = expected_version {
            match &existing {
                None => return Err(TritonError::NotFound(item.key.clone())),
                Some(row) if row.version != expected => {
                    return Err(TritonError::VersionMismatch {
                        key: item.key.clone(),
                        expected,
                        actual: row.version,
                    })
                }
                Some(_) => {}
            }
        }

        let version = existing.map(|row| row.version + 1).unwrap_or(1);
        let record = Record {
            key: item.key.clone(),
            value: item.value.clone(),
            attributes: item.attributes.clone(),
            version,
        };
        tx.put(record.clone()).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Reads one item in a read-only serialisable transaction.
    pub async fn get_metadata(&self, key: &str) -> Result<MetadataItem> {
        if key.is_empty() {
            return Err(TritonError::InvalidRequest("key is required".to_string()));
        }
        let mut tx = self.read_pool.begin(AccessMode::ReadOnly).await?;
        let row = tx.get(key).await?;
        tx.rollback().await?;
        match row {
            Some(record) => Ok(record_to_item(record)),
            None => Err(TritonError::NotFound(key.to_string())),
        }
    }

    /// Conditional delete, mirroring [`MetadataService::put_metadata`].
    pub async fn delete_metadata(
        &self,
        req: DeleteMetadataRequest,
    ) -> Result<DeleteMetadataResponse> {
        if req.key.is_empty() {
            return Err(TritonError::InvalidRequest("key is required".to_string()));
        }

        self.retry(|| self.delete_txn(&req.key, req.expected_version))
            .await?;

        let mirror_key = self.mirror_key(&req.key);
        let mut txn = self.coord.txn();
        if let Some(revision) = req.expected_revision {
            txn = txn.compare_mod_revision(&mirror_key, revision);
        }
        let resp = txn.delete(&mirror_key).commit().await?;
        if !resp.succeeded {
            return Err(TritonError::RevisionConflict(req.key));
        }

        Ok(DeleteMetadataResponse {
            revision: resp.revision,
        })
    }

    async fn delete_txn(&self, key: &str, expected_version: Option<i64>) -> Result<()> {
        let mut tx = self.write_pool.begin(AccessMode::ReadWrite).await?;
        let row = tx
            .get(key)
            .await?
            .ok_or_else(|| TritonError::NotFound(key.to_string()))?;
        if let Some(expected) = expected_version {
            if row.version != expected {
                return Err(TritonError::VersionMismatch {
                    key: key.to_string(),
                    expected,
                    actual: row.version,
                });
            }
        }
        tx.delete(key).await?;
        tx.commit().await
    }

    /// Lists items lexicographically with pagination.
    pub async fn list_metadata(&self, req: ListMetadataRequest) -> Result<ListMetadataResponse> {
        let limit = if req.limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            req.limit
        };

        let mut tx = self.read_pool.begin(AccessMode::ReadOnly).await?;
        let mut rows = tx.list(&req.prefix, &req.page_token, limit + 1).await?;
        tx.rollback().await?;

        let next_page_token = if rows.len() > limit {
            rows.truncate(limit);
            rows.last()
                .map(|record| record.key.clone())
                .unwrap_or_default()
        } else {
            String::new()
        };

        Ok(ListMetadataResponse {
            items: rows.into_iter().map(record_to_item).collect(),
            next_page_token,
        })
    }

    /// Re-runs `op` on serialisation anomalies, up to the retry budget.
    /// Every other error is terminal.
    async fn retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for attempt in 0..self.max_retries {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    tracing::debug!(
                        "retrying metadata transaction after serialization failure (attempt {})",
                        attempt + 1
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            TritonError::Internal(format!("exceeded retry budget ({})", self.max_retries))
        }))
    }
}

fn record_to_item(record: Record) -> MetadataItem {
    MetadataItem {
        key: record.key,
        value: record.value,
        attributes: record.attributes,
        version: record.version,
    }
}
