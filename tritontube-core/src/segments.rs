//! Segment placement records.
//!
//! A [`SegmentRecord`] tracks the authoritative location of an uploaded
//! segment: its primary, the peers that acknowledged replication, and the
//! committed checksum. Records live in the coordination store under a
//! dedicated prefix so watchers (repair tooling, the web tier) can follow
//! placements without touching the relational catalog.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coord::CoordStore;
use crate::error::{Result, TritonError};

pub const DEFAULT_SEGMENTS_PREFIX: &str = "/storage/segments";

/// Bucket/object address of a blob on a storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLocator {
    pub bucket: String,
    pub object: String,
}

/// Authoritative placement of one uploaded segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub segment_id: String,
    pub locator: SegmentLocator,
    pub primary_node: String,
    #[serde(default)]
    pub replicas: Vec<String>,
    pub checksum: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

/// Sink for segment records, written after successful replication.
#[async_trait]
pub trait SegmentStore: Send + Sync {
    async fn put_segment(&self, record: SegmentRecord) -> Result<()>;
}

/// Stores segment records in the coordination store under a prefix.
pub struct CoordSegmentStore {
    coord: Arc<CoordStore>,
    prefix: String,
}

impl CoordSegmentStore {
    pub fn new(coord: Arc<CoordStore>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = if prefix.is_empty() {
            DEFAULT_SEGMENTS_PREFIX.to_string()
        } else {
            prefix
        };
        Self { coord, prefix }
    }

    fn key(&self, segment_id: &str) -> String {
        format!("{}/{}", self.prefix, segment_id)
    }

    /// Reads a record back, mainly for tooling and tests.
    pub async fn get_segment(&self, segment_id: &str) -> Result<Option<SegmentRecord>> {
        let resp = self.coord.get(&self.key(segment_id)).await?;
        match resp.kvs.into_iter().next() {
            Some(kv) => Ok(Some(serde_json::from_str(&kv.value)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SegmentStore for CoordSegmentStore {
    /// Idempotent overwrite; `updated_at` is stamped here.
    async fn put_segment(&self, mut record: SegmentRecord) -> Result<()> {
        if record.segment_id.is_empty() {
            return Err(TritonError::InvalidRequest(
                "segment id is required".to_string(),
            ));
        }
        record.updated_at = Utc::now();
        let encoded = serde_json::to_string(&record)?;
        self.coord.put(&self.key(&record.segment_id), &encoded).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SegmentRecord {
        SegmentRecord {
            segment_id: "v1|720p|0".to_string(),
            locator: SegmentLocator {
                bucket: "videos".to_string(),
                object: "v1/720p/0".to_string(),
            },
            primary_node: "node-a".to_string(),
            replicas: vec!["node-b".to_string()],
            checksum: "abc".to_string(),
            size_bytes: 42,
            attributes: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_and_get_segment() {
        let coord = Arc::new(CoordStore::new());
        let store = CoordSegmentStore::new(coord.clone(), "");

        store.put_segment(sample_record()).await.unwrap();
        let loaded = store.get_segment("v1|720p|0").await.unwrap().unwrap();
        assert_eq!(loaded.primary_node, "node-a");
        assert_eq!(loaded.replicas, vec!["node-b".to_string()]);

        // Overwrite is idempotent.
        store.put_segment(sample_record()).await.unwrap();
        assert!(store.get_segment("v1|720p|0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejects_empty_segment_id() {
        let coord = Arc::new(CoordStore::new());
        let store = CoordSegmentStore::new(coord, "/storage/segments");
        let mut record = sample_record();
        record.segment_id.clear();
        assert!(store.put_segment(record).await.is_err());
    }
}
