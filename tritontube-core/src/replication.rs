//! Replication transport seam and error aggregation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TritonError};
use crate::segments::SegmentLocator;

/// Header frame that opens a segment upload or replication call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSegmentHeader {
    pub segment_id: String,
    pub locator: SegmentLocator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_key: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Fan-out RPC used to push a segment to a peer storage node.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    async fn replicate_segment(
        &self,
        node_id: &str,
        header: &UploadSegmentHeader,
        payload: Bytes,
    ) -> Result<()>;
}

/// Drop-in transport for tests and single-node setups.
pub struct NoopReplicationTransport;

#[async_trait]
impl ReplicationTransport for NoopReplicationTransport {
    async fn replicate_segment(
        &self,
        _node_id: &str,
        _header: &UploadSegmentHeader,
        _payload: Bytes,
    ) -> Result<()> {
        Ok(())
    }
}

/// Handler invoked for replication requests addressed to one node.
pub type ReplicaHandler =
    Arc<dyn Fn(UploadSegmentHeader, Bytes) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Dispatches replication calls to handlers registered in memory.
#[derive(Default)]
pub struct InProcessReplicationTransport {
    handlers: RwLock<HashMap<String, ReplicaHandler>>,
}

impl InProcessReplicationTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: &str, handler: ReplicaHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.to_string(), handler);
    }
}

#[async_trait]
impl ReplicationTransport for InProcessReplicationTransport {
    async fn replicate_segment(
        &self,
        node_id: &str,
        header: &UploadSegmentHeader,
        payload: Bytes,
    ) -> Result<()> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned();
        match handler {
            Some(handler) => handler(header.clone(), payload).await,
            None => Err(TritonError::Transport {
                target: node_id.to_string(),
                message: "no replication handler registered".to_string(),
            }),
        }
    }
}

/// Folds per-target results into a single aggregate error. Returns `None`
/// when every target succeeded.
pub fn merge_replication_errors(
    results: &BTreeMap<String, Result<()>>,
) -> Option<TritonError> {
    let failures: BTreeMap<String, String> = results
        .iter()
        .filter_map(|(target, result)| {
            result
                .as_ref()
                .err()
                .map(|error| (target.clone(), error.to_string()))
        })
        .collect();
    if failures.is_empty() {
        None
    } else {
        Some(TritonError::ReplicationFailed { failures })
    }
}

/// Ensures the replica set produced by the ring contains the primary.
pub fn validate_replication_targets(targets: &[String], primary: &str) -> Result<()> {
    if targets.is_empty() {
        return Err(TritonError::InvalidRequest(
            "replica set cannot be empty".to_string(),
        ));
    }
    if targets.iter().any(|target| target == primary) {
        return Ok(());
    }
    Err(TritonError::ReplicaSetMissingPrimary(primary.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_targets() {
        let targets = vec!["a".to_string(), "b".to_string()];
        assert!(validate_replication_targets(&targets, "a").is_ok());
        assert!(matches!(
            validate_replication_targets(&targets, "c").unwrap_err(),
            TritonError::ReplicaSetMissingPrimary(_)
        ));
        assert!(validate_replication_targets(&[], "a").is_err());
    }

    #[test]
    fn test_merge_errors() {
        let mut results: BTreeMap<String, Result<()>> = BTreeMap::new();
        results.insert("a".to_string(), Ok(()));
        assert!(merge_replication_errors(&results).is_none());

        results.insert(
            "b".to_string(),
            Err(TritonError::Transport {
                target: "b".to_string(),
                message: "unreachable".to_string(),
            }),
        );
        let aggregate = merge_replication_errors(&results);
        match aggregate {
            Some(TritonError::ReplicationFailed { failures }) => {
                assert_eq!(failures.len(), 1);
                assert!(failures.contains_key("b"));
            }
            other => panic!("unexpected aggregate: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_in_process_dispatch() {
        let transport = InProcessReplicationTransport::new();
        transport.register(
            "node-b",
            Arc::new(|_, _| Box::pin(async { Ok(()) })),
        );

        let header = UploadSegmentHeader {
            segment_id: "v1|720p|0".to_string(),
            ..Default::default()
        };
        assert!(transport
            .replicate_segment("node-b", &header, Bytes::new())
            .await
            .is_ok());
        assert!(matches!(
            transport
                .replicate_segment("node-c", &header, Bytes::new())
                .await
                .unwrap_err(),
            TritonError::Transport { .. }
        ));
    }
}
