//! Storage service: segment upload with replica fan-out, segment reads,
//! heartbeat and rebalance snapshots.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::archive::{ArchiveUploader, NoopArchiveUploader};
use crate::blob_store::BlobStore;
use crate::cluster::{NodeDescriptor, RingManager};
use crate::error::{Result, TritonError};
use crate::rebalance::RebalancePlan;
use crate::replication::{
    merge_replication_errors, validate_replication_targets, NoopReplicationTransport,
    ReplicationTransport, UploadSegmentHeader,
};
use crate::segments::{SegmentLocator, SegmentRecord, SegmentStore};

pub const DEFAULT_REPLICATION_FACTOR: usize = 3;
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

/// Per-peer replication deadline inside the upload fan-out.
const PEER_REPLICATION_TIMEOUT: Duration = Duration::from_secs(8);

/// Read chunk size for segment streaming.
const STREAM_CHUNK_BYTES: usize = 128 * 1024;

/// Client-streamed upload frame following the header.
#[derive(Debug, Clone)]
pub enum UploadFrame {
    Chunk(Bytes),
    Commit,
}

/// Per-target outcome of an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaAck {
    pub node_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSegmentResponse {
    pub size_committed: u64,
    pub checksum: String,
    pub replica_status: Vec<ReplicaAck>,
}

/// Server-streamed read frame.
#[derive(Debug, Clone)]
pub enum GetSegmentFrame {
    Chunk(Bytes),
    Eof,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub advertise_address: String,
    #[serde(default)]
    pub capacity_bytes: i64,
    #[serde(default)]
    pub available_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub lease_ttl_seconds: i64,
    pub ring_version: i64,
    pub require_rebalance: bool,
}

pub struct StorageServiceConfig {
    pub node_id: String,
    pub ring: Arc<RingManager>,
    pub blobs: Arc<BlobStore>,
    pub transport: Option<Arc<dyn ReplicationTransport>>,
    pub archive: Option<Arc<dyn ArchiveUploader>>,
    pub segments: Option<Arc<dyn SegmentStore>>,
    pub replication_factor: usize,
    pub lease_ttl: Duration,
}

impl StorageServiceConfig {
    pub fn new(node_id: impl Into<String>, ring: Arc<RingManager>, blobs: Arc<BlobStore>) -> Self {
        Self {
            node_id: node_id.into(),
            ring,
            blobs,
            transport: None,
            archive: None,
            segments: None,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

pub struct StorageService {
    node_id: String,
    ring: Arc<RingManager>,
    blobs: Arc<BlobStore>,
    transport: Arc<dyn ReplicationTransport>,
    archive: Arc<dyn ArchiveUploader>,
    segments: Option<Arc<dyn SegmentStore>>,
    replication_factor: usize,
    lease_ttl: Duration,
    plan_seq: AtomicU64,
}

impl StorageService {
    pub fn new(config: StorageServiceConfig) -> Result<Self> {
        if config.node_id.is_empty() {
            return Err(TritonError::Config("node id is required".to_string()));
        }
        let replication_factor = if config.replication_factor == 0 {
            DEFAULT_REPLICATION_FACTOR
        } else {
            config.replication_factor
        };
        let lease_ttl = if config.lease_ttl.is_zero() {
            DEFAULT_LEASE_TTL
        } else {
            config.lease_ttl
        };
        Ok(Self {
            node_id: config.node_id,
            ring: config.ring,
            blobs: config.blobs,
            transport: config
                .transport
                .unwrap_or_else(|| Arc::new(NoopReplicationTransport)),
            archive: config
                .archive
                .unwrap_or_else(|| Arc::new(NoopArchiveUploader)),
            segments: config.segments,
            replication_factor,
            lease_ttl,
            plan_seq: AtomicU64::new(0),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Receives a client-streamed segment, persists it locally, fans out to
    /// the replica set and the optional cold tier, and records the placement
    /// when every target acknowledged. Local persistence is authoritative:
    /// a local failure fails the upload regardless of peers.
    pub async fn upload_segment(
        &self,
        header: UploadSegmentHeader,
        mut frames: mpsc::Receiver<UploadFrame>,
    ) -> Result<UploadSegmentResponse> {
        if header.segment_id.is_empty() {
            return Err(TritonError::InvalidRequest(
                "segment id is required".to_string(),
            ));
        }
        if header.locator.bucket.is_empty() || header.locator.object.is_empty() {
            return Err(TritonError::InvalidRequest(
                "upload header missing locator".to_string(),
            ));
        }

        let mut payload = BytesMut::new();
        while let Some(frame) = frames.recv().await {
            match frame {
                UploadFrame::Chunk(chunk) => payload.extend_from_slice(&chunk),
                UploadFrame::Commit => break,
            }
        }
        let data = payload.freeze();

        let (size, checksum) = self
            .blobs
            .put(&header.locator.bucket, &header.locator.object, data.clone())
            .await?;

        let mut targets = self
            .ring
            .lookup(header.segment_id.as_bytes(), self.replication_factor)
            .await;
        if targets.is_empty() {
            targets = vec![self.node_id.clone()];
        }
        validate_replication_targets(&targets, &self.node_id)?;

        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
        for target in targets.iter().filter(|target| **target != self.node_id) {
            let transport = Arc::clone(&self.transport);
            let header = header.clone();
            let data = data.clone();
            let target = target.clone();
            tasks.spawn(async move {
                let result = match tokio::time::timeout(
                    PEER_REPLICATION_TIMEOUT,
                    transport.replicate_segment(&target, &header, data),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_elapsed) => Err(TritonError::Transport {
                        target: target.clone(),
                        message: "replication timed out".to_string(),
                    }),
                };
                (target, result)
            });
        }

        if let (Some(s3_bucket), Some(s3_key)) = (&header.s3_bucket, &header.s3_key) {
            if !s3_bucket.is_empty() && !s3_key.is_empty() {
                let archive = Arc::clone(&self.archive);
                let bucket = s3_bucket.clone();
                let key = s3_key.clone();
                let data = data.clone();
                tasks.spawn(async move {
                    let label = format!("s3:{}/{}", bucket, key);
                    let result = archive.upload_segment(&bucket, &key, data).await;
                    (label, result)
                });
            }
        }

        let mut results: BTreeMap<String, Result<()>> = BTreeMap::new();
        results.insert(self.node_id.clone(), Ok(()));
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, result)) => {
                    results.insert(target, result);
                }
                Err(error) => {
                    return Err(TritonError::Internal(format!(
                        "replication task failed: {}",
                        error
                    )))
                }
            }
        }

        let aggregate = merge_replication_errors(&results);

        let mut replica_status = vec![ReplicaAck {
            node_id: self.node_id.clone(),
            success: true,
            error_message: None,
        }];
        for (target, result) in &results {
            if target == &self.node_id {
                continue;
            }
            replica_status.push(ReplicaAck {
                node_id: target.clone(),
                success: result.is_ok(),
                error_message: result.as_ref().err().map(|error| error.to_string()),
            });
        }

        if let Some(segments) = &self.segments {
            match &aggregate {
                None => {
                    let replicas = targets
                        .iter()
                        .filter(|target| {
                            **target != self.node_id
                                && results
                                    .get(*target)
                                    .map(|result| result.is_ok())
                                    .unwrap_or(false)
                        })
                        .cloned()
                        .collect();
                    let record = SegmentRecord {
                        segment_id: header.segment_id.clone(),
                        locator: header.locator.clone(),
                        primary_node: self.node_id.clone(),
                        replicas,
                        checksum: checksum.clone(),
                        size_bytes: size,
                        attributes: header.attributes.clone(),
                        updated_at: chrono::Utc::now(),
                    };
                    let ack = match segments.put_segment(record).await {
                        Ok(()) => ReplicaAck {
                            node_id: "metadata".to_string(),
                            success: true,
                            error_message: None,
                        },
                        Err(error) => ReplicaAck {
                            node_id: "metadata".to_string(),
                            success: false,
                            error_message: Some(error.to_string()),
                        },
                    };
                    replica_status.push(ack);
                }
                Some(error) => {
                    replica_status.push(ReplicaAck {
                        node_id: "metadata".to_string(),
                        success: false,
                        error_message: Some(error.to_string()),
                    });
                }
            }
        }

        if let Some(error) = &aggregate {
            tracing::warn!(
                "segment {} replicated with failures: {}",
                header.segment_id,
                error
            );
            replica_status.push(ReplicaAck {
                node_id: "replication".to_string(),
                success: false,
                error_message: Some(error.to_string()),
            });
        }

        Ok(UploadSegmentResponse {
            size_committed: size,
            checksum,
            replica_status,
        })
    }

    /// Streams a stored segment back to the caller in fixed-size chunks,
    /// terminated by an EOF frame. Early channel close signals truncation.
    pub async fn get_segment(
        &self,
        locator: &SegmentLocator,
    ) -> Result<mpsc::Receiver<GetSegmentFrame>> {
        if locator.bucket.is_empty() || locator.object.is_empty() {
            return Err(TritonError::InvalidRequest(
                "locator is required".to_string(),
            ));
        }
        let mut file = self.blobs.get(&locator.bucket, &locator.object).await?;

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut buf = vec![0u8; STREAM_CHUNK_BYTES];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => {
                        let _ = tx.send(GetSegmentFrame::Eof).await;
                        return;
                    }
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if tx.send(GetSegmentFrame::Chunk(chunk)).await.is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        tracing::warn!("segment stream aborted: {}", error);
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Records the node's availability and returns the current ring version.
    pub async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        if req.node_id.is_empty() {
            return Err(TritonError::InvalidRequest(
                "heartbeat missing node id".to_string(),
            ));
        }
        let descriptor = NodeDescriptor {
            id: req.node_id,
            address: req.advertise_address,
            capacity_bytes: req.capacity_bytes,
            available_bytes: req.available_bytes,
            updated_at: None,
        };
        let ring_version = self.ring.upsert_node(descriptor).await?;
        Ok(HeartbeatResponse {
            lease_ttl_seconds: self.lease_ttl.as_secs() as i64,
            ring_version,
            require_rebalance: false,
        })
    }

    /// Snapshot of the current assignments as a migration plan. Plan ids are
    /// locally unique and monotonic.
    pub async fn rebalance(&self) -> Result<RebalancePlan> {
        let (assignments, ring_version) = self.ring.assignments().await;
        let seq = self.plan_seq.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(RebalancePlan {
            plan_id: format!("plan-{}-{}", self.node_id, seq),
            ring_version,
            assignments,
        })
    }
}
