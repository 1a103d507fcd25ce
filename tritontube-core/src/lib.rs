//! TritonTube Core - placement and replication core for segmented video
//!
//! A consistent-hash placement layer for DASH/HLS segments:
//! - SHA-1 token ring with configurable virtual nodes
//! - ring state persisted and watched through a coordination store
//! - two-layer metadata catalog (serialisable transactions + revision CAS)
//! - primary/replica upload fan-out with per-peer acknowledgements
//! - deadline-bounded rebalancing on membership changes

pub mod archive;
pub mod blob_store;
pub mod cluster;
pub mod coord;
pub mod error;
pub mod keys;
pub mod metadata;
pub mod rebalance;
pub mod relational;
pub mod replication;
pub mod ring;
pub mod segments;
pub mod service;

pub use archive::{ArchiveUploader, FuncArchiveUploader, NoopArchiveUploader};
pub use blob_store::{compute_hash, BlobStore};
pub use cluster::{
    NodeDescriptor, RingEvent, RingManager, RingManagerConfig, VirtualNodeAssignment,
    DEFAULT_CLUSTER_PREFIX, DEFAULT_VIRTUAL_NODES,
};
pub use coord::{CoordStore, CoordTxn, EventKind, GetResponse, KeyValue, TxnResponse, WatchEvent, WatchResponse};
pub use error::{Result, TritonError};
pub use metadata::{
    DeleteMetadataRequest, DeleteMetadataResponse, ListMetadataRequest, ListMetadataResponse,
    MetadataItem, MetadataService, MetadataServiceConfig, PutMetadataRequest, PutMetadataResponse,
    DEFAULT_KEY_PREFIX, DEFAULT_LIST_LIMIT, DEFAULT_MAX_RETRIES,
};
pub use rebalance::{
    MigrationExecutor, NoopMigrationExecutor, RebalancePlan, Rebalancer,
    DEFAULT_REBALANCE_DEADLINE,
};
pub use relational::{AccessMode, Record, RelationalPool, RelationalStore, RelationalTx};
pub use replication::{
    merge_replication_errors, validate_replication_targets, InProcessReplicationTransport,
    NoopReplicationTransport, ReplicaHandler, ReplicationTransport, UploadSegmentHeader,
};
pub use ring::{ring_hash, Ring, RingToken};
pub use segments::{
    CoordSegmentStore, SegmentLocator, SegmentRecord, SegmentStore, DEFAULT_SEGMENTS_PREFIX,
};
pub use service::{
    GetSegmentFrame, HeartbeatRequest, HeartbeatResponse, ReplicaAck, StorageService,
    StorageServiceConfig, UploadFrame, UploadSegmentResponse, DEFAULT_LEASE_TTL,
    DEFAULT_REPLICATION_FACTOR,
};
