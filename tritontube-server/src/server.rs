use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use tritontube_core::keys::{
    placement_key, segment_metadata_key, segment_object_path, video_metadata_key, SEGMENT_BUCKET,
};
use tritontube_core::{
    BlobStore, CoordSegmentStore, CoordStore, GetSegmentFrame, HeartbeatRequest, MetadataItem,
    MetadataService, MetadataServiceConfig, MigrationExecutor, NodeDescriptor, PutMetadataRequest,
    RebalancePlan, Rebalancer, RelationalPool, RelationalStore, Result, RingManager,
    RingManagerConfig, SegmentLocator, StorageService, StorageServiceConfig, TritonError,
    UploadFrame, UploadSegmentHeader,
};

use crate::config::{Config, NodeConfig};

pub struct AppState {
    replication_factor: usize,
    write_quorum: usize,
    blobs: Arc<BlobStore>,
    ring: Arc<RingManager>,
    metadata: Arc<MetadataService>,
    service: Arc<StorageService>,
}

fn error_response(error: TritonError) -> Response {
    let status = match &error {
        TritonError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        TritonError::NotFound(_) => StatusCode::NOT_FOUND,
        TritonError::VersionMismatch { .. } | TritonError::RevisionConflict(_) => {
            StatusCode::CONFLICT
        }
        TritonError::Serialization => StatusCode::SERVICE_UNAVAILABLE,
        TritonError::Transport { .. } | TritonError::ReplicationFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        TritonError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

async fn healthz() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct CreateVideoRequest {
    #[serde(default)]
    id: String,
}

async fn create_video(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateVideoRequest>,
) -> Response {
    if req.id.is_empty() {
        return error_response(TritonError::InvalidRequest("missing id".to_string()));
    }
    let item = MetadataItem {
        key: video_metadata_key(&req.id),
        value: r#"{"status":"ingesting"}"#.to_string(),
        ..Default::default()
    };
    match state
        .metadata
        .put_metadata(PutMetadataRequest {
            item,
            ..Default::default()
        })
        .await
    {
        Ok(resp) => Json(json!({
            "id": req.id,
            "status": "ingesting",
            "version": resp.item.version,
        }))
        .into_response(),
        Err(error) => error_response(error),
    }
}

#[derive(Debug, Deserialize)]
struct SegmentQuery {
    rend: String,
    idx: u64,
}

async fn create_segment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SegmentQuery>,
) -> Response {
    if id.is_empty() || query.rend.is_empty() {
        return error_response(TritonError::InvalidRequest(
            "need id, rend, idx".to_string(),
        ));
    }
    let key = placement_key(&id, &query.rend, query.idx);
    let replicas = state
        .ring
        .lookup(key.as_bytes(), state.replication_factor)
        .await;
    if replicas.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no storage nodes" })),
        )
            .into_response();
    }

    let placement = json!({
        "video": id,
        "rend": query.rend,
        "idx": query.idx,
        "replicas": replicas,
    });
    let item = MetadataItem {
        key: segment_metadata_key(&id, &query.rend, query.idx),
        value: placement.to_string(),
        ..Default::default()
    };
    match state
        .metadata
        .put_metadata(PutMetadataRequest {
            item,
            ..Default::default()
        })
        .await
    {
        Ok(_) => Json(placement).into_response(),
        Err(error) => error_response(error),
    }
}

async fn segment_locations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SegmentQuery>,
) -> Response {
    let key = segment_metadata_key(&id, &query.rend, query.idx);
    match state.metadata.get_metadata(&key).await {
        Ok(item) => match serde_json::from_str::<serde_json::Value>(&item.value) {
            Ok(value) => Json(value).into_response(),
            Err(error) => error_response(TritonError::Internal(format!(
                "stored placement is not valid JSON: {}",
                error
            ))),
        },
        Err(error) => error_response(error),
    }
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    id: String,
    rend: String,
    idx: u64,
}

async fn upload_segment(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Response {
    if query.id.is_empty() || query.rend.is_empty() {
        return error_response(TritonError::InvalidRequest(
            "missing id or rend".to_string(),
        ));
    }

    let segment_id = placement_key(&query.id, &query.rend, query.idx);
    let replicas = state
        .ring
        .lookup(segment_id.as_bytes(), state.replication_factor)
        .await;
    if replicas.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no replicas available" })),
        )
            .into_response();
    }

    // Register the placement before moving bytes, as the ingest flow does.
    let placement_item = MetadataItem {
        key: segment_metadata_key(&query.id, &query.rend, query.idx),
        value: json!({
            "video": query.id,
            "rend": query.rend,
            "idx": query.idx,
            "replicas": replicas,
        })
        .to_string(),
        ..Default::default()
    };
    if let Err(error) = state
        .metadata
        .put_metadata(PutMetadataRequest {
            item: placement_item,
            ..Default::default()
        })
        .await
    {
        return error_response(error);
    }

    let header = UploadSegmentHeader {
        segment_id,
        locator: SegmentLocator {
            bucket: SEGMENT_BUCKET.to_string(),
            object: segment_object_path(&query.id, &query.rend, query.idx),
        },
        ..Default::default()
    };

    let (tx, frames) = mpsc::channel(2);
    if tx.send(UploadFrame::Chunk(body)).await.is_err() {
        return error_response(TritonError::Internal("upload channel closed".to_string()));
    }
    drop(tx);

    let resp = match state.service.upload_segment(header, frames).await {
        Ok(resp) => resp,
        Err(error) => return error_response(error),
    };

    let written = resp
        .replica_status
        .iter()
        .filter(|ack| ack.success && replicas.contains(&ack.node_id))
        .count();
    let object = format!(
        "{}/{}",
        SEGMENT_BUCKET,
        segment_object_path(&query.id, &query.rend, query.idx)
    );

    let payload = json!({
        "ok": written >= state.write_quorum,
        "written": written,
        "W": state.write_quorum,
        "size": resp.size_committed,
        "sha256": resp.checksum,
        "results": resp.replica_status,
        "object": object,
    });
    let status = if written >= state.write_quorum {
        StatusCode::CREATED
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(payload)).into_response()
}

async fn stream_segment(
    State(state): State<Arc<AppState>>,
    Path((id, rend, idx)): Path<(String, String, u64)>,
) -> Response {
    // The catalog is consulted first; an unknown segment is a 404 even if a
    // stray blob exists on disk.
    if let Err(error) = state
        .metadata
        .get_metadata(&segment_metadata_key(&id, &rend, idx))
        .await
    {
        return error_response(error);
    }

    let locator = SegmentLocator {
        bucket: SEGMENT_BUCKET.to_string(),
        object: segment_object_path(&id, &rend, idx),
    };
    match state.service.get_segment(&locator).await {
        Ok(frames) => {
            let stream = ReceiverStream::new(frames).map_while(|frame| match frame {
                GetSegmentFrame::Chunk(chunk) => Some(Ok::<Bytes, std::io::Error>(chunk)),
                GetSegmentFrame::Eof => None,
            });
            Body::from_stream(stream).into_response()
        }
        Err(error) => error_response(error),
    }
}

async fn put_blob(
    State(state): State<Arc<AppState>>,
    Path((bucket, object)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    match state.blobs.put(&bucket, &object, body).await {
        Ok((size, sha256)) => (
            StatusCode::CREATED,
            Json(json!({
                "size": size,
                "sha256": sha256,
                "bucket": bucket,
                "object": object,
            })),
        )
            .into_response(),
        Err(error) => error_response(error),
    }
}

async fn get_blob(
    State(state): State<Arc<AppState>>,
    Path((bucket, object)): Path<(String, String)>,
) -> Response {
    match state.blobs.get(&bucket, &object).await {
        Ok(file) => Body::from_stream(ReaderStream::new(file)).into_response(),
        Err(error) => error_response(error),
    }
}

async fn admin_upsert_node(
    State(state): State<Arc<AppState>>,
    Json(descriptor): Json<NodeDescriptor>,
) -> Response {
    match state.ring.upsert_node(descriptor).await {
        Ok(version) => Json(json!({ "ring_version": version })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn admin_remove_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.ring.remove_node(&id).await {
        Ok(version) => Json(json!({ "ring_version": version })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn admin_list_nodes(State(state): State<Arc<AppState>>) -> Response {
    Json(state.ring.nodes().await).into_response()
}

async fn admin_rebalance(State(state): State<Arc<AppState>>) -> Response {
    match state.service.rebalance().await {
        Ok(plan) => Json(plan).into_response(),
        Err(error) => error_response(error),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/videos", post(create_video))
        .route("/videos/{id}/segments", post(create_segment))
        .route("/videos/{id}/segments/loc", get(segment_locations))
        .route("/upload", post(upload_segment))
        .route("/v/{id}/{rend}/{idx}", get(stream_segment))
        .route("/blob/{bucket}/{*object}", put(put_blob).get(get_blob))
        .route("/admin/nodes", post(admin_upsert_node).get(admin_list_nodes))
        .route("/admin/nodes/{id}", delete(admin_remove_node))
        .route("/admin/rebalance", get(admin_rebalance))
        .with_state(state)
}

/// Logs every plan an operator could apply, the observe-only executor used
/// by the single-node server.
struct PlanLogger;

#[async_trait]
impl MigrationExecutor for PlanLogger {
    async fn execute_plan(&self, plan: &RebalancePlan) -> Result<()> {
        tracing::info!(
            "rebalance plan {} at ring version {} with {} assignments",
            plan.plan_id,
            plan.ring_version,
            plan.assignments.len()
        );
        Ok(())
    }
}

async fn heartbeat_loop(
    service: Arc<StorageService>,
    node: NodeConfig,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                let req = HeartbeatRequest {
                    node_id: node.node_id.clone(),
                    advertise_address: node.effective_address(),
                    capacity_bytes: node.capacity_bytes,
                    available_bytes: node.available_bytes,
                };
                match service.heartbeat(req).await {
                    Ok(resp) => tracing::debug!(
                        "heartbeat acknowledged at ring version {}",
                        resp.ring_version
                    ),
                    Err(error) => tracing::warn!("heartbeat failed: {}", error),
                }
            }
        }
    }
}

pub async fn run_server(config: Config) -> Result<()> {
    let coord = Arc::new(CoordStore::new());
    let relational = Arc::new(RelationalStore::new());
    let pool = RelationalPool::new(relational);

    let mut ring_config = RingManagerConfig::new(coord.clone());
    ring_config.prefix = config.cluster.cluster_prefix.clone();
    ring_config.virtual_nodes = config.cluster.virtual_nodes;
    let ring = Arc::new(RingManager::new(ring_config).await?);

    let mut metadata_config = MetadataServiceConfig::new(pool, coord.clone());
    metadata_config.key_prefix = config.metadata.key_prefix.clone();
    metadata_config.max_retries = config.metadata.max_retries;
    let metadata = Arc::new(MetadataService::new(metadata_config));

    let blobs = Arc::new(BlobStore::new(&config.node.data_dir)?);
    let segments = Arc::new(CoordSegmentStore::new(
        coord,
        config.cluster.segments_prefix.clone(),
    ));

    let mut service_config =
        StorageServiceConfig::new(config.node.node_id.clone(), ring.clone(), blobs.clone());
    service_config.segments = Some(segments);
    service_config.replication_factor = config.cluster.replication_factor;
    service_config.lease_ttl = config.cluster.lease_ttl();
    let service = Arc::new(StorageService::new(service_config)?);

    let shutdown = CancellationToken::new();

    tokio::spawn(heartbeat_loop(
        service.clone(),
        config.node.clone(),
        config.cluster.lease_ttl() / 3,
        shutdown.clone(),
    ));

    let rebalancer = Rebalancer::new(
        ring.clone(),
        Arc::new(PlanLogger),
        config.cluster.rebalance_deadline(),
    );
    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = rebalancer.run(token).await {
                tracing::error!("rebalancer stopped: {}", error);
            }
        });
    }

    let state = Arc::new(AppState {
        replication_factor: config.cluster.replication_factor,
        write_quorum: config.cluster.write_quorum,
        blobs,
        ring,
        metadata,
        service,
    });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.node.bind_addr.as_str()).await?;
    tracing::info!(
        "node {} listening on {}",
        config.node.node_id,
        config.node.bind_addr
    );

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = serve_shutdown.cancelled() => {},
            }
            serve_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    Ok(())
}
