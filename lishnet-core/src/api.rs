//! REST API for datasets, networks and downloads

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::builder::BuildError;
use crate::chunker::DEFAULT_CHUNK_SIZE;
use crate::digest::ChecksumAlgorithm;
use crate::manifest::{ExportOptions, Manifest};
use crate::netconfig::{NetConfigError, NetworkDefinition};
use crate::networks::NetworkError;
use crate::node::{ImportOptions, LishNode, NodeError};
use crate::store::{SortBy, SortOrder, StoreError};
use crate::transfer::{ManifestSource, TransferError};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub peer_id: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    sort_by: Option<SortBy>,
    order: Option<SortOrder>,
}

#[derive(Debug, Default, Deserialize)]
struct ExportQuery {
    #[serde(default)]
    minify: bool,
    #[serde(default)]
    compress: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportDatasetRequest {
    path: PathBuf,
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    chunk_size: Option<u64>,
    algorithm: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    network_id: String,
    manifest_path: Option<PathBuf>,
    manifest: Option<Manifest>,
}

/// Create the REST API router
pub fn create_router(node: LishNode) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/node", get(node_info))
        .route("/api/v1/events", get(events))
        .route("/api/v1/datasets", get(list_datasets).post(import_dataset))
        .route(
            "/api/v1/datasets/:id",
            get(get_dataset).delete(delete_dataset),
        )
        .route("/api/v1/datasets/:id/manifest", get(export_manifest))
        .route("/api/v1/networks", get(list_networks).post(import_network))
        .route(
            "/api/v1/networks/:id",
            get(get_network).delete(delete_network),
        )
        .route("/api/v1/networks/:id/export", get(export_network))
        .route("/api/v1/networks/:id/enabled", post(set_network_enabled))
        .route("/api/v1/networks/:id/connect", post(connect_peer))
        .route("/api/v1/networks/:id/status", get(network_status))
        .route("/api/v1/networks/:id/peers", get(network_peers))
        .route("/api/v1/networks/:id/peers/:peer", get(find_peer))
        .route("/api/v1/networks/:id/addresses", get(network_addresses))
        .route("/api/v1/downloads", get(list_downloads).post(start_download))
        .route("/api/v1/downloads/:id", delete(cancel_download))
        .with_state(node)
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint
async fn health_check(State(node): State<LishNode>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        peer_id: node.peer_id().to_string(),
    })
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(node): State<LishNode>) -> Result<Response, ApiError> {
    let metrics = node.metrics_text().await?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics,
    )
        .into_response())
}

async fn node_info(State(node): State<LishNode>) -> impl IntoResponse {
    Json(node.node_info().await)
}

/// `download:*` events as Server-Sent Events
async fn events(
    State(node): State<LishNode>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures::stream::unfold(node.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    let sse = Event::default().event(event.name()).data(data);
                    return Some((Ok::<_, Infallible>(sse), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn list_datasets(
    State(node): State<LishNode>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let datasets = node
        .datasets(
            query.sort_by.unwrap_or_default(),
            query.order.unwrap_or_default(),
        )
        .await?;
    Ok(Json(datasets))
}

/// Import data already on this node's disk (POST /api/v1/datasets)
async fn import_dataset(
    State(node): State<LishNode>,
    Json(req): Json<ImportDatasetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let algorithm = match req.algorithm.as_deref() {
        Some(name) => name
            .parse::<ChecksumAlgorithm>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => ChecksumAlgorithm::default(),
    };
    info!("API: importing {}", req.path.display());
    let manifest = node
        .import_local(
            &req.path,
            ImportOptions {
                chunk_size: req.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
                algorithm,
                id: req.id,
                name: req.name,
                description: req.description,
            },
        )
        .await?;
    let detail = node.dataset(&manifest.id).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn get_dataset(
    State(node): State<LishNode>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(node.dataset(&id).await?))
}

async fn delete_dataset(
    State(node): State<LishNode>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if node.remove_dataset(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Dataset not found: {}", id)))
    }
}

async fn export_manifest(
    State(node): State<LishNode>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let bytes = node
        .export_manifest(
            &id,
            ExportOptions {
                minify: query.minify,
                compress: query.compress,
            },
        )
        .await?;
    let content_type = if query.compress {
        "application/zstd"
    } else {
        "application/json"
    };
    Ok((StatusCode::OK, [("content-type", content_type)], bytes).into_response())
}

async fn list_networks(State(node): State<LishNode>) -> impl IntoResponse {
    Json(node.networks().list().await)
}

async fn import_network(
    State(node): State<LishNode>,
    Json(definition): Json<NetworkDefinition>,
) -> Result<impl IntoResponse, ApiError> {
    let info = node.networks().import(definition).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn get_network(
    State(node): State<LishNode>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(node.networks().get(&id).await?))
}

async fn delete_network(
    State(node): State<LishNode>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if node.networks().delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Network not found: {}", id)))
    }
}

/// Shareable definition, without the local enabled flag
async fn export_network(
    State(node): State<LishNode>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(node.networks().export(&id).await?))
}

async fn set_network_enabled(
    State(node): State<LishNode>,
    Path(id): Path<String>,
    Json(req): Json<EnabledRequest>,
) -> Result<impl IntoResponse, ApiError> {
    node.networks().set_enabled(&id, req.enabled).await?;
    Ok(Json(node.networks().get(&id).await?))
}

async fn connect_peer(
    State(node): State<LishNode>,
    Path(id): Path<String>,
    Json(req): Json<ConnectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let peer = node.networks().connect(&id, &req.address).await?;
    Ok(Json(serde_json::json!({ "peerId": peer.to_string() })))
}

async fn network_status(
    State(node): State<LishNode>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(node.networks().status(&id).await?))
}

async fn network_peers(
    State(node): State<LishNode>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(node.networks().peers(&id).await?))
}

async fn find_peer(
    State(node): State<LishNode>,
    Path((id, peer)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(node.networks().find_peer(&id, &peer).await?))
}

async fn network_addresses(
    State(node): State<LishNode>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(node.networks().addresses(&id).await?))
}

async fn list_downloads(State(node): State<LishNode>) -> impl IntoResponse {
    Json(node.transfers().await)
}

/// Start a download (POST /api/v1/downloads)
async fn start_download(
    State(node): State<LishNode>,
    Json(req): Json<DownloadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let source = match (req.manifest, req.manifest_path) {
        (Some(manifest), _) => ManifestSource::Manifest(manifest),
        (None, Some(path)) => ManifestSource::Path(path),
        (None, None) => {
            return Err(ApiError::BadRequest(
                "manifest or manifestPath is required".to_string(),
            ))
        }
    };
    let handle = node.download(&req.network_id, source).await?;
    info!(
        "API: download of {} started on {}",
        handle.dataset_id(),
        handle.network_id()
    );
    Ok((StatusCode::ACCEPTED, Json(handle.status())))
}

async fn cancel_download(
    State(node): State<LishNode>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if node.cancel_transfer(&id).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::NotFound(format!("No active download: {}", id)))
    }
}

/// API error type
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

fn network_status_code(e: &NetworkError) -> StatusCode {
    match e {
        NetworkError::NotFound(_) => StatusCode::NOT_FOUND,
        NetworkError::NotEnabled(_) => StatusCode::CONFLICT,
        NetworkError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        NetworkError::Config(e) => netconfig_status_code(e),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn netconfig_status_code(e: &NetConfigError) -> StatusCode {
    match e {
        NetConfigError::InvalidDefinition(_) | NetConfigError::InvalidKey(_) => {
            StatusCode::BAD_REQUEST
        }
        NetConfigError::NotFound(_) => StatusCode::NOT_FOUND,
        NetConfigError::AlreadyExists(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn node_status_code(e: &NodeError) -> StatusCode {
    match e {
        NodeError::DatasetNotFound(_) | NodeError::Store(StoreError::DatasetNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        NodeError::Store(StoreError::InvalidManifest(_)) | NodeError::Manifest(_) => {
            StatusCode::BAD_REQUEST
        }
        NodeError::Build(BuildError::ThreadPool(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        NodeError::Build(_) => StatusCode::BAD_REQUEST,
        NodeError::NetConfig(e) => netconfig_status_code(e),
        NodeError::Network(e) => network_status_code(e),
        NodeError::Transfer(TransferError::Manifest(_)) => StatusCode::BAD_REQUEST,
        NodeError::Transfer(TransferError::Network(e)) => network_status_code(e),
        NodeError::Transfer(TransferError::AlreadyActive(_)) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        let message = e.to_string();
        match node_status_code(&e) {
            StatusCode::BAD_REQUEST => ApiError::BadRequest(message),
            StatusCode::NOT_FOUND => ApiError::NotFound(message),
            StatusCode::CONFLICT => ApiError::Conflict(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl From<NetworkError> for ApiError {
    fn from(e: NetworkError) -> Self {
        NodeError::Network(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                error!("API error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}
