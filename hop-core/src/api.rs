//! REST API for block operations and node management

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::content_id::parse_cid_str;
use crate::exchange::{Exchange, ExchangeError};
use crate::metrics::Metrics;
use crate::storage::Block;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub exchange: Arc<Exchange>,
    pub metrics: Metrics,
}

/// Response for storing a block
#[derive(Serialize, Deserialize)]
pub struct StoreBlockResponse {
    pub cid: String,
    pub size: usize,
}

/// Response for retrieving a block
#[derive(Serialize, Deserialize)]
pub struct GetBlockResponse {
    pub cid: String,
    pub data: String, // base64-encoded
    pub size: usize,
}

#[derive(Serialize, Deserialize)]
pub struct ProvidersResponse {
    pub cid: String,
    pub providers: Vec<String>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub online: bool,
    pub block_count: usize,
    pub total_bytes: usize,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Create the REST API router
pub fn create_router(exchange: Arc<Exchange>, metrics: Metrics) -> Router {
    let state = ApiState { exchange, metrics };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/blocks", post(store_block))
        .route("/api/v1/blocks/:cid", get(get_block))
        .route("/api/v1/providers/:cid", get(get_providers))
        .route("/api/v1/peer-id", get(peer_id_endpoint))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint
async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.exchange.blockstore().stats().await;

    Json(HealthResponse {
        status: "ok".to_string(),
        online: state.exchange.is_online(),
        block_count: stats.block_count,
        total_bytes: stats.total_size,
    })
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.exchange.blockstore().stats().await;
    let provider_entries = state.exchange.supply().registry().len();

    let metrics = state
        .metrics
        .to_prometheus(stats.block_count, stats.total_size, provider_entries);

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics,
    )
}

/// Store a block and announce it to peers (POST /api/v1/blocks)
async fn store_block(
    State(state): State<ApiState>,
    body: bytes::Bytes,
) -> Result<Json<StoreBlockResponse>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("Empty block data".to_string()));
    }

    info!("API: Storing block ({} bytes)", body.len());

    let block = Block::new(body.to_vec())
        .map_err(|e| ApiError::Internal(format!("Failed to create block: {}", e)))?;
    let size = block.size();

    let cid = state.exchange.has_block(block).await?;

    info!("API: Stored and announced block {} ({} bytes)", cid, size);

    Ok(Json(StoreBlockResponse {
        cid: cid.to_string(),
        size,
    }))
}

/// Retrieve a block, fetching it from a provider if needed
/// (GET /api/v1/blocks/:cid)
async fn get_block(
    State(state): State<ApiState>,
    Path(cid_str): Path<String>,
) -> Result<Json<GetBlockResponse>, ApiError> {
    info!("API: Retrieving block {}", cid_str);

    let cid = parse_cid_str(&cid_str)
        .map_err(|e| ApiError::BadRequest(format!("Invalid CID: {}", e)))?;

    let block = state.exchange.get_block(&cid).await?;

    Ok(Json(GetBlockResponse {
        cid: cid_str,
        data: base64::prelude::BASE64_STANDARD.encode(&block.data),
        size: block.size(),
    }))
}

/// Known providers of a block (GET /api/v1/providers/:cid)
async fn get_providers(
    State(state): State<ApiState>,
    Path(cid_str): Path<String>,
) -> Result<Json<ProvidersResponse>, ApiError> {
    let cid = parse_cid_str(&cid_str)
        .map_err(|e| ApiError::BadRequest(format!("Invalid CID: {}", e)))?;

    let providers = state
        .exchange
        .supply()
        .provider_peers_for_content(&cid)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    Ok(Json(ProvidersResponse {
        cid: cid_str,
        providers: providers.iter().map(|p| p.to_string()).collect(),
    }))
}

/// Peer ID endpoint (GET /api/v1/peer-id)
async fn peer_id_endpoint(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.exchange.local_peer_id().to_string())
}

/// API error type
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<ExchangeError> for ApiError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::NotFoundAnywhere(cid) | ExchangeError::NotFoundLocally(cid) => {
                ApiError::NotFound(cid.to_string())
            }
            ExchangeError::InvalidIdentifier(e) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(cid) => (StatusCode::NOT_FOUND, format!("Block not found: {}", cid)),
            ApiError::Internal(msg) => {
                error!("API error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memnet::MockNet;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    async fn test_router() -> (Router, Arc<Exchange>) {
        let net = MockNet::new();
        let node = Arc::new(net.add_memory_node());
        let metrics = Metrics::new();
        let exchange = Exchange::builder()
            .with_blockstore(node.store())
            .with_host(node.clone())
            .with_transfer(node)
            .with_metrics(metrics.clone())
            .build()
            .await
            .unwrap();
        let exchange = Arc::new(exchange);

        (create_router(Arc::clone(&exchange), metrics), exchange)
    }

    async fn body_bytes(response: Response) -> bytes::Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _exchange) = test_router().await;

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_store_and_get_block() {
        let (app, _exchange) = test_router().await;

        let test_data = b"Hello, REST API!";
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/blocks")
            .header("content-type", "application/octet-stream")
            .body(Body::from(test_data.to_vec()))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let store_response: StoreBlockResponse =
            serde_json::from_slice(&body_bytes(response).await).unwrap();

        let request = Request::builder()
            .uri(format!("/api/v1/blocks/{}", store_response.cid))
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let get_block_response: GetBlockResponse =
            serde_json::from_slice(&body_bytes(response).await).unwrap();

        let decoded_data = base64::prelude::BASE64_STANDARD
            .decode(&get_block_response.data)
            .unwrap();
        assert_eq!(decoded_data, test_data);
    }

    #[tokio::test]
    async fn test_get_nonexistent_block() {
        let (app, _exchange) = test_router().await;
        let absent = crate::content_id::content_cid(b"never stored").unwrap();

        let request = Request::builder()
            .uri(format!("/api/v1/blocks/{}", absent))
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_cid_is_bad_request() {
        let (app, _exchange) = test_router().await;

        let request = Request::builder()
            .uri("/api/v1/providers/not-a-cid")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_providers_and_metrics() {
        let (app, exchange) = test_router().await;
        let block = Block::new(b"provided".to_vec()).unwrap();
        exchange.has_block(block.clone()).await.unwrap();

        let request = Request::builder()
            .uri(format!("/api/v1/providers/{}", block.cid))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let providers: ProvidersResponse =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(providers.providers.is_empty());

        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(text.contains("hop_block_count 1"));
        assert!(text.contains("hop_announcements_total 1"));
    }
}
