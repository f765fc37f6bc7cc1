//! HTTP intake for motion samples.
//!
//! This module provides an HTTP server that:
//! - Accepts one sample or an array of samples via POST /samples
//! - Queues them on the running [`Engine`] without blocking
//! - Reports engine counters via GET /stats
//!
//! # Architecture
//!
//! ```text
//! Wearable gateway ──→ POST /samples ──→ Engine shards ──→ SinkWriter ──→ store
//! ```

use crate::engine::{Engine, EngineError};
use crate::feed::MotionSample;
use crate::telemetry::StatsSnapshot;
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

/// Shared server state
pub struct ServerState {
    engine: Arc<Engine>,
}

/// Body of POST /samples.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SampleBatch {
    Many(Vec<MotionSample>),
    One(Box<MotionSample>),
}

impl SampleBatch {
    fn into_vec(self) -> Vec<MotionSample> {
        match self {
            SampleBatch::Many(samples) => samples,
            SampleBatch::One(sample) => vec![*sample],
        }
    }
}

/// Response from the samples endpoint
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub status: String,
    pub accepted: usize,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Samples queued before the failure
    pub accepted: usize,
}

/// GET /health
async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let status = if state.engine.is_running() { "ok" } else { "stopping" };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /samples
///
/// Samples are validated by the engine itself; malformed ones are counted
/// and dropped there, so the response only reflects queueing.
async fn ingest(
    State(state): State<Arc<ServerState>>,
    Json(batch): Json<SampleBatch>,
) -> Result<Json<IngestResponse>, (StatusCode, Json<ErrorResponse>)> {
    let mut accepted = 0;
    for sample in batch.into_vec() {
        if let Err(e) = state.engine.try_submit(sample) {
            tracing::warn!(accepted, "Rejecting samples: {}", e);
            let code = match e {
                EngineError::Busy => "BUSY",
                EngineError::Stopped => "STOPPED",
            };
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.to_string(),
                    code: code.to_string(),
                    accepted,
                }),
            ));
        }
        accepted += 1;
    }

    Ok(Json(IngestResponse {
        status: "ok".to_string(),
        accepted,
    }))
}

/// GET /stats
async fn stats(State(state): State<Arc<ServerState>>) -> Json<StatsSnapshot> {
    Json(state.engine.stats())
}

/// Build the router for an engine.
pub fn router(engine: Arc<Engine>) -> Router {
    let state = Arc::new(ServerState { engine });

    Router::new()
        .route("/health", get(health))
        .route("/samples", post(ingest))
        .route("/stats", get(stats))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    engine: Arc<Engine>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(engine);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Motion risk intake listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
