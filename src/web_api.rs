//! Web API Server
//!
//! HTTP surface of the decoder. Every handler is a thin adapter over
//! [`RequestPipeline`], [`HistoryCache`] and the provider chain.
//!
//! ## Endpoints
//!
//! - `POST /predict` — Classify an uploaded EEG file (raw body)
//! - `GET  /predict/{request_id}/image` — Image produced after a prediction
//! - `POST /dream-image/generate` — Generate an image from an analysis
//! - `POST /dream-image/test` — Generate an image from a built-in analysis
//! - `GET  /dream-image/health` — Which image providers are configured
//! - `GET  /history` — Recent predictions (cached)
//! - `GET  /history/recent` — Built-in sample history
//! - `GET  /health` — Health check
//! - `GET  /metrics` — Prometheus metrics
//! - `GET  /`, `GET /docs`, `GET /openapi.json` — Banner and OpenAPI document
//!
//! ## Middleware (outermost first)
//!
//! CORS, HTTP trace spans, request id, access log (`X-Process-Time`),
//! body size (413), admission (429).

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, DefaultBodyLimit, Path, State},
    http::{header, HeaderValue, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::{retry_after_secs, Admission};
use crate::artifacts::GeneratedImage;
use crate::compute::BandPowers;
use crate::config::ServerConfig;
use crate::history::{sample_dreams, HistoryCache, HistoryEntry};
use crate::metrics;
use crate::pipeline::{DreamImageRequest, PredictResponse, RequestPipeline};
use crate::providers::Artifact;
use crate::DecoderError;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Wall-clock handling time in seconds, set on every response.
const PROCESS_TIME_HEADER: &str = "x-process-time";

/// Longest client-supplied request id that is echoed back.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Identity used when the peer address is not available.
const UNKNOWN_CLIENT: &str = "unknown";

// ============================================================================
// State
// ============================================================================

/// Shared application state available to all handlers.
pub struct AppState {
    /// Prediction pipeline, including the admission gate.
    pub pipeline: RequestPipeline,
    /// Cached history listing.
    pub history: Arc<HistoryCache>,
    /// Listener and body-limit settings.
    pub server: ServerConfig,
}

impl AppState {
    /// Bundle the components the router needs.
    pub fn new(pipeline: RequestPipeline, history: Arc<HistoryCache>, server: ServerConfig) -> Self {
        Self {
            pipeline,
            history,
            server,
        }
    }
}

/// Id assigned by the request-id middleware, available to handlers as an
/// extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

// ============================================================================
// Server
// ============================================================================

/// Build the router with all routes and middleware attached.
pub fn build_router(state: Arc<AppState>) -> Router {
    let max_request_size = state.server.max_request_size;

    Router::new()
        .route("/", get(root_handler))
        .route("/predict", post(predict_handler))
        .route("/predict/:request_id/image", get(prediction_image_handler))
        .route("/dream-image/generate", post(generate_image_handler))
        .route("/dream-image/test", post(test_image_handler))
        .route("/dream-image/health", get(image_health_handler))
        .route("/history", get(history_handler))
        .route("/history/recent", get(recent_history_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/docs", get(schema_handler))
        .route("/openapi.json", get(schema_handler))
        .fallback(not_found_handler)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware,
        ))
        .layer(DefaultBodyLimit::max(max_request_size))
        .layer(middleware::from_fn_with_state(
            max_request_size,
            body_size_middleware,
        ))
        .layer(middleware::from_fn(access_log_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `router` on an already bound `listener` until `shutdown` resolves.
///
/// Peer addresses are captured so admission can key on the client IP.
///
/// # Errors
///
/// Returns [`DecoderError::Io`] if the server fails.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<(), DecoderError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Bind `state.server.host:port` and serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`DecoderError::Io`] if the address cannot be bound or the server
/// fails.
pub async fn start_server<F>(state: Arc<AppState>, shutdown: F) -> Result<(), DecoderError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.server.host, state.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "web API listening");
    serve(listener, build_router(state), shutdown).await
}

// ============================================================================
// Middleware
// ============================================================================

/// Adds an `X-Request-ID` header to every response and exposes it to
/// handlers as a [`RequestId`] extension.
///
/// A client-supplied id of at most [`MAX_REQUEST_ID_LEN`] visible ASCII
/// characters is preserved; otherwise a UUID v4 is generated. The id only
/// correlates logs; predictions are keyed by a server-minted id.
async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= MAX_REQUEST_ID_LEN)
        .filter(|s| s.bytes().all(|b| b.is_ascii_graphic()))
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(request_id.clone()));
    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Logs method, path, status and duration of every request and sets
/// `X-Process-Time` (seconds).
async fn access_log_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|RequestId(id)| id.clone())
        .unwrap_or_default();

    let mut response = next.run(req).await;

    let elapsed = start.elapsed();
    let status = response.status();
    let duration_ms = elapsed.as_secs_f64() * 1000.0;
    if status.is_client_error() || status.is_server_error() {
        warn!(%method, %path, status = status.as_u16(), duration_ms, request_id = %request_id, "request failed");
    } else {
        info!(%method, %path, status = status.as_u16(), duration_ms, request_id = %request_id, "request completed");
    }

    if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", elapsed.as_secs_f64())) {
        response.headers_mut().insert(PROCESS_TIME_HEADER, value);
    }
    response
}

/// Rejects requests whose `Content-Length` exceeds `max_size` with 413.
async fn body_size_middleware(
    State(max_size): State<usize>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(content_length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
    {
        if content_length > max_size {
            return AppError::PayloadTooLarge { max_size }.into_response();
        }
    }

    next.run(req).await
}

/// Counts the request against the client's window.
///
/// Bypass paths and a disabled gate pass straight through. Admitted
/// responses carry `X-RateLimit-Limit` and `X-RateLimit-Remaining`.
async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let gate = state.pipeline.gate();
    if !gate.is_enabled() || gate.is_exempt(req.uri().path()) {
        return next.run(req).await;
    }

    let identity = client_identity(&req);
    match gate.admit(&identity, Instant::now()) {
        Admission::Rejected { retry_after } => {
            metrics::inc_admission_rejected();
            let retry_after_secs = retry_after_secs(retry_after);
            info!(identity = %identity, retry_after_secs, path = %req.uri().path(), "request rejected by admission");
            AppError::RateLimited {
                limit: gate.capacity(),
                retry_after_secs,
            }
            .into_response()
        }
        Admission::Allowed { limit, remaining } => {
            let mut response = next.run(req).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            response
        }
    }
}

/// Client IP from the connection, or `"unknown"` when the server was not
/// started with connect info.
fn client_identity(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

// ============================================================================
// Prediction
// ============================================================================

/// `POST /predict` — Classify the uploaded file contents.
///
/// Parse and compute failures degrade to fallback data; this handler
/// always answers 200 once admitted.
async fn predict_handler(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Json<PredictResponse> {
    let identity = peer
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
    let outcome = state
        .pipeline
        .process_from(&identity, &request_id, body.to_vec())
        .await;
    Json(outcome.response)
}

/// `GET /predict/{request_id}/image` — Image from the background task.
async fn prediction_image_handler(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<Json<DreamImageResponse>, AppError> {
    state
        .pipeline
        .artifacts()
        .get(&request_id)
        .map(|image| Json(DreamImageResponse::from(image)))
        .ok_or(AppError::ImageNotReady(request_id))
}

// ============================================================================
// Dream images
// ============================================================================

/// Body of every dream image response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DreamImageResponse {
    /// Always true; provider failures end at the placeholder.
    pub success: bool,
    /// Set when the provider returned a hosted URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Set when the image is an inline data URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    /// Prompt sent to the provider.
    pub prompt: String,
    /// Readable interpretation.
    pub interpretation: String,
    /// Provider that produced the image.
    pub provider: String,
}

impl From<GeneratedImage> for DreamImageResponse {
    fn from(image: GeneratedImage) -> Self {
        let (image_url, image_base64) = match image.artifact {
            Artifact::Url(url) => (Some(url), None),
            Artifact::DataUri(data) => (None, Some(data)),
        };
        Self {
            success: true,
            image_url,
            image_base64,
            prompt: image.prompt,
            interpretation: image.interpretation,
            provider: image.provider,
        }
    }
}

/// `POST /dream-image/generate`
async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DreamImageRequest>,
) -> Json<DreamImageResponse> {
    let image = state.pipeline.generate_image(&request).await;
    info!(provider = %image.provider, dream_type = %request.dream_type, "dream image generated");
    Json(image.into())
}

/// `POST /dream-image/test` — Same as generate, with the default analysis.
async fn test_image_handler(State(state): State<Arc<AppState>>) -> Json<DreamImageResponse> {
    let request = DreamImageRequest {
        dream_type: "Lucid Dream".to_string(),
        confidence: 85.7,
        bands: BandPowers::DEFAULT_RESULT,
        probabilities: Some(serde_json::json!({
            "Lucid Dream": 85.7,
            "Nightmare": 8.3,
            "Memory Recall": 4.2,
            "Normal Sleep": 1.8,
        })),
    };
    Json(state.pipeline.generate_image(&request).await.into())
}

/// `GET /dream-image/health`
async fn image_health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let providers: serde_json::Map<String, serde_json::Value> = state
        .pipeline
        .providers()
        .availability()
        .into_iter()
        .map(|p| (p.name, serde_json::Value::Bool(p.configured)))
        .collect();

    Json(serde_json::json!({
        "status": "healthy",
        "service": "Dream Image Generation",
        "version": env!("CARGO_PKG_VERSION"),
        "timeout_ms": state.pipeline.providers().timeout().as_millis() as u64,
        "providers": providers,
    }))
}

// ============================================================================
// History
// ============================================================================

/// `GET /history`
async fn history_handler(State(state): State<Arc<AppState>>) -> Json<Vec<HistoryEntry>> {
    Json(state.history.get().await)
}

/// `GET /history/recent`
async fn recent_history_handler() -> Json<Vec<HistoryEntry>> {
    Json(sample_dreams())
}

// ============================================================================
// Utility Handlers
// ============================================================================

/// `GET /` — Service banner.
async fn root_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Welcome to Dream Decoder API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "docs": "/docs",
            "health": "/health",
            "predict": "/predict",
            "dream_image": "/dream-image/generate",
            "history": "/history",
            "metrics": "/metrics",
        },
    }))
}

/// `GET /health` — `ok` while the offload pool runs, `degraded` otherwise.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let pipeline = &state.pipeline;
    let scheduler = pipeline.scheduler();
    let running = scheduler.is_running();
    if !running {
        warn!("health check: offload pool is not running");
    }

    Json(serde_json::json!({
        "status": if running { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "offload": {
            "workers": scheduler.workers(),
            "alive_workers": scheduler.alive_workers(),
            "queued": scheduler.queued(),
            "busy": scheduler.busy(),
            "completed": scheduler.completed(),
            "failed": scheduler.failed(),
        },
        "background": pipeline.background().stats(),
        "rate_limit": {
            "enabled": pipeline.gate().is_enabled(),
            "tracked_identities": pipeline.gate().tracked_identities(),
        },
        "history": state.history.stats(),
        "requests": metrics::get_metrics_summary(),
    }))
}

/// `GET /metrics` — Prometheus metrics.
async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

/// `GET /docs` and `GET /openapi.json`
async fn schema_handler() -> (
    StatusCode,
    [(header::HeaderName, &'static str); 1],
    &'static str,
) {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        OPENAPI_SCHEMA,
    )
}

async fn not_found_handler(uri: Uri) -> AppError {
    AppError::RouteNotFound(uri.path().to_string())
}

// ============================================================================
// OpenAPI Schema
// ============================================================================

/// Static OpenAPI 3.0 specification.
const OPENAPI_SCHEMA: &str = r##"{
  "openapi": "3.0.0",
  "info": {
    "title": "dream-decoder",
    "version": "0.1.0",
    "description": "EEG dream classification with rate limiting and image generation"
  },
  "paths": {
    "/predict": {
      "post": {
        "summary": "Classify an uploaded EEG file",
        "requestBody": {
          "required": true,
          "content": { "application/octet-stream": { "schema": { "type": "string", "format": "binary" } } }
        },
        "responses": {
          "200": { "description": "Prediction (fallback data when degraded)" },
          "413": { "description": "Body too large" },
          "429": { "description": "Rate limit exceeded" }
        }
      }
    },
    "/predict/{request_id}/image": {
      "get": {
        "summary": "Image generated after a prediction",
        "parameters": [{ "name": "request_id", "in": "path", "required": true, "schema": { "type": "string" } }],
        "responses": {
          "200": { "description": "Image ready" },
          "404": { "description": "Not ready or unknown id" }
        }
      }
    },
    "/dream-image/generate": {
      "post": {
        "summary": "Generate a dream image from an analysis",
        "requestBody": {
          "required": true,
          "content": {
            "application/json": {
              "schema": {
                "type": "object",
                "required": ["dream_type", "confidence", "bands"],
                "properties": {
                  "dream_type": { "type": "string" },
                  "confidence": { "type": "number" },
                  "bands": {
                    "type": "object",
                    "properties": {
                      "delta": { "type": "number" },
                      "theta": { "type": "number" },
                      "alpha": { "type": "number" },
                      "beta": { "type": "number" }
                    }
                  },
                  "probabilities": { "type": "object" }
                }
              }
            }
          }
        },
        "responses": { "200": { "description": "Image from the first provider that succeeded" } }
      }
    },
    "/dream-image/test": {
      "post": { "summary": "Generate an image from a built-in analysis", "responses": { "200": { "description": "Image" } } }
    },
    "/dream-image/health": {
      "get": { "summary": "Configured image providers", "responses": { "200": { "description": "Provider map" } } }
    },
    "/history": {
      "get": { "summary": "Recent predictions", "responses": { "200": { "description": "History entries" } } }
    },
    "/history/recent": {
      "get": { "summary": "Sample history", "responses": { "200": { "description": "History entries" } } }
    },
    "/health": {
      "get": { "summary": "Health check", "responses": { "200": { "description": "ok or degraded" } } }
    },
    "/metrics": {
      "get": { "summary": "Prometheus metrics", "responses": { "200": { "description": "Text exposition format" } } }
    },
    "/openapi.json": {
      "get": { "summary": "This document", "responses": { "200": { "description": "OpenAPI 3.0 JSON" } } }
    }
  }
}"##;

// ============================================================================
// Error Type
// ============================================================================

/// Application-level errors returned by API handlers and middleware.
///
/// Each variant maps to an HTTP status code and a JSON error body.
#[derive(Debug)]
pub enum AppError {
    /// The client is over its admission quota.
    RateLimited {
        /// Window capacity.
        limit: usize,
        /// Seconds until a slot frees up.
        retry_after_secs: u64,
    },
    /// `Content-Length` is over the configured maximum.
    PayloadTooLarge {
        /// Largest accepted body in bytes.
        max_size: usize,
    },
    /// No image stored for this request id yet.
    ImageNotReady(String),
    /// No route matched.
    RouteNotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::RateLimited {
                limit,
                retry_after_secs,
            } => {
                let body = serde_json::json!({
                    "error": format!("Rate limit exceeded. Maximum {limit} requests per window."),
                    "retry_after": retry_after_secs,
                });
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            AppError::PayloadTooLarge { max_size } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({
                    "error": "Request body too large",
                    "max_size": max_size,
                })),
            )
                .into_response(),
            AppError::ImageNotReady(request_id) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "Image not ready",
                    "request_id": request_id,
                })),
            )
                .into_response(),
            AppError::RouteNotFound(path) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "success": false,
                    "message": "Endpoint not found",
                    "path": path,
                    "suggestion": "Check /docs for available endpoints",
                })),
            )
                .into_response(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
