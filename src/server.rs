//! HTTP server exposing the context service.
//!
//! A JSON HTTP API suitable for integration with AI coding agents and
//! editor tooling. Every handler is a thin adapter over one
//! [`ContextService`] operation.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/context/retrieve` | Ranked, profile-filtered retrieval |
//! | `POST` | `/context/ast` | Retrieval enriched with syntax-tree chunks |
//! | `POST` | `/context/comprehensive` | Retrieval + file snapshot + conversation |
//! | `POST` | `/ingest` | Embed and store content chunks |
//! | `POST` | `/files` | Store a file context (write-through) |
//! | `GET`  | `/files/context?path=` | Fetch a cached file context |
//! | `POST` | `/files/changed` | Invalidate all state derived from a file |
//! | `GET`  | `/conversations` | List sessions with a live conversation |
//! | `POST` | `/conversations/{session}` | Append a conversation message |
//! | `GET`  | `/conversations/{session}` | Fetch a conversation history |
//! | `POST` | `/impact` | Change-impact analysis with risk level |
//! | `GET`  | `/architecture` | Architecture overview and cycles |
//! | `GET`  | `/stats` | Cross-layer statistics and health |
//! | `GET`  | `/health` | Liveness check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_query", "message": "query text must not be empty", "recoverable": false } }
//! ```
//!
//! Codes: `invalid_query` (400), `not_found` (404), `embedding_failed`,
//! `vector_store`, `cache`, `graph` (502 when recoverable, 500 otherwise),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser-based agent
//! frontends can call the API directly.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::models::{ChangeType, EmbeddingMetadata, FileContext, Message};
use crate::orchestrator::ContextService;
use crate::retrieval::RetrievalRequest;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    service: Arc<ContextService>,
}

/// Start the HTTP server.
///
/// Binds to `[server].bind` and serves until the process terminates.
pub async fn run_server(config: &MeshConfig) -> anyhow::Result<()> {
    let service = Arc::new(ContextService::from_config(config.clone())?);
    run_server_with_service(config, service).await
}

/// Start the server around an already-assembled service. Used by tests
/// and by embedders wiring custom backends.
pub async fn run_server_with_service(
    config: &MeshConfig,
    service: Arc<ContextService>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = build_router(service);

    info!(bind = %bind_addr, "server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Assemble the router; separated from binding so tests can drive it
/// in-process.
pub fn build_router(service: Arc<ContextService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/context/retrieve", post(handle_retrieve))
        .route("/context/ast", post(handle_retrieve_ast))
        .route("/context/comprehensive", post(handle_comprehensive))
        .route("/ingest", post(handle_ingest))
        .route("/files", post(handle_store_file))
        .route("/files/context", get(handle_get_file))
        .route("/files/changed", post(handle_file_changed))
        .route("/conversations", get(handle_list_conversations))
        .route(
            "/conversations/{session}",
            post(handle_append_conversation).get(handle_get_conversation),
        )
        .route("/impact", post(handle_impact))
        .route("/architecture", get(handle_architecture))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { service })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    recoverable: bool,
}

/// Internal error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    recoverable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                recoverable: self.recoverable,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<MeshError> for AppError {
    fn from(err: MeshError) -> Self {
        let recoverable = err.recoverable();
        let (status, code) = match &err {
            MeshError::InvalidQuery { .. } => (StatusCode::BAD_REQUEST, "invalid_query"),
            MeshError::EmbeddingFailed { .. } => (backend_status(recoverable), "embedding_failed"),
            MeshError::DimensionMismatch { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "dimension_mismatch")
            }
            MeshError::VectorStore { .. } => (backend_status(recoverable), "vector_store"),
            MeshError::Cache { .. } => (StatusCode::BAD_GATEWAY, "cache"),
            MeshError::Graph { .. } => (backend_status(recoverable), "graph"),
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
            recoverable,
        }
    }
}

/// Recoverable backend failures are the upstream's fault.
fn backend_status(recoverable: bool) -> StatusCode {
    if recoverable {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
        recoverable: false,
    }
}

// ============ Request bodies ============

/// Body shared by the three retrieval endpoints.
#[derive(Deserialize)]
struct RetrieveBody {
    query: String,
    agent_type: String,
    #[serde(default)]
    context: Option<serde_json::Value>,
    #[serde(default)]
    max_results: Option<usize>,
    #[serde(default)]
    similarity_threshold: Option<f32>,
    /// Only used by `/context/comprehensive`.
    #[serde(default)]
    file_path: Option<String>,
    /// Only used by `/context/comprehensive`.
    #[serde(default)]
    session_id: Option<String>,
}

impl RetrieveBody {
    fn into_request(self) -> (RetrievalRequest, Option<String>, Option<String>) {
        let request = RetrievalRequest {
            query: self.query,
            agent_type: self.agent_type,
            context: self.context,
            max_results: self.max_results,
            similarity_threshold: self.similarity_threshold,
        };
        (request, self.file_path, self.session_id)
    }
}

#[derive(Deserialize)]
struct IngestBody {
    items: Vec<IngestItem>,
}

#[derive(Deserialize)]
struct IngestItem {
    content: String,
    metadata: EmbeddingMetadata,
}

#[derive(Deserialize)]
struct FileChangedBody {
    file_path: String,
    /// Fresh parse to rebuild from, when the caller has one.
    #[serde(default)]
    context: Option<FileContext>,
}

#[derive(Deserialize)]
struct FileQuery {
    path: String,
}

#[derive(Deserialize)]
struct MessageBody {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ImpactBody {
    file_path: String,
    change_type: ChangeType,
}

// ============ Handlers ============

async fn handle_retrieve(
    State(state): State<AppState>,
    Json(body): Json<RetrieveBody>,
) -> Result<Response, AppError> {
    let (request, _, _) = body.into_request();
    let response = state.service.retrieve_context(&request).await?;
    Ok(Json(response).into_response())
}

async fn handle_retrieve_ast(
    State(state): State<AppState>,
    Json(body): Json<RetrieveBody>,
) -> Result<Response, AppError> {
    let (request, file_path, _) = body.into_request();
    let response = state
        .service
        .context_with_ast(&request, file_path.as_deref())
        .await?;
    Ok(Json(response).into_response())
}

async fn handle_comprehensive(
    State(state): State<AppState>,
    Json(body): Json<RetrieveBody>,
) -> Result<Response, AppError> {
    let (request, file_path, session_id) = body.into_request();
    let response = state
        .service
        .comprehensive_context(&request, file_path.as_deref(), session_id.as_deref())
        .await?;
    Ok(Json(response).into_response())
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(body): Json<IngestBody>,
) -> Result<Response, AppError> {
    let items = body
        .items
        .into_iter()
        .map(|item| (item.content, item.metadata))
        .collect();
    let stored = state.service.ingest(items).await?;
    Ok(Json(serde_json::json!({ "stored": stored })).into_response())
}

async fn handle_store_file(
    State(state): State<AppState>,
    Json(context): Json<FileContext>,
) -> Result<Response, AppError> {
    state.service.store_file_context(&context).await?;
    Ok(Json(serde_json::json!({ "stored": context.file_path })).into_response())
}

async fn handle_get_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Response, AppError> {
    match state.service.get_file_context(&query.path).await? {
        Some(context) => Ok(Json(context).into_response()),
        None => Err(not_found(format!("no cached context for {}", query.path))),
    }
}

async fn handle_file_changed(
    State(state): State<AppState>,
    Json(body): Json<FileChangedBody>,
) -> Result<Response, AppError> {
    state
        .service
        .on_file_change(&body.file_path, body.context.as_ref())
        .await?;
    Ok(Json(serde_json::json!({ "invalidated": body.file_path })).into_response())
}

async fn handle_append_conversation(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Json(body): Json<MessageBody>,
) -> Result<Response, AppError> {
    let message = Message {
        role: body.role,
        content: body.content,
        timestamp: Utc::now(),
    };
    let history = state.service.store_conversation(&session, message).await?;
    Ok(Json(history).into_response())
}

async fn handle_list_conversations(State(state): State<AppState>) -> Result<Response, AppError> {
    let sessions = state.service.active_sessions().await?;
    Ok(Json(serde_json::json!({ "sessions": sessions })).into_response())
}

async fn handle_get_conversation(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Response, AppError> {
    match state.service.get_conversation_history(&session).await? {
        Some(history) => Ok(Json(history).into_response()),
        None => Err(not_found(format!("no conversation for session {session}"))),
    }
}

async fn handle_impact(
    State(state): State<AppState>,
    Json(body): Json<ImpactBody>,
) -> Result<Response, AppError> {
    let report = state
        .service
        .analyze_change_impact(&body.file_path, body.change_type)
        .await?;
    Ok(Json(report).into_response())
}

async fn handle_architecture(State(state): State<AppState>) -> Result<Response, AppError> {
    let insights = state.service.architecture_insights().await?;
    Ok(Json(insights).into_response())
}

async fn handle_stats(State(state): State<AppState>) -> Result<Response, AppError> {
    let stats = state.service.system_stats().await?;
    Ok(Json(stats).into_response())
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
