//! HTTP adapter over the answer pipeline.
//!
//! A thin JSON API for chat front ends. It holds one [`AnswerOrchestrator`]
//! for the process; sessions are keyed by the `session_id` the client sends.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | `{query, session_id?}` → orchestrated [`Answer`] |
//! | `POST` | `/search` | `{query, limit?, category?}` → ranked chunks, no generation |
//! | `GET`  | `/health` | Health check (returns version and collection) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "backend_unavailable", "message": "..." } }
//! ```
//!
//! | Code | Status | Cause |
//! |------|--------|-------|
//! | `bad_request` | 400 | empty query, bad filter |
//! | `backend_unavailable` | 503 | embedding or LLM backend failed after retries |
//! | `timeout` | 504 | a backend call exceeded its timeout |
//! | `index_corrupt` | 500 | stored vectors unusable, rebuild required |
//! | `internal` | 500 | anything else |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser chat widget
//! can call the API directly.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use catalog_rag_core::models::ScoredChunk;
use catalog_rag_core::RagError;

use crate::answer::{Answer, AnswerOrchestrator};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::llm::create_generator;
use crate::search::search;
use crate::sqlite_store::SqliteIndex;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    orchestrator: Arc<AnswerOrchestrator>,
}

/// Build the router for an already-assembled orchestrator.
pub fn router(config: Arc<Config>, orchestrator: Arc<AnswerOrchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ask", post(handle_ask))
        .route("/search", post(handle_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState {
            config,
            orchestrator,
        })
}

/// `catalog serve`: bind `[server].bind` and serve until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let embedder = create_embedder(&config.embedding)?;
    let generator = create_generator(&config.llm)?;
    let index = SqliteIndex::open(config).await?;
    let orchestrator = AnswerOrchestrator::new(config, embedder, Arc::new(index), generator);

    let bind_addr = config.server.bind.clone();
    let app = router(Arc::new(config.clone()), Arc::new(orchestrator));

    info!(bind = %bind_addr, collection = %config.index.collection, "server starting");
    println!("Catalog server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
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
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let (status, code) = match &err {
            RagError::BackendTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            e if e.is_backend_failure() => (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable"),
            RagError::InvalidFilter(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            RagError::IndexCorruption(_) => (StatusCode::INTERNAL_SERVER_ERROR, "index_corrupt"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    collection: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        collection: state.config.index.collection.clone(),
    })
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    query: String,
    /// A new session is started when absent.
    #[serde(default)]
    session_id: Option<String>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<Answer>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let session_id = req
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let answer = state.orchestrator.ask(&req.query, &session_id).await?;
    Ok(Json(answer))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<ScoredChunk>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let result = search(
        &state.config,
        state.orchestrator.retriever(),
        &req.query,
        req.limit,
        req.category,
    )
    .await?;
    Ok(Json(SearchResponse {
        results: result.hits,
    }))
}
