//! HTTP server.
//!
//! Exposes ingestion, the embedding pipeline, hybrid search and chat over a
//! JSON HTTP API. Chat replies stream as Server-Sent Events.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/repositories/{id}/chunks` | Ingest chunks, queue embedding |
//! | `DELETE` | `/repositories/{id}` | Delete a repository's chunks and vectors |
//! | `POST` | `/repositories/{id}/embed` | Queue pending chunks for embedding |
//! | `GET`  | `/pipeline/stats` | Pipeline statistics (`?repository_id=`) |
//! | `POST` | `/search` | Vector, lexical or hybrid search |
//! | `POST`, `GET` | `/sessions` | Create / list chat sessions |
//! | `GET`, `PATCH`, `DELETE` | `/sessions/{id}` | Read / update / delete a session |
//! | `POST` | `/sessions/{id}/messages` | Send a message, stream the reply |
//! | `POST` | `/messages` | Start a new session with a message, stream the reply |
//!
//! Session routes require an `x-user-id` header. Sessions of other users
//! are reported as not found.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "session_conflict", "message": "session ... is still streaming a reply" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `session_conflict` (409),
//! `provider_mismatch` (422), `unavailable` (503), `internal` (500).
//!
//! # Chat stream
//!
//! `POST /sessions/{id}/messages` and `POST /messages` answer with
//! `text/event-stream`. The first `context` event carries the session id,
//! which is how a client learns the id of a session started through
//! `/messages`. Events
//! are named `context`, `delta`, `done` and `error`; each carries the JSON
//! form of a [`ChatEvent`]. Closing the connection cancels generation; the
//! partial reply is kept in the session.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use repo_rag_core::error::RagError;
use repo_rag_core::models::ChatSession;
use repo_rag_core::store::SessionUpdate;

use crate::chat::{ChatEvent, ChatEventStream, NewSession, SendMessage};
use crate::config::Config;
use crate::ingest::{DeleteReport, IngestReport, IngestRequest};
use crate::pipeline::{PipelineStats, QueueOutcome};
use crate::search::{SearchRequest, SearchResponse};
use crate::services::AppServices;

/// Shared application state passed to all route handlers.
type AppState = Arc<AppServices>;

/// Start the HTTP server and the embedding pipeline.
///
/// Runs until Ctrl-C, then drains in-flight requests and stops the
/// pipeline within `pipeline.shutdown_timeout_secs`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Arc::new(AppServices::build(config).await?);
    if config.embedding.is_enabled() {
        services.pipeline.start().await?;
    } else {
        warn!("embedding provider is disabled; search runs lexical-only");
    }

    let bind_addr = config.server.bind.clone();
    let app = router(services.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "server listening");
    println!("repo-rag server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped, draining embedding pipeline");
    services.pipeline.stop().await;
    services.pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Build the router over already-constructed services.
pub fn router(services: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/repositories/{id}", axum::routing::delete(handle_delete_repository))
        .route("/repositories/{id}/chunks", post(handle_ingest))
        .route("/repositories/{id}/embed", post(handle_embed))
        .route("/pipeline/stats", get(handle_stats))
        .route("/search", post(handle_search))
        .route("/sessions", post(handle_create_session).get(handle_list_sessions))
        .route(
            "/sessions/{id}",
            get(handle_get_session)
                .patch(handle_update_session)
                .delete(handle_delete_session),
        )
        .route("/sessions/{id}/messages", post(handle_send_message))
        .route("/messages", post(handle_start_chat))
        .layer(cors)
        .with_state(services)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        match RagError::find(&err) {
            Some(RagError::InvalidInput(_)) => {
                AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
            }
            Some(RagError::NotFound(_)) => AppError::new(StatusCode::NOT_FOUND, "not_found", message),
            Some(RagError::SessionConflict(_)) => {
                AppError::new(StatusCode::CONFLICT, "session_conflict", message)
            }
            Some(RagError::ProviderMismatch(_)) => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "provider_mismatch", message)
            }
            Some(RagError::ProviderUnavailable(_)) | Some(RagError::IndexUnavailable(_)) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
            _ => {
                error!(error = %message, "request failed");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

/// Caller identity from the `x-user-id` header.
pub struct UserId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or_else(|| {
                AppError::new(StatusCode::BAD_REQUEST, "bad_request", "missing x-user-id header")
            })
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    embedding_model: String,
}

async fn handle_health(State(services): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        embedding_model: services.embedding.model_name().to_string(),
    })
}

// ============ Repositories ============

async fn handle_ingest(
    State(services): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestReport>, AppError> {
    Ok(Json(services.ingest.ingest_chunks(&id, req).await?))
}

async fn handle_delete_repository(
    State(services): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteReport>, AppError> {
    Ok(Json(services.ingest.delete_repository(&id).await?))
}

async fn handle_embed(
    State(services): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<QueueOutcome>), AppError> {
    let outcome = services.pipeline.queue_repository(&id).await?;
    let status = match outcome {
        QueueOutcome::Accepted { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

#[derive(Deserialize)]
struct StatsQuery {
    repository_id: Option<String>,
}

async fn handle_stats(
    State(services): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<PipelineStats>, AppError> {
    Ok(Json(services.pipeline.stats(q.repository_id.as_deref()).await?))
}

// ============ POST /search ============

async fn handle_search(
    State(services): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    Ok(Json(services.search.handle(&req).await?))
}

// ============ Sessions ============

#[derive(Serialize)]
struct SessionList {
    sessions: Vec<ChatSession>,
}

async fn handle_create_session(
    State(services): State<AppState>,
    UserId(user): UserId,
    Json(new): Json<NewSession>,
) -> Result<(StatusCode, Json<ChatSession>), AppError> {
    let session = services.chat.create_session(&user, new).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn handle_list_sessions(
    State(services): State<AppState>,
    UserId(user): UserId,
) -> Result<Json<SessionList>, AppError> {
    let sessions = services.chat.list_sessions(&user).await?;
    Ok(Json(SessionList { sessions }))
}

async fn handle_get_session(
    State(services): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<Json<ChatSession>, AppError> {
    Ok(Json(services.chat.get_session(&user, &id).await?))
}

#[derive(Deserialize)]
struct SessionPatch {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    repository_id: Option<String>,
}

async fn handle_update_session(
    State(services): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
    Json(patch): Json<SessionPatch>,
) -> Result<Json<ChatSession>, AppError> {
    let update = SessionUpdate {
        title: patch.title,
        repository_id: patch.repository_id,
    };
    Ok(Json(services.chat.update_session(&user, &id, update).await?))
}

async fn handle_delete_session(
    State(services): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    services.chat.delete_session(&user, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_send_message(
    State(services): State<AppState>,
    UserId(user): UserId,
    Path(id): Path<String>,
    Json(msg): Json<SendMessage>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (_, events) = services.chat.send_message(&user, Some(&id), msg).await?;
    Ok(sse_reply(events))
}

/// Like [`handle_send_message`], creating the session from the message.
async fn handle_start_chat(
    State(services): State<AppState>,
    UserId(user): UserId,
    Json(msg): Json<SendMessage>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (_, events) = services.chat.send_message(&user, None, msg).await?;
    Ok(sse_reply(events))
}

fn sse_reply(events: ChatEventStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = events.map(|ev| Ok(sse_event(&ev)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(ev: &ChatEvent) -> Event {
    let data = serde_json::to_string(ev).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "message": e.to_string(), "partial": false }).to_string()
    });
    Event::default().event(ev.name()).data(data)
}
