//! Thin HTTP surface over the engine facade.
//!
//! Handlers validate nothing beyond their payload shape; every decision
//! (state transitions, capacity, provider availability) is made by the
//! engine and mapped onto status codes here: 400 invalid input, 404
//! unknown session, 409 forbidden transition, 503 missing providers,
//! 500 storage failure.

use crate::analysis::JobRequest;
use crate::engine::Engine;
use crate::errors::{SessionError, StorageError};
use crate::session::manager::ReportState;
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

pub type SharedEngine = Arc<Engine>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::NotFound(_)
            | SessionError::Storage(StorageError::SessionNotFound(_))
            | SessionError::Storage(StorageError::ArtifactNotFound { .. }) => {
                Self::NotFound(message)
            }
            SessionError::InvalidTransition { .. }
            | SessionError::AlreadyRunning(_)
            | SessionError::CapacityExhausted(_) => Self::Conflict(message),
            SessionError::ProvidersUnconfigured => Self::Unavailable(message),
            SessionError::InvalidRequest(_) => Self::BadRequest(message),
            SessionError::Storage(_) => Self::Internal(message),
        }
    }
}

// ── Request payloads ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct ClearRequest {
    #[serde(default)]
    confirm: bool,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/analyze", post(submit_job))
        .route("/sessions", get(list_sessions))
        .route("/sessions/clear", post(clear_sessions))
        .route("/sessions/{id}/status", get(session_status))
        .route("/sessions/{id}/progress", get(session_progress))
        .route("/sessions/{id}/results", get(session_results))
        .route("/sessions/{id}/pause", post(pause_session))
        .route("/sessions/{id}/resume", post(resume_session))
        .route("/sessions/{id}/continue", post(continue_session))
        .route("/sessions/{id}", delete(delete_session))
        .route("/status", get(provider_status))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Bind and serve until the process is stopped.
pub async fn serve(engine: SharedEngine, bind: &str) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "marketscope listening");
    axum::serve(listener, build_router(engine))
        .await
        .context("server error")
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn submit_job(
    State(engine): State<SharedEngine>,
    Json(job): Json<JobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = engine.submit(job)?;
    Ok(Json(json!({"session_id": session_id, "status": "running"})))
}

async fn list_sessions(State(engine): State<SharedEngine>) -> impl IntoResponse {
    let sessions = engine.list_sessions();
    Json(json!({"total": sessions.len(), "sessions": sessions}))
}

async fn session_status(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    engine
        .status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session {id} not found")))
}

async fn session_progress(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if engine.status(&id).is_none() {
        return Err(ApiError::NotFound(format!("session {id} not found")));
    }
    Ok(Json(json!({"session_id": id, "progress": engine.progress(&id)})))
}

async fn session_results(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match engine.get_report(&id) {
        ReportState::Ready(report) => Ok(Json(*report).into_response()),
        ReportState::Pending => {
            Ok(Json(json!({"session_id": id, "status": "pending"})).into_response())
        }
        ReportState::NotFound => Err(ApiError::NotFound(format!("session {id} not found"))),
    }
}

async fn pause_session(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    engine.pause(&id)?;
    Ok(Json(json!({"session_id": id, "status": "pausing"})))
}

async fn resume_session(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    engine.resume(&id)?;
    Ok(Json(json!({"session_id": id, "status": "running"})))
}

async fn continue_session(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    engine.continue_from_persisted(&id)?;
    Ok(Json(json!({"session_id": id, "status": "running"})))
}

async fn delete_session(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    engine.delete_session(&id)?;
    Ok(Json(json!({"session_id": id, "deleted": true})))
}

async fn clear_sessions(
    State(engine): State<SharedEngine>,
    Json(request): Json<ClearRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !request.confirm {
        return Err(ApiError::BadRequest(
            "set \"confirm\": true to delete every session".to_string(),
        ));
    }
    let deleted = engine.clear_sessions();
    Ok(Json(json!({"deleted": deleted})))
}

async fn provider_status(State(engine): State<SharedEngine>) -> impl IntoResponse {
    Json(json!({"providers": engine.provider_snapshot()}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::config::Config;
    use crate::pipeline::component::ComponentRegistry;
    use crate::provider::registry::ProviderRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    fn test_router(dir: &TempDir) -> Router {
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        let engine = Engine::with_parts(
            config,
            Arc::new(ProviderRegistry::new()),
            Arc::new(CheckpointStore::new(dir.path())),
            Arc::new(ComponentRegistry::new()),
        );
        build_router(Arc::new(engine))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn submit_without_providers_returns_503() {
        let dir = TempDir::new().unwrap();
        let response = test_router(&dir)
            .oneshot(post_json("/analyze", r#"{"segment": "fitness"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_session_status_is_404() {
        let dir = TempDir::new().unwrap();
        let response = test_router(&dir)
            .oneshot(
                Request::builder()
                    .uri("/sessions/session_missing/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pause_unknown_session_is_404() {
        let dir = TempDir::new().unwrap();
        let response = test_router(&dir)
            .oneshot(post_json("/sessions/session_missing/pause", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn continue_of_unknown_session_is_404() {
        let dir = TempDir::new().unwrap();
        let response = test_router(&dir)
            .oneshot(post_json("/sessions/session_missing/continue", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn clear_requires_confirmation() {
        let dir = TempDir::new().unwrap();
        let router = test_router(&dir);

        let refused = router
            .clone()
            .oneshot(post_json("/sessions/clear", "{}"))
            .await
            .unwrap();
        assert_eq!(refused.status(), StatusCode::BAD_REQUEST);

        let accepted = router
            .oneshot(post_json("/sessions/clear", r#"{"confirm": true}"#))
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sessions_listing_is_empty_initially() {
        let dir = TempDir::new().unwrap();
        let response = test_router(&dir)
            .oneshot(Request::builder().uri("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["total"], 0);
    }
}
