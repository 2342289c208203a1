// Tahlil API — HTTP Boundary
//
// Thin axum layer over the engine: extract identity and inputs, call the
// orchestrator or the store, map EngineError onto the stable status
// contract. Heavy logic lives in crate::engine; these modules never
// reach around the orchestrator.
//
// Identity: every request carries an X-User-ID header. A missing header
// means "new anonymous user": an id is minted server-side and returned
// in the response's X-User-ID header for the client to persist. There is
// no authentication layer; all processing stays on the local machine.

pub mod analysis;
pub mod chat;
pub mod data;
pub mod upload;

use crate::atoms::error::EngineError;
use crate::engine::state::EngineState;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub const USER_ID_HEADER: &str = "x-user-id";

pub fn build_router(state: Arc<EngineState>) -> Router {
    let body_limit = state.config.max_file_size_bytes() as usize;
    Router::new()
        .route("/api/health", get(health))
        .route("/api/upload", post(upload::submit).get(upload::list))
        .route("/api/upload/:id/status", get(upload::status))
        .route("/api/upload/:id", delete(upload::remove))
        .route("/api/transactions", get(data::transactions))
        .route("/api/financial/statements", get(data::statement))
        .route("/api/analysis/full", post(analysis::run_full))
        .route("/api/analysis/results", get(analysis::results))
        .route("/api/chat", post(chat::send))
        .route("/api/chat/history", get(chat::history))
        .route("/ws/chat/:upload_id", get(chat::ws_chat))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<Arc<EngineState>>,
) -> Json<serde_json::Value> {
    let runtime_reachable = state.backend.list_models().await.is_ok();
    Json(json!({ "status": "ok", "runtime_reachable": runtime_reachable }))
}

// ── Identity ───────────────────────────────────────────────────────────────

/// The caller's user id, minted fresh for anonymous requests.
pub fn user_id_from(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("anon-{}", uuid::Uuid::new_v4()))
}

/// Wrap a JSON body so the (possibly minted) user id rides back on the
/// response for the client to persist.
pub fn with_user_header(user_id: &str, body: serde_json::Value) -> Response {
    let mut response = Json(body).into_response();
    if let Ok(value) = user_id.parse() {
        response.headers_mut().insert(USER_ID_HEADER, value);
    }
    response
}

// ── Error mapping ──────────────────────────────────────────────────────────

/// EngineError → HTTP status, per the stable contract. Bodies are short
/// actionable strings; no stack traces, no model names, no identifiers
/// beyond the upload_id.
pub fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::WorkspaceNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::WorkspaceBusy(_) => StatusCode::CONFLICT,
        EngineError::IngestionParseFailed(_) | EngineError::RetrievalEmpty => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        // NeedsInsights is normally answered in-band with a 200 hint;
        // if it escapes as an error it is still not a server fault.
        EngineError::NeedsInsights => StatusCode::OK,
        EngineError::LlmUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::LlmTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error wrapper implementing IntoResponse; handlers return
/// `ApiResult<Response>`.
pub struct ApiError(pub EngineError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            log::error!("[api] {}", self.0);
        }
        let mut response = (status, Json(json!({ "error": self.0.to_string() }))).into_response();
        if let EngineError::LlmUnavailable(_) = self.0 {
            if let Ok(value) = "5".parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&EngineError::BadRequest("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&EngineError::WorkspaceNotFound("u".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_for(&EngineError::WorkspaceBusy("u".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&EngineError::IngestionParseFailed("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&EngineError::LlmUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&EngineError::LlmTimeout { seconds: 30 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&EngineError::Other("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_user_id_minted_when_header_missing() {
        let headers = HeaderMap::new();
        let id = user_id_from(&headers);
        assert!(id.starts_with("anon-"));

        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, "user-7".parse().unwrap());
        assert_eq!(user_id_from(&headers), "user-7");
    }
}
