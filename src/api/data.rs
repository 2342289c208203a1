// Tahlil API — Parsed-Data Endpoints
//
// Paginated transactions and the parsed financial statement for a
// completed workspace.

use super::{user_id_from, with_user_header, ApiResult};
use crate::atoms::error::EngineError;
use crate::atoms::types::UploadStatus;
use crate::engine::state::EngineState;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

fn default_limit() -> usize {
    50
}

#[derive(Deserialize)]
pub struct TransactionsQuery {
    pub upload_id: String,
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn require_completed(
    state: &EngineState,
    user_id: &str,
    upload_id: &str,
) -> Result<(), EngineError> {
    let upload = state
        .store
        .get_upload(user_id, upload_id)?
        .ok_or_else(|| EngineError::WorkspaceNotFound(upload_id.to_string()))?;
    match upload.status {
        UploadStatus::Completed => Ok(()),
        UploadStatus::Failed => Err(EngineError::IngestionParseFailed(
            "this workspace failed to ingest".into(),
        )),
        _ => Err(EngineError::WorkspaceBusy(upload_id.to_string())),
    }
}

/// GET /api/transactions?upload_id=…&page=…&limit=…
pub async fn transactions(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    Query(query): Query<TransactionsQuery>,
) -> ApiResult<Response> {
    let user_id = user_id_from(&headers);
    require_completed(&state, &user_id, &query.upload_id)?;

    let limit = query.limit.clamp(1, 500);
    let (transactions, total) = state.store.get_transactions(&query.upload_id, query.page, limit)?;
    Ok(with_user_header(&user_id, json!({ "transactions": transactions, "total": total })))
}

#[derive(Deserialize)]
pub struct StatementQuery {
    pub upload_id: String,
}

/// GET /api/financial/statements?upload_id=…
pub async fn statement(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    Query(query): Query<StatementQuery>,
) -> ApiResult<Response> {
    let user_id = user_id_from(&headers);
    require_completed(&state, &user_id, &query.upload_id)?;

    let statement = state.store.get_statement(&query.upload_id)?.ok_or_else(|| {
        EngineError::IngestionParseFailed(
            "this workspace holds transactions, not a financial statement".into(),
        )
    })?;
    Ok(with_user_header(&user_id, serde_json::to_value(statement).map_err(EngineError::from)?))
}
