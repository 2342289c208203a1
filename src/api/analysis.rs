// Tahlil API — Analysis Endpoints
//
// The full insights run (blocking: the response carries every agent's
// result, and each result was durable the moment its agent finished) and
// the saved-results read used by dashboards and by clients deciding
// whether chat is ready.

use super::{user_id_from, with_user_header, ApiResult};
use crate::engine::state::EngineState;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct RunRequest {
    pub upload_id: String,
}

/// POST /api/analysis/full — run the whole agent panel for a workspace.
pub async fn run_full(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<RunRequest>,
) -> ApiResult<Response> {
    let user_id = user_id_from(&headers);
    let results = state.orchestrator.run_full_insights(&user_id, &body.upload_id).await?;
    Ok(with_user_header(&user_id, json!(results)))
}

#[derive(Deserialize)]
pub struct ResultsQuery {
    pub upload_id: String,
}

/// GET /api/analysis/results — latest saved per-agent results.
pub async fn results(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<Response> {
    let user_id = user_id_from(&headers);
    let results = state.orchestrator.saved_results(&user_id, &query.upload_id)?;
    Ok(with_user_header(
        &user_id,
        json!({ "has_results": !results.is_empty(), "results": results }),
    ))
}
