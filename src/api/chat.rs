// Tahlil API — Chat Endpoints
//
// One-shot chat, paginated history, and the WebSocket streaming channel.
// The streaming path shares the orchestrator's prepare step with the
// blocking path, so routing, cache fallback and the NEEDS_INSIGHTS
// sentinel behave identically on both.

use super::{user_id_from, with_user_header, ApiResult};
use crate::atoms::error::EngineError;
use crate::engine::agents;
use crate::engine::orchestrator::{needs_insights_hint, ChatPlan};
use crate::engine::state::EngineState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct ChatBody {
    pub upload_id: String,
    pub query: String,
}

/// POST /api/chat — one-shot question and answer.
pub async fn send(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<ChatBody>,
) -> ApiResult<Response> {
    let user_id = user_id_from(&headers);
    if body.query.trim().is_empty() {
        return Err(EngineError::BadRequest("empty query".into()).into());
    }

    let answer = state.orchestrator.answer_chat(&user_id, &body.upload_id, &body.query).await?;
    Ok(with_user_header(
        &user_id,
        json!({
            "answer": answer.answer,
            "agent_used": answer.agent_used,
            "sources": answer.sources,
        }),
    ))
}

fn default_history_limit() -> usize {
    100
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub upload_id: String,
    #[serde(default = "default_history_limit")]
    pub limit: usize,
    /// Paginate backwards: only messages with id below this.
    pub before: Option<i64>,
}

/// GET /api/chat/history — messages for an upload, oldest first.
pub async fn history(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Response> {
    let user_id = user_id_from(&headers);
    state
        .store
        .get_upload(&user_id, &query.upload_id)?
        .ok_or_else(|| EngineError::WorkspaceNotFound(query.upload_id.clone()))?;

    let limit = query.limit.clamp(1, 500);
    let messages = state.store.chat_history(&query.upload_id, limit, query.before)?;
    Ok(with_user_header(&user_id, json!({ "messages": messages })))
}

// ── WebSocket streaming ────────────────────────────────────────────────────

/// WS /ws/chat/{upload_id} — frames of {query} in, {delta}/{done} out.
pub async fn ws_chat(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    Path(upload_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let user_id = user_id_from(&headers);
    upgrade.on_upgrade(move |socket| ws_session(state, socket, user_id, upload_id))
}

async fn ws_session(state: Arc<EngineState>, mut socket: WebSocket, user_id: String, upload_id: String) {
    info!("[api] ws chat opened for {}", upload_id);

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let query = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(v) => v["query"].as_str().unwrap_or_default().to_string(),
            Err(_) => String::new(),
        };
        if query.is_empty() {
            let _ = send_json(&mut socket, json!({ "error": "frames must be {\"query\": …}" })).await;
            continue;
        }

        if let Err(e) = answer_streaming(&state, &mut socket, &user_id, &upload_id, &query).await {
            warn!("[api] ws chat turn failed: {}", e);
            let _ = send_json(&mut socket, json!({ "error": e.to_string() })).await;
            let _ = send_json(&mut socket, json!({ "done": true })).await;
        }
    }

    info!("[api] ws chat closed for {}", upload_id);
}

async fn answer_streaming(
    state: &Arc<EngineState>,
    socket: &mut WebSocket,
    user_id: &str,
    upload_id: &str,
    query: &str,
) -> Result<(), EngineError> {
    match state.orchestrator.prepare_chat(user_id, upload_id, query).await? {
        ChatPlan::NeedsInsights { agent_name } => {
            let hint = needs_insights_hint();
            send_json(socket, json!({ "delta": hint, "agent_used": agent_name })).await?;
            send_json(socket, json!({ "done": true })).await?;
            state.orchestrator.record_chat_turn(user_id, upload_id, query, &hint, &agent_name)?;
            Ok(())
        }
        ChatPlan::Ready(prepared) => {
            let agent_name = prepared.agent.name().to_string();
            let (mut rx, sources) = agents::run_chat_stream(
                prepared.agent.as_ref(),
                &prepared.ctx,
                query,
                &prepared.retrieval_query,
                prepared.intent_filter.clone(),
                &prepared.cached,
            )
            .await?;

            let mut transcript = String::new();
            while let Some(chunk) = rx.recv().await {
                let delta = chunk?;
                transcript.push_str(&delta);
                send_json(socket, json!({ "delta": delta })).await?;
            }
            send_json(socket, json!({ "done": true, "agent_used": agent_name, "sources": sources }))
                .await?;

            let persisted = agents::strip_think(&transcript);
            state.orchestrator.record_chat_turn(user_id, upload_id, query, &persisted, &agent_name)?;
            Ok(())
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: serde_json::Value) -> Result<(), EngineError> {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .map_err(|e| EngineError::Other(format!("websocket send: {}", e)))
}
