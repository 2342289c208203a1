// Tahlil API — Upload Endpoints
//
// Submit (multipart), list, status polling, and workspace deletion.
// Ingestion itself runs as a background task; clients poll
// /api/upload/{id}/status until `completed` or `failed`.

use super::{user_id_from, with_user_header, ApiError, ApiResult};
use crate::atoms::error::EngineError;
use crate::atoms::types::{Upload, UploadStatus};
use crate::engine::ingest;
use crate::engine::state::EngineState;
use axum::extract::{Multipart, Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use log::{error, info};
use serde_json::json;
use std::sync::Arc;

/// POST /api/upload — multipart file field, returns {upload_id, status}.
pub async fn submit(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let user_id = user_id_from(&headers);

    let mut filename = None;
    let mut bytes = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EngineError::BadRequest(format!("malformed multipart body: {}", e)))?
    {
        if field.name() == Some("file") || filename.is_none() {
            filename = field.file_name().map(str::to_string).or(filename);
            bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| EngineError::BadRequest(format!("unreadable file field: {}", e)))?,
            );
        }
    }

    let filename =
        filename.ok_or_else(|| EngineError::BadRequest("no file in upload".to_string()))?;
    let bytes = bytes.ok_or_else(|| EngineError::BadRequest("empty upload".to_string()))?;

    if bytes.len() as u64 > state.config.max_file_size_bytes() {
        return Err(ApiError(EngineError::BadRequest(format!(
            "file exceeds the {} MB limit",
            state.config.max_file_size_mb
        ))));
    }
    let supported = [".csv", ".xls", ".xlsx", ".pdf"];
    let lower = filename.to_lowercase();
    if !supported.iter().any(|ext| lower.ends_with(ext)) {
        return Err(ApiError(EngineError::BadRequest(
            "unsupported file type — upload CSV, Excel or PDF".to_string(),
        )));
    }

    let upload_id = format!("upload_{}", uuid::Uuid::new_v4().simple());
    let stored_path = ingest::stored_file_path(&state.config.uploads_dir(), &upload_id, &filename);
    tokio::fs::write(&stored_path, &bytes).await.map_err(EngineError::Io)?;

    state.store.create_upload(&Upload {
        upload_id: upload_id.clone(),
        user_id: user_id.clone(),
        filename: filename.clone(),
        document_type: None,
        status: UploadStatus::Uploading,
        created_at: Utc::now(),
        summary_metadata: serde_json::Map::new(),
    })?;

    info!("[api] upload {} received ({}, {} bytes)", upload_id, filename, bytes.len());

    // Ingestion is long (vision PDFs especially); run it off-request and
    // let the client poll.
    {
        let state = state.clone();
        let upload_id = upload_id.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            if let Err(e) =
                state.ingest.ingest(&user_id, &upload_id, &stored_path, &filename).await
            {
                error!("[api] background ingestion of {} failed: {}", upload_id, e);
            }
        });
    }

    Ok(with_user_header(
        &user_id,
        json!({ "upload_id": upload_id, "status": UploadStatus::Processing }),
    ))
}

/// GET /api/upload — the current user's workspaces.
pub async fn list(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let user_id = user_id_from(&headers);
    let uploads = state.store.list_uploads(&user_id)?;
    Ok(with_user_header(&user_id, json!({ "uploads": uploads })))
}

/// GET /api/upload/{id}/status — ingestion progress for polling.
pub async fn status(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    Path(upload_id): Path<String>,
) -> ApiResult<Response> {
    let user_id = user_id_from(&headers);
    let upload = state
        .store
        .get_upload(&user_id, &upload_id)?
        .ok_or_else(|| EngineError::WorkspaceNotFound(upload_id.clone()))?;

    Ok(with_user_header(
        &user_id,
        json!({
            "status": upload.status,
            "document_type": upload.document_type,
            "summary_metadata": upload.summary_metadata,
        }),
    ))
}

/// DELETE /api/upload/{id} — cascading workspace deletion.
pub async fn remove(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    Path(upload_id): Path<String>,
) -> ApiResult<Response> {
    let user_id = user_id_from(&headers);
    state.orchestrator.delete_workspace(&user_id, &upload_id)?;
    Ok(with_user_header(&user_id, json!({ "deleted": true })))
}
