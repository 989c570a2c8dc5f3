//! Session file handlers
//!
//! The file repository surface the editor talks to. Writes and deletes go
//! through the workspace manager so rows and disk never diverge; plain
//! listing reads straight from the repository.

use crate::extractors::bearer_user;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use terminus_core::store::FileStore;
use terminus_core::Error;
use terminus_types::CodeFile;

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    files: Vec<CodeFile>,
}

#[derive(Debug, Serialize)]
pub struct FileResponse {
    file: CodeFile,
}

#[derive(Debug, Serialize)]
pub struct FileContentResponse {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileRequest {
    content: String,
}

/// Bearer auth + session ownership for every file route.
async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    session_id: i64,
) -> Result<(), StatusCode> {
    let user = bearer_user(state, headers).map_err(|e| e.status)?;
    match state.db.fetch_session(session_id).await {
        Ok(Some(session)) => {
            if user.can_access_session(session.user_id) {
                Ok(())
            } else {
                Err(StatusCode::FORBIDDEN)
            }
        }
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(session_id, %e, "session lookup failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn logical_path(raw: &str) -> String {
    format!("/{}", raw.trim_start_matches('/'))
}

fn map_core_error(e: Error) -> StatusCode {
    match e {
        Error::Path(_) => StatusCode::BAD_REQUEST,
        Error::Workspace(message) if message.contains("No such file") => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn list(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<FileListResponse>, StatusCode> {
    authorize(&state, &headers, session_id).await?;

    match state.db.list_files(session_id).await {
        Ok(files) => Ok(Json(FileListResponse { files })),
        Err(e) => {
            tracing::error!(session_id, %e, "failed to list files");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn read(
    State(state): State<AppState>,
    Path((session_id, path)): Path<(i64, String)>,
    headers: HeaderMap,
) -> Result<Json<FileContentResponse>, StatusCode> {
    authorize(&state, &headers, session_id).await?;
    let path = logical_path(&path);

    // Prefer the repository row; fall back to disk for files the shell
    // created that have not been synced yet.
    match state.db.get_file(session_id, &path).await {
        Ok(Some(file)) => Ok(Json(FileContentResponse {
            path: file.path,
            content: file.content,
        })),
        Ok(None) => match state.workspace.read_file(session_id, &path).await {
            Ok(content) => Ok(Json(FileContentResponse { path, content })),
            Err(Error::Workspace(_)) => Err(StatusCode::NOT_FOUND),
            Err(e) => Err(map_core_error(e)),
        },
        Err(e) => {
            tracing::error!(session_id, %e, "failed to read file");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn write(
    State(state): State<AppState>,
    Path((session_id, path)): Path<(i64, String)>,
    headers: HeaderMap,
    Json(req): Json<WriteFileRequest>,
) -> Result<Json<FileResponse>, StatusCode> {
    authorize(&state, &headers, session_id).await?;
    let path = logical_path(&path);

    // Transient disk failures get one retry; the manager itself never
    // retries.
    let first = state.workspace.write_file(session_id, &path, &req.content).await;
    let result = match first {
        Err(Error::Workspace(e)) => {
            tracing::warn!(session_id, path = %path, %e, "file write failed, retrying once");
            state.workspace.write_file(session_id, &path, &req.content).await
        }
        other => other,
    };

    match result {
        Ok(file) => Ok(Json(FileResponse { file })),
        Err(e) => {
            tracing::warn!(session_id, path = %path, %e, "failed to write file");
            Err(map_core_error(e))
        }
    }
}

pub async fn delete(
    State(state): State<AppState>,
    Path((session_id, path)): Path<(i64, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    authorize(&state, &headers, session_id).await?;
    let path = logical_path(&path);

    match state.workspace.delete_file(session_id, &path).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            tracing::warn!(session_id, path = %path, %e, "failed to delete file");
            Err(map_core_error(e))
        }
    }
}
