//! HTTP code execution endpoint (the editor's "Run code" button)
//!
//! One-shot execution in the session's workspace; shares nothing with the
//! interactive shell. Results are bounded by the engine's output cap and
//! deadline.

use crate::extractors::bearer_user;
use crate::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use terminus_core::ExecutionJob;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub session_id: i64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub input_data: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub output: String,
    pub error: String,
    pub exit_status: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

pub async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, StatusCode> {
    let user = bearer_user(&state, &headers).map_err(|e| e.status)?;

    let session = match state.db.fetch_session(req.session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(session_id = req.session_id, %e, "session lookup failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    if !user.can_access_session(session.user_id) {
        return Err(StatusCode::FORBIDDEN);
    }

    // The shell may not be live; the run only needs the directory.
    let cwd = match state.workspace.materialize(req.session_id).await {
        Ok(cwd) => cwd,
        Err(e) => {
            tracing::error!(session_id = req.session_id, %e, "workspace materialize failed");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let job = ExecutionJob {
        language: req.language.unwrap_or_else(|| "python".to_string()),
        code: req.code,
        stdin: req.input_data,
        cwd,
        deadline: None,
    };

    match state.engine.execute(job).await {
        Ok(result) => Ok(Json(ExecuteResponse {
            output: result.stdout,
            error: result.stderr,
            exit_status: result.exit_status,
            duration_ms: result.duration_ms,
            timed_out: result.timed_out,
        })),
        Err(terminus_core::Error::Execution(message)) => Ok(Json(ExecuteResponse {
            output: String::new(),
            error: message,
            exit_status: -1,
            duration_ms: 0,
            timed_out: false,
        })),
        Err(e) => {
            tracing::error!(session_id = req.session_id, %e, "execution failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
