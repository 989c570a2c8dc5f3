//! Session handlers
//!
//! Minimal CRUD surface over the session rows. Deleting a session tears
//! down its live PTY, cascades its CodeFiles, and removes the workspace
//! directory from disk.

use crate::extractors::bearer_user;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use terminus_types::Session;

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    sessions: Vec<Session>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    session: Session,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionListResponse>, StatusCode> {
    let user = bearer_user(&state, &headers).map_err(|e| e.status)?;

    match state.db.list_sessions(user.user_id).await {
        Ok(sessions) => Ok(Json(SessionListResponse { sessions })),
        Err(e) => {
            tracing::error!(%e, "failed to list sessions");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionResponse>, StatusCode> {
    let user = bearer_user(&state, &headers).map_err(|e| e.status)?;

    match state
        .db
        .create_session(user.user_id, &req.name, req.description.as_deref())
        .await
    {
        Ok(session) => {
            tracing::info!(session_id = session.id, user_id = user.user_id, "session created");
            Ok(Json(SessionResponse { session }))
        }
        Err(e) => {
            tracing::error!(%e, "failed to create session");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>, StatusCode> {
    let user = bearer_user(&state, &headers).map_err(|e| e.status)?;

    match state.db.fetch_session(id).await {
        Ok(Some(session)) => {
            if !user.can_access_session(session.user_id) {
                return Err(StatusCode::FORBIDDEN);
            }
            Ok(Json(SessionResponse { session }))
        }
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(session_id = id, %e, "failed to get session");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    let user = bearer_user(&state, &headers).map_err(|e| e.status)?;

    match state.db.fetch_session(id).await {
        Ok(Some(session)) => {
            if !user.can_access_session(session.user_id) {
                return Err(StatusCode::FORBIDDEN);
            }
        }
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(session_id = id, %e, "failed to get session");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    // Kill the live shell first so nothing writes into the tree while the
    // workspace is being removed.
    if let Err(e) = state.registry.destroy(id).await {
        tracing::warn!(session_id = id, %e, "failed to destroy live session");
    }
    if let Err(e) = state.workspace.remove_workspace(id).await {
        tracing::warn!(session_id = id, %e, "failed to remove workspace");
    }

    match state.db.delete_session(id).await {
        Ok(()) => {
            tracing::info!(session_id = id, "session deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => {
            tracing::error!(session_id = id, %e, "failed to delete session");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{app_state, mint_token, router};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn crud_round_trip_over_http() {
        let temp = tempfile::tempdir().unwrap();
        let app = router(app_state(&temp).await);
        let token = mint_token(1, "user");

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/sessions",
                Some(&token),
                Some(r#"{"name":"algo-practice","description":"warmups"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = json_body(response).await;
        let id = created["session"]["id"].as_i64().unwrap();
        assert_eq!(created["session"]["name"], "algo-practice");

        let response = app
            .clone()
            .oneshot(request("GET", "/api/sessions", Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["sessions"].as_array().unwrap().len(), 1);

        let uri = format!("/api/sessions/{}", id);
        let response = app
            .clone()
            .oneshot(request("GET", &uri, Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request("DELETE", &uri, Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(request("GET", &uri, Some(&token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ownership_is_enforced_per_role() {
        let temp = tempfile::tempdir().unwrap();
        let state = app_state(&temp).await;
        let session = state.db.create_session(2, "owned", None).await.unwrap();
        let app = router(state);
        let uri = format!("/api/sessions/{}", session.id);

        let response = app
            .clone()
            .oneshot(request("GET", &uri, None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let intruder = mint_token(1, "user");
        let response = app
            .clone()
            .oneshot(request("GET", &uri, Some(&intruder), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let admin = mint_token(3, "admin");
        let response = app
            .oneshot(request("GET", &uri, Some(&admin), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
