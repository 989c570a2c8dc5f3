//! Bearer-token extraction for protected routes

use crate::AppState;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use terminus_types::AuthUser;

/// Auth error response
pub struct AuthError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": "unauthorized"
        }));
        (self.status, body).into_response()
    }
}

/// Validate the `Authorization: Bearer` header and return the principal.
pub fn bearer_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
    let auth_header = headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AuthError {
            status: StatusCode::UNAUTHORIZED,
            message: "Missing Authorization header".to_string(),
        })?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| AuthError {
        status: StatusCode::UNAUTHORIZED,
        message: "Invalid Authorization format".to_string(),
    })?;

    state.auth_service.validate_token(token).map_err(|_| AuthError {
        status: StatusCode::UNAUTHORIZED,
        message: "Invalid or expired token".to_string(),
    })
}
