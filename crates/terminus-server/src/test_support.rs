//! Shared fixtures for handler tests

use crate::services::AuthService;
use crate::storage::Database;
use crate::AppState;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use terminus_core::{Config, ExecutionEngine, SessionRegistry, WorkspaceManager};

pub const JWT_SECRET: &str = "test-secret";

/// Full application state over an in-memory database, with workspaces
/// under the given temp dir and `/bin/sh` as the session shell.
pub async fn app_state(temp: &tempfile::TempDir) -> AppState {
    let config = Arc::new(Config {
        workspace_root: temp.path().to_path_buf(),
        shell: "/bin/sh".to_string(),
        shell_args: vec![],
        ..Config::default()
    });
    let db = Arc::new(Database::in_memory().await.unwrap());
    let workspace = Arc::new(WorkspaceManager::new(config.clone(), db.clone()));
    let registry = Arc::new(SessionRegistry::new(config.clone(), workspace.clone()).unwrap());
    let engine = Arc::new(ExecutionEngine::new(config.clone()));
    let auth_service = Arc::new(AuthService::new(JWT_SECRET.to_string()));

    AppState {
        db,
        registry,
        workspace,
        engine,
        auth_service,
        config,
    }
}

/// Bearer token the external auth service would have issued.
pub fn mint_token(user_id: i64, role: &str) -> String {
    #[derive(Serialize)]
    struct Claims {
        sub: String,
        role: String,
        exp: i64,
        iat: i64,
    }
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        role: role.to_string(),
        exp: now + 3600,
        iat: now,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

/// The production router over the given state.
pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .nest("/api", crate::api_routes())
        .with_state(state)
}

/// Serve the router on an ephemeral local port.
pub async fn serve(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}
