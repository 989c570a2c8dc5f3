//! Terminus Server
//!
//! Backend of the browser-based Python IDE: per-session PTY supervision
//! behind a WebSocket terminal stream, on-demand code execution, and the
//! workspace/file surface, over an embedded SQLite repository.

mod extractors;
mod handlers;
mod services;
mod storage;
#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use terminus_core::{Config, ExecutionEngine, SessionRegistry, WorkspaceManager};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use services::AuthService;
use storage::Database;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub registry: Arc<SessionRegistry>,
    pub workspace: Arc<WorkspaceManager>,
    pub engine: Arc<ExecutionEngine>,
    pub auth_service: Arc<AuthService>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Terminus Server v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run_server().await {
        error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_server() -> Result<()> {
    let settings = load_settings().context("Failed to load configuration")?;
    info!(
        "Config loaded: bind={}, db={}, workspace_root={}",
        settings.bind_address,
        settings.database_path,
        settings.core.workspace_root.display()
    );

    let config = Arc::new(settings.core);

    let db = Arc::new(
        Database::new(&settings.database_path)
            .await
            .context("Failed to initialize database")?,
    );

    let workspace = Arc::new(WorkspaceManager::new(config.clone(), db.clone()));
    let registry = Arc::new(
        SessionRegistry::new(config.clone(), workspace.clone())
            .context("Failed to initialize session registry")?,
    );
    let engine = Arc::new(ExecutionEngine::new(config.clone()));
    let auth_service = Arc::new(AuthService::new(settings.jwt_secret));

    let shutdown = CancellationToken::new();
    let reaper = registry.spawn_reaper(shutdown.clone());

    let state = AppState {
        db,
        registry,
        workspace,
        engine,
        auth_service,
        config,
    };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = settings
        .bind_address
        .parse()
        .context("Failed to parse bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = reaper.await;
    Ok(())
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/terminal/ws/:session_id", get(handlers::ws::handler))
        .route("/terminal/code/execute", post(handlers::execute::execute))
        .route(
            "/sessions",
            get(handlers::sessions::list).post(handlers::sessions::create),
        )
        .route(
            "/sessions/:id",
            get(handlers::sessions::get).delete(handlers::sessions::delete),
        )
        .route("/sessions/:id/files", get(handlers::files::list))
        .route(
            "/sessions/:id/files/*path",
            get(handlers::files::read)
                .put(handlers::files::write)
                .delete(handlers::files::delete),
        )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
    shutdown.cancel();
}

struct Settings {
    bind_address: String,
    database_path: String,
    jwt_secret: String,
    core: Config,
}

fn load_settings() -> Result<Settings> {
    let data_dir = std::env::var("TERMINUS_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/opt/terminus/data"));

    let database_path = std::env::var("TERMINUS_DATABASE_PATH").unwrap_or_else(|_| {
        data_dir.join("terminus.db").to_string_lossy().to_string()
    });

    let bind_address =
        std::env::var("TERMINUS_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8700".to_string());

    let jwt_secret = std::env::var("TERMINUS_JWT_SECRET").unwrap_or_else(|_| {
        warn!("TERMINUS_JWT_SECRET not set, using default (insecure for production)");
        "change-me-in-production".to_string()
    });

    let mut core = Config::default();
    if let Ok(root) = std::env::var("TERMINUS_WORKSPACE_ROOT") {
        core.workspace_root = PathBuf::from(root);
    }
    if let Ok(shell) = std::env::var("TERMINUS_SHELL") {
        core.shell = shell;
    }
    if let Some(secs) = env_secs("TERMINUS_EXECUTION_DEADLINE_SECS")? {
        core.execution_deadline = secs;
    }
    if let Some(secs) = env_secs("TERMINUS_IDLE_SESSION_TTL_SECS")? {
        core.idle_session_ttl = secs;
    }
    if let Some(secs) = env_secs("TERMINUS_PING_INTERVAL_SECS")? {
        core.ping_interval = secs;
    }

    Ok(Settings {
        bind_address,
        database_path,
        jwt_secret,
        core,
    })
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => {
            let secs: u64 = value
                .parse()
                .with_context(|| format!("{} must be an integer number of seconds", name))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}
