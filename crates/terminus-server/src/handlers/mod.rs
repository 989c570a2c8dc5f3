//! HTTP and WebSocket handlers

pub mod execute;
pub mod files;
pub mod sessions;
pub mod ws;

use axum::Json;
use serde_json::{json, Value};

/// Liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
