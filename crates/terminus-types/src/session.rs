//! Session and file models mirroring the relational store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-owned logical workspace plus its interactive shell lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// A logical file belonging to a session.
///
/// `path` is absolute within the session root and `/`-separated; `name` is
/// always the last path segment. `(session_id, path)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeFile {
    pub id: i64,
    pub session_id: i64,
    pub path: String,
    pub name: String,
    pub content: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodeFile {
    /// Derive the file name and type tag from a logical path.
    pub fn name_and_type(path: &str) -> (String, String) {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let file_type = match name.rsplit('.').next() {
            Some("py") => "python",
            Some("md") => "markdown",
            Some("json") => "json",
            _ => "text",
        }
        .to_string();
        (name, file_type)
    }
}

/// Result of a disk -> repository synchronization pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Completed one-shot execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
}
