//! WebSocket frame protocol
//!
//! Frames are UTF-8 JSON objects, one per logical message, tagged by
//! `type`. Unknown fields are ignored; unknown `type` values are rejected
//! by the broker with a `BAD_FRAME` error frame.

use serde::{Deserialize, Serialize};

/// Client -> Server frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Raw keystrokes for the interactive shell.
    ShellInput {
        data: String,
    },
    /// Terminal window size change.
    ShellResize {
        cols: u16,
        rows: u16,
    },
    /// One-shot code execution; replied with `code_execution_result`.
    ExecuteCode {
        code: String,
        #[serde(default)]
        input_data: Option<String>,
        #[serde(default)]
        language: Option<String>,
    },
    /// Stage stdin for the next `execute_code`.
    InputData {
        content: String,
    },
    /// The file repository changed out-of-band; trigger a workspace sync.
    FileChange,
    /// Heartbeat.
    Ping {
        timestamp: i64,
    },
}

/// Server -> Client frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Batched PTY output.
    ShellOutput {
        data: String,
    },
    /// The PTY is attached and ready for input.
    ShellConnected,
    /// Non-fatal shell-side failure.
    ShellError {
        error: String,
    },
    /// Result of a one-shot `execute_code`.
    CodeExecutionResult {
        status: ExecutionStatus,
        output: String,
        error: String,
        exit_status: i32,
        duration_ms: u64,
        timed_out: bool,
    },
    /// A file changed on disk relative to the repository.
    FileChange {
        file_path: String,
        kind: FileChangeKind,
    },
    /// A `file_change` sync request completed.
    FileSyncComplete {
        message: String,
    },
    /// Staged stdin was accepted.
    InputDataReceived,
    /// Heartbeat reply; echoes the client timestamp.
    Pong {
        timestamp: i64,
    },
    /// Operational error; the connection stays open.
    Error {
        code: String,
        message: String,
    },
}

/// Outcome classification for `code_execution_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Ok,
    Error,
    Timeout,
}

/// Disk-relative change kind for `file_change` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Created,
    Updated,
    Deleted,
}
