//! Core configuration
//!
//! Every tunable of the terminal subsystem in one place. The server binary
//! overlays environment variables on top of these defaults.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root under which per-session workspaces are materialized.
    pub workspace_root: PathBuf,
    /// Login shell spawned for each session.
    pub shell: String,
    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,
    /// Python interpreter used by the execution engine.
    pub python_bin: String,
    /// Initial PTY size.
    pub pty_cols: u16,
    pub pty_rows: u16,
    /// Maximum bytes handed out per `PtyReader::read` call.
    pub read_chunk_max: usize,
    /// One-shot execution deadline.
    pub execution_deadline: Duration,
    /// SIGTERM -> SIGKILL grace for timed-out executions.
    pub execution_kill_grace: Duration,
    /// Per-stream capture cap for one-shot executions.
    pub output_cap: usize,
    /// SIGTERM -> SIGKILL grace when killing a PTY.
    pub pty_kill_grace: Duration,
    /// How long DRAINING may last before output is discarded.
    pub pty_drain_deadline: Duration,
    /// Expected client heartbeat interval.
    pub ping_interval: Duration,
    /// Quiescent sessions older than this are reaped.
    pub idle_session_ttl: Duration,
    /// How often the reaper scans for quiescent sessions.
    pub reaper_interval: Duration,
    /// Bound of the per-connection outbound frame queue.
    pub outbound_queue_frames: usize,
    /// `shell_output` aggregation window.
    pub output_batch_window: Duration,
    /// `shell_output` aggregation size cap.
    pub output_batch_bytes: usize,
    /// Budget for a full workspace scan.
    pub workspace_sync_max: Duration,
    /// Prompt substring rewritten in shell output.
    pub prompt_pattern: String,
    /// Replacement for the matched prompt.
    pub prompt_replacement: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/tmp/terminus_workspace"),
            shell: "bash".to_string(),
            shell_args: vec!["-l".to_string()],
            python_bin: "python3".to_string(),
            pty_cols: 80,
            pty_rows: 24,
            read_chunk_max: 64 * 1024,
            execution_deadline: Duration::from_secs(10),
            execution_kill_grace: Duration::from_millis(500),
            output_cap: 1024 * 1024,
            pty_kill_grace: Duration::from_secs(2),
            pty_drain_deadline: Duration::from_secs(3),
            ping_interval: Duration::from_secs(30),
            idle_session_ttl: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(60),
            outbound_queue_frames: 1024,
            output_batch_window: Duration::from_millis(16),
            output_batch_bytes: 4 * 1024,
            workspace_sync_max: Duration::from_secs(2),
            prompt_pattern: r"[A-Za-z0-9_-]+@[A-Za-z0-9_-]+:~#\s".to_string(),
            prompt_replacement: "terminuside:~# ".to_string(),
        }
    }
}
