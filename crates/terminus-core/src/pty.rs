//! PTY supervisor
//!
//! Owns one interactive shell per live session behind a pseudo-terminal and
//! exposes a non-blocking byte-stream interface suitable for multiplexing
//! into a remote terminal. Blocking PTY reads and writes run on dedicated
//! threads bridged to the async world through channels; output fans out to
//! subscribers over a broadcast channel after prompt normalization.

use crate::config::Config;
use crate::error::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use portable_pty::{CommandBuilder, NativePtySystem, PtySize, PtySystem};
use regex::Regex;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

/// Commands injected right after spawn to install the fixed prompt. These
/// exact lines are suppressed from subscriber output.
const BOOTSTRAP_LINES: &[&str] = &["export PS1=\"terminuside:~# \"", "clear", "echo ''"];

/// Lifecycle of a PTY session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyState {
    Spawning,
    Running,
    Draining,
    Closed,
}

/// Outcome of a single subscriber read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyRead {
    Data(Bytes),
    Empty,
    Eof,
}

pub struct PtySupervisor {
    config: Arc<Config>,
    prompt_re: Regex,
}

impl PtySupervisor {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let prompt_re = Regex::new(&config.prompt_pattern)
            .map_err(|e| Error::Pty(format!("invalid prompt pattern: {}", e)))?;
        Ok(Self { config, prompt_re })
    }

    /// Allocate a pseudo-terminal and fork the login shell inside the
    /// session workspace. The prompt is rewritten before the first read so
    /// clients always see the fixed `terminuside:~# ` literal.
    pub async fn spawn(
        &self,
        session_id: i64,
        workspace_path: &Path,
        env: &[(String, String)],
    ) -> Result<Arc<PtySession>> {
        let size = PtySize {
            rows: self.config.pty_rows,
            cols: self.config.pty_cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pty_system = NativePtySystem::default();
        let pair = pty_system
            .openpty(size)
            .map_err(|e| Error::Pty(format!("openpty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&self.config.shell);
        cmd.args(&self.config.shell_args);
        cmd.cwd(workspace_path);
        cmd.env("TERM", "xterm-256color");
        cmd.env("SHELL", "/bin/bash");
        cmd.env("PS1", "terminuside:~# ");
        cmd.env("HOME", workspace_path.as_os_str());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Pty(format!("spawn shell: {}", e)))?;
        let pid = child.process_id();
        info!(session_id, pid, "shell spawned");

        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Pty(format!("pty writer: {}", e)))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Pty(format!("pty reader: {}", e)))?;

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(256);
        let (resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(8);
        let (output_tx, _) = broadcast::channel::<Bytes>(1024);
        let (state_tx, state_rx) = watch::channel(PtyState::Spawning);

        // Writer thread: drains queued input into the master side.
        tokio::task::spawn_blocking(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).is_err() || writer.flush().is_err() {
                    break;
                }
            }
        });

        // Reader thread: blocking reads bridged into the async pump.
        let (raw_tx, raw_rx) = mpsc::channel::<std::io::Result<Bytes>>(1024);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if raw_tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = raw_tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        let last_activity = Arc::new(RwLock::new(Utc::now()));
        let exit_code = Arc::new(RwLock::new(None));
        let pump = PumpContext {
            session_id,
            master: pair.master,
            child,
            raw_rx,
            resize_rx,
            output_tx: output_tx.clone(),
            state_tx,
            last_activity: last_activity.clone(),
            exit_code: exit_code.clone(),
            prompt_re: self.prompt_re.clone(),
            prompt_replacement: self.config.prompt_replacement.clone(),
            drain_deadline: self.config.pty_drain_deadline,
        };
        tokio::spawn(pump.run());

        let session = Arc::new(PtySession {
            session_id,
            workspace_path: workspace_path.to_path_buf(),
            created_at: Utc::now(),
            pid,
            input_tx,
            resize_tx,
            output_tx,
            state_rx,
            size: RwLock::new((self.config.pty_cols, self.config.pty_rows)),
            last_activity,
            exit_code,
            kill_grace: self.config.pty_kill_grace,
            drain_deadline: self.config.pty_drain_deadline,
            read_chunk_max: self.config.read_chunk_max,
        });

        // Install the fixed prompt before anything reaches subscribers.
        session
            .write(format!("{}\n", BOOTSTRAP_LINES.join("\n")).into_bytes())
            .await?;

        Ok(session)
    }
}

/// A live shell attached to a pseudo-terminal.
pub struct PtySession {
    pub session_id: i64,
    pub workspace_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub pid: Option<u32>,
    input_tx: mpsc::Sender<Vec<u8>>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    output_tx: broadcast::Sender<Bytes>,
    state_rx: watch::Receiver<PtyState>,
    size: RwLock<(u16, u16)>,
    last_activity: Arc<RwLock<DateTime<Utc>>>,
    exit_code: Arc<RwLock<Option<i32>>>,
    kill_grace: Duration,
    drain_deadline: Duration,
    read_chunk_max: usize,
}

impl PtySession {
    /// Enqueue raw bytes for the shell. Backpressure is the bounded input
    /// queue; the caller is never blocked on PTY I/O itself.
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        *self.last_activity.write().await = Utc::now();
        self.input_tx
            .send(data)
            .await
            .map_err(|_| Error::Pty("input channel closed".to_string()))
    }

    /// Set the terminal window size.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        *self.size.write().await = (cols, rows);
        self.resize_tx
            .send((cols, rows))
            .await
            .map_err(|_| Error::Pty("resize channel closed".to_string()))
    }

    /// Subscribe to post-processed output produced after this call.
    pub fn subscribe(&self) -> PtyReader {
        PtyReader {
            rx: self.output_tx.subscribe(),
            state_rx: self.state_rx.clone(),
            pending: Bytes::new(),
            chunk_max: self.read_chunk_max,
        }
    }

    pub fn state(&self) -> PtyState {
        *self.state_rx.borrow()
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state(), PtyState::Spawning | PtyState::Running)
    }

    pub async fn current_size(&self) -> (u16, u16) {
        *self.size.read().await
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().await
    }

    pub async fn exit_code(&self) -> Option<i32> {
        *self.exit_code.read().await
    }

    /// SIGTERM, wait out the grace period, then SIGKILL; resolves once the
    /// pump has drained and closed the master.
    pub async fn kill(&self, grace: Option<Duration>) -> Result<()> {
        if self.state() == PtyState::Closed {
            return Ok(());
        }
        let grace = grace.unwrap_or(self.kill_grace);

        self.signal(Signal::Term);
        if self.await_state(PtyState::Closed, grace).await {
            return Ok(());
        }

        self.signal(Signal::Kill);
        if self.await_state(PtyState::Closed, self.drain_deadline).await {
            Ok(())
        } else {
            Err(Error::Pty(format!(
                "session {} did not close after SIGKILL",
                self.session_id
            )))
        }
    }

    async fn await_state(&self, wanted: PtyState, deadline: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let reached = tokio::time::timeout(deadline, async {
            loop {
                if *rx.borrow() == wanted {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        reached.is_ok() && self.state() == wanted
    }

    #[cfg(unix)]
    fn signal(&self, signal: Signal) {
        use nix::sys::signal::{kill, Signal as NixSignal};
        use nix::unistd::Pid;
        if let Some(pid) = self.pid {
            let sig = match signal {
                Signal::Term => NixSignal::SIGTERM,
                Signal::Kill => NixSignal::SIGKILL,
            };
            if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
                debug!(session_id = self.session_id, pid, %e, "signal delivery failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: Signal) {}
}

enum Signal {
    Term,
    Kill,
}

/// Subscriber handle over the output broadcast.
pub struct PtyReader {
    rx: broadcast::Receiver<Bytes>,
    state_rx: watch::Receiver<PtyState>,
    pending: Bytes,
    chunk_max: usize,
}

impl PtyReader {
    /// Yield buffered output, at most `read_chunk_max` bytes per call.
    /// Returns `Empty` when the deadline elapses with no output and `Eof`
    /// once the PTY has closed and everything was delivered.
    pub async fn read(&mut self, deadline: Duration) -> PtyRead {
        if !self.pending.is_empty() {
            return PtyRead::Data(self.take_chunk());
        }
        let wait = tokio::time::timeout(deadline, async {
            loop {
                match self.rx.recv().await {
                    Ok(bytes) => return Some(bytes),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "pty subscriber lagged; output dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;

        match wait {
            // The session handle keeps the broadcast sender alive, so a
            // quiet closed PTY surfaces as a timeout with state Closed.
            Err(_) => {
                if *self.state_rx.borrow() == PtyState::Closed {
                    PtyRead::Eof
                } else {
                    PtyRead::Empty
                }
            }
            Ok(None) => PtyRead::Eof,
            Ok(Some(bytes)) => {
                self.pending = bytes;
                PtyRead::Data(self.take_chunk())
            }
        }
    }

    fn take_chunk(&mut self) -> Bytes {
        if self.pending.len() <= self.chunk_max {
            std::mem::take(&mut self.pending)
        } else {
            self.pending.split_to(self.chunk_max)
        }
    }
}

/// State moved into the read pump task.
struct PumpContext {
    session_id: i64,
    master: Box<dyn portable_pty::MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    raw_rx: mpsc::Receiver<std::io::Result<Bytes>>,
    resize_rx: mpsc::Receiver<(u16, u16)>,
    output_tx: broadcast::Sender<Bytes>,
    state_tx: watch::Sender<PtyState>,
    last_activity: Arc<RwLock<DateTime<Utc>>>,
    exit_code: Arc<RwLock<Option<i32>>>,
    prompt_re: Regex,
    prompt_replacement: String,
    drain_deadline: Duration,
}

impl PumpContext {
    async fn run(mut self) {
        let _ = self.state_tx.send(PtyState::Running);

        loop {
            tokio::select! {
                chunk = self.raw_rx.recv() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            self.forward(bytes).await;
                        }
                        Some(Err(e)) => {
                            // EIO is how Linux reports master-side EOF.
                            if e.raw_os_error() != Some(5) {
                                error!(session_id = self.session_id, %e, "pty read error");
                            }
                            break;
                        }
                        None => break,
                    }
                }
                Some((cols, rows)) = self.resize_rx.recv() => {
                    debug!(session_id = self.session_id, cols, rows, "resize pty");
                    let _ = self.master.resize(PtySize {
                        cols,
                        rows,
                        pixel_width: 0,
                        pixel_height: 0,
                    });
                }
            }
        }

        // Drain whatever the reader thread still has buffered.
        let _ = self.state_tx.send(PtyState::Draining);
        let drain = tokio::time::timeout(self.drain_deadline, async {
            while let Some(chunk) = self.raw_rx.recv().await {
                if let Ok(bytes) = chunk {
                    self.forward(bytes).await;
                }
            }
        })
        .await;
        if drain.is_err() {
            warn!(session_id = self.session_id, "drain deadline expired; residual output discarded");
        }

        let session_id = self.session_id;
        let mut child = self.child;
        let status = tokio::task::spawn_blocking(move || child.wait()).await;
        let code = match status {
            Ok(Ok(status)) => Some(status.exit_code() as i32),
            _ => None,
        };
        *self.exit_code.write().await = code;

        drop(self.master);
        let _ = self.state_tx.send(PtyState::Closed);
        info!(session_id, exit_code = code, "pty closed");
    }

    async fn forward(&mut self, bytes: Bytes) {
        let processed = post_process(&self.prompt_re, &self.prompt_replacement, &bytes);
        if processed.is_empty() {
            return;
        }
        *self.last_activity.write().await = Utc::now();
        // No subscribers is fine; output generated before attach is dropped.
        let _ = self.output_tx.send(processed);
    }
}

/// Normalize prompts and strip the bootstrap lines from a chunk.
fn post_process(prompt_re: &Regex, replacement: &str, chunk: &[u8]) -> Bytes {
    let text = String::from_utf8_lossy(chunk);
    let filtered = filter_bootstrap_lines(&text);
    let normalized = prompt_re.replace_all(&filtered, replacement);
    Bytes::from(normalized.into_owned().into_bytes())
}

/// Drop lines that exactly echo a bootstrap command.
fn filter_bootstrap_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let stripped = line.trim_end_matches(['\n', '\r']);
        if BOOTSTRAP_LINES.contains(&stripped) {
            continue;
        }
        out.push_str(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_re() -> Regex {
        Regex::new(&Config::default().prompt_pattern).unwrap()
    }

    #[test]
    fn prompts_are_normalized() {
        let re = default_re();
        let out = post_process(&re, "terminuside:~# ", b"root@sandbox-42:~# ls\n");
        assert_eq!(&out[..], b"terminuside:~# ls\n" as &[u8]);
    }

    #[test]
    fn non_prompt_bytes_pass_through() {
        let re = default_re();
        let out = post_process(&re, "terminuside:~# ", b"plain output, no prompt\n");
        assert_eq!(&out[..], b"plain output, no prompt\n" as &[u8]);
    }

    #[test]
    fn bootstrap_lines_are_suppressed() {
        let re = default_re();
        let input = b"export PS1=\"terminuside:~# \"\r\nclear\necho ''\nreal output\n";
        let out = post_process(&re, "terminuside:~# ", input);
        assert_eq!(&out[..], b"real output\n" as &[u8]);
    }

    #[test]
    fn partial_bootstrap_lines_are_kept() {
        let re = default_re();
        let out = post_process(&re, "terminuside:~# ", b"clearly not a bootstrap line\n");
        assert_eq!(&out[..], b"clearly not a bootstrap line\n" as &[u8]);
    }

    #[cfg(unix)]
    mod live {
        use super::super::*;

        fn cat_config(temp: &tempfile::TempDir) -> Arc<Config> {
            Arc::new(Config {
                workspace_root: temp.path().to_path_buf(),
                shell: "/bin/cat".to_string(),
                shell_args: vec![],
                ..Config::default()
            })
        }

        #[tokio::test]
        async fn spawn_write_read_kill() {
            let temp = tempfile::tempdir().unwrap();
            let config = cat_config(&temp);
            let supervisor = PtySupervisor::new(config).unwrap();
            let session = supervisor.spawn(1, temp.path(), &[]).await.unwrap();
            assert!(session.is_alive());

            let mut reader = session.subscribe();
            session.write(b"hello-pty\n".to_vec()).await.unwrap();

            let mut seen = Vec::new();
            for _ in 0..20 {
                match reader.read(Duration::from_millis(500)).await {
                    PtyRead::Data(bytes) => {
                        seen.extend_from_slice(&bytes);
                        if String::from_utf8_lossy(&seen).contains("hello-pty") {
                            break;
                        }
                    }
                    PtyRead::Empty => continue,
                    PtyRead::Eof => break,
                }
            }
            assert!(String::from_utf8_lossy(&seen).contains("hello-pty"));

            session.kill(Some(Duration::from_millis(500))).await.unwrap();
            assert_eq!(session.state(), PtyState::Closed);
            assert!(!session.is_alive());

            // Pending reads resolve with EOF once closed.
            loop {
                match reader.read(Duration::from_millis(200)).await {
                    PtyRead::Data(_) => continue,
                    PtyRead::Empty => continue,
                    PtyRead::Eof => break,
                }
            }
        }

        #[tokio::test]
        async fn resize_is_accepted_while_running() {
            let temp = tempfile::tempdir().unwrap();
            let supervisor = PtySupervisor::new(cat_config(&temp)).unwrap();
            let session = supervisor.spawn(2, temp.path(), &[]).await.unwrap();

            session.resize(120, 40).await.unwrap();
            assert_eq!(session.current_size().await, (120, 40));

            session.kill(None).await.unwrap();
        }

        #[tokio::test]
        async fn kill_is_idempotent() {
            let temp = tempfile::tempdir().unwrap();
            let supervisor = PtySupervisor::new(cat_config(&temp)).unwrap();
            let session = supervisor.spawn(3, temp.path(), &[]).await.unwrap();

            session.kill(Some(Duration::from_millis(500))).await.unwrap();
            session.kill(Some(Duration::from_millis(500))).await.unwrap();
            assert_eq!(session.state(), PtyState::Closed);
        }
    }
}
