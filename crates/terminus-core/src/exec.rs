//! Execution engine
//!
//! Runs a code snippet to completion in the session workspace and returns a
//! bounded result. One-shot executions share no state with the session's
//! interactive shell; the injection variant writes through the PTY instead
//! and its output arrives as normal shell frames.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pty::PtySession;
use rand::Rng;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use terminus_types::ExecutionResult;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Appended to a capped stream.
const TRUNCATION_SENTINEL: &str = "\n…[truncated]\n";

/// An ephemeral run request.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub language: String,
    pub code: String,
    pub stdin: Option<String>,
    pub cwd: PathBuf,
    pub deadline: Option<Duration>,
}

pub struct ExecutionEngine {
    config: Arc<Config>,
}

impl ExecutionEngine {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Run the snippet to completion, enforcing the deadline and the
    /// per-stream output cap.
    pub async fn execute(&self, job: ExecutionJob) -> Result<ExecutionResult> {
        if job.language != "python" {
            return Err(Error::Execution(format!(
                "unsupported language: {}",
                job.language
            )));
        }

        let started = Instant::now();
        let deadline = job.deadline.unwrap_or(self.config.execution_deadline);
        let cap = self.config.output_cap;

        // A program that consumes stdin cannot share it with the code
        // stream, so the snippet goes to a temp file in that case.
        let temp_script = match &job.stdin {
            Some(_) => Some(self.write_temp_script(&job).await?),
            None => None,
        };

        let mut cmd = Command::new(&self.config.python_bin);
        match &temp_script {
            Some(path) => {
                cmd.arg(path);
            }
            None => {
                cmd.arg("-");
            }
        }
        cmd.current_dir(&job.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Execution(format!("spawn {}: {}", self.config.python_bin, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = match (&temp_script, &job.stdin) {
                (Some(_), Some(input)) => input.clone(),
                _ => job.code.clone(),
            };
            // A closed pipe just means the program never read it.
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                debug!(%e, "stdin write ended early");
            }
        }

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| Error::Execution("missing stdout pipe".to_string()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| Error::Execution("missing stderr pipe".to_string()))?;
        let stdout_task = tokio::spawn(read_capped(stdout_pipe, cap));
        let stderr_task = tokio::spawn(read_capped(stderr_pipe, cap));

        let (status, timed_out) = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(status) => (
                status.map_err(|e| Error::Execution(format!("wait: {}", e)))?,
                false,
            ),
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "execution deadline exceeded");
                let status = self.terminate(&mut child).await?;
                (status, true)
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if let Some(path) = temp_script {
            let _ = tokio::fs::remove_file(path).await;
        }

        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_status: exit_status_code(&status),
            timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Inject the snippet into the live shell; results stream back as
    /// ordinary PTY output.
    pub async fn execute_in_pty(&self, pty: &PtySession, code: &str) -> Result<()> {
        pty.write(format!("{}\n", code).into_bytes()).await
    }

    /// SIGTERM, short grace, then SIGKILL.
    async fn terminate(&self, child: &mut tokio::process::Child) -> Result<std::process::ExitStatus> {
        signal_term(child.id());
        match tokio::time::timeout(self.config.execution_kill_grace, child.wait()).await {
            Ok(status) => status.map_err(|e| Error::Execution(format!("wait: {}", e))),
            Err(_) => {
                child
                    .start_kill()
                    .map_err(|e| Error::Execution(format!("kill: {}", e)))?;
                child
                    .wait()
                    .await
                    .map_err(|e| Error::Execution(format!("wait: {}", e)))
            }
        }
    }

    async fn write_temp_script(&self, job: &ExecutionJob) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&job.cwd)
            .await
            .map_err(|e| Error::Execution(format!("cwd {}: {}", job.cwd.display(), e)))?;
        let suffix: u32 = rand::thread_rng().gen();
        let path = job.cwd.join(format!(".terminus-run-{:08x}.py", suffix));
        tokio::fs::write(&path, job.code.as_bytes())
            .await
            .map_err(|e| Error::Execution(format!("write {}: {}", path.display(), e)))?;
        Ok(path)
    }
}

/// Read a pipe to EOF, keeping at most `cap` bytes and appending the
/// truncation sentinel when output was dropped. The pipe is drained fully
/// either way so the child never blocks on a full buffer.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut pipe: R, cap: usize) -> String {
    let mut kept = Vec::with_capacity(8192.min(cap));
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if kept.len() < cap {
                    let take = (cap - kept.len()).min(n);
                    kept.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_SENTINEL);
    }
    text
}

fn exit_status_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn signal_term(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = pid {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn signal_term(_pid: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn engine(temp: &tempfile::TempDir) -> ExecutionEngine {
        ExecutionEngine::new(Arc::new(Config {
            workspace_root: temp.path().to_path_buf(),
            ..Config::default()
        }))
    }

    fn job(temp: &tempfile::TempDir, code: &str) -> ExecutionJob {
        ExecutionJob {
            language: "python".to_string(),
            code: code.to_string(),
            stdin: None,
            cwd: temp.path().to_path_buf(),
            deadline: None,
        }
    }

    #[tokio::test]
    async fn hello_world() {
        let temp = tempfile::tempdir().unwrap();
        let result = engine(&temp).execute(job(&temp, "print(1+2)")).await.unwrap();
        assert_eq!(result.stdout, "3\n");
        assert_eq!(result.exit_status, 0);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn stdin_is_fed_to_the_program() {
        let temp = tempfile::tempdir().unwrap();
        let mut j = job(&temp, "print('hi', input())");
        j.stdin = Some("Alice\n".to_string());
        let result = engine(&temp).execute(j).await.unwrap();
        assert_eq!(result.stdout, "hi Alice\n");
        assert_eq!(result.exit_status, 0);

        // The temp script is unlinked after the run.
        let mut entries = std::fs::read_dir(temp.path()).unwrap();
        assert!(entries.all(|e| {
            !e.unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with(".terminus-run-")
        }));
    }

    #[tokio::test]
    async fn stderr_and_exit_status_are_captured() {
        let temp = tempfile::tempdir().unwrap();
        let result = engine(&temp)
            .execute(job(&temp, "import sys; sys.stderr.write('boom\\n'); sys.exit(3)"))
            .await
            .unwrap();
        assert_eq!(result.stderr, "boom\n");
        assert_eq!(result.exit_status, 3);
    }

    #[tokio::test]
    async fn deadline_terminates_the_program() {
        let temp = tempfile::tempdir().unwrap();
        let mut j = job(&temp, "import time; time.sleep(30)");
        j.deadline = Some(Duration::from_secs(1));
        let result = engine(&temp).execute(j).await.unwrap();
        assert!(result.timed_out);
        assert_ne!(result.exit_status, 0);
        assert!(result.duration_ms >= 1000);
        assert!(result.duration_ms <= 2000);
    }

    #[tokio::test]
    async fn stdout_is_capped_with_sentinel() {
        let temp = tempfile::tempdir().unwrap();
        let result = engine(&temp)
            .execute(job(
                &temp,
                "import sys; sys.stdout.write('x' * (2 * 1024 * 1024))",
            ))
            .await
            .unwrap();
        assert!(result.stdout.ends_with(TRUNCATION_SENTINEL));
        assert!(result.stdout.len() <= 1024 * 1024 + TRUNCATION_SENTINEL.len());
    }

    #[tokio::test]
    async fn unknown_language_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let mut j = job(&temp, "puts 1");
        j.language = "ruby".to_string();
        assert!(matches!(
            engine(&temp).execute(j).await,
            Err(Error::Execution(_))
        ));
    }

    #[tokio::test]
    async fn pty_injection_appears_as_shell_output() {
        use crate::pty::{PtyRead, PtySupervisor};

        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            workspace_root: temp.path().to_path_buf(),
            shell: "/bin/cat".to_string(),
            shell_args: vec![],
            ..Config::default()
        });
        let supervisor = PtySupervisor::new(config.clone()).unwrap();
        let session = supervisor.spawn(1, temp.path(), &[]).await.unwrap();
        let engine = ExecutionEngine::new(config);

        let mut reader = session.subscribe();
        engine.execute_in_pty(&session, "print(42)").await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..20 {
            match reader.read(Duration::from_millis(500)).await {
                PtyRead::Data(bytes) => {
                    seen.extend_from_slice(&bytes);
                    if String::from_utf8_lossy(&seen).contains("print(42)") {
                        break;
                    }
                }
                PtyRead::Empty => continue,
                PtyRead::Eof => break,
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("print(42)"));

        session.kill(None).await.unwrap();
    }

    #[tokio::test]
    async fn runs_resolve_relative_paths_in_the_workspace() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("data.txt"), "42").unwrap();
        let result = engine(&temp)
            .execute(job(&temp, "print(open('data.txt').read())"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "42\n");
    }
}
