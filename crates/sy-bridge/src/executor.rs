//! Local command execution.
//!
//! [`ShellExecutor`] runs each line through the configured shell in the
//! session's working directory. `pwd` and `cd` are answered in-process so the
//! directory sticks between commands.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sy_core::config::ExecutorConfig;
use sy_core::types::SessionId;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit status reported when a command overruns its time limit.
pub const TIMEOUT_EXIT_STATUS: i32 = 124;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub chunks: Vec<String>,
    pub exit_status: i32,
}

impl ExecOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self::with_status(text, 0)
    }

    pub fn with_status(text: impl Into<String>, exit_status: i32) -> Self {
        let text = text.into();
        Self {
            chunks: if text.is_empty() { Vec::new() } else { vec![text] },
            exit_status,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start {shell}: {reason}")]
    Spawn { shell: String, reason: String },

    #[error("command i/o failed: {0}")]
    Io(String),
}

/// Runs `local` command lines on behalf of a session.
#[async_trait]
pub trait LocalExecutor: Send + Sync + 'static {
    async fn execute(&self, session_id: SessionId, command: &str) -> Result<ExecOutput, ExecError>;

    /// Drop per-session state once the session is closed.
    fn forget(&self, _session_id: SessionId) {}
}

pub struct ShellExecutor {
    shell: String,
    timeout: Duration,
    initial_dir: PathBuf,
    cwd: DashMap<SessionId, PathBuf>,
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>, timeout: Duration, initial_dir: PathBuf) -> Self {
        Self {
            shell: shell.into(),
            timeout,
            initial_dir,
            cwd: DashMap::new(),
        }
    }

    pub fn from_config(cfg: &ExecutorConfig) -> Self {
        let initial_dir = cfg
            .working_dir
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::new(cfg.shell.clone(), Duration::from_secs(cfg.timeout_secs), initial_dir)
    }

    /// Current working directory of a session.
    pub fn cwd(&self, session_id: SessionId) -> PathBuf {
        self.cwd
            .get(&session_id)
            .map(|d| d.value().clone())
            .unwrap_or_else(|| self.initial_dir.clone())
    }

    async fn change_dir(&self, session_id: SessionId, target: &str) -> ExecOutput {
        let cwd = self.cwd(session_id);
        let candidate = if target == ".." {
            cwd.parent().map(Path::to_path_buf).unwrap_or(cwd.clone())
        } else {
            cwd.join(target)
        };
        match tokio::fs::metadata(&candidate).await {
            Ok(meta) if meta.is_dir() => {
                let resolved = tokio::fs::canonicalize(&candidate)
                    .await
                    .unwrap_or(candidate);
                debug!(%session_id, cwd = %resolved.display(), "working directory changed");
                self.cwd.insert(session_id, resolved);
                ExecOutput::ok("")
            }
            _ => ExecOutput::with_status(
                format!("cd: {}: No such file or directory\n", candidate.display()),
                1,
            ),
        }
    }

    async fn run_shell(&self, session_id: SessionId, command: &str) -> Result<ExecOutput, ExecError> {
        let cwd = self.cwd(session_id);
        // `exec 2>&1` merges stderr into stdout for the rest of the script.
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(format!("exec 2>&1\n{command}"))
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn {
                shell: self.shell.clone(),
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let text = String::from_utf8_lossy(&output.stdout).into_owned();
                // Killed by a signal: report it the way shells do.
                let status = output.status.code().unwrap_or(128 + signal_of(&output.status));
                Ok(ExecOutput::with_status(text, status))
            }
            Ok(Err(e)) => Err(ExecError::Io(e.to_string())),
            Err(_) => {
                warn!(%session_id, command, timeout_secs = self.timeout.as_secs(), "local command timed out");
                Ok(ExecOutput::with_status("Command timed out\n", TIMEOUT_EXIT_STATUS))
            }
        }
    }
}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> i32 {
    0
}

#[async_trait]
impl LocalExecutor for ShellExecutor {
    async fn execute(&self, session_id: SessionId, command: &str) -> Result<ExecOutput, ExecError> {
        let command = command.trim();
        if command == "pwd" {
            return Ok(ExecOutput::ok(format!("{}\n", self.cwd(session_id).display())));
        }
        if let Some(target) = command.strip_prefix("cd ") {
            return Ok(self.change_dir(session_id, target.trim()).await);
        }
        self.run_shell(session_id, command).await
    }

    fn forget(&self, session_id: SessionId) {
        self.cwd.remove(&session_id);
    }
}
