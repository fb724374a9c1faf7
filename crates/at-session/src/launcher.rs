use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("launch I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LaunchError>;

// ---------------------------------------------------------------------------
// LaunchSpec
// ---------------------------------------------------------------------------

/// Everything needed to start one agent process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// stdout and stderr are appended here.
    pub log_file: PathBuf,
}

// ---------------------------------------------------------------------------
// ProcessHandle / ProcessControl
// ---------------------------------------------------------------------------

/// Caller-side handle to a launched process.
///
/// `kill` only sends the request; it does not wait for the process to go
/// away. `wait` resolves with the exit code once the launcher reports the
/// exit (`None` for signal deaths or when the launcher vanished).
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: flume::Sender<()>,
    exit_rx: flume::Receiver<Option<i32>>,
}

/// Launcher-side end of a [`ProcessHandle`].
#[derive(Debug)]
pub struct ProcessControl {
    pub kill_rx: flume::Receiver<()>,
    pub exit_tx: flume::Sender<Option<i32>>,
}

impl ProcessControl {
    /// Report the process exit to the handle.
    pub fn report_exit(&self, code: Option<i32>) {
        let _ = self.exit_tx.send(code);
    }

    /// Number of kill requests received and not yet consumed.
    pub fn pending_kills(&self) -> usize {
        self.kill_rx.len()
    }
}

impl ProcessHandle {
    /// Create a connected handle/control pair.
    pub fn channel(pid: Option<u32>) -> (ProcessHandle, ProcessControl) {
        let (kill_tx, kill_rx) = flume::unbounded();
        let (exit_tx, exit_rx) = flume::bounded(1);
        (
            ProcessHandle {
                pid,
                kill_tx,
                exit_rx,
            },
            ProcessControl { kill_rx, exit_tx },
        )
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request termination. Returns `false` if the launcher side is gone.
    pub fn kill(&self) -> bool {
        self.kill_tx.send(()).is_ok()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> Option<i32> {
        self.exit_rx.recv_async().await.ok().flatten()
    }

    /// Non-blocking exit check.
    pub fn try_exit_code(&self) -> Option<Option<i32>> {
        self.exit_rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// ProcessLauncher trait
// ---------------------------------------------------------------------------

/// Abstraction over process spawning so the orchestrator can be tested
/// without real agent binaries.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<ProcessHandle>;
}

// ---------------------------------------------------------------------------
// TokioProcessLauncher
// ---------------------------------------------------------------------------

/// Spawns real OS processes with `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct TokioProcessLauncher;

impl TokioProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<ProcessHandle> {
        if let Some(parent) = spec.log_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)?;
        let stderr = stdout.try_clone()?;

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let mut child = command.spawn().map_err(|e| LaunchError::Spawn {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id();
        let (handle, control) = ProcessHandle::channel(pid);
        let program = spec.program.clone();

        tokio::spawn(async move {
            let ProcessControl { kill_rx, exit_tx } = control;

            // A dropped handle disables the kill branch instead of killing.
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx.recv_async() => {
                    debug!(?pid, "kill requested");
                    if let Err(e) = child.start_kill() {
                        warn!(?pid, error = %e, "failed to signal process");
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(?pid, error = %e, "failed to reap process");
                    None
                }
            };
            debug!(?pid, program = %program, ?code, "process exited");
            let _ = exit_tx.send(code);
        });

        info!(?pid, program = %spec.program, cwd = %spec.cwd.display(), "process launched");
        Ok(handle)
    }
}
