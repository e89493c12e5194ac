//! Child server process supervision.
//!
//! Spawns the stdio server binary with all three streams piped, runs the
//! SIGTERM → grace → SIGKILL stop ladder, and broadcasts the exit status
//! that the rest of the bridge hangs off.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::error::BridgeError;

/// Default install location of the GitHub MCP server binary.
pub const DEFAULT_BINARY_PATH: &str = "/usr/local/bin/github-mcp-server";

/// Configuration for the child server process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Path to the server binary.
    pub binary_path: PathBuf,
    /// Arguments passed to the binary. The upstream server only speaks
    /// JSON-RPC over its pipes when given `stdio`.
    pub args: Vec<String>,
    /// Extra environment applied over the inherited environment. Anything
    /// not overridden here (credentials included) passes through untouched.
    pub env: HashMap<String, String>,
    /// How long a stopping child gets between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from(DEFAULT_BINARY_PATH),
            args: vec!["stdio".to_string()],
            env: HashMap::new(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl ProcessConfig {
    /// Build a config from the environment (`GITHUB_MCP_BINARY`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("GITHUB_MCP_BINARY") {
            config.binary_path = PathBuf::from(path);
        }
        config
    }

    pub fn with_binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = path.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// How a child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatusInfo {
    /// Exit code, when the child exited on its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Terminating signal, when the child was killed (unix).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl ExitStatusInfo {
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatusInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitStatusInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// The child's captured stdio streams, handed to the wire layer.
#[derive(Debug)]
pub struct ProcessStreams {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Handle to a supervised child process.
///
/// The `Child` itself lives inside a supervision task; the handle talks to
/// it through channels, so any number of holders can await the exit.
#[derive(Debug)]
pub struct ServerProcess {
    pid: Option<u32>,
    stop_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<Option<ExitStatusInfo>>,
}

impl ServerProcess {
    /// Launch the configured binary.
    ///
    /// The path must point at an executable file; anything else fails with
    /// a startup error before the spawn is attempted.
    pub fn spawn(config: &ProcessConfig) -> Result<(Self, ProcessStreams), BridgeError> {
        ensure_executable(&config.binary_path)?;

        let mut command = Command::new(&config.binary_path);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: terminal signals must reach the gateway, not
        // the child directly.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            BridgeError::Startup(format!(
                "failed to spawn {}: {e}",
                config.binary_path.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Startup("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Startup("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::Startup("child stderr not captured".to_string()))?;

        let pid = child.id();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(child, stop_rx, exit_tx, config.stop_grace));

        tracing::info!(pid, binary = %config.binary_path.display(), "Started server process");

        Ok((
            Self {
                pid,
                stop_tx,
                exit_rx,
            },
            ProcessStreams {
                stdin,
                stdout,
                stderr,
            },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, once the child has exited.
    pub fn exit_status(&self) -> Option<ExitStatusInfo> {
        *self.exit_rx.borrow()
    }

    /// Ask the child to stop and wait for it to exit. Idempotent: calling
    /// again (or after the child already died) just returns the status.
    pub async fn stop(&self) -> ExitStatusInfo {
        let _ = self.stop_tx.send(true);
        self.await_exit().await
    }

    /// Wait until the child has exited, however that happens.
    pub async fn await_exit(&self) -> ExitStatusInfo {
        let mut exit_rx = self.exit_rx.clone();
        match exit_rx.wait_for(|status| status.is_some()).await {
            Ok(status) => (*status).unwrap_or_else(ExitStatusInfo::unknown),
            Err(_) => ExitStatusInfo::unknown(),
        }
    }
}

fn ensure_executable(path: &Path) -> Result<(), BridgeError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| BridgeError::Startup(format!("server binary {}: {e}", path.display())))?;
    if !metadata.is_file() {
        return Err(BridgeError::Startup(format!(
            "server binary {} is not a file",
            path.display()
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(BridgeError::Startup(format!(
                "server binary {} is not executable",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Owns the `Child`: waits for a natural exit, or runs the TERM → grace →
/// KILL ladder when a stop is requested. Broadcasts the status exactly once.
async fn supervise(
    mut child: Child,
    mut stop_rx: watch::Receiver<bool>,
    exit_tx: watch::Sender<Option<ExitStatusInfo>>,
    grace: Duration,
) {
    let status = tokio::select! {
        biased;

        status = child.wait() => status_info(status),

        _ = stop_rx.changed() => stop_child(&mut child, grace).await,
    };

    tracing::info!(%status, "Server process exited");
    let _ = exit_tx.send(Some(status));
}

async fn stop_child(child: &mut Child, grace: Duration) -> ExitStatusInfo {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "Failed to signal server process");
        }
        match timeout(grace, child.wait()).await {
            Ok(status) => return status_info(status),
            Err(_) => {
                tracing::warn!(
                    pid,
                    grace_secs = grace.as_secs_f64(),
                    "Server ignored SIGTERM, killing"
                );
            }
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to kill server process");
    }
    status_info(child.wait().await)
}

fn status_info(status: std::io::Result<std::process::ExitStatus>) -> ExitStatusInfo {
    match status {
        Ok(status) => ExitStatusInfo::from(status),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to reap server process");
            ExitStatusInfo::unknown()
        }
    }
}
