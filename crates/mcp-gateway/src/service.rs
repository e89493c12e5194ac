//! Bridge facade tying the supervisor, correlator, and state machine
//! together behind a small callable surface.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, watch};

use crate::correlator::RequestCorrelator;
use crate::diagnostics;
use crate::error::BridgeError;
use crate::health::{BridgeState, HealthReport};
use crate::process::{ProcessConfig, ServerProcess};
use crate::rpc::protocol::RpcReply;
use crate::version::{GATEWAY_VERSION, VersionInfo};

/// MCP protocol revision announced during the handshake.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Deadline applied when a call does not carry its own.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub process: ProcessConfig,
    pub default_timeout: Duration,
    /// Run the MCP initialize handshake before the first real call.
    pub auto_initialize: bool,
    pub protocol_version: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            process: ProcessConfig::default(),
            default_timeout: DEFAULT_CALL_TIMEOUT,
            auto_initialize: true,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Build a config from the environment (`GITHUB_MCP_BINARY`,
    /// `GITHUB_MCP_PROTOCOL_VERSION`).
    pub fn from_env() -> Self {
        let mut config = Self {
            process: ProcessConfig::from_env(),
            ..Self::default()
        };
        if let Ok(version) = std::env::var("GITHUB_MCP_PROTOCOL_VERSION") {
            config.protocol_version = version;
        }
        config
    }

    pub fn with_process(mut self, process: ProcessConfig) -> Self {
        self.process = process;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_auto_initialize(mut self, auto_initialize: bool) -> Self {
        self.auto_initialize = auto_initialize;
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }
}

/// Live wiring for one child: supervisor handle, correlator, handshake flag.
struct BridgeRuntime {
    process: Arc<ServerProcess>,
    correlator: Arc<RequestCorrelator>,
    /// Guards the one-time MCP handshake.
    initialized: Mutex<bool>,
    started_at: String,
}

/// The bridge: owns the child server and answers JSON-RPC calls over it.
///
/// State machine: NOT_STARTED → RUNNING → (STOPPING → STOPPED | CRASHED),
/// with STOPPED and CRASHED accepting a fresh `start`. Nothing restarts
/// automatically.
pub struct GatewayService {
    config: BridgeConfig,
    state: RwLock<BridgeState>,
    runtime: RwLock<Option<Arc<BridgeRuntime>>>,
    /// `serverInfo` captured from the child's initialize response.
    server_info: RwLock<Option<Value>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayService {
    pub fn new(config: BridgeConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            state: RwLock::new(BridgeState::NotStarted),
            runtime: RwLock::new(None),
            server_info: RwLock::new(None),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Launch the child and wire the bridge to it.
    ///
    /// The previous child's wiring, if any, is replaced wholesale.
    pub async fn start(self: &Arc<Self>) -> Result<(), BridgeError> {
        let mut state = self.state.write().await;
        match *state {
            BridgeState::NotStarted | BridgeState::Stopped | BridgeState::Crashed => {}
            current => {
                return Err(BridgeError::Startup(format!(
                    "server already active (state {current})"
                )));
            }
        }

        let (process, streams) = ServerProcess::spawn(&self.config.process)?;
        let process = Arc::new(process);
        let correlator = Arc::new(RequestCorrelator::new(streams.stdin));
        correlator.spawn_reader(streams.stdout);
        correlator.spawn_timeout_sweep();
        diagnostics::spawn_stderr_forwarder(streams.stderr);

        let runtime = Arc::new(BridgeRuntime {
            process: process.clone(),
            correlator: correlator.clone(),
            initialized: Mutex::new(false),
            started_at: chrono::Utc::now().to_rfc3339(),
        });
        *self.runtime.write().await = Some(runtime);
        *self.server_info.write().await = None;
        *state = BridgeState::Running;
        drop(state);

        self.spawn_exit_watcher(process, correlator);
        Ok(())
    }

    /// Issue one JSON-RPC call and wait for its reply.
    ///
    /// `params` defaults to an empty object (the upstream server rejects
    /// null params); `timeout` falls back to the configured default. The
    /// reply is the child's raw `result` or `error` member, untouched.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<RpcReply, BridgeError> {
        let runtime = self.current_runtime().await?;

        if self.config.auto_initialize && method != "initialize" {
            self.ensure_initialized(&runtime).await?;
        }

        let reply = self.raw_call(&runtime, method, params, timeout).await?;

        // A client driving the handshake itself counts; re-initializing a
        // child that is already initialized would confuse it.
        if method == "initialize" {
            if let RpcReply::Result(result) = &reply {
                self.record_initialized(&runtime, result).await;
            }
        }
        Ok(reply)
    }

    /// Orderly shutdown of the child. Idempotent; a crash racing the stop
    /// converges on the same terminal state without double-failing anything.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            match *state {
                BridgeState::Running => *state = BridgeState::Stopping,
                // Another stop is in flight; fall through and wait with it.
                BridgeState::Stopping => {}
                _ => return,
            }
        }

        let runtime = self.runtime.read().await.clone();
        let Some(runtime) = runtime else { return };
        let status = runtime.process.stop().await;

        // The exit watcher performs the same convergence; whichever runs
        // first wins and the other leaves the terminal state alone.
        let mut state = self.state.write().await;
        if *state == BridgeState::Stopping {
            *state = BridgeState::Stopped;
        }
        tracing::info!(%status, state = %*state, "Bridge stopped");
    }

    /// Snapshot for the health endpoint.
    pub async fn health(&self) -> HealthReport {
        let status = *self.state.read().await;
        let runtime = self.runtime.read().await.clone();
        let server_info = self.server_info.read().await.clone();

        let mut version = VersionInfo::new();
        if let Some(info) = &server_info {
            if let Some(name) = info.get("name").and_then(Value::as_str) {
                version = version.with_server_name(name.to_string());
            }
            if let Some(v) = info.get("version").and_then(Value::as_str) {
                version = version.with_server_version(v.to_string());
            }
        }

        let (pid, started_at, exit_status) = match &runtime {
            Some(runtime) => (
                status.is_running().then(|| runtime.process.pid()).flatten(),
                Some(runtime.started_at.clone()),
                runtime.process.exit_status(),
            ),
            None => (None, None, None),
        };

        HealthReport {
            status,
            running: status.is_running(),
            pid,
            started_at,
            exit_status,
            version,
        }
    }

    /// Liveness signal: true only while calls are being accepted.
    pub async fn is_running(&self) -> bool {
        self.state.read().await.is_running()
    }

    pub async fn state(&self) -> BridgeState {
        *self.state.read().await
    }

    /// Ask the HTTP layer to begin graceful shutdown.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    async fn current_runtime(&self) -> Result<Arc<BridgeRuntime>, BridgeError> {
        let state = *self.state.read().await;
        if !state.is_running() {
            return Err(BridgeError::Unavailable(state));
        }
        match self.runtime.read().await.clone() {
            Some(runtime) => Ok(runtime),
            None => Err(BridgeError::Unavailable(state)),
        }
    }

    async fn raw_call(
        &self,
        runtime: &BridgeRuntime,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<RpcReply, BridgeError> {
        let params = params.unwrap_or_else(|| json!({}));
        let timeout = timeout.unwrap_or(self.config.default_timeout);

        let pending = runtime.correlator.issue(method, params, timeout).await?;
        let frame = pending
            .await
            .map_err(|_| BridgeError::Transport("response channel closed".to_string()))??;
        Ok(RpcReply::from_response(frame))
    }

    /// One-time MCP handshake, run before the first real call. Concurrent
    /// first calls serialize on the runtime's init mutex so the child sees
    /// exactly one initialize.
    async fn ensure_initialized(&self, runtime: &Arc<BridgeRuntime>) -> Result<(), BridgeError> {
        let mut initialized = runtime.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        let params = json!({
            "protocolVersion": self.config.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": "mcp-gateway",
                "version": GATEWAY_VERSION,
            },
        });
        tracing::info!(protocol_version = %self.config.protocol_version, "Initializing server");
        let reply = self.raw_call(runtime, "initialize", Some(params), None).await?;
        let result = match reply {
            RpcReply::Result(result) => result,
            RpcReply::Error(error) => {
                return Err(BridgeError::Startup(format!(
                    "server rejected initialize: {error}"
                )));
            }
        };

        runtime
            .correlator
            .send_notification("notifications/initialized")
            .await?;
        *initialized = true;
        drop(initialized);

        self.capture_server_info(&result).await;
        Ok(())
    }

    async fn record_initialized(&self, runtime: &BridgeRuntime, result: &Value) {
        *runtime.initialized.lock().await = true;
        self.capture_server_info(result).await;
    }

    async fn capture_server_info(&self, result: &Value) {
        if let Some(info) = result.get("serverInfo") {
            tracing::info!(
                server_name = info.get("name").and_then(serde_json::Value::as_str).unwrap_or_default(),
                server_version = info.get("version").and_then(serde_json::Value::as_str).unwrap_or_default(),
                "Server identified itself"
            );
            *self.server_info.write().await = Some(info.clone());
        }
    }

    /// Single authority for post-exit cleanup: fails the in-flight table,
    /// then lands the state machine on STOPPED or CRASHED.
    fn spawn_exit_watcher(
        self: &Arc<Self>,
        process: Arc<ServerProcess>,
        correlator: Arc<RequestCorrelator>,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            let status = process.await_exit().await;
            let failed = correlator.fail_all(status);

            let mut state = service.state.write().await;
            let still_current = {
                let runtime = service.runtime.read().await;
                runtime
                    .as_ref()
                    .is_some_and(|r| Arc::ptr_eq(&r.process, &process))
            };
            if !still_current {
                // A newer child owns the state machine now.
                return;
            }
            let next = match *state {
                BridgeState::Stopping => BridgeState::Stopped,
                BridgeState::Running => BridgeState::Crashed,
                terminal => terminal,
            };
            if next == BridgeState::Crashed {
                tracing::warn!(%status, failed, "Server process died unexpectedly");
            }
            *state = next;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn frame_bytes(value: &Value) -> Vec<u8> {
        let json = serde_json::to_vec(value).unwrap();
        let mut bytes = format!("Content-Length: {}\r\n\r\n", json.len()).into_bytes();
        bytes.extend_from_slice(&json);
        bytes
    }

    fn write_frame_file(dir: &tempfile::TempDir, name: &str, value: &Value) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, frame_bytes(value)).unwrap();
        path
    }

    fn sh_bridge(script: &str) -> BridgeConfig {
        BridgeConfig::default()
            .with_auto_initialize(false)
            .with_process(
                ProcessConfig::default()
                    .with_binary_path("/bin/sh")
                    .with_args(vec!["-c".to_string(), script.to_string()]),
            )
    }

    async fn wait_for_state(service: &GatewayService, want: BridgeState) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let current = service.state().await;
            if current == want {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("state stuck at {current}, wanted {want}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(60));
        assert!(config.auto_initialize);
        assert_eq!(config.protocol_version, "2024-11-05");
        assert_eq!(config.process.args, vec!["stdio".to_string()]);
    }

    #[tokio::test]
    async fn fresh_service_reports_not_started() {
        let service = Arc::new(GatewayService::new(BridgeConfig::default()));

        let report = service.health().await;
        assert_eq!(report.status, BridgeState::NotStarted);
        assert!(!report.running);
        assert!(report.pid.is_none());
        assert_eq!(report.version.gateway, GATEWAY_VERSION);
    }

    #[tokio::test]
    async fn call_before_start_is_unavailable() {
        let service = Arc::new(GatewayService::new(BridgeConfig::default()));

        let err = service.call("tools/list", None, None).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Unavailable(BridgeState::NotStarted)
        ));
    }

    #[tokio::test]
    async fn scripted_child_answers_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let resp = write_frame_file(
            &dir,
            "resp",
            &json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}}),
        );
        let script = format!("read _; read _; cat '{}'; exec cat >/dev/null", resp.display());
        let service = Arc::new(GatewayService::new(sh_bridge(&script)));

        service.start().await.unwrap();
        assert_eq!(service.state().await, BridgeState::Running);
        assert!(service.health().await.pid.is_some());

        let reply = service.call("initialize", None, None).await.unwrap();
        assert_eq!(reply, RpcReply::Result(json!({"ok": true})));

        service.stop().await;
        assert_eq!(service.state().await, BridgeState::Stopped);
    }

    #[tokio::test]
    async fn child_error_member_passes_through_as_reply() {
        let dir = tempfile::tempdir().unwrap();
        let resp = write_frame_file(
            &dir,
            "resp",
            &json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32601, "message": "method not found"},
            }),
        );
        let script = format!("read _; read _; cat '{}'; exec cat >/dev/null", resp.display());
        let service = Arc::new(GatewayService::new(sh_bridge(&script)));
        service.start().await.unwrap();

        let reply = service.call("definitely/missing", None, None).await.unwrap();
        assert_eq!(
            reply,
            RpcReply::Error(json!({"code": -32601, "message": "method not found"}))
        );
        assert_eq!(service.state().await, BridgeState::Running);
    }

    #[tokio::test]
    async fn silent_child_times_out_and_bridge_stays_running() {
        let service = Arc::new(GatewayService::new(sh_bridge("exec cat >/dev/null")));
        service.start().await.unwrap();

        let begun = tokio::time::Instant::now();
        let err = service
            .call("tools/list", None, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        let elapsed = begun.elapsed();

        match err {
            BridgeError::Timeout(waited) => assert_eq!(waited, Duration::from_secs(1)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(elapsed >= Duration::from_millis(900), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "returned too late: {elapsed:?}");
        assert_eq!(service.state().await, BridgeState::Running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_child_fails_pending_call_then_reports_crashed() {
        let service = Arc::new(GatewayService::new(sh_bridge("exec cat >/dev/null")));
        service.start().await.unwrap();
        let pid = service.health().await.pid.unwrap();

        let call_task = tokio::spawn({
            let service = service.clone();
            async move {
                service
                    .call("tools/list", None, Some(Duration::from_secs(30)))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();

        let err = timeout(WAIT, call_task).await.unwrap().unwrap().unwrap_err();
        match err {
            BridgeError::ChildExited { status } => assert_eq!(status.signal, Some(9)),
            other => panic!("expected child exit, got {other:?}"),
        }

        wait_for_state(&service, BridgeState::Crashed).await;
        let report = service.health().await;
        assert_eq!(report.exit_status.unwrap().signal, Some(9));

        let err = service.call("tools/list", None, None).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Unavailable(BridgeState::Crashed)
        ));
    }

    #[tokio::test]
    async fn restart_after_stop_gets_a_fresh_child() {
        let dir = tempfile::tempdir().unwrap();
        let resp = write_frame_file(
            &dir,
            "resp",
            &json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}}),
        );
        let script = format!("read _; read _; cat '{}'; exec cat >/dev/null", resp.display());
        let service = Arc::new(GatewayService::new(sh_bridge(&script)));

        service.start().await.unwrap();
        service.stop().await;
        assert_eq!(service.state().await, BridgeState::Stopped);

        service.start().await.unwrap();
        assert_eq!(service.state().await, BridgeState::Running);

        // Fresh correlator: ids restart at 1, so the canned reply matches.
        let reply = service.call("initialize", None, None).await.unwrap();
        assert_eq!(reply, RpcReply::Result(json!({"ok": true})));
        service.stop().await;
    }

    #[tokio::test]
    async fn restart_after_crash_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("crashed-once");
        // Crashes on the first run, stays up on the second.
        let script = format!(
            "if [ -e '{0}' ]; then exec cat >/dev/null; else : > '{0}'; exit 3; fi",
            marker.display()
        );
        let service = Arc::new(GatewayService::new(sh_bridge(&script)));

        service.start().await.unwrap();
        wait_for_state(&service, BridgeState::Crashed).await;
        assert_eq!(service.health().await.exit_status.unwrap().code, Some(3));

        service.start().await.unwrap();
        assert_eq!(service.state().await, BridgeState::Running);
        service.stop().await;
        assert_eq!(service.state().await, BridgeState::Stopped);
    }

    #[tokio::test]
    async fn start_while_running_is_refused() {
        let service = Arc::new(GatewayService::new(sh_bridge("exec cat >/dev/null")));
        service.start().await.unwrap();

        let err = service.start().await.unwrap_err();
        match err {
            BridgeError::Startup(msg) => assert!(msg.contains("already active")),
            other => panic!("expected startup error, got {other:?}"),
        }
        service.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let service = Arc::new(GatewayService::new(sh_bridge("exec cat >/dev/null")));
        service.start().await.unwrap();

        tokio::join!(service.stop(), service.stop());
        assert_eq!(service.state().await, BridgeState::Stopped);

        // And again, long after the child is gone.
        service.stop().await;
        assert_eq!(service.state().await, BridgeState::Stopped);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let service = Arc::new(GatewayService::new(BridgeConfig::default()));
        service.stop().await;
        assert_eq!(service.state().await, BridgeState::NotStarted);
    }

    #[tokio::test]
    async fn auto_initialize_handshake_runs_once_before_first_call() {
        let dir = tempfile::tempdir().unwrap();
        let init = write_frame_file(
            &dir,
            "init",
            &json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "serverInfo": {"name": "github-mcp-server", "version": "9.9.9"},
                },
            }),
        );
        let tools = write_frame_file(
            &dir,
            "tools",
            &json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": {"tools": [{"name": "get_issue"}]},
            }),
        );
        // Frames carry no trailing newline, so each later header line is
        // consumed together with the previous frame's payload.
        let script = format!(
            "read _; read _; cat '{}'; read _; read _; read _; read _; cat '{}'; exec cat >/dev/null",
            init.display(),
            tools.display(),
        );
        let config = sh_bridge(&script).with_auto_initialize(true);
        let service = Arc::new(GatewayService::new(config));
        service.start().await.unwrap();

        let reply = timeout(WAIT, service.call("tools/list", None, None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            reply,
            RpcReply::Result(json!({"tools": [{"name": "get_issue"}]}))
        );

        let report = service.health().await;
        assert_eq!(
            report.version.server_name,
            Some("github-mcp-server".to_string())
        );
        assert_eq!(report.version.server_version, Some("9.9.9".to_string()));
        service.stop().await;
    }

    #[tokio::test]
    async fn concurrent_calls_multiplex_over_one_child() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_frame_file(
            &dir,
            "first",
            &json!({"jsonrpc": "2.0", "id": 1, "result": {"n": 1}}),
        );
        let second = write_frame_file(
            &dir,
            "second",
            &json!({"jsonrpc": "2.0", "id": 2, "result": {"n": 2}}),
        );
        // Answer in reverse order once both requests are in.
        let script = format!(
            "read _; read _; read _; read _; cat '{}'; cat '{}'; exec cat >/dev/null",
            second.display(),
            first.display(),
        );
        let service = Arc::new(GatewayService::new(sh_bridge(&script)));
        service.start().await.unwrap();

        let (a, b) = tokio::join!(
            service.call("alpha", None, None),
            service.call("beta", None, None),
        );
        assert_eq!(a.unwrap(), RpcReply::Result(json!({"n": 1})));
        assert_eq!(b.unwrap(), RpcReply::Result(json!({"n": 2})));
        service.stop().await;
    }
}
