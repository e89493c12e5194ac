//! Bridge lifecycle state and health reporting types.

use serde::{Deserialize, Serialize};

use crate::process::ExitStatusInfo;
use crate::version::VersionInfo;

/// Lifecycle state of the bridge.
///
/// NOT_STARTED → RUNNING → (STOPPING → STOPPED | CRASHED). STOPPED and
/// CRASHED both permit a fresh start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeState {
    /// No child has been launched yet
    #[default]
    NotStarted,
    /// Child is up, calls are accepted
    Running,
    /// Orderly stop in progress
    Stopping,
    /// Child exited after an orderly stop
    Stopped,
    /// Child exited without being asked to
    Crashed,
}

impl BridgeState {
    pub fn is_running(&self) -> bool {
        matches!(self, BridgeState::Running)
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BridgeState::NotStarted => "NOT_STARTED",
            BridgeState::Running => "RUNNING",
            BridgeState::Stopping => "STOPPING",
            BridgeState::Stopped => "STOPPED",
            BridgeState::Crashed => "CRASHED",
        };
        write!(f, "{name}")
    }
}

/// Snapshot returned by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: BridgeState,
    /// True exactly when `status` is RUNNING.
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the child was started (ISO 8601 format).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Exit status of the previous child, once it has exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<ExitStatusInfo>,
    pub version: VersionInfo,
}
