//! Error taxonomy for the bridge.

use std::time::Duration;

use crate::health::BridgeState;
use crate::process::ExitStatusInfo;
use crate::rpc::codec::FramingError;

/// Failures produced by the bridge itself.
///
/// A JSON-RPC `error` member returned by the child is not one of these:
/// that is a successful call whose answer happens to be an error, and it
/// passes through untouched.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The child could not be launched or initialized.
    #[error("failed to start server: {0}")]
    Startup(String),

    /// A frame could not be encoded or decoded.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Writing to or reading from the child's pipes failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// No response arrived within the per-request deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The child exited while the request was outstanding.
    #[error("server exited while request was in flight ({status})")]
    ChildExited { status: ExitStatusInfo },

    /// The bridge is not in a state that accepts calls.
    #[error("server is not available (state {0})")]
    Unavailable(BridgeState),
}

impl BridgeError {
    /// Stable lowercase tag used in HTTP bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Startup(_) => "startup",
            BridgeError::Framing(_) => "framing",
            BridgeError::Transport(_) => "transport",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::ChildExited { .. } => "child_exited",
            BridgeError::Unavailable(_) => "unavailable",
        }
    }
}
