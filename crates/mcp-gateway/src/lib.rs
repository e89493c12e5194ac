//! mcp-gateway: HTTP gateway for stdio JSON-RPC / MCP servers.

mod correlator;
mod diagnostics;
mod health;
mod version;

pub mod error;
pub mod process;
pub mod rpc;
pub mod service;
pub mod transport;

pub use correlator::RequestCorrelator;

pub use diagnostics::{STDERR_TARGET, spawn_stderr_forwarder};
pub use error::BridgeError;
pub use health::{BridgeState, HealthReport};
pub use process::{ExitStatusInfo, ProcessConfig, ServerProcess};
pub use rpc::codec::{ContentLengthCodec, FramingError};
pub use rpc::protocol::{RequestId, RpcReply, RpcRequest};
pub use service::{BridgeConfig, GatewayService};
pub use transport::{ServerConfig, serve};
pub use version::{GATEWAY_VERSION, VersionInfo};
