//! Stderr passthrough from the child server.
//!
//! The GitHub MCP server writes its own diagnostics to stderr. Those lines
//! are republished through tracing so they land in the gateway's log
//! stream, tagged with a fixed target marking their origin.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Target every republished child stderr line is logged under.
pub const STDERR_TARGET: &str = "mcp_gateway::stderr";

/// Reads `reader` line by line, invoking `handle` for each line until the
/// stream closes. A partial final line is delivered without its newline.
/// Read failures end the loop; nothing is surfaced to the caller.
pub async fn copy_lines<R, F>(reader: R, mut handle: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => handle(&line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Server stderr closed uncleanly");
                break;
            }
        }
    }
}

/// Forwards child stderr through tracing for the child's lifetime.
pub fn spawn_stderr_forwarder<R>(stderr: R) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(copy_lines(stderr, |line| {
        tracing::info!(target: STDERR_TARGET, "{line}");
    }))
}
