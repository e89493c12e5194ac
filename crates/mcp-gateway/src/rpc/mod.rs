//! Wire layer for talking JSON-RPC to the child server.
//!
//! # Architecture
//!
//! - **protocol**: Message types (RpcRequest, RpcReply, request ids)
//! - **codec**: Content-Length framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
