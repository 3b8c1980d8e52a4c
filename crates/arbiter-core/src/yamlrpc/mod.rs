//! YAML-RPC over Unix domain sockets.
//!
//! The wire protocol every Arbiter node speaks: length-prefixed YAML
//! documents carrying request, response, and error messages. One socket
//! per node; the orchestrator connects as a client, the node serves.
//!
//! # Architecture
//!
//! - **Message**: the `yamlrpc` document model and its codec
//! - **Transport**: framing plus Unix-socket connect/listen plumbing
//! - **Client**: correlated, timeout-bounded calls against a node socket
//! - **Server**: method registry and dispatch loop on the node side

pub mod client;
pub mod message;
pub mod server;
pub mod transport;

pub use client::RpcClient;
pub use message::{ErrorCode, RpcMessage};
pub use server::{MethodHandler, RpcServer, RpcServerHandle};
pub use transport::{read_frame, write_frame, Transport, TransportListener};
