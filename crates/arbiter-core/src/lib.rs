//! Arbiter Core - YAML-RPC protocol, transport, client and server for
//! Arbiter nodes.
//!
//! This crate provides the communication layer every Arbiter node and the
//! orchestrator share: the `yamlrpc` message model, length-prefixed framing
//! over Unix domain sockets, a correlating client, and a dispatching
//! server. Node discovery and lifecycle live in the `arbiter-orchestrator`
//! crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use arbiter_core::yamlrpc::{RpcClient, RpcServer};
//! use serde_yaml::Value;
//!
//! #[tokio::main]
//! async fn main() -> arbiter_core::Result<()> {
//!     // Node side: expose the standard method surface.
//!     let server = RpcServer::new();
//!     server.register_method("node.health", |_params| Ok(Value::from(true)));
//!     let _handle = server.start("/tmp/demo-node.sock").await?;
//!
//!     // Orchestrator side: connect and call.
//!     let client = RpcClient::new("/tmp/demo-node.sock");
//!     client.connect().await?;
//!     let reply = client.node_health().await;
//!     println!("health: {:?}", reply);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod yamlrpc;

// Re-export commonly used types
pub use error::{ArbiterError, Result};
pub use yamlrpc::{ErrorCode, RpcClient, RpcMessage, RpcServer, RpcServerHandle};
