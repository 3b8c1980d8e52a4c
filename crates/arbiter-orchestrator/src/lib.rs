//! Arbiter Orchestrator - node discovery, process lifecycle, and the node
//! registry.
//!
//! This crate sits on top of `arbiter-core`'s YAML-RPC layer. It finds node
//! manifests on disk, spawns the processes they describe, connects to their
//! sockets, and supervises them: health probes, crash detection, restarts,
//! and orderly shutdown.
//!
//! # Example
//!
//! ```rust,ignore
//! use arbiter_orchestrator::{NodeRegistry, RegistryConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> arbiter_core::Result<()> {
//!     let registry = Arc::new(NodeRegistry::new());
//!     registry.enable_discovery(".arbiter/nodes");
//!     registry.scan_now().await;
//!
//!     for (id, started) in registry.start_all().await {
//!         println!("{}: started={}", id, started);
//!     }
//!     registry.connect_node("yaml-validator").await?;
//!     registry.start_health_monitoring(RegistryConfig::HEALTH_CHECK_INTERVAL);
//!
//!     // ... dispatch work via registry.execute_node(...) ...
//!
//!     registry.stop_all().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod manifest;
pub mod process;
pub mod registry;

// Re-export commonly used types
pub use config::{DiscoveryConfig, RegistryConfig};
pub use discovery::{DiscoveryEvent, DiscoveryScanner};
pub use manifest::NodeManifest;
pub use registry::{NodeRegistry, NodeState, NodeStatus, RetryPolicy};
