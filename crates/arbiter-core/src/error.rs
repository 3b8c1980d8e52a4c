//! Error types for the Arbiter node subsystem.
//!
//! One error enum serves both workspace crates so that orchestration code can
//! hand any failure to the wire layer and get a well-formed error code back.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Arbiter node communication and orchestration.
#[derive(Debug, Error)]
pub enum ArbiterError {
    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Not connected to node: {id}")]
    NotConnected { id: String },

    // Wire protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid params for {method}: {message}")]
    InvalidParams { method: String, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("YAML error: {message}")]
    Yaml {
        message: String,
        #[source]
        source: Option<serde_yaml::Error>,
    },

    // Manifest and configuration errors
    #[error("Manifest error at {path:?}: {message}")]
    Manifest {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // Node lifecycle errors
    #[error("Node not found: {id}")]
    NodeNotFound { id: String },

    #[error("Node already running: {id}")]
    AlreadyRunning { id: String },

    #[error("Failed to spawn node {id}: {message}")]
    SpawnFailed { id: String, message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Resource limit exceeded: {message}")]
    ResourceLimit { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Arbiter operations.
pub type Result<T> = std::result::Result<T, ArbiterError>;

// Conversion implementations for common error types

impl From<std::io::Error> for ArbiterError {
    fn from(err: std::io::Error) -> Self {
        ArbiterError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_yaml::Error> for ArbiterError {
    fn from(err: serde_yaml::Error) -> Self {
        ArbiterError::Yaml {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ArbiterError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ArbiterError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Convert to a YAML-RPC error code.
    ///
    /// Standard codes (JSON-RPC compatible):
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Node codes (application-defined, -1000 to -1005):
    /// - -1000: Node initialization error
    /// - -1001: Node configuration error
    /// - -1002: Node validation error
    /// - -1003: Node execution timeout
    /// - -1004: Node resource limit
    /// - -1005: Node internal error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            ArbiterError::Protocol { .. } | ArbiterError::Yaml { .. } => -32700,

            ArbiterError::InvalidRequest { .. } => -32600,

            ArbiterError::MethodNotFound { .. } => -32601,

            ArbiterError::InvalidParams { .. } => -32602,

            ArbiterError::Transport { .. }
            | ArbiterError::NotConnected { .. }
            | ArbiterError::Io { .. } => -32603,

            ArbiterError::SpawnFailed { .. } | ArbiterError::AlreadyRunning { .. } => -1000,

            ArbiterError::Manifest { .. }
            | ArbiterError::Config { .. }
            | ArbiterError::NodeNotFound { .. } => -1001,

            ArbiterError::Validation { .. } => -1002,

            ArbiterError::Timeout(_) => -1003,

            ArbiterError::ResourceLimit { .. } => -1004,

            // All other errors are node-internal errors
            _ => -1005,
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// Used by the registry's connect backoff: a refused or missing socket is
    /// worth retrying while the node finishes starting up; a manifest or
    /// validation problem is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArbiterError::Transport { .. } | ArbiterError::Timeout(_) | ArbiterError::Io { .. }
        )
    }
}
