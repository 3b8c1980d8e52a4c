//! Centralized configuration for the Arbiter wire layer.
//!
//! Tuning constants for framing, connection handling, and call timeouts.
//! Orchestration-level constants live in `arbiter-orchestrator`.

use std::time::Duration;

/// Wire protocol configuration.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Protocol tag carried in every message (`yamlrpc: "1.0"`).
    pub const VERSION: &'static str = "1.0";

    /// Upper bound on a single framed payload. A length header above this is
    /// treated as protocol corruption, not an allocation request.
    pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024; // 10MB
}

/// Client-side connection and call configuration.
pub struct ClientConfig;

impl ClientConfig {
    /// Ceiling for establishing a socket connection.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default ceiling for one request/response exchange. Overridable per
    /// client via `RpcClient::with_timeout` and per call via
    /// `call_with_timeout`.
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Server-side configuration.
pub struct ServerConfig;

impl ServerConfig {
    /// Maximum simultaneously served connections per server.
    pub const MAX_CONNECTIONS: usize = 64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(ClientConfig::CALL_TIMEOUT > ClientConfig::CONNECT_TIMEOUT);
        assert!(ClientConfig::CONNECT_TIMEOUT > Duration::ZERO);
    }

    #[test]
    fn test_frame_cap_fits_header() {
        // The length header is a u32; the cap must be representable in it.
        assert!(ProtocolConfig::MAX_FRAME_SIZE <= u32::MAX as usize);
    }
}
