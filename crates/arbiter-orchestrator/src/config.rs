//! Centralized configuration for the orchestrator.
//!
//! This module provides configuration constants for node discovery, process
//! lifecycle, and health monitoring.

use std::time::Duration;

/// Node discovery configuration.
pub struct DiscoveryConfig;

impl DiscoveryConfig {
    /// Directory scanned for node manifests, relative to the working
    /// directory unless an absolute path is configured.
    pub const DEFAULT_BASE_DIR: &'static str = ".arbiter/nodes";

    /// File names recognized as node manifests.
    pub const MANIFEST_PATTERNS: [&'static str; 2] = ["manifest.yaml", "node.yaml"];

    /// Interval between background scans.
    pub const SCAN_INTERVAL: Duration = Duration::from_secs(10);
}

/// Node registry and lifecycle configuration.
pub struct RegistryConfig;

impl RegistryConfig {
    /// Interval between health-monitor passes.
    pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

    // connect_node retry schedule
    pub const CONNECT_RETRY_ATTEMPTS: u32 = 5;
    pub const CONNECT_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);
    pub const CONNECT_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

    /// Grace period passed along with `node.shutdown`, in seconds.
    pub const SHUTDOWN_GRACE_SECS: u64 = 10;

    /// How long a process gets between SIGTERM and SIGKILL.
    pub const STOP_KILL_WAIT: Duration = Duration::from_secs(2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_schedule_is_bounded() {
        assert!(RegistryConfig::CONNECT_RETRY_ATTEMPTS >= 1);
        assert!(RegistryConfig::CONNECT_RETRY_INITIAL_DELAY <= RegistryConfig::CONNECT_RETRY_MAX_DELAY);
    }

    #[test]
    fn test_manifest_patterns_are_yaml() {
        for pattern in DiscoveryConfig::MANIFEST_PATTERNS {
            assert!(pattern.ends_with(".yaml"));
        }
    }
}
