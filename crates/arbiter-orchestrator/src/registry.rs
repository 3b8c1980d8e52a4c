//! Node registry: lifecycle orchestration over discovered manifests.
//!
//! The registry owns one record per node id and drives it through spawn,
//! connect, health monitoring, and shutdown. One mutex guards the record
//! map and is never held across a spawn, an RPC, or a sleep; long
//! operations snapshot under the lock, block outside it, and re-lock to
//! commit.

use crate::config::RegistryConfig;
use crate::discovery::{DiscoveryEvent, DiscoveryScanner};
use crate::manifest::NodeManifest;
use crate::process;
use arbiter_core::{ArbiterError, Result, RpcClient, RpcMessage};
use chrono::{DateTime, Utc};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Manifest known, process not started.
    Discovered,
    /// Spawn in progress.
    Starting,
    /// Process spawned, no RPC connection yet.
    Running,
    /// RPC connection established, no health verdict yet.
    Connected,
    /// Last health probe succeeded.
    Healthy,
    /// Last health probe failed.
    Unhealthy,
    /// Shutdown in progress.
    Stopping,
    /// Process terminated (or never observed alive).
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Discovered => "discovered",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Connected => "connected",
            NodeState::Healthy => "healthy",
            NodeState::Unhealthy => "unhealthy",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Retry parameters for `connect_node`.
///
/// A freshly spawned node needs time to bind its socket, so the first
/// connection attempt routinely fails. Delays double per attempt up to
/// `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: RegistryConfig::CONNECT_RETRY_ATTEMPTS,
            initial_delay: RegistryConfig::CONNECT_RETRY_INITIAL_DELAY,
            max_delay: RegistryConfig::CONNECT_RETRY_MAX_DELAY,
        }
    }
}

/// Point-in-time snapshot of one node's registry record.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: String,
    pub name: String,
    pub state: NodeState,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub connected: bool,
    pub healthy: bool,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl NodeStatus {
    /// Condensed status for operator-facing listings.
    pub fn status_string(&self) -> &'static str {
        if self.pid.is_none() {
            "stopped"
        } else if !self.connected {
            "running-disconnected"
        } else if self.healthy {
            "running-healthy"
        } else {
            "running-unhealthy"
        }
    }
}

struct NodeRecord {
    manifest: Arc<NodeManifest>,
    source_path: Option<PathBuf>,
    state: NodeState,
    pid: Option<u32>,
    restart_count: u32,
    registered_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    last_health_check: Option<DateTime<Utc>>,
    healthy: bool,
    client: Option<Arc<RpcClient>>,
}

impl NodeRecord {
    fn new(manifest: Arc<NodeManifest>, source_path: Option<PathBuf>) -> Self {
        Self {
            manifest,
            source_path,
            state: NodeState::Discovered,
            pid: None,
            restart_count: 0,
            registered_at: Utc::now(),
            started_at: None,
            last_health_check: None,
            healthy: false,
            client: None,
        }
    }

    fn snapshot(&self, id: &str) -> NodeStatus {
        NodeStatus {
            id: id.to_string(),
            name: self.manifest.name.clone(),
            state: self.state,
            pid: self.pid,
            restart_count: self.restart_count,
            connected: self.client.as_ref().is_some_and(|c| c.is_connected()),
            healthy: self.healthy,
            registered_at: self.registered_at,
            started_at: self.started_at,
            last_health_check: self.last_health_check,
        }
    }
}

/// Registry of external node processes.
///
/// Explicitly constructed; hold it in an `Arc` so discovery callbacks and
/// the health-monitor loop can reference it. Dropping the registry stops
/// its background tasks but leaves node processes running; call
/// [`stop_all`](Self::stop_all) first for an orderly shutdown.
pub struct NodeRegistry {
    nodes: Mutex<HashMap<String, NodeRecord>>,
    retry: RetryPolicy,
    stop_kill_wait: Duration,
    discovery: Mutex<Option<Arc<DiscoveryScanner>>>,
    discovery_enabled: AtomicBool,
    monitoring_active: AtomicBool,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            retry: RetryPolicy::default(),
            stop_kill_wait: RegistryConfig::STOP_KILL_WAIT,
            discovery: Mutex::new(None),
            discovery_enabled: AtomicBool::new(false),
            monitoring_active: AtomicBool::new(false),
            monitor_task: Mutex::new(None),
        }
    }

    /// Override the connect retry parameters.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    // Registration

    /// Register a node manifest by hand.
    ///
    /// The manifest must pass [`NodeManifest::validate`]. Re-registering an
    /// existing id replaces the stored manifest and leaves the process
    /// state (pid, client, restart counter) untouched.
    pub fn register_node(
        &self,
        manifest: NodeManifest,
        source_path: Option<PathBuf>,
    ) -> Result<()> {
        let errors = manifest.validate();
        if !errors.is_empty() {
            return Err(ArbiterError::Manifest {
                message: errors.join("; "),
                path: source_path,
            });
        }
        self.upsert(Arc::new(manifest), source_path);
        Ok(())
    }

    /// Remove a node, stopping its process first.
    pub async fn unregister_node(&self, id: &str) -> Result<()> {
        let record = {
            self.nodes
                .lock()
                .unwrap()
                .remove(id)
                .ok_or_else(|| ArbiterError::NodeNotFound { id: id.to_string() })?
        };
        shutdown_node(record.client, record.pid, self.stop_kill_wait).await;
        info!("Unregistered node {}", id);
        Ok(())
    }

    /// Stop every node and drop all records.
    pub async fn clear(&self) {
        let records: Vec<NodeRecord> = {
            self.nodes.lock().unwrap().drain().map(|(_, r)| r).collect()
        };
        for record in records {
            shutdown_node(record.client, record.pid, self.stop_kill_wait).await;
        }
    }

    fn upsert(&self, manifest: Arc<NodeManifest>, source_path: Option<PathBuf>) {
        let id = manifest.id.clone();
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.get_mut(&id) {
            Some(record) => {
                debug!("Updated manifest for node {}", id);
                record.manifest = manifest;
                if source_path.is_some() {
                    record.source_path = source_path;
                }
            }
            None => {
                info!("Registered node {}", id);
                nodes.insert(id, NodeRecord::new(manifest, source_path));
            }
        }
    }

    // Discovery wiring

    /// Attach a manifest scanner over `base_dir` and start its background
    /// loop. Discovered manifests register themselves, Changed events
    /// replace the stored manifest without touching process state, and Lost
    /// events stop and remove the node.
    ///
    /// The loop's first pass runs after one scan interval; call
    /// [`scan_now`](Self::scan_now) for an immediate walk.
    pub fn enable_discovery(self: &Arc<Self>, base_dir: impl Into<PathBuf>) {
        let scanner = Arc::new(DiscoveryScanner::new(base_dir));

        // Weak: the scanner's callback list must not keep the registry
        // alive after its owner drops it.
        let registry = Arc::downgrade(self);
        scanner.on_event(move |event| {
            if let Some(registry) = Weak::upgrade(&registry) {
                if registry.discovery_enabled.load(Ordering::SeqCst) {
                    registry.apply_discovery_event(event);
                }
            }
        });

        let old = {
            let mut slot = self.discovery.lock().unwrap();
            let old = slot.take();
            *slot = Some(Arc::clone(&scanner));
            old
        };
        if let Some(old) = old {
            old.stop_scanning();
        }

        self.discovery_enabled.store(true, Ordering::SeqCst);
        scanner.start_scanning();
        info!("Node discovery enabled at {:?}", scanner.base_dir());
    }

    /// Stop the scanner loop and detach it. Registered nodes stay.
    pub fn disable_discovery(&self) {
        self.discovery_enabled.store(false, Ordering::SeqCst);
        if let Some(scanner) = self.discovery.lock().unwrap().take() {
            scanner.stop_scanning();
            info!("Node discovery disabled");
        }
    }

    /// Run one manifest scan immediately and return its events. Empty when
    /// discovery is not enabled.
    pub async fn scan_now(&self) -> Vec<DiscoveryEvent> {
        let scanner = { self.discovery.lock().unwrap().clone() };
        match scanner {
            Some(scanner) => scanner.scan_once().await,
            None => Vec::new(),
        }
    }

    fn apply_discovery_event(&self, event: &DiscoveryEvent) {
        match event {
            DiscoveryEvent::Discovered { manifest, path, .. }
            | DiscoveryEvent::Changed { manifest, path, .. } => {
                self.upsert(Arc::clone(manifest), Some(path.clone()));
            }
            DiscoveryEvent::Lost { id } => {
                let record = { self.nodes.lock().unwrap().remove(id) };
                if let Some(record) = record {
                    info!("Node {} manifest lost, cleaning up", id);
                    let kill_wait = self.stop_kill_wait;
                    tokio::spawn(async move {
                        shutdown_node(record.client, record.pid, kill_wait).await;
                    });
                }
            }
        }
    }

    // Lifecycle

    /// Spawn the node's process per its manifest and return the pid.
    pub async fn start_node(&self, id: &str) -> Result<u32> {
        let (manifest, prev_state) = {
            let mut nodes = self.nodes.lock().unwrap();
            let record = nodes
                .get_mut(id)
                .ok_or_else(|| ArbiterError::NodeNotFound { id: id.to_string() })?;
            if record.state == NodeState::Starting {
                return Err(ArbiterError::AlreadyRunning { id: id.to_string() });
            }
            if let Some(pid) = record.pid {
                if process::is_process_alive(pid) {
                    return Err(ArbiterError::AlreadyRunning { id: id.to_string() });
                }
            }
            let prev = record.state;
            record.state = NodeState::Starting;
            (Arc::clone(&record.manifest), prev)
        };

        match process::spawn_node_process(&manifest) {
            Ok(pid) => {
                let mut nodes = self.nodes.lock().unwrap();
                match nodes.get_mut(id) {
                    Some(record) => {
                        record.pid = Some(pid);
                        record.started_at = Some(Utc::now());
                        record.state = NodeState::Running;
                        record.healthy = false;
                        Ok(pid)
                    }
                    // Removed while we were spawning; don't orphan the child.
                    None => {
                        let kill_wait = self.stop_kill_wait;
                        tokio::spawn(async move {
                            let _ = process::terminate_process(pid, kill_wait).await;
                        });
                        Err(ArbiterError::NodeNotFound { id: id.to_string() })
                    }
                }
            }
            Err(e) => {
                let mut nodes = self.nodes.lock().unwrap();
                if let Some(record) = nodes.get_mut(id) {
                    if record.state == NodeState::Starting {
                        record.state = prev_state;
                    }
                }
                Err(e)
            }
        }
    }

    /// Connect to the node's socket, retrying with exponential backoff.
    ///
    /// Idempotent when a live connection already exists. The client's call
    /// ceiling comes from the manifest's `resources.timeout_seconds`.
    pub async fn connect_node(&self, id: &str) -> Result<()> {
        let (socket_path, call_timeout, stale) = {
            let mut nodes = self.nodes.lock().unwrap();
            let record = nodes
                .get_mut(id)
                .ok_or_else(|| ArbiterError::NodeNotFound { id: id.to_string() })?;
            if record.client.as_ref().is_some_and(|c| c.is_connected()) {
                return Ok(());
            }
            (
                PathBuf::from(&record.manifest.communication.socket_path),
                Duration::from_secs(record.manifest.resources.timeout_seconds),
                record.client.take(),
            )
        };
        if let Some(stale) = stale {
            stale.disconnect().await;
        }

        let client = Arc::new(RpcClient::new(&socket_path).with_timeout(call_timeout));
        let mut delay = self.retry.initial_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match client.connect().await {
                Ok(()) => break,
                Err(e) if attempt >= self.retry.attempts || !e.is_retryable() => {
                    warn!(
                        "Failed to connect to node {} after {} attempts: {}",
                        id, attempt, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        "Connect attempt {}/{} for node {} failed: {}",
                        attempt, self.retry.attempts, id, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry.max_delay);
                }
            }
        }

        let committed = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(id) {
                Some(record) => {
                    record.client = Some(Arc::clone(&client));
                    record.state = NodeState::Connected;
                    // No health verdict until the first health check.
                    record.healthy = false;
                    true
                }
                None => false,
            }
        };
        if !committed {
            // Removed while we were connecting.
            client.disconnect().await;
            return Err(ArbiterError::NodeNotFound { id: id.to_string() });
        }
        info!("Connected to node {} at {:?}", id, socket_path);
        Ok(())
    }

    /// Drop the node's RPC connection, leaving its process running.
    pub async fn disconnect_node(&self, id: &str) -> Result<()> {
        let client = {
            let mut nodes = self.nodes.lock().unwrap();
            let record = nodes
                .get_mut(id)
                .ok_or_else(|| ArbiterError::NodeNotFound { id: id.to_string() })?;
            record.healthy = false;
            if record.pid.is_some() {
                record.state = NodeState::Running;
            }
            record.client.take()
        };
        if let Some(client) = client {
            client.disconnect().await;
        }
        Ok(())
    }

    /// Stop a node: best-effort graceful shutdown over RPC, then the
    /// SIGTERM/SIGKILL ladder. Returns whether the process is confirmed
    /// gone.
    pub async fn stop_node(&self, id: &str) -> Result<bool> {
        let (client, pid) = {
            let mut nodes = self.nodes.lock().unwrap();
            let record = nodes
                .get_mut(id)
                .ok_or_else(|| ArbiterError::NodeNotFound { id: id.to_string() })?;
            record.state = NodeState::Stopping;
            record.healthy = false;
            (record.client.take(), record.pid.take())
        };

        let gone = shutdown_node(client, pid, self.stop_kill_wait).await;

        let mut nodes = self.nodes.lock().unwrap();
        if let Some(record) = nodes.get_mut(id) {
            record.state = NodeState::Stopped;
        }
        info!("Stopped node {}", id);
        Ok(gone)
    }

    /// Stop (failures ignored) and start a node. The restart counter
    /// increments exactly once per invocation, whether or not the start
    /// succeeds.
    pub async fn restart_node(&self, id: &str) -> Result<u32> {
        {
            let mut nodes = self.nodes.lock().unwrap();
            let record = nodes
                .get_mut(id)
                .ok_or_else(|| ArbiterError::NodeNotFound { id: id.to_string() })?;
            record.restart_count += 1;
        }
        if let Err(e) = self.stop_node(id).await {
            debug!("Ignoring stop failure during restart of {}: {}", id, e);
        }
        self.start_node(id).await
    }

    // RPC passthrough

    /// Call an arbitrary method on a connected node.
    ///
    /// `Err` means the node is unknown or has no attached client; transport
    /// faults on a live client come back as Error-typed messages.
    pub async fn call_node(
        &self,
        id: &str,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<RpcMessage> {
        let client = self.client_for(id)?;
        Ok(client.call(method, params).await)
    }

    pub async fn node_info(&self, id: &str) -> Result<RpcMessage> {
        let client = self.client_for(id)?;
        Ok(client.node_info().await)
    }

    pub async fn validate_node(&self, id: &str, input: Value) -> Result<RpcMessage> {
        let client = self.client_for(id)?;
        Ok(client.node_validate(input).await)
    }

    pub async fn execute_node(&self, id: &str, input: Value, context: Value) -> Result<RpcMessage> {
        let client = self.client_for(id)?;
        Ok(client.node_execute(input, context).await)
    }

    fn client_for(&self, id: &str) -> Result<Arc<RpcClient>> {
        let nodes = self.nodes.lock().unwrap();
        let record = nodes
            .get(id)
            .ok_or_else(|| ArbiterError::NodeNotFound { id: id.to_string() })?;
        record
            .client
            .clone()
            .ok_or_else(|| ArbiterError::NotConnected { id: id.to_string() })
    }

    // Health

    /// Probe one node with `node.health` and record the verdict. A node
    /// without an attached client reads unhealthy without being probed.
    pub async fn health_check(&self, id: &str) -> bool {
        let client = match self.client_for(id) {
            Ok(client) => client,
            Err(_) => return false,
        };
        let reply = client.node_health().await;
        let healthy = matches!(
            &reply,
            RpcMessage::Response { result, .. } if result.as_bool() == Some(true)
        );

        let mut nodes = self.nodes.lock().unwrap();
        if let Some(record) = nodes.get_mut(id) {
            record.last_health_check = Some(Utc::now());
            if record.client.is_some() {
                record.healthy = healthy;
                record.state = if healthy {
                    NodeState::Healthy
                } else {
                    NodeState::Unhealthy
                };
            }
        }
        healthy
    }

    /// Probe every registered node. Disconnected nodes report `false`.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for id in self.node_ids() {
            let healthy = self.health_check(&id).await;
            results.insert(id, healthy);
        }
        results
    }

    /// Start the periodic health monitor. One loop per registry; repeated
    /// calls while active are no-ops. Each pass first marks nodes whose
    /// process has exited as Stopped, then probes the connected remainder.
    /// Unhealthy nodes are recorded, not restarted.
    pub fn start_health_monitoring(self: &Arc<Self>, interval: Duration) {
        if self.monitoring_active.swap(true, Ordering::SeqCst) {
            debug!("Health monitoring is already active");
            return;
        }
        info!("Starting node health monitoring every {:?}", interval);

        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while registry.monitoring_active.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;
                if !registry.monitoring_active.load(Ordering::SeqCst) {
                    break;
                }
                registry.run_health_pass().await;
            }
        });
        *self.monitor_task.lock().unwrap() = Some(handle);
    }

    /// Stop the health monitor loop.
    pub fn stop_health_monitoring(&self) {
        if !self.monitoring_active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.monitor_task.lock().unwrap().take() {
            handle.abort();
        }
        info!("Stopped node health monitoring");
    }

    async fn run_health_pass(&self) {
        // Crash detection: reconcile recorded pids with the process table.
        let spawned: Vec<(String, u32)> = {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .iter()
                .filter_map(|(id, r)| r.pid.map(|pid| (id.clone(), pid)))
                .collect()
        };
        let mut dead_clients = Vec::new();
        for (id, pid) in spawned {
            if process::is_process_alive(pid) {
                continue;
            }
            warn!("Node {} process {} exited unexpectedly", id, pid);
            let mut nodes = self.nodes.lock().unwrap();
            if let Some(record) = nodes.get_mut(&id) {
                if record.pid == Some(pid) {
                    record.pid = None;
                    record.state = NodeState::Stopped;
                    record.healthy = false;
                    if let Some(client) = record.client.take() {
                        dead_clients.push(client);
                    }
                }
            }
        }
        for client in dead_clients {
            client.disconnect().await;
        }

        let connected: Vec<String> = {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .iter()
                .filter(|(_, r)| r.client.is_some())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in connected {
            let healthy = self.health_check(&id).await;
            debug!("Health check for node {}: {}", id, healthy);
        }
    }

    // Batch operations

    /// Start every registered node. Per-node success map; one failure never
    /// aborts the rest.
    pub async fn start_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for id in self.node_ids() {
            let started = match self.start_node(&id).await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Failed to start node {}: {}", id, e);
                    false
                }
            };
            results.insert(id, started);
        }
        results
    }

    /// Stop every registered node. Per-node map of "process confirmed
    /// gone".
    pub async fn stop_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for id in self.node_ids() {
            let stopped = self.stop_node(&id).await.unwrap_or(false);
            results.insert(id, stopped);
        }
        results
    }

    // Introspection

    /// Registered node ids, sorted.
    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(id)
    }

    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(id).map(|record| record.snapshot(id))
    }

    /// Condensed per-node status strings (`stopped`,
    /// `running-disconnected`, `running-unhealthy`, `running-healthy`).
    pub fn registry_status(&self) -> HashMap<String, String> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    record.snapshot(id).status_string().to_string(),
                )
            })
            .collect()
    }

    pub fn registered_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn running_count(&self) -> usize {
        let nodes = self.nodes.lock().unwrap();
        nodes.values().filter(|r| r.pid.is_some()).count()
    }

    pub fn healthy_count(&self) -> usize {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .values()
            .filter(|r| r.healthy && r.client.is_some())
            .count()
    }

    /// Manifest currently stored for a node.
    pub fn manifest(&self, id: &str) -> Option<Arc<NodeManifest>> {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(id).map(|record| Arc::clone(&record.manifest))
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NodeRegistry {
    fn drop(&mut self) {
        self.monitoring_active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.monitor_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(scanner) = self.discovery.lock().unwrap().take() {
            scanner.stop_scanning();
        }
    }
}

/// Graceful-then-forceful teardown of one node's connection and process.
///
/// The `node.shutdown` request shares `kill_wait` as its reply ceiling so a
/// hung node cannot stall the stop flow. Returns whether the process is
/// confirmed gone.
async fn shutdown_node(
    client: Option<Arc<RpcClient>>,
    pid: Option<u32>,
    kill_wait: Duration,
) -> bool {
    if let Some(client) = client {
        if client.is_connected() {
            let mut params = Mapping::new();
            params.insert(
                Value::from("timeout_seconds"),
                Value::from(RegistryConfig::SHUTDOWN_GRACE_SECS),
            );
            let reply = client
                .call_with_timeout("node.shutdown", Some(Value::Mapping(params)), kill_wait)
                .await;
            if reply.is_error() {
                debug!("Graceful shutdown request was not honored: {:?}", reply);
            }
        }
        client.disconnect().await;
    }

    match pid {
        None => true,
        Some(pid) => match process::terminate_process(pid, kill_wait).await {
            Ok(gone) => gone,
            Err(e) => {
                warn!("Failed to terminate process {}: {}", pid, e);
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manifest(id: &str, command: &str) -> NodeManifest {
        let mut manifest = NodeManifest::default();
        manifest.id = id.to_string();
        manifest.name = format!("{} node", id);
        manifest.runtime.command = command.to_string();
        manifest.communication.socket_path = format!("/tmp/arbiter-test-{}.sock", id);
        manifest
    }

    fn status(
        pid: Option<u32>,
        connected: bool,
        healthy: bool,
    ) -> NodeStatus {
        NodeStatus {
            id: "n".into(),
            name: "n".into(),
            state: NodeState::Discovered,
            pid,
            restart_count: 0,
            connected,
            healthy,
            registered_at: Utc::now(),
            started_at: None,
            last_health_check: None,
        }
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(status(None, false, false).status_string(), "stopped");
        assert_eq!(
            status(Some(1), false, false).status_string(),
            "running-disconnected"
        );
        assert_eq!(
            status(Some(1), true, false).status_string(),
            "running-unhealthy"
        );
        assert_eq!(
            status(Some(1), true, true).status_string(),
            "running-healthy"
        );
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_register_and_introspect() {
        let registry = NodeRegistry::new();
        registry
            .register_node(test_manifest("alpha", "/bin/true"), None)
            .unwrap();

        assert!(registry.contains("alpha"));
        assert_eq!(registry.node_ids(), vec!["alpha".to_string()]);
        assert_eq!(registry.registered_count(), 1);
        assert_eq!(registry.running_count(), 0);

        let status = registry.status("alpha").unwrap();
        assert_eq!(status.state, NodeState::Discovered);
        assert_eq!(status.name, "alpha node");
        assert_eq!(status.status_string(), "stopped");
        assert_eq!(
            registry.registry_status().get("alpha").map(String::as_str),
            Some("stopped")
        );
    }

    #[test]
    fn test_register_rejects_invalid_manifest() {
        let registry = NodeRegistry::new();
        let mut manifest = test_manifest("", "/bin/true");
        manifest.name.clear();

        let err = registry.register_node(manifest, None).unwrap_err();
        assert!(matches!(err, ArbiterError::Manifest { .. }));
        assert!(err.to_string().contains("Missing required field: id"));
        assert_eq!(registry.registered_count(), 0);
    }

    #[test]
    fn test_reregister_keeps_process_state() {
        let registry = NodeRegistry::new();
        registry
            .register_node(test_manifest("alpha", "/bin/true"), None)
            .unwrap();

        let mut updated = test_manifest("alpha", "/bin/true");
        updated.name = "renamed".to_string();
        registry.register_node(updated, None).unwrap();

        assert_eq!(registry.registered_count(), 1);
        let status = registry.status("alpha").unwrap();
        assert_eq!(status.name, "renamed");
        assert_eq!(status.restart_count, 0);
        assert_eq!(status.state, NodeState::Discovered);
    }

    #[tokio::test]
    async fn test_unknown_node_errors() {
        let registry = NodeRegistry::new();

        assert!(matches!(
            registry.start_node("ghost").await,
            Err(ArbiterError::NodeNotFound { .. })
        ));
        assert!(matches!(
            registry.stop_node("ghost").await,
            Err(ArbiterError::NodeNotFound { .. })
        ));
        assert!(matches!(
            registry.unregister_node("ghost").await,
            Err(ArbiterError::NodeNotFound { .. })
        ));
        assert!(matches!(
            registry.call_node("ghost", "node.info", None).await,
            Err(ArbiterError::NodeNotFound { .. })
        ));
        assert!(registry.status("ghost").is_none());
    }

    #[tokio::test]
    async fn test_call_requires_connection() {
        let registry = NodeRegistry::new();
        registry
            .register_node(test_manifest("alpha", "/bin/true"), None)
            .unwrap();

        let err = registry
            .call_node("alpha", "node.info", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::NotConnected { .. }));
        assert!(!registry.health_check("alpha").await);
    }

    #[tokio::test]
    async fn test_start_failure_reverts_state() {
        let registry = NodeRegistry::new();
        registry
            .register_node(test_manifest("broken", "/nonexistent/bin/node"), None)
            .unwrap();

        let err = registry.start_node("broken").await.unwrap_err();
        assert!(matches!(err, ArbiterError::SpawnFailed { .. }));

        let status = registry.status("broken").unwrap();
        assert_eq!(status.state, NodeState::Discovered);
        assert!(status.pid.is_none());
    }

    #[tokio::test]
    async fn test_restart_counter_is_unconditional() {
        let registry = NodeRegistry::new();
        registry
            .register_node(test_manifest("flaky", "/nonexistent/bin/node"), None)
            .unwrap();

        assert!(registry.restart_node("flaky").await.is_err());
        assert_eq!(registry.status("flaky").unwrap().restart_count, 1);

        assert!(registry.restart_node("flaky").await.is_err());
        assert_eq!(registry.status("flaky").unwrap().restart_count, 2);
    }

    #[tokio::test]
    async fn test_stop_without_process_is_idempotent() {
        let registry = NodeRegistry::new();
        registry
            .register_node(test_manifest("idle", "/bin/true"), None)
            .unwrap();

        assert!(registry.stop_node("idle").await.unwrap());
        assert!(registry.stop_node("idle").await.unwrap());
        assert_eq!(registry.status("idle").unwrap().state, NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_batch_maps_cover_every_node() {
        let registry = NodeRegistry::new();
        registry
            .register_node(test_manifest("good", "/bin/true"), None)
            .unwrap();
        registry
            .register_node(test_manifest("bad", "/nonexistent/bin/node"), None)
            .unwrap();

        let started = registry.start_all().await;
        assert_eq!(started.len(), 2);
        assert_eq!(started.get("good"), Some(&true));
        assert_eq!(started.get("bad"), Some(&false));

        let stopped = registry.stop_all().await;
        assert_eq!(stopped.len(), 2);
        assert_eq!(stopped.get("good"), Some(&true));
        assert_eq!(stopped.get("bad"), Some(&true));

        let health = registry.health_check_all().await;
        assert_eq!(health.len(), 2);
        assert_eq!(health.get("good"), Some(&false));
    }

    #[tokio::test]
    async fn test_clear_empties_registry() {
        let registry = NodeRegistry::new();
        registry
            .register_node(test_manifest("alpha", "/bin/true"), None)
            .unwrap();
        registry
            .register_node(test_manifest("beta", "/bin/true"), None)
            .unwrap();
        assert_eq!(registry.registered_count(), 2);

        registry.clear().await;
        assert_eq!(registry.registered_count(), 0);
        assert!(registry.node_ids().is_empty());
    }

    #[test]
    fn test_node_state_display() {
        assert_eq!(NodeState::Discovered.to_string(), "discovered");
        assert_eq!(NodeState::Running.to_string(), "running");
        assert_eq!(NodeState::Unhealthy.to_string(), "unhealthy");
        assert_eq!(NodeState::Stopped.to_string(), "stopped");
    }
}
