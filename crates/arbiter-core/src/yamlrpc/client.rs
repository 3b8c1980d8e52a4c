//! YAML-RPC client for calling methods on a running node.
//!
//! Connects to a node's Unix socket and provides `call()` for method
//! invocation with per-request correlation. A background reader task
//! matches incoming responses to in-flight requests by id, so concurrent
//! calls complete out of order without blocking one another.
//!
//! # Thread Safety
//!
//! The client is meant to be shared behind an `Arc`. Writes are serialized
//! through a tokio `Mutex` on the write half of the stream; the read half
//! is owned by the reader task. The pending-call map uses a std `Mutex`
//! and is never held across an await point.

use super::message::{ErrorCode, RpcMessage};
use super::transport::{read_frame, write_frame, Transport};
use crate::config::ClientConfig;
use crate::Result;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, warn};

type PendingMap = Arc<std::sync::Mutex<HashMap<String, oneshot::Sender<RpcMessage>>>>;

/// Live connection state: the write half plus the reader task that owns
/// the read half.
struct Connection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    reader_task: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// YAML-RPC client bound to one node socket.
pub struct RpcClient {
    socket_path: PathBuf,
    call_timeout: Duration,
    next_seq: AtomicU64,
    pending: PendingMap,
    connection: Mutex<Option<Connection>>,
    connected: Arc<AtomicBool>,
}

impl RpcClient {
    /// Create a client for the given socket path. Does not connect.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            call_timeout: ClientConfig::CALL_TIMEOUT,
            next_seq: AtomicU64::new(1),
            pending: Arc::new(std::sync::Mutex::new(HashMap::new())),
            connection: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the default per-call timeout from `ClientConfig`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Connect to the node's socket and start the reader task.
    ///
    /// A no-op when already connected. If a previous connection died, its
    /// reader is torn down and a fresh connection is established.
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if slot.is_some() && self.connected.load(Ordering::Relaxed) {
            return Ok(());
        }
        if let Some(old) = slot.take() {
            let _ = old.shutdown_tx.send(true);
            old.reader_task.abort();
        }

        let transport = Transport::connect(&self.socket_path).await?;
        let (read_half, write_half) = transport.into_split();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.connected.store(true, Ordering::Relaxed);

        let reader_task = tokio::spawn(Self::reader_loop(
            read_half,
            self.pending.clone(),
            self.connected.clone(),
            shutdown_rx,
        ));

        *slot = Some(Connection {
            writer: Arc::new(Mutex::new(write_half)),
            reader_task,
            shutdown_tx,
        });

        debug!("RPC client connected to {}", self.socket_path.display());
        Ok(())
    }

    /// Close the connection and join the reader task.
    ///
    /// Calls still in flight resolve immediately with a synthesized
    /// "Connection closed" error instead of waiting out their timeouts.
    /// Safe to call twice and safe to call concurrently with `call()`.
    pub async fn disconnect(&self) {
        let conn = { self.connection.lock().await.take() };
        let Some(conn) = conn else {
            return;
        };

        self.connected.store(false, Ordering::Relaxed);
        let _ = conn.shutdown_tx.send(true);
        drop(conn.writer);
        if conn.reader_task.await.is_err() {
            debug!("RPC reader task aborted during disconnect");
        }
        Self::drain_pending(&self.pending);

        debug!("RPC client disconnected from {}", self.socket_path.display());
    }

    /// Call a method and wait for the matching response.
    ///
    /// Never returns `Err`: local failures (not connected, send failure,
    /// timeout) are folded into a synthesized Error message so callers see
    /// the same shape a remote error would have.
    pub async fn call(&self, method: impl Into<String>, params: Option<Value>) -> RpcMessage {
        self.call_with_timeout(method, params, self.call_timeout).await
    }

    /// `call` with an explicit timeout instead of the configured default.
    pub async fn call_with_timeout(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        timeout: Duration,
    ) -> RpcMessage {
        let method = method.into();

        // Clone the writer out of the slot; the slot lock is never held
        // across the send or the response wait.
        let writer = {
            let slot = self.connection.lock().await;
            match slot.as_ref() {
                Some(conn) if self.connected.load(Ordering::Relaxed) => conn.writer.clone(),
                _ => return RpcMessage::error(ErrorCode::INTERNAL_ERROR, "Not connected", ""),
            }
        };

        let id = self.next_request_id();
        let request = RpcMessage::request(method.clone(), params, id.clone());

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        let sent = match request.encode() {
            Ok(bytes) => {
                let mut w = writer.lock().await;
                write_frame(&mut *w, &bytes).await.is_ok()
            }
            Err(_) => false,
        };
        if !sent {
            self.pending.lock().unwrap().remove(&id);
            debug!("RPC send failed for {} (id {})", method, id);
            return RpcMessage::error(ErrorCode::INTERNAL_ERROR, "Send failed", id);
        }

        // A concurrent disconnect may have drained `pending` before the
        // insert above landed; once `connected` is false nothing else will
        // resolve this entry, so sweep it here.
        if !self.connected.load(Ordering::Relaxed)
            && self.pending.lock().unwrap().remove(&id).is_some()
        {
            debug!("RPC connection closed during {} (id {})", method, id);
            return RpcMessage::error(ErrorCode::INTERNAL_ERROR, "Connection closed", id);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => {
                // The reader drained without resolving us; connection is gone.
                RpcMessage::error(ErrorCode::INTERNAL_ERROR, "Connection closed", id)
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                warn!("RPC call {} timed out after {:?} (id {})", method, timeout, id);
                RpcMessage::error(ErrorCode::NODE_EXECUTION_TIMEOUT, "Request timeout", id)
            }
        }
    }

    /// Whether the client currently holds a live connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Number of calls still waiting on a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Socket path this client targets.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// `node.info`: capability and version query.
    pub async fn node_info(&self) -> RpcMessage {
        self.call("node.info", None).await
    }

    /// `node.validate`: ask the node to validate an input document.
    pub async fn node_validate(&self, input: Value) -> RpcMessage {
        let mut params = Mapping::new();
        params.insert(Value::from("input"), input);
        self.call("node.validate", Some(Value::Mapping(params))).await
    }

    /// `node.execute`: run the node against an input document.
    pub async fn node_execute(&self, input: Value, context: Value) -> RpcMessage {
        let mut params = Mapping::new();
        params.insert(Value::from("input"), input);
        params.insert(Value::from("context"), context);
        self.call("node.execute", Some(Value::Mapping(params))).await
    }

    /// `node.health`: liveness probe.
    pub async fn node_health(&self) -> RpcMessage {
        self.call("node.health", None).await
    }

    /// `node.shutdown`: request a graceful stop with the given grace period.
    pub async fn node_shutdown(&self, timeout_seconds: u64) -> RpcMessage {
        let mut params = Mapping::new();
        params.insert(Value::from("timeout_seconds"), Value::from(timeout_seconds));
        self.call("node.shutdown", Some(Value::Mapping(params))).await
    }

    async fn reader_loop(
        mut reader: OwnedReadHalf,
        pending: PendingMap,
        connected: Arc<AtomicBool>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break, // peer closed
                    Err(e) => {
                        debug!("RPC reader error: {}", e);
                        break;
                    }
                },
                _ = shutdown_rx.changed() => break,
            };

            let Some(message) = RpcMessage::decode(&frame) else {
                debug!("Dropping undecodable RPC frame ({} bytes)", frame.len());
                continue;
            };

            let id = message.id().to_string();
            if id.is_empty() {
                debug!("Dropping RPC message without id");
                continue;
            }

            let sender = pending.lock().unwrap().remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => debug!("Dropping RPC message with unknown id {}", id),
            }
        }

        connected.store(false, Ordering::Relaxed);
        Self::drain_pending(&pending);
    }

    /// Resolve every in-flight call with a synthesized "Connection closed"
    /// error carrying that call's request id.
    fn drain_pending(pending: &PendingMap) {
        let drained: Vec<(String, oneshot::Sender<RpcMessage>)> = {
            let mut map = pending.lock().unwrap();
            map.drain().collect()
        };
        for (id, tx) in drained {
            let _ = tx.send(RpcMessage::error(
                ErrorCode::INTERNAL_ERROR,
                "Connection closed",
                id,
            ));
        }
    }

    fn next_request_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("req-{}-{}", millis, seq)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        // Best-effort teardown when dropped without `disconnect()`.
        if let Some(conn) = self.connection.get_mut().take() {
            let _ = conn.shutdown_tx.send(true);
            conn.reader_task.abort();
        }
    }
}
