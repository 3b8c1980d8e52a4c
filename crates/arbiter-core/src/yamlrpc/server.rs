//! YAML-RPC server side: the method surface a node exposes on its socket.
//!
//! Listens on a Unix socket, accepts connections from the orchestrator (or
//! any other client), and dispatches decoded requests to registered method
//! handlers.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. Each connection is handled in its
//! own spawned task; requests on a single connection are handled in order.
//! The handler map is shared behind an `RwLock` and may be mutated before
//! or after `start()`.

use super::message::{ErrorCode, RpcMessage};
use super::transport::{Transport, TransportListener};
use crate::config::ServerConfig;
use crate::Result;
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handler for one RPC method. Receives the request's params (if any) and
/// produces the result value, or an error the server frames into an Error
/// message with the matching taxonomy code.
pub type MethodHandler = Arc<dyn Fn(Option<Value>) -> Result<Value> + Send + Sync>;

type HandlerMap = Arc<RwLock<HashMap<String, MethodHandler>>>;

/// Handle to a running RPC server. Dropping shuts down the server.
pub struct RpcServerHandle {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    /// Path of the socket the server is listening on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Shut down the server gracefully.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers to close.
    pub fn shutdown(&mut self) {
        // Signal accept loop to stop
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Signal all connection handlers to close
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// YAML-RPC server that dispatches requests to registered handlers.
pub struct RpcServer {
    handlers: HandlerMap,
}

impl RpcServer {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler under a method name, replacing any previous one.
    ///
    /// May be called before or after `start()`; new registrations are
    /// visible to subsequent requests.
    pub fn register_method<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(handler));
    }

    /// Remove a handler. Returns whether one was registered.
    pub fn unregister_method(&self, name: &str) -> bool {
        self.handlers.write().unwrap().remove(name).is_some()
    }

    /// Register the standard node method surface.
    ///
    /// `node.info` returns the supplied info document, `node.health`
    /// returns `true`, and `node.shutdown` acknowledges with `true`; the
    /// decision to actually exit stays with the embedding node.
    pub fn register_standard_methods(&self, info: Value) {
        self.register_method("node.info", move |_params| Ok(info.clone()));
        self.register_method("node.health", |_params| Ok(Value::from(true)));
        self.register_method("node.shutdown", |_params| Ok(Value::from(true)));
    }

    /// Start serving on the given socket path.
    ///
    /// Any stale socket file is replaced. Returns a handle used to query
    /// the path and shut the server down; the accept loop runs in a
    /// background tokio task.
    pub async fn start(&self, path: impl AsRef<Path>) -> Result<RpcServerHandle> {
        let listener = TransportListener::bind(path)?;
        let socket_path = listener.local_path().to_path_buf();

        info!("RPC server listening on {}", socket_path.display());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            self.handlers.clone(),
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(RpcServerHandle {
            socket_path,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TransportListener,
        handlers: HandlerMap,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("RPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(transport) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= ServerConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting RPC connection: at max capacity ({})",
                                    ServerConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let handlers = handlers.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(transport, &handlers, &mut conn_shutdown).await
                                {
                                    debug!("RPC connection ended: {}", e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("RPC accept error: {}", e);
                        }
                    }
                }
            }
        }
        // The listener drops here and unlinks its socket file.
    }

    async fn handle_connection(
        mut transport: Transport,
        handlers: &HandlerMap,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            // Wait for either a frame or a shutdown signal
            let frame = tokio::select! {
                result = transport.recv() => {
                    match result? {
                        Some(frame) => frame,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(()); // Server shutting down
                }
            };

            let Some(reply) = Self::process_frame(&frame, handlers) else {
                continue; // notification, or traffic we drop silently
            };
            transport.send(&reply.encode()?).await?;
        }
    }

    /// Turn one inbound frame into an optional reply.
    fn process_frame(frame: &[u8], handlers: &HandlerMap) -> Option<RpcMessage> {
        let Some(message) = RpcMessage::decode(frame) else {
            return Some(RpcMessage::error(ErrorCode::PARSE_ERROR, "Parse error", ""));
        };

        let (method, params, id) = match message {
            RpcMessage::Request { method, params, id } => (method, params, id),
            other => {
                // Responses and errors are not valid traffic toward a server.
                let id = other.id().to_string();
                if id.is_empty() {
                    debug!("Dropping non-request RPC message");
                    return None;
                }
                return Some(RpcMessage::error(
                    ErrorCode::INVALID_REQUEST,
                    "Invalid request",
                    id,
                ));
            }
        };

        let handler = handlers.read().unwrap().get(&method).cloned();
        let Some(handler) = handler else {
            if id.is_empty() {
                debug!("Dropping notification for unknown method {}", method);
                return None;
            }
            return Some(RpcMessage::error(
                ErrorCode::METHOD_NOT_FOUND,
                format!("Method not found: {}", method),
                id,
            ));
        };

        let outcome = handler(params);

        // Notifications run the handler but never get a reply.
        if id.is_empty() {
            if let Err(e) = outcome {
                debug!("Notification handler {} failed: {}", method, e);
            }
            return None;
        }

        Some(match outcome {
            Ok(result) => RpcMessage::response(result, id),
            Err(e) => RpcMessage::error(e.to_rpc_error_code(), e.to_string(), id),
        })
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArbiterError;
    use serde_yaml::Mapping;
    use std::sync::atomic::AtomicU64;
    use tempfile::TempDir;

    fn sock(dir: &TempDir) -> PathBuf {
        dir.path().join("server.sock")
    }

    async fn roundtrip(transport: &mut Transport, request: &RpcMessage) -> RpcMessage {
        transport.send(&request.encode().unwrap()).await.unwrap();
        let frame = transport.recv().await.unwrap().unwrap();
        RpcMessage::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = sock(&dir);

        let server = RpcServer::new();
        let mut handle = server.start(&path).await.unwrap();
        assert_eq!(handle.socket_path(), path.as_path());
        assert!(path.exists());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_dispatches_registered_method() {
        let dir = TempDir::new().unwrap();
        let path = sock(&dir);

        let server = RpcServer::new();
        server.register_method("node.health", |_params| Ok(Value::from(true)));
        let mut handle = server.start(&path).await.unwrap();

        let mut transport = Transport::connect(&path).await.unwrap();
        let reply = roundtrip(
            &mut transport,
            &RpcMessage::request("node.health", None, "req-1"),
        )
        .await;

        match reply {
            RpcMessage::Response { result, id } => {
                assert_eq!(result, Value::from(true));
                assert_eq!(id, "req-1");
            }
            other => panic!("expected response, got {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_method_not_found() {
        let dir = TempDir::new().unwrap();
        let path = sock(&dir);

        let server = RpcServer::new();
        let mut handle = server.start(&path).await.unwrap();

        let mut transport = Transport::connect(&path).await.unwrap();
        let reply = roundtrip(
            &mut transport,
            &RpcMessage::request("no.such.method", None, "req-2"),
        )
        .await;

        match reply {
            RpcMessage::Error { code, message, id, .. } => {
                assert_eq!(code, ErrorCode::METHOD_NOT_FOUND);
                assert!(message.contains("no.such.method"));
                assert_eq!(id, "req-2");
            }
            other => panic!("expected error, got {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_replies_parse_error_for_garbage() {
        let dir = TempDir::new().unwrap();
        let path = sock(&dir);

        let server = RpcServer::new();
        let mut handle = server.start(&path).await.unwrap();

        let mut transport = Transport::connect(&path).await.unwrap();
        transport.send(&[0xff, 0xfe, 0x00]).await.unwrap();
        let frame = transport.recv().await.unwrap().unwrap();
        let reply = RpcMessage::decode(&frame).unwrap();

        match reply {
            RpcMessage::Error { code, message, id, .. } => {
                assert_eq!(code, ErrorCode::PARSE_ERROR);
                assert_eq!(message, "Parse error");
                assert!(id.is_empty());
            }
            other => panic!("expected error, got {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_maps_handler_error_to_taxonomy_code() {
        let dir = TempDir::new().unwrap();
        let path = sock(&dir);

        let server = RpcServer::new();
        server.register_method("node.validate", |_params| {
            Err(ArbiterError::Validation {
                message: "input rejected".to_string(),
            })
        });
        let mut handle = server.start(&path).await.unwrap();

        let mut transport = Transport::connect(&path).await.unwrap();
        let reply = roundtrip(
            &mut transport,
            &RpcMessage::request("node.validate", None, "req-3"),
        )
        .await;

        match reply {
            RpcMessage::Error { code, message, id, .. } => {
                assert_eq!(code, ErrorCode::NODE_VALIDATION_ERROR);
                assert!(message.contains("input rejected"));
                assert_eq!(id, "req-3");
            }
            other => panic!("expected error, got {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_runs_notification_without_reply() {
        let dir = TempDir::new().unwrap();
        let path = sock(&dir);

        let hits = Arc::new(AtomicU64::new(0));
        let server = RpcServer::new();
        let counter = hits.clone();
        server.register_method("bump", move |_params| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(Value::Null)
        });
        let observed = hits.clone();
        server.register_method("count", move |_params| {
            Ok(Value::from(observed.load(Ordering::Relaxed)))
        });
        let mut handle = server.start(&path).await.unwrap();

        let mut transport = Transport::connect(&path).await.unwrap();
        // Notification first; the only reply on the wire must belong to the
        // follow-up request.
        transport
            .send(&RpcMessage::notification("bump", None).encode().unwrap())
            .await
            .unwrap();
        let reply = roundtrip(&mut transport, &RpcMessage::request("count", None, "req-4")).await;

        match reply {
            RpcMessage::Response { result, id } => {
                assert_eq!(result, Value::from(1u64));
                assert_eq!(id, "req-4");
            }
            other => panic!("expected response, got {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_rejects_non_request_traffic() {
        let dir = TempDir::new().unwrap();
        let path = sock(&dir);

        let server = RpcServer::new();
        let mut handle = server.start(&path).await.unwrap();

        let mut transport = Transport::connect(&path).await.unwrap();
        let reply = roundtrip(
            &mut transport,
            &RpcMessage::response(Value::from(42), "stray-1"),
        )
        .await;

        match reply {
            RpcMessage::Error { code, id, .. } => {
                assert_eq!(code, ErrorCode::INVALID_REQUEST);
                assert_eq!(id, "stray-1");
            }
            other => panic!("expected error, got {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_unregister_method() {
        let dir = TempDir::new().unwrap();
        let path = sock(&dir);

        let server = RpcServer::new();
        server.register_method("ephemeral", |_params| Ok(Value::Null));
        assert!(server.unregister_method("ephemeral"));
        assert!(!server.unregister_method("ephemeral"));

        let mut handle = server.start(&path).await.unwrap();
        let mut transport = Transport::connect(&path).await.unwrap();
        let reply = roundtrip(
            &mut transport,
            &RpcMessage::request("ephemeral", None, "req-5"),
        )
        .await;

        match reply {
            RpcMessage::Error { code, .. } => assert_eq!(code, ErrorCode::METHOD_NOT_FOUND),
            other => panic!("expected error, got {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_standard_methods() {
        let dir = TempDir::new().unwrap();
        let path = sock(&dir);

        let mut info = Mapping::new();
        info.insert(Value::from("name"), Value::from("demo-node"));
        info.insert(Value::from("version"), Value::from("1.0.0"));

        let server = RpcServer::new();
        server.register_standard_methods(Value::Mapping(info.clone()));
        let mut handle = server.start(&path).await.unwrap();

        let mut transport = Transport::connect(&path).await.unwrap();

        let reply = roundtrip(&mut transport, &RpcMessage::request("node.info", None, "i-1")).await;
        match reply {
            RpcMessage::Response { result, .. } => assert_eq!(result, Value::Mapping(info)),
            other => panic!("expected response, got {:?}", other),
        }

        let reply =
            roundtrip(&mut transport, &RpcMessage::request("node.health", None, "h-1")).await;
        match reply {
            RpcMessage::Response { result, .. } => assert_eq!(result, Value::from(true)),
            other => panic!("expected response, got {:?}", other),
        }

        let reply =
            roundtrip(&mut transport, &RpcMessage::request("node.shutdown", None, "s-1")).await;
        match reply {
            RpcMessage::Response { result, .. } => assert_eq!(result, Value::from(true)),
            other => panic!("expected response, got {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_serves_concurrent_connections() {
        let dir = TempDir::new().unwrap();
        let path = sock(&dir);

        let server = RpcServer::new();
        server.register_method("echo", |params| Ok(params.unwrap_or(Value::Null)));
        let mut handle = server.start(&path).await.unwrap();

        let path_a = path.clone();
        let path_b = path.clone();
        let a = tokio::spawn(async move {
            let mut transport = Transport::connect(&path_a).await.unwrap();
            let request = RpcMessage::request("echo", Some(Value::from("a")), "conn-a");
            transport.send(&request.encode().unwrap()).await.unwrap();
            let frame = transport.recv().await.unwrap().unwrap();
            RpcMessage::decode(&frame).unwrap()
        });
        let b = tokio::spawn(async move {
            let mut transport = Transport::connect(&path_b).await.unwrap();
            let request = RpcMessage::request("echo", Some(Value::from("b")), "conn-b");
            transport.send(&request.encode().unwrap()).await.unwrap();
            let frame = transport.recv().await.unwrap().unwrap();
            RpcMessage::decode(&frame).unwrap()
        });

        let (reply_a, reply_b) = (a.await.unwrap(), b.await.unwrap());
        match reply_a {
            RpcMessage::Response { result, id } => {
                assert_eq!(result, Value::from("a"));
                assert_eq!(id, "conn-a");
            }
            other => panic!("expected response, got {:?}", other),
        }
        match reply_b {
            RpcMessage::Response { result, id } => {
                assert_eq!(result, Value::from("b"));
                assert_eq!(id, "conn-b");
            }
            other => panic!("expected response, got {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_registration_after_start_is_visible() {
        let dir = TempDir::new().unwrap();
        let path = sock(&dir);

        let server = RpcServer::new();
        let mut handle = server.start(&path).await.unwrap();

        let mut transport = Transport::connect(&path).await.unwrap();
        let reply =
            roundtrip(&mut transport, &RpcMessage::request("late", None, "req-6")).await;
        match reply {
            RpcMessage::Error { code, .. } => assert_eq!(code, ErrorCode::METHOD_NOT_FOUND),
            other => panic!("expected error, got {:?}", other),
        }

        server.register_method("late", |_params| Ok(Value::from("now")));
        let reply =
            roundtrip(&mut transport, &RpcMessage::request("late", None, "req-7")).await;
        match reply {
            RpcMessage::Response { result, .. } => assert_eq!(result, Value::from("now")),
            other => panic!("expected response, got {:?}", other),
        }

        handle.shutdown();
    }
}
