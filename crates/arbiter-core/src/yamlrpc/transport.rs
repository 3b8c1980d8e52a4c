//! Framed transport over Unix domain sockets.
//!
//! One frame is a 4-byte big-endian length prefix followed by exactly that
//! many payload bytes:
//!
//! ```text
//! [u32 BE: len][UTF-8 YAML bytes of len]
//! ```
//!
//! The framing functions are generic over the reader/writer so they can be
//! exercised against in-memory cursors; `Transport` and `TransportListener`
//! bind them to `tokio::net::UnixStream`. The transport never retries:
//! reconnect policy belongs to the client and registry layers.

use crate::config::{ClientConfig, ProtocolConfig};
use crate::{ArbiterError, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

/// Read a length-prefixed frame from an async reader.
///
/// Returns `Ok(None)` on clean EOF (peer closed between frames). EOF inside
/// a frame is an error: a truncated frame never surfaces as a partial
/// payload.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(ArbiterError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                ProtocolConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(ArbiterError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                payload.len(),
                ProtocolConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// One connected, framed byte-stream channel.
///
/// `send`/`recv` take `&mut self`: exclusive access serializes the channel
/// to one logical conversation. Concurrent RPC over a single connection is
/// built above this with `into_split` (see the client's reader task).
#[derive(Debug)]
pub struct Transport {
    stream: UnixStream,
}

impl Transport {
    /// Connect to a listening endpoint, bounded by
    /// [`ClientConfig::CONNECT_TIMEOUT`].
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = tokio::time::timeout(
            ClientConfig::CONNECT_TIMEOUT,
            UnixStream::connect(path),
        )
        .await
        .map_err(|_| ArbiterError::Timeout(ClientConfig::CONNECT_TIMEOUT))?
        .map_err(|e| ArbiterError::Transport {
            message: format!("connect to {} failed: {}", path.display(), e),
        })?;

        debug!("Connected to {}", path.display());
        Ok(Self { stream })
    }

    /// Send one whole payload as a frame.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, payload).await
    }

    /// Receive one whole frame; `Ok(None)` when the peer has closed.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        read_frame(&mut self.stream).await
    }

    /// Split into owned halves for concurrent read/write use.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

/// Listening endpoint bound to a socket path.
///
/// Binding removes any stale socket file left by a previous process
/// (last-writer-wins); the file is removed again when the listener drops.
#[derive(Debug)]
pub struct TransportListener {
    listener: UnixListener,
    path: PathBuf,
}

impl TransportListener {
    /// Bind the endpoint, replacing a stale socket file if one exists.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ArbiterError::io_with_path(e, &path)),
        }

        let listener =
            UnixListener::bind(&path).map_err(|e| ArbiterError::io_with_path(e, &path))?;

        debug!("Listening on {}", path.display());
        Ok(Self { listener, path })
    }

    /// Accept the next inbound connection.
    pub async fn accept(&self) -> Result<Transport> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(Transport { stream })
    }

    /// Path of the bound socket file.
    pub fn local_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransportListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"yamlrpc: '1.0'";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_truncated_payload_is_error() {
        // Header promises 10 bytes; only 4 arrive before EOF.
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_frame_read_truncated_header_returns_none() {
        // EOF inside the 4-byte header reads as connection closed; no
        // partial payload is ever surfaced.
        let mut cursor = std::io::Cursor::new(vec![0u8, 0u8]);
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (ProtocolConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]); // some bytes but not enough

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_length_prefix_is_big_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0xAA; 7]).await.unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 7]);
    }

    #[tokio::test]
    async fn test_stream_pair_send_recv() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut sender = Transport { stream: a };
        let mut receiver = Transport { stream: b };

        sender.send(b"first").await.unwrap();
        sender.send(b"second").await.unwrap();
        drop(sender);

        assert_eq!(receiver.recv().await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(receiver.recv().await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(receiver.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = TransportListener::bind(&path).unwrap();
        assert_eq!(listener.local_path(), path.as_path());

        // Connect/accept through the fresh endpoint.
        let (client, served) =
            tokio::join!(Transport::connect(&path), async { listener.accept().await });
        let mut client = client.unwrap();
        let mut served = served.unwrap();

        client.send(b"ping").await.unwrap();
        assert_eq!(served.recv().await.unwrap(), Some(b"ping".to_vec()));
    }

    #[tokio::test]
    async fn test_listener_drop_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.sock");

        let listener = TransportListener::bind(&path).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = Transport::connect(dir.path().join("absent.sock")).await;
        assert!(result.is_err());
    }
}
