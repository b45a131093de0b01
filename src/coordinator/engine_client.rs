//! Client for the local storage engine's Unix socket
//!
//! Every call opens a fresh connection, sends one command and reads one
//! response; the socket is dropped before `send` returns on every path.

use crate::common::{EngineConfig, EngineFraming, Error, Result};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Debug, Clone)]
pub struct StorageEngineClient {
    socket_path: PathBuf,
    framing: EngineFraming,
    max_response_bytes: usize,
}

impl StorageEngineClient {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            framing: config.framing,
            max_response_bytes: config.max_response_bytes.max(1),
        }
    }

    /// Relay one command and return the engine's response
    pub async fn send(&self, command: &str) -> Result<String> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Engine(format!(
                "failed to connect to storage engine at {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        let response = match self.framing {
            EngineFraming::Raw => self.exchange_raw(&mut stream, command).await?,
            EngineFraming::LengthPrefixed => self.exchange_framed(&mut stream, command).await?,
        };

        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    /// Unframed exchange: one write, one bounded read. Longer responses are truncated.
    async fn exchange_raw(&self, stream: &mut UnixStream, command: &str) -> Result<Vec<u8>> {
        stream
            .write_all(command.as_bytes())
            .await
            .map_err(|e| Error::Engine(format!("failed to send command to storage engine: {}", e)))?;

        let mut buf = vec![0u8; self.max_response_bytes];
        let n = stream.read(&mut buf).await.map_err(|e| {
            Error::Engine(format!("failed to read response from storage engine: {}", e))
        })?;
        if n == 0 {
            return Err(Error::Engine(
                "storage engine closed the connection without responding".into(),
            ));
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn exchange_framed(&self, stream: &mut UnixStream, command: &str) -> Result<Vec<u8>> {
        let payload = command.as_bytes();
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::Engine("command too large for engine frame".into()))?;

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(payload);
        stream
            .write_all(&frame)
            .await
            .map_err(|e| Error::Engine(format!("failed to send command to storage engine: {}", e)))?;

        let len = stream.read_u32().await.map_err(|e| {
            Error::Engine(format!("failed to read response header from storage engine: {}", e))
        })? as usize;
        if len > self.max_response_bytes {
            return Err(Error::Engine(format!(
                "storage engine response of {} bytes exceeds limit of {}",
                len, self.max_response_bytes
            )));
        }

        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.map_err(|e| {
            Error::Engine(format!("failed to read response from storage engine: {}", e))
        })?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn client(path: &Path, framing: EngineFraming, max: usize) -> StorageEngineClient {
        StorageEngineClient::new(&EngineConfig {
            socket_path: path.to_path_buf(),
            framing,
            max_response_bytes: max,
        })
    }

    /// Engine that answers one raw request with `reply`, returning what it received
    fn raw_engine(
        listener: UnixListener,
        reply: Vec<u8>,
    ) -> tokio::task::JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(&reply).await.unwrap();
            buf.truncate(n);
            buf
        })
    }

    #[tokio::test]
    async fn test_raw_relay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.sock");
        let engine = raw_engine(UnixListener::bind(&path).unwrap(), b"OK: User a saved.".to_vec());

        let response = client(&path, EngineFraming::Raw, 2048)
            .send("PUT a age 1")
            .await
            .unwrap();

        assert_eq!(response, "OK: User a saved.");
        // no trailing newline on the internal channel
        assert_eq!(engine.await.unwrap(), b"PUT a age 1");
    }

    #[tokio::test]
    async fn test_raw_response_truncated_to_buffer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.sock");
        let _engine = raw_engine(UnixListener::bind(&path).unwrap(), vec![b'x'; 64]);

        let response = client(&path, EngineFraming::Raw, 16).send("GET a").await.unwrap();
        assert_eq!(response.len(), 16);
    }

    #[tokio::test]
    async fn test_engine_down() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.sock");

        let err = client(&path, EngineFraming::Raw, 2048).send("GET a").await.unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
    }

    #[tokio::test]
    async fn test_engine_closes_without_reply() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = conn.read(&mut buf).await;
        });

        let err = client(&path, EngineFraming::Raw, 2048).send("GET a").await.unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
    }

    #[tokio::test]
    async fn test_length_prefixed_exchange() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let big = "v".repeat(5000);
        let reply = big.clone();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let len = conn.read_u32().await.unwrap() as usize;
            let mut cmd = vec![0u8; len];
            conn.read_exact(&mut cmd).await.unwrap();
            assert_eq!(cmd, b"GET big");
            conn.write_u32(reply.len() as u32).await.unwrap();
            conn.write_all(reply.as_bytes()).await.unwrap();
        });

        let response = client(&path, EngineFraming::LengthPrefixed, 1 << 20)
            .send("GET big")
            .await
            .unwrap();
        assert_eq!(response, big);
    }

    #[tokio::test]
    async fn test_length_prefixed_rejects_oversized_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let len = conn.read_u32().await.unwrap() as usize;
            let mut cmd = vec![0u8; len];
            conn.read_exact(&mut cmd).await.unwrap();
            conn.write_u32(10_000).await.unwrap();
        });

        let err = client(&path, EngineFraming::LengthPrefixed, 128)
            .send("GET big")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }
}
