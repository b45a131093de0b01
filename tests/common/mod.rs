//! Shared fixtures: an in-memory storage engine on a Unix socket and
//! in-process coordinators bound to ephemeral ports.

#![allow(dead_code)]

use kvrelay::common::NodeSettings;
use kvrelay::{Client, Coordinator};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::oneshot;

/// Storage engine stand-in speaking the raw channel protocol:
/// `PUT <key> <value...>` answers `OK`, `GET <key>` answers `OK <value>` or `NOT_FOUND`.
pub struct FakeEngine {
    pub path: PathBuf,
    pub store: Arc<Mutex<HashMap<String, String>>>,
    pub calls: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub fn spawn(dir: &Path, name: &str) -> Self {
        let path = dir.join(format!("{}.sock", name));
        let listener = UnixListener::bind(&path).unwrap();
        let store = Arc::new(Mutex::new(HashMap::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        let engine_store = store.clone();
        let engine_calls = calls.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 1024];
                let n = match conn.read(&mut buf).await {
                    Ok(n) if n > 0 => n,
                    _ => continue,
                };
                engine_calls.fetch_add(1, Ordering::SeqCst);
                let command = String::from_utf8_lossy(&buf[..n]).into_owned();
                let reply = apply(&engine_store, &command);
                let _ = conn.write_all(reply.as_bytes()).await;
            }
        });

        Self { path, store, calls }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.lock().unwrap().get(key).cloned()
    }
}

fn apply(store: &Mutex<HashMap<String, String>>, command: &str) -> String {
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(verb), Some(key)) if verb.eq_ignore_ascii_case("PUT") => {
            let value = parts.collect::<Vec<_>>().join(" ");
            store.lock().unwrap().insert(key.to_string(), value);
            "OK".to_string()
        }
        (Some(verb), Some(key)) if verb.eq_ignore_ascii_case("GET") => {
            match store.lock().unwrap().get(key) {
                Some(value) => format!("OK {}", value),
                None => format!("NOT_FOUND: {}", key),
            }
        }
        _ => "ERROR: Unknown or malformed command.".to_string(),
    }
}

pub fn local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A coordinator serving in the background until `stop` is called or dropped
pub struct RunningNode {
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<kvrelay::Result<()>>,
}

impl RunningNode {
    pub async fn start(settings: NodeSettings) -> Self {
        let coord = Coordinator::bind(settings).await.unwrap();
        let addr = coord.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(coord.serve_until(async move {
            let _ = stopped.await;
        }));
        Self {
            addr,
            stop: Some(stop),
            task,
        }
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task).await.unwrap().unwrap();
    }

    pub async fn client(&self) -> Client {
        Client::connect(self.addr, Duration::from_secs(5)).await.unwrap()
    }
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// An address nothing is listening on
pub async fn dead_addr() -> SocketAddr {
    let reserved = tokio::net::TcpListener::bind(local()).await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);
    addr
}
