//! Per-connection command loop
//!
//! Each client line goes through: classify, admit, relay to the storage
//! engine, replicate (primary writes only), respond. Commands on one
//! connection are handled strictly one at a time, so responses come back in
//! request order. Every failure is turned into a single response line; only
//! client socket errors end the session.

use crate::common::{NodeRole, NodeSettings, ReplicationMode};
use crate::coordinator::admission::{Admission, AdmissionPolicy, Origin};
use crate::coordinator::command::{
    auth_secret, is_success, loggable, CommandKind, ERR_AUTH_FAILED, ERR_INTERNAL,
    ERR_INVALID_ENCODING, ERR_REPLICATION_FAILED, ERR_WRITE_ON_SECONDARY, OK_AUTHENTICATED,
};
use crate::coordinator::engine_client::StorageEngineClient;
use crate::coordinator::replication_client::ReplicationClient;
use crate::coordinator::replicator::ReplicationHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// How committed writes reach the secondary
#[derive(Clone)]
pub enum Replication {
    /// Secondary nodes never replicate
    Disabled,
    /// One inline attempt per write
    Sync {
        client: ReplicationClient,
        peer: String,
    },
    /// Durable backlog drained by the replicator task
    Async(ReplicationHandle),
}

impl Replication {
    pub fn mode(&self) -> Option<ReplicationMode> {
        match self {
            Replication::Disabled => None,
            Replication::Sync { .. } => Some(ReplicationMode::Sync),
            Replication::Async(_) => Some(ReplicationMode::Async),
        }
    }
}

/// Everything a session needs, built once at startup and shared read-only
pub struct SessionContext {
    pub settings: Arc<NodeSettings>,
    policy: AdmissionPolicy,
    engine: StorageEngineClient,
    replication: Replication,
    secret: Option<blake3::Hash>,
}

impl SessionContext {
    pub fn new(settings: Arc<NodeSettings>, replication: Replication) -> Self {
        let replication = match settings.role {
            NodeRole::Primary => replication,
            NodeRole::Secondary => Replication::Disabled,
        };
        Self {
            policy: AdmissionPolicy::from_settings(&settings),
            engine: StorageEngineClient::new(&settings.engine),
            secret: settings
                .replication
                .shared_secret
                .as_deref()
                .map(|s| blake3::hash(s.as_bytes())),
            replication,
            settings,
        }
    }

    pub fn replication(&self) -> &Replication {
        &self.replication
    }

    /// Process one trimmed, non-empty command and produce its response line
    pub async fn handle(&self, command: &str, origin: &mut Origin) -> String {
        tracing::debug!("Received from {}: '{}'", origin.ip, loggable(command));

        if let Some(expected) = &self.secret {
            if let Some(presented) = auth_secret(command) {
                return self.authenticate(expected, presented, origin);
            }
        }

        let kind = CommandKind::classify(command);

        if let Admission::Reject(reason) = self.policy.decide(kind, origin) {
            tracing::warn!(
                "Rejecting write command from {} on {} node: {}",
                origin.ip,
                self.settings.role,
                reason
            );
            return ERR_WRITE_ON_SECONDARY.to_string();
        }

        let response = match self.engine.send(command).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Error from local storage engine for client {}: {}", origin.ip, e);
                return ERR_INTERNAL.to_string();
            }
        };
        let response = response.trim_end_matches(['\r', '\n']).to_string();

        if kind.is_write() && is_success(&response) {
            if let Err(reason) = self.replicate(command).await {
                tracing::error!(
                    "FATAL: Failed to replicate command to secondary: {}. Data is now inconsistent.",
                    reason
                );
                return ERR_REPLICATION_FAILED.to_string();
            }
        }

        response
    }

    async fn replicate(&self, command: &str) -> Result<(), String> {
        match &self.replication {
            Replication::Disabled => Ok(()),
            Replication::Sync { client, peer } => {
                tracing::info!("Replicating write command to secondary at {}", peer);
                let outcome = client.send(command, peer).await;
                if outcome.is_success() {
                    Ok(())
                } else {
                    Err(outcome.to_string())
                }
            }
            Replication::Async(handle) => match handle.enqueue(command).await {
                Ok(sequence) => {
                    tracing::debug!("Queued write {} for replication", sequence);
                    Ok(())
                }
                Err(e) => Err(format!("could not queue write for replication: {}", e)),
            },
        }
    }

    fn authenticate(&self, expected: &blake3::Hash, presented: &str, origin: &mut Origin) -> String {
        // blake3::Hash equality is constant-time
        if blake3::hash(presented.as_bytes()) == *expected {
            origin.authenticated = true;
            tracing::info!("Peer {} authenticated", origin.ip);
            OK_AUTHENTICATED.to_string()
        } else {
            origin.authenticated = false;
            tracing::warn!("Authentication failed for {}", origin.ip);
            ERR_AUTH_FAILED.to_string()
        }
    }
}

/// One client connection. The socket is released when `run` returns.
pub struct ConnectionSession {
    ctx: Arc<SessionContext>,
    stream: TcpStream,
    client_addr: SocketAddr,
    origin: Origin,
}

impl ConnectionSession {
    pub fn new(ctx: Arc<SessionContext>, stream: TcpStream, client_addr: SocketAddr) -> Self {
        Self {
            ctx,
            stream,
            client_addr,
            origin: Origin::new(client_addr.ip()),
        }
    }

    pub async fn run(mut self) {
        tracing::info!("TCP client connected from {}", self.client_addr);

        let idle_timeout = self.ctx.settings.limits.idle_timeout();
        let (reader, mut writer) = self.stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line);
            let result = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, read).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::info!("TCP client {} idle for {:?}, closing", self.client_addr, limit);
                        break;
                    }
                },
                None => read.await,
            };

            match result {
                Ok(0) => break,
                // EOF in the middle of a line: the partial command is dropped
                Ok(_) if line.last() != Some(&b'\n') => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Error reading from TCP client {}: {}", self.client_addr, e);
                    break;
                }
            }

            // lines are relayed and replicated as text, never lossily re-encoded
            let response = match std::str::from_utf8(&line) {
                Ok(text) => {
                    let command = text.trim();
                    if command.is_empty() {
                        continue;
                    }
                    self.ctx.handle(command, &mut self.origin).await
                }
                Err(_) => {
                    tracing::warn!("Rejecting command from {}: not valid UTF-8", self.client_addr);
                    ERR_INVALID_ENCODING.to_string()
                }
            };

            let mut out = response.into_bytes();
            out.push(b'\n');
            if let Err(e) = writer.write_all(&out).await {
                tracing::warn!("Error writing to TCP client {}: {}", self.client_addr, e);
                break;
            }
        }

        tracing::info!("TCP client {} disconnected", self.client_addr);
    }
}
