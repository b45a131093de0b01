//! Mirrors a committed write to the peer coordinator over its client protocol
//!
//! One connection per command, one attempt, no retry. The caller decides what
//! a failed outcome means (sync mode reports it to the client, the async
//! replicator backs off and tries again).

use crate::common::ReplicationConfig;
use crate::coordinator::command::{is_success, AUTH_COMMAND};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    Success,
    /// Could not connect, or the link broke before a confirmation arrived
    Unreachable(String),
    /// Peer answered with something other than the success token
    Rejected(String),
    /// Connect or confirmation deadline expired
    Timeout(&'static str),
}

impl ReplicationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ReplicationOutcome::Success)
    }
}

impl fmt::Display for ReplicationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationOutcome::Success => write!(f, "replicated"),
            ReplicationOutcome::Unreachable(reason) => write!(f, "peer unreachable: {}", reason),
            ReplicationOutcome::Rejected(response) => {
                write!(f, "peer returned an error: {}", response)
            }
            ReplicationOutcome::Timeout(stage) => write!(f, "timed out during {}", stage),
        }
    }
}

#[derive(Clone)]
pub struct ReplicationClient {
    connect_timeout: Duration,
    confirm_timeout: Duration,
    shared_secret: Option<String>,
}

impl fmt::Debug for ReplicationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationClient")
            .field("connect_timeout", &self.connect_timeout)
            .field("confirm_timeout", &self.confirm_timeout)
            .field("authenticated", &self.shared_secret.is_some())
            .finish()
    }
}

impl ReplicationClient {
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            confirm_timeout: config.confirm_timeout(),
            shared_secret: config.shared_secret.clone(),
        }
    }

    /// Send `command` to the coordinator at `peer` and wait for its confirmation
    pub async fn send(&self, command: &str, peer: &str) -> ReplicationOutcome {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(peer)).await {
            Err(_) => return ReplicationOutcome::Timeout("connect"),
            Ok(Err(e)) => {
                return ReplicationOutcome::Unreachable(format!(
                    "could not connect to {}: {}",
                    peer, e
                ))
            }
            Ok(Ok(stream)) => stream,
        };
        let _ = stream.set_nodelay(true);

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        if let Some(secret) = &self.shared_secret {
            let auth_line = format!("{} {}", AUTH_COMMAND, secret);
            match self.exchange(&mut reader, &mut writer, &auth_line).await {
                ReplicationOutcome::Success => {}
                ReplicationOutcome::Rejected(response) => {
                    return ReplicationOutcome::Rejected(format!(
                        "authentication refused: {}",
                        response
                    ))
                }
                other => return other,
            }
        }

        let outcome = self.exchange(&mut reader, &mut writer, command).await;
        let _ = writer.shutdown().await;
        outcome
    }

    async fn exchange(
        &self,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        line: &str,
    ) -> ReplicationOutcome {
        let mut out = Vec::with_capacity(line.len() + 1);
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
        if let Err(e) = writer.write_all(&out).await {
            return ReplicationOutcome::Unreachable(format!("could not send command: {}", e));
        }

        let mut confirmation = String::new();
        match timeout(self.confirm_timeout, reader.read_line(&mut confirmation)).await {
            Err(_) => ReplicationOutcome::Timeout("confirmation"),
            Ok(Err(e)) => {
                ReplicationOutcome::Unreachable(format!("did not receive confirmation: {}", e))
            }
            Ok(Ok(_)) if !confirmation.ends_with('\n') => ReplicationOutcome::Unreachable(
                "connection closed before confirmation".to_string(),
            ),
            Ok(Ok(_)) => {
                let confirmation = confirmation.trim_end();
                tracing::debug!("Received replication confirmation: '{}'", confirmation);
                if is_success(confirmation) {
                    ReplicationOutcome::Success
                } else {
                    ReplicationOutcome::Rejected(confirmation.to_string())
                }
            }
        }
    }
}
