//! Configuration for the kvrelay coordinator
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional TOML file, `KVRELAY_*` environment variables and the legacy
//! `NODE_ROLE` / `NODE_TCP_PORT` / `SECONDARY_NODE_ADDR` / `PRIMARY_NODE_ADDR`
//! variables. [`Config::resolve`] turns the raw values into immutable
//! [`NodeSettings`].

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "kvrelay.toml";

/// Port used when NODE_TCP_PORT is not set
pub const DEFAULT_NODE_TCP_PORT: u16 = 123;

/// Legacy environment variables, mapped onto config keys
const LEGACY_ENV: &[(&str, &str)] = &[
    ("NODE_ROLE", "node_role"),
    ("NODE_TCP_PORT", "node_tcp_port"),
    ("SECONDARY_NODE_ADDR", "secondary_node_addr"),
    ("PRIMARY_NODE_ADDR", "primary_node_addr"),
];

/// Raw configuration, as loaded from file and environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Role of this node (PRIMARY or SECONDARY)
    #[serde(default)]
    pub node_role: Option<NodeRole>,

    /// Client-facing TCP port
    #[serde(default)]
    pub node_tcp_port: Option<u16>,

    /// Interface to listen on
    #[serde(default = "default_listen_host")]
    pub listen_host: IpAddr,

    /// Address of the secondary coordinator (primary only)
    #[serde(default)]
    pub secondary_node_addr: Option<String>,

    /// Address of the primary coordinator, `host:port` (secondary only)
    #[serde(default)]
    pub primary_node_addr: Option<String>,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub limits: ConnectionLimits,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_role: None,
            node_tcp_port: None,
            listen_host: default_listen_host(),
            secondary_node_addr: None,
            primary_node_addr: None,
            engine: EngineConfig::default(),
            replication: ReplicationConfig::default(),
            limits: ConnectionLimits::default(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeRole {
    #[serde(alias = "primary", alias = "Primary")]
    Primary,
    #[serde(alias = "secondary", alias = "Secondary")]
    Secondary,
}

impl std::str::FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRIMARY" => Ok(NodeRole::Primary),
            "SECONDARY" => Ok(NodeRole::Secondary),
            other => Err(Error::InvalidConfig(format!(
                "unknown node role '{}', must be 'PRIMARY' or 'SECONDARY'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "PRIMARY"),
            NodeRole::Secondary => write!(f, "SECONDARY"),
        }
    }
}

/// How requests and responses are delimited on the storage engine socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineFraming {
    /// Raw bytes out, one bounded read back
    #[default]
    Raw,
    /// 4-byte big-endian length before every payload
    LengthPrefixed,
}

/// Local storage engine channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Unix domain socket of the storage engine
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    #[serde(default)]
    pub framing: EngineFraming,

    /// Read buffer cap (raw) or maximum frame size (length-prefixed)
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/storage_engine.sock")
}
fn default_max_response_bytes() -> usize {
    2048
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            framing: EngineFraming::default(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// One attempt per write, inline with the client request
    #[default]
    Sync,
    /// Durable backlog shipped by a background task
    Async,
}

/// When the replication log is fsynced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSyncPolicy {
    /// fsync after every append
    #[default]
    Always,
    /// Flush to the OS only
    Never,
}

/// Replication towards the secondary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub mode: ReplicationMode,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How long to wait for the peer's confirmation line
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_ms: u64,

    /// Replication backlog (async mode)
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    #[serde(default)]
    pub sync_policy: LogSyncPolicy,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Secret both coordinators share; enables `AUTH` on replication links
    #[serde(default, skip_serializing)]
    pub shared_secret: Option<String>,
}

fn default_connect_timeout() -> u64 {
    5_000
}
fn default_confirm_timeout() -> u64 {
    5_000
}
fn default_log_path() -> PathBuf {
    PathBuf::from("./kvrelay-data/replication.log")
}
fn default_initial_backoff() -> u64 {
    100
}
fn default_max_backoff() -> u64 {
    30_000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::default(),
            connect_timeout_ms: default_connect_timeout(),
            confirm_timeout_ms: default_confirm_timeout(),
            log_path: default_log_path(),
            sync_policy: LogSyncPolicy::default(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            shared_secret: None,
        }
    }
}

impl ReplicationConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

/// Listener limits; unbounded when unset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionLimits {
    #[serde(default)]
    pub max_connections: Option<usize>,

    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl ConnectionLimits {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// The counterpart coordinator, as seen from this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEndpoint {
    /// Held by the primary: the secondary writes are mirrored to
    ReplicateTo(String),
    /// Held by the secondary: the primary, trusted as write origin
    TrustFrom { addr: String, ips: Vec<IpAddr> },
}

/// Validated, immutable node configuration shared by every session
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub role: NodeRole,
    pub listen_addr: SocketAddr,
    pub peer: PeerEndpoint,
    pub engine: EngineConfig,
    pub replication: ReplicationConfig,
    pub limits: ConnectionLimits,
}

impl NodeSettings {
    /// Primary node mirroring writes to `secondary`
    pub fn primary(listen_addr: SocketAddr, secondary: impl Into<String>) -> Self {
        Self {
            role: NodeRole::Primary,
            listen_addr,
            peer: PeerEndpoint::ReplicateTo(secondary.into()),
            engine: EngineConfig::default(),
            replication: ReplicationConfig::default(),
            limits: ConnectionLimits::default(),
        }
    }

    /// Secondary node trusting writes from `primary_ips`
    pub fn secondary(listen_addr: SocketAddr, primary_ips: Vec<IpAddr>) -> Self {
        let addr = primary_ips
            .first()
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        Self {
            role: NodeRole::Secondary,
            listen_addr,
            peer: PeerEndpoint::TrustFrom {
                addr,
                ips: primary_ips,
            },
            engine: EngineConfig::default(),
            replication: ReplicationConfig::default(),
            limits: ConnectionLimits::default(),
        }
    }

    /// Address writes are replicated to, if this node replicates
    pub fn replication_target(&self) -> Option<&str> {
        match &self.peer {
            PeerEndpoint::ReplicateTo(addr) => Some(addr),
            PeerEndpoint::TrustFrom { .. } => None,
        }
    }

    /// Addresses a write origin must match on a secondary
    pub fn trusted_primary_ips(&self) -> &[IpAddr] {
        match &self.peer {
            PeerEndpoint::TrustFrom { ips, .. } => ips,
            PeerEndpoint::ReplicateTo(_) => &[],
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from `kvrelay.toml` when present,
    /// then the environment. An explicit `path` must exist.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let mut builder = config::Config::builder().add_source(file).add_source(
            config::Environment::with_prefix("KVRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        for (var, key) in LEGACY_ENV {
            let value = std::env::var(var).ok().filter(|v| !v.trim().is_empty());
            builder = builder.set_override_option(*key, value)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate the raw configuration and freeze it into [`NodeSettings`]
    pub async fn resolve(self) -> Result<NodeSettings> {
        let role = self.node_role.ok_or_else(|| {
            Error::InvalidConfig("NODE_ROLE not set. Must be 'PRIMARY' or 'SECONDARY'.".into())
        })?;

        let port = match self.node_tcp_port {
            Some(port) => port,
            None => {
                tracing::warn!(
                    "NODE_TCP_PORT not set, using default port {}",
                    DEFAULT_NODE_TCP_PORT
                );
                DEFAULT_NODE_TCP_PORT
            }
        };
        let listen_addr = SocketAddr::new(self.listen_host, port);

        let peer = match role {
            NodeRole::Primary => {
                let addr = self
                    .secondary_node_addr
                    .filter(|a| !a.trim().is_empty())
                    .ok_or_else(|| {
                        Error::InvalidConfig(
                            "PRIMARY node requires SECONDARY_NODE_ADDR to be set.".into(),
                        )
                    })?;
                PeerEndpoint::ReplicateTo(addr.trim().to_string())
            }
            NodeRole::Secondary => {
                let addr = self.primary_node_addr.unwrap_or_default();
                let ips = resolve_primary(&addr).await?;
                PeerEndpoint::TrustFrom { addr, ips }
            }
        };

        if self.engine.max_response_bytes == 0 {
            return Err(Error::InvalidConfig(
                "engine.max_response_bytes must be greater than zero".into(),
            ));
        }
        if self.limits.max_connections == Some(0) {
            return Err(Error::InvalidConfig(
                "limits.max_connections must be greater than zero".into(),
            ));
        }

        Ok(NodeSettings {
            role,
            listen_addr,
            peer,
            engine: self.engine,
            replication: self.replication,
            limits: self.limits,
        })
    }
}

/// Resolve the primary's `host:port` to every address it may connect from
async fn resolve_primary(addr: &str) -> Result<Vec<IpAddr>> {
    let invalid =
        || Error::InvalidConfig("SECONDARY node requires a valid PRIMARY_NODE_ADDR to be set.".into());

    let (host, _port) = split_host_port(addr).ok_or_else(invalid)?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip.to_canonical()]);
    }

    let mut ips: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| {
            Error::InvalidConfig(format!("could not resolve primary host '{}': {}", host, e))
        })?
        .map(|sa| sa.ip().to_canonical())
        .collect();
    ips.sort();
    ips.dedup();

    if ips.is_empty() {
        return Err(invalid());
    }
    Ok(ips)
}

/// Split `host:port` / `[v6]:port`, requiring a non-empty host and a numeric port
fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let addr = addr.trim();
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || (host.contains(':') && !addr.starts_with('[')) {
        return None;
    }
    Some((host, port))
}
