//! Common utilities and types shared across kvrelay

pub mod config;
pub mod error;
pub mod utils;

pub use config::{
    Config, ConnectionLimits, EngineConfig, EngineFraming, LogSyncPolicy, NodeRole,
    NodeSettings, PeerEndpoint, ReplicationConfig, ReplicationMode,
};
pub use error::{Error, Result};
pub use utils::{crc32, parse_duration, Backoff};
