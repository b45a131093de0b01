//! Coordinator in front of the local storage engine
//!
//! The coordinator is responsible for:
//! - Admission control by node role and request origin
//! - Relaying commands to the storage engine over its Unix socket
//! - Mirroring committed writes from the primary to the secondary

pub mod admission;
pub mod command;
pub mod engine_client;
pub mod replication_client;
pub mod replication_log;
pub mod replicator;
pub mod server;
pub mod session;

pub use admission::{Admission, AdmissionPolicy, Origin};
pub use command::CommandKind;
pub use engine_client::StorageEngineClient;
pub use replication_client::{ReplicationClient, ReplicationOutcome};
pub use server::Coordinator;
