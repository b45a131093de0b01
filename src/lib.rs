//! # kvrelay
//!
//! Coordinator for a two-node (primary/secondary) key-value cluster:
//! - Text line protocol for clients (`PUT key value`, `GET key`, ...)
//! - Writes admitted only on the primary, or from the primary on the secondary
//! - Commands relayed to a local storage engine over a Unix socket
//! - Committed writes mirrored to the secondary, inline or through a durable backlog
//!
//! ## Architecture
//!
//! ```text
//!   clients                              clients (reads)
//!      │                                      │
//! ┌────▼──────────────┐   PUT ... \n    ┌─────▼─────────────┐
//! │ Primary           │ ──────────────► │ Secondary         │
//! │ coordinator       │ ◄────────────── │ coordinator       │
//! └────┬──────────────┘     OK ... \n   └─────┬─────────────┘
//!      │ unix socket                          │ unix socket
//! ┌────▼──────────────┐                 ┌─────▼─────────────┐
//! │ storage engine    │                 │ storage engine    │
//! └───────────────────┘                 └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the secondary, then the primary
//! ```bash
//! NODE_ROLE=SECONDARY NODE_TCP_PORT=7001 PRIMARY_NODE_ADDR=10.0.0.1:7000 \
//!   kvrelay-coord serve
//! NODE_ROLE=PRIMARY NODE_TCP_PORT=7000 SECONDARY_NODE_ADDR=10.0.0.2:7001 \
//!   kvrelay-coord serve
//! ```
//!
//! ### Talk to a node
//! ```bash
//! kvrelay --host 10.0.0.1 --port 7000
//! kvrelay --host 10.0.0.1 --port 7000 "PUT alice age 30" "GET alice"
//! ```

pub mod client;
pub mod common;
pub mod coordinator;

pub use client::Client;
pub use common::{Config, Error, NodeSettings, Result};
pub use coordinator::Coordinator;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
