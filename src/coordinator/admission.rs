//! Write admission by node role and request origin
//!
//! The primary accepts everything. A secondary accepts reads from anyone and
//! writes only from the primary: either a session that presented the shared
//! secret (when one is configured) or, without a secret, a connection whose
//! source IP is one of the primary's addresses. Source-IP trust is weak
//! authentication; configure a shared secret where NAT or proxies sit between
//! the coordinators.

use crate::common::{NodeRole, NodeSettings};
use crate::coordinator::command::CommandKind;
use std::net::IpAddr;

pub const REJECT_WRITES_ONLY_ON_PRIMARY: &str = "writes only allowed on primary";

/// Where a command came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub ip: IpAddr,
    /// Session presented the shared secret
    pub authenticated: bool,
}

impl Origin {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip: ip.to_canonical(),
            authenticated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject(&'static str),
}

impl Admission {
    pub fn is_accept(&self) -> bool {
        matches!(self, Admission::Accept)
    }
}

/// Stateless admission decision, built once from the node settings
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    role: NodeRole,
    trusted_primary: Vec<IpAddr>,
    require_secret: bool,
}

impl AdmissionPolicy {
    pub fn new(role: NodeRole, trusted_primary: Vec<IpAddr>, require_secret: bool) -> Self {
        Self {
            role,
            trusted_primary: trusted_primary.into_iter().map(|ip| ip.to_canonical()).collect(),
            require_secret,
        }
    }

    pub fn from_settings(settings: &NodeSettings) -> Self {
        Self::new(
            settings.role,
            settings.trusted_primary_ips().to_vec(),
            settings.replication.shared_secret.is_some(),
        )
    }

    pub fn decide(&self, kind: CommandKind, origin: &Origin) -> Admission {
        match (self.role, kind) {
            (NodeRole::Primary, _) | (NodeRole::Secondary, CommandKind::Read) => Admission::Accept,
            (NodeRole::Secondary, CommandKind::Write) => {
                if self.is_from_primary(origin) {
                    Admission::Accept
                } else {
                    Admission::Reject(REJECT_WRITES_ONLY_ON_PRIMARY)
                }
            }
        }
    }

    fn is_from_primary(&self, origin: &Origin) -> bool {
        if self.require_secret {
            origin.authenticated
        } else {
            self.trusted_primary.contains(&origin.ip.to_canonical())
        }
    }
}
