//! Tunnel interface management
//!
//! A [`TunnelInterface`] owns one WireGuard interface and converges its live
//! peer set to a [`DesiredPeerSet`]. All OS interaction goes through the
//! [`TunnelDriver`] trait:
//! - [`WgCommandDriver`] drives the kernel with the `ip` and `wg` tools
//! - [`MemoryDriver`] keeps the interface state in process, for tests and
//!   dry runs

pub mod diff;
pub mod driver;
pub mod interface;
pub mod memory;
pub mod wg;

use crate::keys::Key;
use crate::types::{canonical_cidrs, Endpoint};
use crate::Result;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

pub use diff::{PeerFailure, ReconcilePlan, ReconcileReport};
pub use driver::{DeviceConfig, TunnelDriver};
pub use interface::{CreateOutcome, InterfaceConfig, InterfaceState, TunnelInterface};
pub use memory::{DriverOp, FailPoint, MemoryDriver};
pub use wg::WgCommandDriver;

/// Which [`TunnelDriver`] a process should use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Kernel WireGuard via `ip` and `wg`
    #[default]
    Wg,
    /// In-process model, no privileges needed
    Memory,
}

impl DriverKind {
    pub fn build(self) -> Arc<dyn TunnelDriver> {
        match self {
            DriverKind::Wg => Arc::new(WgCommandDriver::new()),
            DriverKind::Memory => Arc::new(MemoryDriver::new()),
        }
    }
}

/// A peer as applied to (or read back from) the tunnel driver.
///
/// Allowed IPs are kept sorted, deduplicated and normalized to their network
/// address so that desired and live state compare structurally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: Key,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNetwork>,
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    /// Whether the live peer already has this configuration.
    ///
    /// A desired peer without an endpoint accepts whatever endpoint the live
    /// peer has learned from roaming.
    pub fn satisfied_by(&self, live: &PeerConfig) -> bool {
        self.public_key == live.public_key
            && self.allowed_ips == live.allowed_ips
            && self.persistent_keepalive == live.persistent_keepalive
            && (self.endpoint.is_none() || self.endpoint == live.endpoint)
    }
}

/// One entry of a desired peer set, as supplied by the operator or agent.
///
/// Fields are kept as text so a malformed entry can be reported on its own
/// without rejecting the whole set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredPeer {
    pub public_key: String,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default, rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    #[serde(default, rename = "keepAliveSeconds")]
    pub keepalive_secs: u16,
}

impl DesiredPeer {
    /// Parse into a driver-ready configuration, resolving the endpoint
    pub async fn to_config(&self) -> Result<PeerConfig> {
        let public_key = Key::from_base64(&self.public_key)?;
        let allowed_ips = canonical_cidrs(&self.allowed_ips)?;
        let endpoint = match &self.endpoint {
            Some(ep) => Some(ep.resolve().await?),
            None => None,
        };
        Ok(PeerConfig {
            public_key,
            endpoint,
            allowed_ips,
            persistent_keepalive: (self.keepalive_secs > 0).then_some(self.keepalive_secs),
        })
    }
}

/// Ordered target configuration for one interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DesiredPeerSet {
    peers: Vec<DesiredPeer>,
}

impl DesiredPeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, peer: DesiredPeer) {
        self.peers.push(peer);
    }

    pub fn iter(&self) -> impl Iterator<Item = &DesiredPeer> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl From<Vec<DesiredPeer>> for DesiredPeerSet {
    fn from(peers: Vec<DesiredPeer>) -> Self {
        Self { peers }
    }
}

impl FromIterator<DesiredPeer> for DesiredPeerSet {
    fn from_iter<I: IntoIterator<Item = DesiredPeer>>(iter: I) -> Self {
        Self {
            peers: iter.into_iter().collect(),
        }
    }
}
