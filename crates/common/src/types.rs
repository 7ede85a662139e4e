//! Core types for wgmesh
//!
//! Wire payloads of the control API use camelCase field names.

use crate::keys::Key;
use crate::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Default WireGuard UDP port
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Default persistent keepalive interval, in seconds
pub const DEFAULT_KEEPALIVE_SECS: u16 = 25;

// ============================================================================
// Endpoint
// ============================================================================

/// Where a peer's tunnel listens
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Check the endpoint is usable
    pub fn validate(&self) -> Result<()> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(Error::Validation("endpoint host is empty".to_string()));
        }
        if host.contains(char::is_whitespace) || host.contains('/') {
            return Err(Error::Validation(format!("invalid endpoint host '{}'", host)));
        }
        if self.port == 0 {
            return Err(Error::Validation("endpoint port must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Resolve the endpoint to a socket address.
    ///
    /// IP literals are parsed directly; hostnames go through the system
    /// resolver and the first address wins.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        self.validate()?;
        let host = self.host.trim().trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let mut addrs = tokio::net::lookup_host((host, self.port))
            .await
            .map_err(|e| Error::Validation(format!("cannot resolve endpoint {}: {}", self, e)))?;
        addrs
            .next()
            .ok_or_else(|| Error::Validation(format!("endpoint {} resolved to no address", self)))
    }

    /// Same host, different port
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.host.trim();
        if host.parse::<std::net::Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", host, self.port)
        } else {
            write!(f, "{}:{}", host, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

// ============================================================================
// CIDR helpers
// ============================================================================

/// Parse a CIDR and normalize it to its network address.
///
/// `10.0.0.7/24` becomes `10.0.0.0/24`, which is how the kernel reports
/// allowed IPs back. A bare address is taken as a host route.
pub fn parse_cidr(s: &str) -> Result<IpNetwork> {
    let s = s.trim();
    let net: IpNetwork = s
        .parse()
        .map_err(|e| Error::Validation(format!("invalid CIDR '{}': {}", s, e)))?;
    Ok(IpNetwork::new(net.network(), net.prefix())?)
}

/// Whether two CIDR blocks share any address
pub fn cidrs_overlap(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// Parse, normalize, sort and dedup a list of CIDRs
pub fn canonical_cidrs<S: AsRef<str>>(items: &[S]) -> Result<Vec<IpNetwork>> {
    let mut nets = items
        .iter()
        .map(|s| parse_cidr(s.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    nets.sort_by_key(|n| (n.network(), n.prefix()));
    nets.dedup();
    Ok(nets)
}

// ============================================================================
// Registry descriptor and control API payloads
// ============================================================================

/// A registered node, as sent to `POST /register`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub id: String,
    pub token: String,
    pub public_key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    /// TCP port of the node's `connect` receiver; defaults to the endpoint port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,
    /// Mesh addresses the node owns
    #[serde(default, rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
}

impl PeerDescriptor {
    /// Validate everything except the token
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("peer id is empty".to_string()));
        }
        if let Some(endpoint) = &self.endpoint {
            endpoint.validate()?;
        }
        if self.control_port == Some(0) {
            return Err(Error::Validation("control port must be non-zero".to_string()));
        }
        canonical_cidrs(&self.allowed_ips)?;
        Ok(())
    }

    /// Address of the node's `connect` receiver, if it advertised an endpoint
    pub fn control_endpoint(&self) -> Option<Endpoint> {
        self.endpoint.as_ref().map(|ep| match self.control_port {
            Some(port) => ep.with_port(port),
            None => ep.clone(),
        })
    }
}

/// Successful `POST /register` response: the service's own tunnel address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub listen_addr: String,
    pub listen_port: u16,
}

/// Counterpart connection info pushed to a node's `POST /connect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub id: String,
    pub token: String,
    pub public_key: Key,
    pub endpoint: Endpoint,
    #[serde(default, rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
}

impl ConnectRequest {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("peer id is empty".to_string()));
        }
        self.endpoint.validate()?;
        canonical_cidrs(&self.allowed_ips)?;
        Ok(())
    }
}

/// Successful `POST /connect` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAck {
    pub peer_id: String,
}

/// Error body returned by both HTTP servers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// `GET /health` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}
