//! Node agent configuration

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use wgmesh_common::tunnel::DriverKind;
use wgmesh_common::{
    canonical_cidrs, DesiredPeer, Endpoint, Error, InterfaceConfig, IpNetwork, Key, Result,
    DEFAULT_KEEPALIVE_SECS, DEFAULT_LISTEN_PORT,
};

/// Node agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Rendezvous service host, with or without an `http://` scheme
    pub server_addr: String,

    /// Rendezvous service control port
    pub server_port: u16,

    /// This node's id in the registry
    #[serde(rename = "peerID")]
    pub peer_id: String,

    /// Shared registration token
    pub token: String,

    /// Tunnel private key; generated when absent
    pub private_key: Option<Key>,

    /// WireGuard UDP port
    pub listen_port: u16,

    /// Routes for a counterpart whose push carries none
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,

    pub interface_name: String,

    /// This node's tunnel address in CIDR form
    pub address: String,

    /// Host other nodes reach this one at; without it the node registers no
    /// endpoint and cannot be pushed to
    pub endpoint_host: Option<String>,

    /// TCP port of the `connect` receiver, defaults to the listen port
    pub control_port: Option<u16>,

    pub keepalive_secs: u16,

    /// Re-registration period in seconds, 0 disables
    pub reregister_interval_secs: u64,

    pub driver: DriverKind,

    /// Peers configured locally, reconciled alongside pushed counterparts
    pub static_peers: Vec<DesiredPeer>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".to_string(),
            server_port: 8080,
            peer_id: String::new(),
            token: String::new(),
            private_key: None,
            listen_port: DEFAULT_LISTEN_PORT,
            allowed_ips: Vec::new(),
            interface_name: "wg0".to_string(),
            address: "10.0.0.10/24".to_string(),
            endpoint_host: None,
            control_port: None,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            reregister_interval_secs: 120,
            driver: DriverKind::default(),
            static_peers: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Parse configuration from a JSON file, or TOML when the extension says so.
    ///
    /// Not validated: command line overrides are applied first, then
    /// [`Self::validate`] is called.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            _ => serde_json::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?,
        };

        Ok(config)
    }

    /// Apply command line overrides on top of the file values
    pub fn apply_overrides(&mut self, token: Option<String>) {
        if let Some(token) = token {
            self.token = token;
        }
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.peer_id.trim().is_empty() {
            return Err(Error::InvalidConfig("peerID must not be empty".to_string()));
        }
        if self.token.is_empty() {
            return Err(Error::InvalidConfig("token must not be empty".to_string()));
        }
        if self.server_addr.trim().is_empty() || self.server_port == 0 {
            return Err(Error::InvalidConfig(
                "serverAddr and serverPort are required".to_string(),
            ));
        }
        if self.listen_port == 0 || self.control_port == Some(0) {
            return Err(Error::InvalidConfig("ports must be non-zero".to_string()));
        }
        canonical_cidrs(&self.allowed_ips)
            .map_err(|e| Error::InvalidConfig(format!("allowedIPs: {}", e)))?;
        self.mesh_ip()?;
        if let Some(endpoint) = self.endpoint() {
            endpoint
                .validate()
                .map_err(|e| Error::InvalidConfig(format!("endpointHost: {}", e)))?;
        }
        Ok(())
    }

    /// Base URL of the rendezvous service
    pub fn server_url(&self) -> String {
        let addr = self.server_addr.trim().trim_end_matches('/');
        if addr.contains("://") {
            format!("{}:{}", addr, self.server_port)
        } else {
            format!("http://{}:{}", addr, self.server_port)
        }
    }

    pub fn control_port(&self) -> u16 {
        self.control_port.unwrap_or(self.listen_port)
    }

    /// Where this node's tunnel is reached, if advertised
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint_host
            .as_ref()
            .map(|host| Endpoint::new(host.trim(), self.listen_port))
    }

    fn mesh_ip(&self) -> Result<IpAddr> {
        let net: IpNetwork = self
            .address
            .trim()
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("address '{}': {}", self.address, e)))?;
        Ok(net.ip())
    }

    /// Host route for this node's tunnel address, advertised on registration
    pub fn advertised_ips(&self) -> Result<Vec<String>> {
        let ip = self.mesh_ip()?;
        let prefix = if ip.is_ipv4() { 32 } else { 128 };
        Ok(vec![format!("{}/{}", ip, prefix)])
    }

    pub fn reregister_interval(&self) -> Option<Duration> {
        (self.reregister_interval_secs > 0)
            .then(|| Duration::from_secs(self.reregister_interval_secs))
    }

    pub fn interface_config(&self) -> InterfaceConfig {
        InterfaceConfig {
            name: self.interface_name.clone(),
            address: Some(self.address.clone()),
            listen_port: self.listen_port,
            private_key: self.private_key,
        }
    }
}
