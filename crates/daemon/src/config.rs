//! Rendezvous service configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use wgmesh_common::tunnel::DriverKind;
use wgmesh_common::{parse_cidr, Error, Key, Result, DEFAULT_LISTEN_PORT};

/// Rendezvous service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Tunnel address handed to registering nodes
    pub listen_addr: String,

    /// WireGuard UDP port handed to registering nodes
    pub listen_port: u16,

    /// Host the control API binds to
    pub bind_addr: String,

    /// Control API TCP port
    pub control_port: u16,

    /// Service tunnel private key; generated when absent
    pub private_key: Option<Key>,

    /// Shared secret every node must present
    pub token: String,

    /// Registrant id -> id of the peer that must learn about it
    pub connected_peers: HashMap<String, String>,

    /// Registration lifetime in seconds, 0 disables expiry
    pub peer_ttl_secs: u64,

    /// Timeout for one `connect` push
    pub push_timeout_ms: u64,

    /// Push attempts when the counterpart refuses the connection
    pub push_max_attempts: u32,

    /// Run a tunnel interface peered with every registered node
    pub tunnel: Option<ServiceTunnelConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "10.0.0.1".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            bind_addr: "0.0.0.0".to_string(),
            control_port: 8080,
            private_key: None,
            token: String::new(),
            connected_peers: HashMap::new(),
            peer_ttl_secs: 600,
            push_timeout_ms: 5000,
            push_max_attempts: 1,
            tunnel: None,
        }
    }
}

/// The service's own tunnel interface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTunnelConfig {
    #[serde(default = "default_interface_name")]
    pub name: String,
    /// Interface address in CIDR form
    pub address: String,
    #[serde(default)]
    pub driver: DriverKind,
}

fn default_interface_name() -> String {
    "wg0".to_string()
}

impl ServiceConfig {
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
    pub fn apply_overrides(&mut self, token: Option<String>, control_port: Option<u16>) {
        if let Some(token) = token {
            self.token = token;
        }
        if let Some(port) = control_port {
            self.control_port = port;
        }
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(Error::InvalidConfig("token must not be empty".to_string()));
        }
        if self.listen_port == 0 || self.control_port == 0 {
            return Err(Error::InvalidConfig("ports must be non-zero".to_string()));
        }
        if self.push_max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "pushMaxAttempts must be at least 1".to_string(),
            ));
        }
        for (from, to) in &self.connected_peers {
            if from == to {
                return Err(Error::InvalidConfig(format!(
                    "peer '{}' is connected to itself",
                    from
                )));
            }
        }
        if let Some(tunnel) = &self.tunnel {
            parse_cidr(&tunnel.address)
                .map_err(|e| Error::InvalidConfig(format!("tunnel address: {}", e)))?;
        }
        Ok(())
    }

    /// Registration lifetime, `None` when expiry is disabled
    pub fn peer_ttl(&self) -> Option<Duration> {
        (self.peer_ttl_secs > 0).then(|| Duration::from_secs(self.peer_ttl_secs))
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}
