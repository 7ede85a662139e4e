//! Kernel WireGuard driver built on the `ip` and `wg` command line tools

use super::{DeviceConfig, PeerConfig, TunnelDriver};
use crate::keys::Key;
use crate::types::canonical_cidrs;
use crate::{Error, Result};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::io::Write;
use std::net::SocketAddr;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, trace};

/// Drives kernel WireGuard links through `ip(8)` and `wg(8)`.
///
/// Requires `CAP_NET_ADMIN`.
#[derive(Debug, Clone)]
pub struct WgCommandDriver {
    ip_bin: String,
    wg_bin: String,
}

impl Default for WgCommandDriver {
    fn default() -> Self {
        Self {
            ip_bin: "ip".to_string(),
            wg_bin: "wg".to_string(),
        }
    }
}

impl WgCommandDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use non-default tool paths
    pub fn with_binaries(ip_bin: impl Into<String>, wg_bin: impl Into<String>) -> Self {
        Self {
            ip_bin: ip_bin.into(),
            wg_bin: wg_bin.into(),
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        trace!(program, args = %args.join(" "), "running");

        let output = AsyncCommand::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Os(format!("failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            return Err(Error::Os(format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn ip(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.run(&self.ip_bin, &args).await
    }

    async fn wg(&self, args: Vec<String>) -> Result<String> {
        self.run(&self.wg_bin, &args).await
    }
}

#[async_trait]
impl TunnelDriver for WgCommandDriver {
    async fn link_exists(&self, name: &str) -> Result<bool> {
        let output = AsyncCommand::new(&self.ip_bin)
            .args(["link", "show", "dev", name])
            .output()
            .await
            .map_err(|e| Error::Os(format!("failed to run {}: {}", self.ip_bin, e)))?;

        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("does not exist") || stderr.contains("Cannot find device") {
            Ok(false)
        } else {
            Err(Error::Os(format!("ip link show {} failed: {}", name, stderr.trim())))
        }
    }

    async fn create_link(&self, name: &str) -> Result<()> {
        self.ip(&["link", "add", "dev", name, "type", "wireguard"]).await?;
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> Result<()> {
        self.ip(&["link", "set", "up", "dev", name]).await?;
        Ok(())
    }

    async fn assign_address(&self, name: &str, address: &IpNetwork) -> Result<()> {
        let address = address.to_string();
        self.ip(&["address", "replace", address.as_str(), "dev", name]).await?;
        Ok(())
    }

    async fn configure_device(&self, name: &str, device: &DeviceConfig) -> Result<()> {
        // wg only reads private keys from files; tempfile creates them 0600.
        let mut key_file = tempfile::NamedTempFile::new()?;
        writeln!(key_file, "{}", device.private_key.to_base64())?;
        key_file.flush()?;

        let key_path = key_file.path().to_string_lossy().to_string();
        self.wg(vec![
            "set".to_string(),
            name.to_string(),
            "private-key".to_string(),
            key_path,
            "listen-port".to_string(),
            device.listen_port.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn set_peer(&self, name: &str, peer: &PeerConfig) -> Result<()> {
        self.wg(set_peer_args(name, peer)).await?;
        debug!(interface = name, peer = %peer.public_key.short(), "wg set peer");
        Ok(())
    }

    async fn remove_peer(&self, name: &str, public_key: &Key) -> Result<()> {
        self.wg(vec![
            "set".to_string(),
            name.to_string(),
            "peer".to_string(),
            public_key.to_base64(),
            "remove".to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn peers(&self, name: &str) -> Result<Vec<PeerConfig>> {
        let dump = self
            .wg(vec!["show".to_string(), name.to_string(), "dump".to_string()])
            .await?;
        parse_dump(&dump)
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        self.ip(&["link", "del", "dev", name]).await?;
        Ok(())
    }
}

/// Arguments for `wg set <if> peer ...` that fully specify a peer.
///
/// `allowed-ips` replaces the existing list, so an update in place needs no
/// prior removal.
fn set_peer_args(name: &str, peer: &PeerConfig) -> Vec<String> {
    let mut args = vec![
        "set".to_string(),
        name.to_string(),
        "peer".to_string(),
        peer.public_key.to_base64(),
    ];

    if let Some(endpoint) = peer.endpoint {
        args.push("endpoint".to_string());
        args.push(endpoint.to_string());
    }

    args.push("allowed-ips".to_string());
    args.push(
        peer.allowed_ips
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(","),
    );

    args.push("persistent-keepalive".to_string());
    args.push(match peer.persistent_keepalive {
        Some(secs) => secs.to_string(),
        None => "off".to_string(),
    });

    args
}

/// Parse the output of `wg show <if> dump`.
///
/// The first line describes the interface; each following line is a peer:
/// `public-key preshared-key endpoint allowed-ips latest-handshake
/// transfer-rx transfer-tx persistent-keepalive`, tab separated.
pub fn parse_dump(dump: &str) -> Result<Vec<PeerConfig>> {
    let mut peers = Vec::new();

    for line in dump.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(Error::Os(format!("unexpected wg dump line: {}", line)));
        }

        let public_key = Key::from_base64(fields[0])
            .map_err(|e| Error::Os(format!("bad peer key in wg dump: {}", e)))?;

        let endpoint = match fields[2] {
            "(none)" => None,
            ep => Some(ep.parse::<SocketAddr>().map_err(|e| {
                Error::Os(format!("bad endpoint '{}' in wg dump: {}", ep, e))
            })?),
        };

        let allowed_ips = match fields[3] {
            "(none)" | "" => Vec::new(),
            list => {
                let items: Vec<&str> = list.split(',').collect();
                canonical_cidrs(&items)
                    .map_err(|e| Error::Os(format!("bad allowed-ips in wg dump: {}", e)))?
            }
        };

        let persistent_keepalive = match fields[7] {
            "off" | "0" => None,
            secs => Some(secs.parse::<u16>().map_err(|e| {
                Error::Os(format!("bad keepalive '{}' in wg dump: {}", secs, e))
            })?),
        };

        peers.push(PeerConfig {
            public_key,
            endpoint,
            allowed_ips,
            persistent_keepalive,
        });
    }

    Ok(peers)
}
