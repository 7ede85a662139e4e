//! Tunnel interface lifecycle and reconciliation
//!
//! Continuously converges a WireGuard interface's live peers to a desired set.

use super::diff::{self, ReconcileReport};
use super::{DesiredPeerSet, DeviceConfig, PeerConfig, TunnelDriver};
use crate::keys::{Key, KeyPair};
use crate::types::{parse_cidr, DEFAULT_LISTEN_PORT};
use crate::{Error, Result};
use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Longest interface name Linux accepts (IFNAMSIZ - 1)
const MAX_NAME_LEN: usize = 15;

/// Process-wide operation locks, one per interface name
static INTERFACE_LOCKS: Lazy<parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> =
    Lazy::new(|| parking_lot::Mutex::new(HashMap::new()));

fn interface_lock(name: &str) -> Arc<tokio::sync::Mutex<()>> {
    INTERFACE_LOCKS
        .lock()
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

fn default_name() -> String {
    "wg0".to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

/// Interface settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Interface address in CIDR form, e.g. `10.0.0.10/24`
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Generated when absent
    #[serde(default)]
    pub private_key: Option<Key>,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            address: None,
            listen_port: DEFAULT_LISTEN_PORT,
            private_key: None,
        }
    }
}

/// Lifecycle of a [`TunnelInterface`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterfaceState {
    Absent,
    Created,
    Configured,
    Converged,
    Deleted,
}

impl InterfaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceState::Absent => "absent",
            InterfaceState::Created => "created",
            InterfaceState::Configured => "configured",
            InterfaceState::Converged => "converged",
            InterfaceState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What [`TunnelInterface::create`] found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

struct Inner {
    name: String,
    address: Option<IpNetwork>,
    listen_port: u16,
    keys: KeyPair,
    driver: Arc<dyn TunnelDriver>,
    state: parking_lot::Mutex<InterfaceState>,
    op_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Handle to one WireGuard interface.
///
/// Clones share state. Operations on the same interface name are serialized
/// across all handles in the process.
#[derive(Clone)]
pub struct TunnelInterface {
    inner: Arc<Inner>,
}

impl fmt::Debug for TunnelInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelInterface")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("public_key", &self.inner.keys.public_key().short())
            .finish()
    }
}

impl TunnelInterface {
    /// Build a handle; nothing is touched on the host until [`create`](Self::create)
    pub fn new(config: InterfaceConfig, driver: Arc<dyn TunnelDriver>) -> Result<Self> {
        validate_name(&config.name)?;
        if config.listen_port == 0 {
            return Err(Error::Validation("listen port must be non-zero".to_string()));
        }

        let address = config.address.as_deref().map(parse_address).transpose()?;
        let keys = match config.private_key {
            Some(private_key) => KeyPair::from_private(private_key),
            None => KeyPair::generate()?,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                op_lock: interface_lock(&config.name),
                name: config.name,
                address,
                listen_port: config.listen_port,
                keys,
                driver,
                state: parking_lot::Mutex::new(InterfaceState::Absent),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn public_key(&self) -> &Key {
        self.inner.keys.public_key()
    }

    pub fn listen_port(&self) -> u16 {
        self.inner.listen_port
    }

    pub fn address(&self) -> Option<IpNetwork> {
        self.inner.address
    }

    pub fn state(&self) -> InterfaceState {
        *self.inner.state.lock()
    }

    fn set_state(&self, state: InterfaceState) {
        let mut current = self.inner.state.lock();
        if *current != state {
            debug!(interface = %self.inner.name, from = %*current, to = %state, "state change");
            *current = state;
        }
    }

    fn ensure_live(&self, op: &str) -> Result<()> {
        if self.state() == InterfaceState::Deleted {
            return Err(Error::InvalidStateTransition {
                from: InterfaceState::Deleted.to_string(),
                to: op.to_string(),
            });
        }
        Ok(())
    }

    /// Create and configure the interface.
    ///
    /// An existing link is never created again. If this handle already
    /// configured it the call does nothing; otherwise the configuration is
    /// reapplied on top of what is there.
    pub async fn create(&self) -> Result<CreateOutcome> {
        let _guard = self.inner.op_lock.lock().await;
        self.ensure_live("create")?;
        let name = self.inner.name.as_str();
        let driver = &self.inner.driver;

        let outcome = if driver.link_exists(name).await? {
            if self.state() >= InterfaceState::Configured {
                info!(interface = name, "Interface already exists and is configured, nothing to do");
                return Ok(CreateOutcome::AlreadyExists);
            }
            info!(interface = name, "Interface already exists, reapplying configuration");
            CreateOutcome::AlreadyExists
        } else {
            driver.create_link(name).await?;
            self.set_state(InterfaceState::Created);
            info!(interface = name, "Interface created");
            CreateOutcome::Created
        };

        if self.state() == InterfaceState::Absent {
            self.set_state(InterfaceState::Created);
        }

        driver.set_link_up(name).await?;
        if let Some(address) = &self.inner.address {
            driver.assign_address(name, address).await?;
        }
        driver
            .configure_device(
                name,
                &DeviceConfig {
                    private_key: *self.inner.keys.private_key(),
                    listen_port: self.inner.listen_port,
                },
            )
            .await?;

        self.set_state(InterfaceState::Configured);
        info!(
            interface = name,
            listen_port = self.inner.listen_port,
            public_key = %self.public_key(),
            "Interface configured"
        );
        Ok(outcome)
    }

    /// Converge the live peers to `desired`.
    ///
    /// Bad entries are reported per peer and leave the rest of the set
    /// unaffected. A driver failure aborts the pass with an error; running it
    /// again picks up where it stopped.
    pub async fn reconcile(&self, desired: &DesiredPeerSet) -> Result<ReconcileReport> {
        let _guard = self.inner.op_lock.lock().await;
        self.ensure_live("reconcile")?;

        let state = self.state();
        if state < InterfaceState::Configured {
            return Err(Error::InvalidStateTransition {
                from: state.to_string(),
                to: "reconcile".to_string(),
            });
        }

        let name = self.inner.name.as_str();
        let prepared = diff::prepare(desired).await;
        for failure in &prepared.failures {
            warn!(interface = name, peer = %failure.public_key, "Skipping peer: {}", failure.reason);
        }

        let actual = self.inner.driver.peers(name).await?;
        let plan = diff::plan(&prepared.peers, &prepared.held, &actual);

        let mut report = ReconcileReport {
            unchanged: plan.unchanged.len(),
            failures: prepared.failures,
            ..Default::default()
        };

        if let Err(e) = self.apply(&plan, &mut report).await {
            self.set_state(InterfaceState::Configured);
            return Err(e);
        }

        self.set_state(if report.is_clean() {
            InterfaceState::Converged
        } else {
            InterfaceState::Configured
        });

        if report.is_noop() {
            debug!(interface = name, unchanged = report.unchanged, "Peers already converged");
        } else {
            info!(
                interface = name,
                added = report.added.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                unchanged = report.unchanged,
                failed = report.failures.len(),
                "Peers reconciled"
            );
        }
        Ok(report)
    }

    async fn apply(&self, plan: &diff::ReconcilePlan, report: &mut ReconcileReport) -> Result<()> {
        let name = self.inner.name.as_str();
        let driver = &self.inner.driver;

        for key in &plan.remove {
            driver.remove_peer(name, key).await?;
            debug!(interface = name, peer = %key.short(), "peer removed");
            report.removed.push(*key);
        }

        for peer in &plan.update {
            driver.set_peer(name, peer).await?;
            debug!(interface = name, peer = %peer.public_key.short(), "peer updated");
            report.updated.push(peer.public_key);
        }

        for peer in &plan.replace {
            driver.remove_peer(name, &peer.public_key).await?;
            driver.set_peer(name, peer).await?;
            debug!(interface = name, peer = %peer.public_key.short(), "peer replaced");
            report.updated.push(peer.public_key);
        }

        for peer in &plan.add {
            driver.set_peer(name, peer).await?;
            debug!(interface = name, peer = %peer.public_key.short(), "peer added");
            report.added.push(peer.public_key);
        }

        Ok(())
    }

    /// Remove one live peer by its base64 public key
    pub async fn remove_peer(&self, public_key: &str) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;
        self.ensure_live("remove_peer")?;
        let key = Key::from_base64(public_key)?;
        let name = self.inner.name.as_str();

        let live = self.inner.driver.peers(name).await?;
        if !live.iter().any(|p| p.public_key == key) {
            return Err(Error::not_found("peer", key.to_base64()));
        }

        self.inner.driver.remove_peer(name, &key).await?;
        if self.state() == InterfaceState::Converged {
            self.set_state(InterfaceState::Configured);
        }
        info!(interface = name, peer = %key.short(), "Peer removed");
        Ok(())
    }

    /// Public keys of the live peers
    pub async fn list_peers(&self) -> Result<BTreeSet<Key>> {
        Ok(self.peers().await?.into_iter().map(|p| p.public_key).collect())
    }

    /// Live peer configuration, read from the driver
    pub async fn peers(&self) -> Result<Vec<PeerConfig>> {
        let _guard = self.inner.op_lock.lock().await;
        self.ensure_live("peers")?;
        self.inner.driver.peers(&self.inner.name).await
    }

    /// Tear the interface down
    pub async fn delete(&self) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;
        self.ensure_live("delete")?;
        let name = self.inner.name.as_str();

        if !self.inner.driver.link_exists(name).await? {
            return Err(Error::not_found("interface", name));
        }

        self.inner.driver.delete_link(name).await?;
        self.set_state(InterfaceState::Deleted);
        info!(interface = name, "Interface deleted");
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "interface name '{}' must be 1 to {} characters",
            name, MAX_NAME_LEN
        )));
    }
    if name.contains('/') || name.contains(char::is_whitespace) || name == "." || name == ".." {
        return Err(Error::Validation(format!("invalid interface name '{}'", name)));
    }
    Ok(())
}

/// Interface addresses keep their host part, unlike allowed IPs
fn parse_address(s: &str) -> Result<IpNetwork> {
    parse_cidr(s)?;
    s.trim()
        .parse()
        .map_err(|e| Error::Validation(format!("invalid interface address '{}': {}", s, e)))
}
