//! In-process tunnel driver
//!
//! Models the kernel's view of WireGuard links in memory. Used by tests and by
//! agents running in dry-run mode. Every mutating call is recorded in an
//! operation log, and one-shot failures can be injected at any primitive.

use super::{DeviceConfig, PeerConfig, TunnelDriver};
use crate::keys::Key;
use crate::{Error, Result};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// A mutating driver call, as recorded in the operation log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOp {
    CreateLink(String),
    SetLinkUp(String),
    AssignAddress(String, IpNetwork),
    ConfigureDevice(String),
    SetPeer(String, Key),
    RemovePeer(String, Key),
    DeleteLink(String),
}

/// Primitive at which a failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateLink,
    SetLinkUp,
    AssignAddress,
    ConfigureDevice,
    SetPeer,
    RemovePeer,
    Peers,
    DeleteLink,
}

/// State of one in-memory link
#[derive(Debug, Clone, Default)]
pub struct MemoryLink {
    pub up: bool,
    pub addresses: Vec<IpNetwork>,
    pub device: Option<DeviceConfig>,
    pub peers: BTreeMap<Key, PeerConfig>,
}

#[derive(Default)]
struct MemoryState {
    links: HashMap<String, MemoryLink>,
    ops: Vec<DriverOp>,
    fail_next: HashSet<FailPoint>,
}

/// Tunnel driver that keeps everything in memory
#[derive(Default)]
pub struct MemoryDriver {
    state: Mutex<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call at `point` fail with an OS error
    pub fn fail_next(&self, point: FailPoint) {
        self.state.lock().fail_next.insert(point);
    }

    /// Snapshot of a link
    pub fn link(&self, name: &str) -> Option<MemoryLink> {
        self.state.lock().links.get(name).cloned()
    }

    /// Recorded mutating calls, oldest first
    pub fn ops(&self) -> Vec<DriverOp> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    /// Number of times a link with this name was created
    pub fn links_created(&self, name: &str) -> usize {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| matches!(op, DriverOp::CreateLink(n) if n == name))
            .count()
    }

    /// Recorded calls that touched the given peer
    pub fn peer_ops(&self, public_key: &Key) -> Vec<DriverOp> {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| match op {
                DriverOp::SetPeer(_, k) | DriverOp::RemovePeer(_, k) => k == public_key,
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// Change a link behind the interface's back, as another tool would
    pub fn tamper<F: FnOnce(&mut MemoryLink)>(&self, name: &str, f: F) -> Result<()> {
        let mut state = self.state.lock();
        let link = state.links.get_mut(name).ok_or_else(|| no_device(name))?;
        f(link);
        Ok(())
    }
}

fn no_device(name: &str) -> Error {
    Error::Os(format!("Device \"{}\" does not exist", name))
}

impl MemoryState {
    fn check(&mut self, point: FailPoint) -> Result<()> {
        if self.fail_next.remove(&point) {
            return Err(Error::Os(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }

    fn link_mut(&mut self, name: &str) -> Result<&mut MemoryLink> {
        self.links.get_mut(name).ok_or_else(|| no_device(name))
    }
}

#[async_trait]
impl TunnelDriver for MemoryDriver {
    async fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().links.contains_key(name))
    }

    async fn create_link(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateLink)?;
        if state.links.contains_key(name) {
            return Err(Error::Os(format!("RTNETLINK answers: File exists ({})", name)));
        }
        state.links.insert(name.to_string(), MemoryLink::default());
        state.ops.push(DriverOp::CreateLink(name.to_string()));
        debug!(interface = name, "memory link created");
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::SetLinkUp)?;
        state.link_mut(name)?.up = true;
        state.ops.push(DriverOp::SetLinkUp(name.to_string()));
        Ok(())
    }

    async fn assign_address(&self, name: &str, address: &IpNetwork) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::AssignAddress)?;
        let link = state.link_mut(name)?;
        if !link.addresses.contains(address) {
            link.addresses.push(*address);
        }
        state.ops.push(DriverOp::AssignAddress(name.to_string(), *address));
        Ok(())
    }

    async fn configure_device(&self, name: &str, device: &DeviceConfig) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::ConfigureDevice)?;
        state.link_mut(name)?.device = Some(device.clone());
        state.ops.push(DriverOp::ConfigureDevice(name.to_string()));
        Ok(())
    }

    async fn set_peer(&self, name: &str, peer: &PeerConfig) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::SetPeer)?;
        let link = state.link_mut(name)?;

        // Like the kernel, an allowed IP belongs to exactly one peer.
        for (key, other) in link.peers.iter_mut() {
            if *key != peer.public_key {
                other.allowed_ips.retain(|net| !peer.allowed_ips.contains(net));
            }
        }

        let entry = link.peers.entry(peer.public_key).or_insert_with(|| PeerConfig {
            public_key: peer.public_key,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        });
        // An unset endpoint leaves the current one alone, as `wg set` does.
        if peer.endpoint.is_some() {
            entry.endpoint = peer.endpoint;
        }
        entry.allowed_ips = peer.allowed_ips.clone();
        entry.persistent_keepalive = peer.persistent_keepalive;

        state
            .ops
            .push(DriverOp::SetPeer(name.to_string(), peer.public_key));
        Ok(())
    }

    async fn remove_peer(&self, name: &str, public_key: &Key) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::RemovePeer)?;
        state.link_mut(name)?.peers.remove(public_key);
        state
            .ops
            .push(DriverOp::RemovePeer(name.to_string(), *public_key));
        Ok(())
    }

    async fn peers(&self, name: &str) -> Result<Vec<PeerConfig>> {
        let mut state = self.state.lock();
        state.check(FailPoint::Peers)?;
        Ok(state.link_mut(name)?.peers.values().cloned().collect())
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::DeleteLink)?;
        if state.links.remove(name).is_none() {
            return Err(no_device(name));
        }
        state.ops.push(DriverOp::DeleteLink(name.to_string()));
        Ok(())
    }
}
