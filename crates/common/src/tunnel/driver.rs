//! OS boundary for tunnel interfaces

use super::PeerConfig;
use crate::keys::Key;
use crate::Result;
use async_trait::async_trait;
use ipnetwork::IpNetwork;

/// Device-level WireGuard settings installed at creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub private_key: Key,
    pub listen_port: u16,
}

/// Primitives the kernel (or a stand-in) exposes for one WireGuard link.
///
/// Every method reports failures as `Error::Os`. Peer operations are
/// individually atomic: a `set_peer` either applies the whole peer or
/// nothing.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Whether a link with this name exists
    async fn link_exists(&self, name: &str) -> Result<bool>;

    /// Create a WireGuard link; fails if the name is taken
    async fn create_link(&self, name: &str) -> Result<()>;

    /// Bring the link administratively up
    async fn set_link_up(&self, name: &str) -> Result<()>;

    /// Assign an address, replacing an identical one if present
    async fn assign_address(&self, name: &str, address: &IpNetwork) -> Result<()>;

    /// Install the private key and listen port
    async fn configure_device(&self, name: &str, device: &DeviceConfig) -> Result<()>;

    /// Add a peer, or update it in place if the key is already present
    async fn set_peer(&self, name: &str, peer: &PeerConfig) -> Result<()>;

    /// Remove a peer by public key
    async fn remove_peer(&self, name: &str, public_key: &Key) -> Result<()>;

    /// Live peer configuration
    async fn peers(&self, name: &str) -> Result<Vec<PeerConfig>>;

    /// Tear the link down
    async fn delete_link(&self, name: &str) -> Result<()>;
}
