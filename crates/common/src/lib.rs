//! wgmesh common library
//!
//! Shared errors, keys, control API payloads and the tunnel interface
//! reconciler used by both the rendezvous daemon and the node agent.

pub mod error;
pub mod keys;
pub mod tunnel;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use keys::{derive_public_key, generate_private_key, Key, KeyPair};
pub use tunnel::{
    DesiredPeer, DesiredPeerSet, DriverKind, InterfaceConfig, ReconcileReport, TunnelDriver,
    TunnelInterface,
};
pub use types::*;

pub use ipnetwork::IpNetwork;

/// wgmesh version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
