//! wgmesh rendezvous daemon
//!
//! Keeps the registry of mesh nodes and tells each node's configured
//! counterpart how to reach it.

pub mod config;
pub mod error;
pub mod push;
pub mod registry;
pub mod server;

pub use config::{ServiceConfig, ServiceTunnelConfig};
pub use push::{CounterpartNotifier, RetryPolicy};
pub use registry::{PeerRegistry, RegisteredPeer};
pub use server::RendezvousService;
