//! wgmesh node agent
//!
//! Registers a node with the rendezvous service, receives counterpart pushes
//! and reconciles the local WireGuard interface.

pub mod agent;
pub mod client;
pub mod commands;
pub mod config;
pub mod receiver;

pub use agent::MeshClient;
pub use client::RendezvousClient;
pub use config::ClientConfig;
