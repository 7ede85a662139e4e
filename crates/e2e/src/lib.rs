//! wgmesh end-to-end harness
//!
//! Runs the rendezvous service and mesh nodes in process, each on its own
//! ephemeral port, with nodes using the in-memory tunnel driver:
//!
//! ```text
//! ServiceHandle (RendezvousService on 127.0.0.1:<port>)
//!   ▲ POST /register             │ POST /connect
//!   │                            ▼
//! NodeHandle (MeshClient + MemoryDriver, receiver on 127.0.0.1:<port>)
//! ```

pub mod error;
pub mod server;

pub use error::{E2eError, E2eResult};
pub use server::{find_free_port, init_tracing, NodeHandle, ServiceHandle};
