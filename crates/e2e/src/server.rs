//! Server management - running the rendezvous service and mesh nodes

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};
use wgmesh_agent::{ClientConfig, MeshClient};
use wgmesh_common::tunnel::{DriverKind, MemoryDriver, PeerConfig};
use wgmesh_common::Key;
use wgmesh_daemon::{PeerRegistry, RendezvousService, ServiceConfig};

use crate::error::{E2eError, E2eResult};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Install a test subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Handle to an in-process rendezvous service
pub struct ServiceHandle {
    pub base_url: String,
    pub port: u16,
    registry: Arc<PeerRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<wgmesh_common::Result<()>>>,
}

impl ServiceHandle {
    /// Start the service on an ephemeral loopback port
    pub async fn spawn(config: ServiceConfig) -> E2eResult<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let registry = Arc::new(PeerRegistry::new(config.peer_ttl()));
        let service = RendezvousService::new(config, registry.clone(), None)
            .map_err(|e| E2eError::ServerStartup(e.to_string()))?;

        info!("Spawning rendezvous service on port {}", port);
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(service.serve(listener, async move {
            let _ = rx.await;
        }));

        let handle = ServiceHandle {
            base_url,
            port,
            registry,
            shutdown: Some(tx),
            task: Some(task),
        };
        wait_for_healthy(&handle.base_url, STARTUP_TIMEOUT).await?;
        Ok(handle)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    /// Wait until `id` is registered
    pub async fn wait_for_registration(&self, id: &str, timeout: Duration) -> E2eResult<()> {
        let registry = self.registry.clone();
        poll(&format!("registration of {}", id), timeout, || {
            registry.get(id).ok().map(|_| ())
        })
        .await
    }

    /// Node configuration pointing at this service
    pub fn node_config(&self, id: &str, token: &str, address: &str) -> ClientConfig {
        ClientConfig {
            server_addr: "127.0.0.1".to_string(),
            server_port: self.port,
            peer_id: id.to_string(),
            token: token.to_string(),
            interface_name: format!("wg-{}", id),
            address: address.to_string(),
            endpoint_host: Some("127.0.0.1".to_string()),
            driver: DriverKind::Memory,
            ..Default::default()
        }
    }

    /// Stop the service and wait for it to exit
    pub async fn stop(mut self) -> E2eResult<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(result) => result?,
                Err(e) => return Err(E2eError::ServerStartup(format!("service task: {}", e))),
            }
        }
        Ok(())
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Handle to an in-process mesh node backed by the memory driver
pub struct NodeHandle {
    pub id: String,
    pub public_key: Key,
    pub control_port: u16,
    pub driver: Arc<MemoryDriver>,
    interface_name: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<wgmesh_common::Result<()>>>,
}

impl NodeHandle {
    /// Start a node; its `connect` receiver binds an ephemeral loopback port
    pub async fn spawn(mut config: ClientConfig) -> E2eResult<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let control_port = listener.local_addr()?.port();
        config.control_port = Some(control_port);

        let driver = Arc::new(MemoryDriver::new());
        let id = config.peer_id.clone();
        let interface_name = config.interface_name.clone();
        let client = MeshClient::new(config, driver.clone())?;
        let public_key = *client.public_key();

        info!("Spawning node {} with receiver on port {}", id, control_port);
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(client.run_with_listener(listener, async move {
            let _ = rx.await;
        }));

        Ok(NodeHandle {
            id,
            public_key,
            control_port,
            driver,
            interface_name,
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    /// Live peers of the node's interface
    pub fn peers(&self) -> Vec<PeerConfig> {
        self.driver
            .link(&self.interface_name)
            .map(|link| link.peers.into_values().collect())
            .unwrap_or_default()
    }

    /// Wait until the node's interface has a peer with `key`
    pub async fn wait_for_peer(&self, key: &Key, timeout: Duration) -> E2eResult<PeerConfig> {
        let what = format!("peer {} on {}", key.short(), self.id);
        poll(&what, timeout, || self.peers().into_iter().find(|p| p.public_key == *key)).await
    }

    /// Wait until the node's interface no longer has a peer with `key`
    pub async fn wait_for_peer_gone(&self, key: &Key, timeout: Duration) -> E2eResult<()> {
        let what = format!("removal of peer {} on {}", key.short(), self.id);
        poll(&what, timeout, || {
            (!self.peers().iter().any(|p| p.public_key == *key)).then_some(())
        })
        .await
    }

    /// Wait for the node's control loop to exit on its own
    pub async fn join(mut self) -> E2eResult<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(E2eError::ServerStartup(format!("node task: {}", e))),
        }
    }

    /// Shut the node down gracefully
    pub async fn stop(mut self) -> E2eResult<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.join().await
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Wait for the server to respond to health checks
pub async fn wait_for_healthy(base_url: &str, timeout_duration: Duration) -> E2eResult<()> {
    let health_url = format!("{}/health", base_url);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;

    let start = std::time::Instant::now();
    let mut attempts = 0;

    while start.elapsed() < timeout_duration {
        attempts += 1;

        match client.get(&health_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                return Ok(());
            }
            Ok(resp) => {
                warn!("Health check returned {}", resp.status());
            }
            Err(e) => {
                // Connection refused is expected while server is starting
                if !e.is_connect() {
                    warn!("Health check error: {}", e);
                }
            }
        }

        sleep(Duration::from_millis(50)).await;
    }

    Err(E2eError::ServerHealthCheck(attempts))
}

async fn poll<T>(what: &str, timeout: Duration, mut check: impl FnMut() -> Option<T>) -> E2eResult<T> {
    let start = std::time::Instant::now();
    loop {
        if let Some(value) = check() {
            return Ok(value);
        }
        if start.elapsed() >= timeout {
            return Err(E2eError::Timeout(what.to_string()));
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Find a free port to use
pub fn find_free_port() -> E2eResult<u16> {
    Ok(StdTcpListener::bind("127.0.0.1:0")?.local_addr()?.port())
}
