//! Mesh node agent
//!
//! Brings up the local tunnel, registers with the rendezvous service and
//! keeps the tunnel's peers in line with the counterparts the service pushes.

use crate::client::RendezvousClient;
use crate::config::ClientConfig;
use crate::receiver::{self, PUSH_QUEUE_DEPTH};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};
use wgmesh_common::{
    ConnectRequest, DesiredPeer, DesiredPeerSet, Error, Key, PeerDescriptor, ReconcileReport,
    Result, TunnelDriver, TunnelInterface,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A mesh node
pub struct MeshClient {
    config: ClientConfig,
    interface: TunnelInterface,
    rendezvous: RendezvousClient,
    counterparts: BTreeMap<String, ConnectRequest>,
}

impl MeshClient {
    pub fn new(config: ClientConfig, driver: Arc<dyn TunnelDriver>) -> Result<Self> {
        config.validate()?;
        let interface = TunnelInterface::new(config.interface_config(), driver)?;
        let rendezvous = RendezvousClient::new(config.server_url(), REQUEST_TIMEOUT)?;

        Ok(Self {
            config,
            interface,
            rendezvous,
            counterparts: BTreeMap::new(),
        })
    }

    pub fn interface(&self) -> &TunnelInterface {
        &self.interface
    }

    pub fn public_key(&self) -> &Key {
        self.interface.public_key()
    }

    /// What this node registers as
    pub fn descriptor(&self) -> Result<PeerDescriptor> {
        Ok(PeerDescriptor {
            id: self.config.peer_id.clone(),
            token: self.config.token.clone(),
            public_key: *self.public_key(),
            endpoint: self.config.endpoint(),
            control_port: Some(self.config.control_port()),
            allowed_ips: self.config.advertised_ips()?,
        })
    }

    /// Static peers followed by every known counterpart, in id order
    pub fn desired_peers(&self) -> DesiredPeerSet {
        let counterparts = self.counterparts.values().map(|c| DesiredPeer {
            public_key: c.public_key.to_base64(),
            endpoint: Some(c.endpoint.clone()),
            allowed_ips: if c.allowed_ips.is_empty() {
                self.config.allowed_ips.clone()
            } else {
                c.allowed_ips.clone()
            },
            keepalive_secs: self.config.keepalive_secs,
        });

        self.config
            .static_peers
            .iter()
            .cloned()
            .chain(counterparts)
            .collect()
    }

    /// Bind the `connect` receiver on all addresses and run until `shutdown`
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(("0.0.0.0", self.config.control_port())).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Run with an already bound `connect` receiver
    pub async fn run_with_listener<F>(mut self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.interface.create().await?;

        let (push_tx, mut push_rx) = mpsc::channel(PUSH_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let app = receiver::router(&self.config.token, push_tx);
        info!("Connect receiver listening on {}", listener.local_addr()?);
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        match self.register().await {
            Ok(()) => {}
            Err(e @ (Error::Unauthorized(_) | Error::Validation(_))) => {
                let _ = stop_tx.send(());
                let _ = server.await;
                return Err(e);
            }
            Err(e) => warn!("Registration failed, retrying later: {}", e),
        }
        self.reconcile().await;

        let mut ticker = self.config.reregister_interval().map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
                Some(push) = push_rx.recv() => {
                    self.accept_push(push);
                    self.reconcile().await;
                }
                _ = next_tick(&mut ticker) => {
                    if let Err(e) = self.register().await {
                        warn!("Re-registration failed: {}", e);
                    }
                    self.reconcile().await;
                }
            }
        }

        if let Err(e) = self
            .rendezvous
            .deregister(&self.config.peer_id, &self.config.token)
            .await
        {
            debug!("Deregistration failed: {}", e);
        }

        let _ = stop_tx.send(());
        match server.await {
            Ok(result) => result?,
            Err(e) => return Err(Error::Internal(format!("connect receiver panicked: {}", e))),
        }
        Ok(())
    }

    async fn register(&self) -> Result<()> {
        let ack = self.rendezvous.register(&self.descriptor()?).await?;
        info!(
            peer = %self.config.peer_id,
            service = %format!("{}:{}", ack.listen_addr, ack.listen_port),
            "Registered with {}",
            self.rendezvous.base_url()
        );
        Ok(())
    }

    fn accept_push(&mut self, push: ConnectRequest) {
        info!(
            counterpart = %push.id,
            endpoint = %push.endpoint,
            public_key = %push.public_key.short(),
            "Counterpart updated"
        );
        self.counterparts.insert(push.id.clone(), push);
    }

    /// Converge the interface; failures are logged and retried on the next event
    async fn reconcile(&self) -> Option<ReconcileReport> {
        match self.interface.reconcile(&self.desired_peers()).await {
            Ok(report) => {
                for failure in &report.failures {
                    warn!("Peer {} not applied: {}", failure.public_key, failure.reason);
                }
                Some(report)
            }
            Err(e) => {
                error!("Failed to reconcile {}: {}", self.interface.name(), e);
                None
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgmesh_common::tunnel::MemoryDriver;
    use wgmesh_common::{derive_public_key, generate_private_key, Endpoint};

    fn config(allowed_ips: &[&str]) -> ClientConfig {
        ClientConfig {
            peer_id: "bob".to_string(),
            token: "s3cret".to_string(),
            interface_name: "wga-unit".to_string(),
            endpoint_host: Some("5.6.7.8".to_string()),
            control_port: Some(8081),
            allowed_ips: allowed_ips.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn push(id: &str, allowed_ips: &[&str]) -> ConnectRequest {
        ConnectRequest {
            id: id.to_string(),
            token: "s3cret".to_string(),
            public_key: derive_public_key(&generate_private_key().unwrap()),
            endpoint: Endpoint::new("1.2.3.4", 51820),
            allowed_ips: allowed_ips.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_descriptor() {
        let client = MeshClient::new(config(&[]), Arc::new(MemoryDriver::new())).unwrap();
        let descriptor = client.descriptor().unwrap();
        assert_eq!(descriptor.id, "bob");
        assert_eq!(descriptor.public_key, *client.public_key());
        assert_eq!(descriptor.endpoint, Some(Endpoint::new("5.6.7.8", 51820)));
        assert_eq!(descriptor.control_port, Some(8081));
        assert_eq!(descriptor.allowed_ips, vec!["10.0.0.10/32"]);
    }

    #[tokio::test]
    async fn test_desired_peers_fall_back_to_configured_routes() {
        let mut client =
            MeshClient::new(config(&["10.0.0.0/24"]), Arc::new(MemoryDriver::new())).unwrap();
        client.accept_push(push("alice", &[]));

        let desired: Vec<_> = client.desired_peers().iter().cloned().collect();
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].allowed_ips, vec!["10.0.0.0/24"]);
        assert_eq!(desired[0].endpoint, Some(Endpoint::new("1.2.3.4", 51820)));
        assert_eq!(desired[0].keepalive_secs, 25);
    }

    #[tokio::test]
    async fn test_later_push_replaces_counterpart() {
        let mut client =
            MeshClient::new(config(&["10.0.0.0/24"]), Arc::new(MemoryDriver::new())).unwrap();
        client.accept_push(push("alice", &["10.0.0.1/32"]));
        let newer = push("alice", &["10.0.0.1/32"]);
        let newer_key = newer.public_key;
        client.accept_push(newer);

        let desired: Vec<_> = client.desired_peers().iter().cloned().collect();
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].public_key, newer_key.to_base64());
        assert_eq!(desired[0].allowed_ips, vec!["10.0.0.1/32"]);
    }

    #[tokio::test]
    async fn test_static_peers_come_first() {
        let static_key = derive_public_key(&generate_private_key().unwrap());
        let mut cfg = config(&[]);
        cfg.static_peers = vec![DesiredPeer {
            public_key: static_key.to_base64(),
            endpoint: Some(Endpoint::new("192.168.1.101", 51820)),
            allowed_ips: vec!["10.0.0.254/32".to_string()],
            keepalive_secs: 25,
        }];
        let mut client = MeshClient::new(cfg, Arc::new(MemoryDriver::new())).unwrap();
        client.accept_push(push("alice", &["10.0.0.1/32"]));

        let desired: Vec<_> = client.desired_peers().iter().cloned().collect();
        assert_eq!(desired.len(), 2);
        assert_eq!(desired[0].public_key, static_key.to_base64());
    }

    #[tokio::test]
    async fn test_reconcile_applies_counterparts() {
        let driver = Arc::new(MemoryDriver::new());
        let mut client = MeshClient::new(config(&[]), driver.clone()).unwrap();
        client.interface().create().await.unwrap();

        let alice = push("alice", &["10.0.0.1/32"]);
        let alice_key = alice.public_key;
        client.accept_push(alice);
        let report = client.reconcile().await.unwrap();

        assert_eq!(report.added, vec![alice_key]);
        let link = driver.link("wga-unit").unwrap();
        assert!(link.peers.contains_key(&alice_key));
    }
}
