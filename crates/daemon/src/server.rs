//! Rendezvous HTTP service
//!
//! Accepts node registrations, stores them in the [`PeerRegistry`] and pushes
//! each registrant's connection info to its configured counterpart.

use crate::config::ServiceConfig;
use crate::error::ApiError;
use crate::push::{CounterpartNotifier, RetryPolicy};
use crate::registry::PeerRegistry;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use wgmesh_common::{
    DesiredPeer, DesiredPeerSet, Error, HealthResponse, PeerDescriptor, RegisterResponse, Result,
    TunnelInterface, DEFAULT_KEEPALIVE_SECS,
};

const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(100);

/// Shared handler state
pub struct ServiceState {
    config: ServiceConfig,
    registry: Arc<PeerRegistry>,
    notifier: CounterpartNotifier,
    token_digest: [u8; 32],
    tunnel: Option<TunnelInterface>,
    /// Held from registry snapshot to the end of the tunnel reconcile
    tunnel_sync: tokio::sync::Mutex<()>,
}

impl ServiceState {
    fn authorize(&self, token: &str) -> Result<()> {
        let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        if digest != self.token_digest {
            return Err(Error::Unauthorized("invalid token".to_string()));
        }
        Ok(())
    }

    /// Tell the registrant's counterpart about it. Failures are only logged.
    async fn push_to_counterpart(&self, id: &str) {
        let Some(target_id) = self.config.connected_peers.get(id) else {
            debug!(peer = %id, "no counterpart configured");
            return;
        };

        let (registrant, target) = self.registry.get_pair(id, target_id);
        let (Some(registrant), Some(target)) = (registrant, target) else {
            debug!(peer = %id, counterpart = %target_id, "counterpart not registered yet");
            return;
        };

        match self.notifier.notify(&registrant, &target).await {
            Ok(ack) => info!(
                peer = %id,
                counterpart = %target_id,
                acked = %ack.peer_id,
                "Counterpart notified"
            ),
            Err(e) => warn!("Failed to notify {} about {}: {}", target_id, id, e),
        }
    }

    /// Converge the service's own interface to every node that advertised
    /// mesh addresses
    async fn sync_tunnel(&self) {
        let Some(tunnel) = &self.tunnel else {
            return;
        };

        // A snapshot must not be applied after a newer one
        let _guard = self.tunnel_sync.lock().await;
        let desired: DesiredPeerSet = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|p| !p.descriptor.allowed_ips.is_empty())
            .map(|p| DesiredPeer {
                public_key: p.descriptor.public_key.to_base64(),
                endpoint: p.descriptor.endpoint,
                allowed_ips: p.descriptor.allowed_ips,
                keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            })
            .collect();

        match tunnel.reconcile(&desired).await {
            Ok(report) => {
                for failure in &report.failures {
                    warn!(
                        "Service tunnel skipped peer {}: {}",
                        failure.public_key, failure.reason
                    );
                }
            }
            Err(e) => warn!("Failed to reconcile service tunnel {}: {}", tunnel.name(), e),
        }
    }
}

/// The rendezvous service
#[derive(Clone)]
pub struct RendezvousService {
    state: Arc<ServiceState>,
}

impl RendezvousService {
    /// Build the service around an injected registry.
    ///
    /// `tunnel`, when given, must already be created.
    pub fn new(
        config: ServiceConfig,
        registry: Arc<PeerRegistry>,
        tunnel: Option<TunnelInterface>,
    ) -> Result<Self> {
        config.validate()?;
        let notifier = CounterpartNotifier::new(
            config.push_timeout(),
            config.token.clone(),
            RetryPolicy {
                max_attempts: config.push_max_attempts,
                ..Default::default()
            },
        )?;
        let token_digest = Sha256::digest(config.token.as_bytes()).into();

        Ok(Self {
            state: Arc::new(ServiceState {
                config,
                registry,
                notifier,
                token_digest,
                tunnel,
                tunnel_sync: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.state.registry.clone()
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/register", post(register_handler))
            .route("/register/:id", delete(deregister_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on `listener` until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Rendezvous service listening on http://{}", listener.local_addr()?);
        let sweeper = self.spawn_expiry_sweeper();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result?;
        Ok(())
    }

    /// Periodically drop expired registrations from the service tunnel.
    ///
    /// Only runs when the service has a tunnel and registrations expire.
    fn spawn_expiry_sweeper(&self) -> Option<JoinHandle<()>> {
        self.state.tunnel.as_ref()?;
        let period = (self.state.registry.ttl()? / 2).max(MIN_SWEEP_PERIOD);
        let state = self.state.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!("Sweeping expired registrations from the service tunnel");
                state.sync_tunnel().await;
            }
        }))
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

async fn register_handler(
    State(state): State<Arc<ServiceState>>,
    body: Bytes,
) -> std::result::Result<Json<RegisterResponse>, ApiError> {
    let mut descriptor: PeerDescriptor = serde_json::from_slice(&body)
        .map_err(|e| Error::Validation(format!("invalid registration: {}", e)))?;
    descriptor.validate()?;
    state.authorize(&descriptor.token)?;

    // The shared secret is not kept per peer
    descriptor.token.clear();
    let id = descriptor.id.clone();
    let endpoint = descriptor.endpoint.as_ref().map(|e| e.to_string());

    let replaced = state.registry.register(descriptor);
    info!(
        peer = %id,
        endpoint = endpoint.as_deref().unwrap_or("-"),
        replaced = replaced.is_some(),
        "Peer registered"
    );

    state.push_to_counterpart(&id).await;
    state.sync_tunnel().await;

    Ok(Json(RegisterResponse {
        listen_addr: state.config.listen_addr.clone(),
        listen_port: state.config.listen_port,
    }))
}

async fn deregister_handler(
    State(state): State<Arc<ServiceState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<StatusCode, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;
    state.authorize(token.trim())?;

    state.registry.remove(&id)?;
    info!(peer = %id, "Peer deregistered");
    state.sync_tunnel().await;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;
    use wgmesh_common::tunnel::MemoryDriver;
    use wgmesh_common::{derive_public_key, generate_private_key, InterfaceConfig, Key};

    const TOKEN: &str = "s3cret";

    fn config(connected: &[(&str, &str)]) -> ServiceConfig {
        ServiceConfig {
            token: TOKEN.to_string(),
            connected_peers: connected
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect::<HashMap<_, _>>(),
            push_timeout_ms: 2000,
            ..Default::default()
        }
    }

    fn service(config: ServiceConfig) -> RendezvousService {
        RendezvousService::new(config, Arc::new(PeerRegistry::new(None)), None).unwrap()
    }

    fn key() -> Key {
        derive_public_key(&generate_private_key().unwrap())
    }

    fn register_body(id: &str, token: &str, key: &Key) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "token": token,
            "publicKey": key.to_base64(),
            "endpoint": {"host": "1.2.3.4", "port": 51820},
        })
    }

    async fn post_json(app: Router, uri: &str, body: String) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_register_returns_service_address() {
        let svc = service(config(&[]));
        let (status, body) = post_json(
            svc.router(),
            "/register",
            register_body("alice", TOKEN, &key()).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["listenAddr"], "10.0.0.1");
        assert_eq!(body["listenPort"], 51820);
        assert_eq!(svc.registry().len(), 1);
        assert!(svc.registry().get("alice").unwrap().token.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_token_leaves_registry_untouched() {
        let svc = service(config(&[]));
        let first_key = key();
        post_json(
            svc.router(),
            "/register",
            register_body("alice", TOKEN, &first_key).to_string(),
        )
        .await;

        let (status, body) = post_json(
            svc.router(),
            "/register",
            register_body("alice", "guess", &key()).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("invalid token"));
        assert_eq!(svc.registry().get("alice").unwrap().public_key, first_key);
    }

    #[tokio::test]
    async fn test_malformed_registrations_are_bad_requests() {
        let svc = service(config(&[]));
        let bad_cidr = serde_json::json!({
            "id": "alice",
            "token": TOKEN,
            "publicKey": key().to_base64(),
            "allowedIPs": ["10.0.0.1/99"],
        });

        for body in [
            "not json".to_string(),
            r#"{"id":"alice","token":"s3cret","publicKey":"short"}"#.to_string(),
            r#"{"id":"alice"}"#.to_string(),
            bad_cidr.to_string(),
        ] {
            let (status, body) = post_json(svc.router(), "/register", body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body["error"].is_string());
        }
        assert!(svc.registry().is_empty());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let svc = service(config(&[]));
        let second = key();
        for k in [key(), second] {
            post_json(
                svc.router(),
                "/register",
                register_body("alice", TOKEN, &k).to_string(),
            )
            .await;
        }
        assert_eq!(svc.registry().get("alice").unwrap().public_key, second);
    }

    #[tokio::test]
    async fn test_unreachable_counterpart_does_not_fail_registration() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let svc = service(config(&[("alice", "bob")]));

        let mut bob = register_body("bob", TOKEN, &key());
        bob["endpoint"] = serde_json::json!({"host": "127.0.0.1", "port": 51820});
        bob["controlPort"] = serde_json::json!(port);
        post_json(svc.router(), "/register", bob.to_string()).await;

        let (status, _) = post_json(
            svc.router(),
            "/register",
            register_body("alice", TOKEN, &key()).to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(svc.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_deregister() {
        let svc = service(config(&[]));
        post_json(
            svc.router(),
            "/register",
            register_body("alice", TOKEN, &key()).to_string(),
        )
        .await;

        let delete = |auth: Option<&str>, id: &str| {
            let mut req = Request::builder()
                .method("DELETE")
                .uri(format!("/register/{}", id));
            if let Some(auth) = auth {
                req = req.header("authorization", auth);
            }
            req.body(Body::empty()).unwrap()
        };

        let resp = svc.router().oneshot(delete(None, "alice")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = svc
            .router()
            .oneshot(delete(Some("Bearer wrong"), "alice"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = svc
            .router()
            .oneshot(delete(Some("Bearer s3cret"), "alice"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(svc.registry().is_empty());

        let resp = svc
            .router()
            .oneshot(delete(Some("Bearer s3cret"), "alice"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let svc = service(config(&[]));
        let resp = svc
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    async fn service_tunnel(name: &str) -> TunnelInterface {
        let tunnel = TunnelInterface::new(
            InterfaceConfig {
                name: name.to_string(),
                address: Some("10.0.0.1/24".to_string()),
                ..Default::default()
            },
            Arc::new(MemoryDriver::new()),
        )
        .unwrap();
        tunnel.create().await.unwrap();
        tunnel
    }

    fn meshed_body(id: &str, key: &Key, octet: u8) -> String {
        let mut body = register_body(id, TOKEN, key);
        body["allowedIPs"] = serde_json::json!([format!("10.0.0.{}/32", octet)]);
        body.to_string()
    }

    #[tokio::test]
    async fn test_service_tunnel_follows_registrations() {
        let tunnel = service_tunnel("wgs-test").await;

        let svc = RendezvousService::new(
            config(&[]),
            Arc::new(PeerRegistry::new(None)),
            Some(tunnel.clone()),
        )
        .unwrap();

        let alice_key = key();
        let mut alice = register_body("alice", TOKEN, &alice_key);
        alice["allowedIPs"] = serde_json::json!(["10.0.0.10/32"]);
        post_json(svc.router(), "/register", alice.to_string()).await;

        // Nodes without mesh addresses are not peered
        post_json(
            svc.router(),
            "/register",
            register_body("bob", TOKEN, &key()).to_string(),
        )
        .await;

        let peers = tunnel.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, alice_key);
        assert_eq!(peers[0].endpoint, Some("1.2.3.4:51820".parse().unwrap()));
        assert_eq!(peers[0].persistent_keepalive, Some(DEFAULT_KEEPALIVE_SECS));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_all_reach_service_tunnel() {
        let tunnel = service_tunnel("wgs-race").await;
        let svc = RendezvousService::new(
            config(&[]),
            Arc::new(PeerRegistry::new(None)),
            Some(tunnel.clone()),
        )
        .unwrap();

        let keys: Vec<Key> = (0..16).map(|_| key()).collect();
        let handles: Vec<_> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let app = svc.router();
                let body = meshed_body(&format!("node-{}", i), k, 10 + i as u8);
                tokio::spawn(async move { post_json(app, "/register", body).await.0 })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), StatusCode::OK);
        }

        // The last reconcile saw every registration
        let live = tunnel.list_peers().await.unwrap();
        assert_eq!(live.len(), keys.len());
        assert!(keys.iter().all(|k| live.contains(k)));
    }

    #[tokio::test]
    async fn test_expired_registrations_leave_service_tunnel() {
        let tunnel = service_tunnel("wgs-expiry").await;
        let svc = RendezvousService::new(
            config(&[]),
            Arc::new(PeerRegistry::new(Some(Duration::from_millis(300)))),
            Some(tunnel.clone()),
        )
        .unwrap();

        let alice_key = key();
        let (status, _) =
            post_json(svc.router(), "/register", meshed_body("alice", &alice_key, 10)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(tunnel.list_peers().await.unwrap().contains(&alice_key));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(svc.clone().serve(listener, async move {
            let _ = stop_rx.await;
        }));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tunnel.list_peers().await.unwrap().contains(&alice_key) {
            assert!(tokio::time::Instant::now() < deadline, "expired peer still on tunnel");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(svc.registry().is_empty());

        let _ = stop_tx.send(());
        server.await.unwrap().unwrap();
    }
}
