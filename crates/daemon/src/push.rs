//! Counterpart dissemination
//!
//! After a node registers, the service tells the node's configured
//! counterpart how to reach it by posting to the counterpart's `connect`
//! receiver. Delivery is at most once: a request that may have reached the
//! counterpart is never sent again.

use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};
use wgmesh_common::{ConnectAck, ConnectRequest, Error, PeerDescriptor, Result};

/// How many times to try a push whose connection was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Sends `connect` pushes to counterparts
#[derive(Debug, Clone)]
pub struct CounterpartNotifier {
    client: Client,
    token: String,
    policy: RetryPolicy,
}

impl CounterpartNotifier {
    /// `token` is the service's shared secret, which receivers check
    pub fn new(timeout: Duration, token: impl Into<String>, policy: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            token: token.into(),
            policy,
        })
    }

    /// URL of a node's `connect` receiver
    pub fn connect_url(target: &PeerDescriptor) -> Option<String> {
        target
            .control_endpoint()
            .map(|ep| format!("http://{}/connect", ep))
    }

    /// Tell `target` about `registrant`
    pub async fn notify(
        &self,
        registrant: &PeerDescriptor,
        target: &PeerDescriptor,
    ) -> Result<ConnectAck> {
        let endpoint = registrant.endpoint.clone().ok_or_else(|| {
            Error::Validation(format!("peer '{}' registered without an endpoint", registrant.id))
        })?;
        let url = Self::connect_url(target).ok_or_else(|| {
            Error::Validation(format!("peer '{}' has no reachable control endpoint", target.id))
        })?;

        let request = ConnectRequest {
            id: registrant.id.clone(),
            token: self.token.clone(),
            public_key: registrant.public_key,
            endpoint,
            allowed_ips: registrant.allowed_ips.clone(),
        };

        let mut attempt = 1;
        let response = loop {
            debug!(counterpart = %target.id, %url, attempt, "pushing counterpart info");
            match self.client.post(&url).json(&request).send().await {
                Ok(response) => break response,
                Err(e) if e.is_connect() && attempt < self.policy.max_attempts => {
                    warn!(
                        "Push to {} refused (attempt {}/{}): {}",
                        target.id, attempt, self.policy.max_attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.policy.backoff).await;
                }
                Err(e) => {
                    return Err(Error::Transport(format!("push to {} failed: {}", url, e)));
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "{} answered {}: {}",
                url,
                status,
                body.trim()
            )));
        }

        response
            .json::<ConnectAck>()
            .await
            .map_err(|e| Error::Transport(format!("invalid connect ack from {}: {}", url, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use wgmesh_common::{derive_public_key, generate_private_key, Endpoint};

    type Received = Arc<Mutex<Vec<ConnectRequest>>>;

    async fn receiver() -> (u16, Received) {
        let received: Received = Arc::default();
        let app = Router::new()
            .route(
                "/connect",
                post(
                    |State(received): State<Received>, Json(req): Json<ConnectRequest>| async move {
                        let peer_id = req.id.clone();
                        received.lock().push(req);
                        Json(ConnectAck { peer_id })
                    },
                ),
            )
            .with_state(received.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (port, received)
    }

    fn descriptor(id: &str, endpoint: Option<Endpoint>, control_port: Option<u16>) -> PeerDescriptor {
        PeerDescriptor {
            id: id.to_string(),
            token: String::new(),
            public_key: derive_public_key(&generate_private_key().unwrap()),
            endpoint,
            control_port,
            allowed_ips: vec!["10.0.0.1/32".to_string()],
        }
    }

    fn notifier(max_attempts: u32) -> CounterpartNotifier {
        CounterpartNotifier::new(
            Duration::from_secs(2),
            "s3cret",
            RetryPolicy {
                max_attempts,
                backoff: Duration::from_millis(10),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_push_delivers_registrant_info() {
        let (port, received) = receiver().await;
        let alice = descriptor("alice", Some(Endpoint::new("1.2.3.4", 51820)), None);
        let bob = descriptor("bob", Some(Endpoint::new("127.0.0.1", 51820)), Some(port));

        let ack = notifier(1).notify(&alice, &bob).await.unwrap();
        assert_eq!(ack.peer_id, "alice");

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, "alice");
        assert_eq!(received[0].token, "s3cret");
        assert_eq!(received[0].public_key, alice.public_key);
        assert_eq!(received[0].endpoint, Endpoint::new("1.2.3.4", 51820));
        assert_eq!(received[0].allowed_ips, vec!["10.0.0.1/32".to_string()]);
    }

    #[tokio::test]
    async fn test_push_requires_endpoints() {
        let alice = descriptor("alice", None, None);
        let bob = descriptor("bob", Some(Endpoint::new("127.0.0.1", 1)), None);
        assert!(matches!(
            notifier(1).notify(&alice, &bob).await,
            Err(Error::Validation(_))
        ));

        let alice = descriptor("alice", Some(Endpoint::new("1.2.3.4", 51820)), None);
        let bob = descriptor("bob", None, None);
        assert!(matches!(
            notifier(1).notify(&alice, &bob).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_push_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let alice = descriptor("alice", Some(Endpoint::new("1.2.3.4", 51820)), None);
        let bob = descriptor("bob", Some(Endpoint::new("127.0.0.1", 51820)), Some(port));

        assert!(matches!(
            notifier(3).notify(&alice, &bob).await,
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn test_connect_url() {
        let bob = descriptor("bob", Some(Endpoint::new("fd00::2", 51820)), Some(8081));
        assert_eq!(
            CounterpartNotifier::connect_url(&bob).as_deref(),
            Some("http://[fd00::2]:8081/connect")
        );
        assert!(CounterpartNotifier::connect_url(&descriptor("x", None, Some(1))).is_none());
    }
}
