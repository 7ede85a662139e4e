//! Rendezvous service HTTP client

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use wgmesh_common::{
    Error, ErrorBody, HealthResponse, PeerDescriptor, RegisterResponse, Result,
};

/// Client for the rendezvous control API
#[derive(Debug, Clone)]
pub struct RendezvousClient {
    client: Client,
    base_url: String,
}

impl RendezvousClient {
    /// Create a client for the service at `base_url`, e.g. `http://10.0.0.1:8080`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register (or re-register) this node
    pub async fn register(&self, descriptor: &PeerDescriptor) -> Result<RegisterResponse> {
        let url = format!("{}/register", self.base_url);
        debug!(%url, peer = %descriptor.id, "registering");

        let response = self
            .client
            .post(&url)
            .json(descriptor)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("register with {} failed: {}", url, e)))?;

        let response = check(response).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("invalid register response: {}", e)))
    }

    /// Remove this node's registration
    pub async fn deregister(&self, id: &str, token: &str) -> Result<()> {
        let url = format!("{}/register/{}", self.base_url, id);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("deregister with {} failed: {}", url, e)))?;

        check(response).await?;
        Ok(())
    }

    /// Check the service is up
    pub async fn health(&self) -> Result<HealthResponse> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{} unreachable: {}", url, e)))?;

        check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Transport(format!("invalid health response: {}", e)))
    }
}

/// Turn an error status into the matching error
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);

    Err(match status {
        StatusCode::UNAUTHORIZED => Error::Unauthorized(message),
        StatusCode::BAD_REQUEST => Error::Validation(message),
        StatusCode::NOT_FOUND => Error::not_found("registration", message),
        _ => Error::Transport(format!("service answered {}: {}", status, message)),
    })
}
