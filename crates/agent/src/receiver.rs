//! `connect` receiver
//!
//! The rendezvous service pushes counterpart info here. Accepted pushes are
//! handed to the agent's control loop over a bounded channel.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use wgmesh_common::{ConnectAck, ConnectRequest, Error, ErrorBody, HealthResponse};

/// Pending pushes the control loop has not picked up yet
pub const PUSH_QUEUE_DEPTH: usize = 32;

struct ReceiverState {
    token_digest: [u8; 32],
    pushes: mpsc::Sender<ConnectRequest>,
}

struct ReceiverError(Error);

impl From<Error> for ReceiverError {
    fn from(e: Error) -> Self {
        ReceiverError(e)
    }
}

impl IntoResponse for ReceiverError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        debug!(status = status.as_u16(), "connect rejected: {}", self.0);
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Router serving `POST /connect` and `GET /health`.
///
/// Pushes must carry `token`, the mesh's shared secret.
pub fn router(token: &str, pushes: mpsc::Sender<ConnectRequest>) -> Router {
    let state = Arc::new(ReceiverState {
        token_digest: Sha256::digest(token.as_bytes()).into(),
        pushes,
    });

    Router::new()
        .route("/connect", post(connect_handler))
        .route("/health", get(|| async { Json(HealthResponse::ok()) }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn connect_handler(
    State(state): State<Arc<ReceiverState>>,
    body: Bytes,
) -> Result<Json<ConnectAck>, ReceiverError> {
    let request: ConnectRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::Validation(format!("invalid connect request: {}", e)))?;
    request.validate()?;

    let digest: [u8; 32] = Sha256::digest(request.token.as_bytes()).into();
    if digest != state.token_digest {
        return Err(Error::Unauthorized("invalid token".to_string()).into());
    }

    let peer_id = request.id.clone();
    info!(peer = %peer_id, endpoint = %request.endpoint, "Counterpart info received");
    state
        .pushes
        .send(request)
        .await
        .map_err(|_| Error::Internal("agent is shutting down".to_string()))?;

    Ok(Json(ConnectAck { peer_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use wgmesh_common::{generate_private_key, Endpoint};

    fn push(token: &str) -> String {
        serde_json::to_string(&ConnectRequest {
            id: "alice".to_string(),
            token: token.to_string(),
            public_key: generate_private_key().unwrap(),
            endpoint: Endpoint::new("1.2.3.4", 51820),
            allowed_ips: vec!["10.0.0.1/32".to_string()],
        })
        .unwrap()
    }

    fn request(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/connect")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_push_is_forwarded() {
        let (tx, mut rx) = mpsc::channel(PUSH_QUEUE_DEPTH);
        let resp = router("s3cret", tx)
            .oneshot(request(push("s3cret")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let ack: ConnectAck = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ack.peer_id, "alice");

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.id, "alice");
        assert_eq!(forwarded.endpoint, Endpoint::new("1.2.3.4", 51820));
    }

    #[tokio::test]
    async fn test_wrong_token_is_rejected() {
        let (tx, mut rx) = mpsc::channel(PUSH_QUEUE_DEPTH);
        let resp = router("s3cret", tx)
            .oneshot(request(push("guess")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_push_is_rejected() {
        let (tx, _rx) = mpsc::channel(PUSH_QUEUE_DEPTH);
        let app = router("s3cret", tx);

        let resp = app
            .clone()
            .oneshot(request("{\"id\":\"alice\"}".to_string()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let mut bad_ip: serde_json::Value = serde_json::from_str(&push("s3cret")).unwrap();
        bad_ip["allowedIPs"] = serde_json::json!(["10.0.0.1/64"]);
        let resp = app.oneshot(request(bad_ip.to_string())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_closed_loop_is_server_error() {
        let (tx, rx) = mpsc::channel(PUSH_QUEUE_DEPTH);
        drop(rx);
        let resp = router("s3cret", tx)
            .oneshot(request(push("s3cret")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
