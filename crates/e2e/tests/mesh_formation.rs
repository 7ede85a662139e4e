//! Mesh formation through the rendezvous service, with nodes running in process

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use test_case::test_case;
use wgmesh_common::Error;
use wgmesh_daemon::ServiceConfig;
use wgmesh_e2e::error::E2eError;
use wgmesh_e2e::{init_tracing, NodeHandle, ServiceHandle};

const TOKEN: &str = "s3cret";
const WAIT: Duration = Duration::from_secs(10);

fn service_config(links: &[(&str, &str)]) -> ServiceConfig {
    ServiceConfig {
        token: TOKEN.to_string(),
        connected_peers: links
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect::<HashMap<_, _>>(),
        push_timeout_ms: 2000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_counterpart_learns_registrant() {
    init_tracing();
    let service = ServiceHandle::spawn(service_config(&[("alice", "bob")]))
        .await
        .unwrap();

    let bob = NodeHandle::spawn(service.node_config("bob", TOKEN, "10.0.0.3/24"))
        .await
        .unwrap();
    service.wait_for_registration("bob", WAIT).await.unwrap();

    let alice = NodeHandle::spawn(service.node_config("alice", TOKEN, "10.0.0.2/24"))
        .await
        .unwrap();

    let peer = bob.wait_for_peer(&alice.public_key, WAIT).await.unwrap();
    let expected: SocketAddr = "127.0.0.1:51820".parse().unwrap();
    assert_eq!(peer.endpoint, Some(expected));
    assert_eq!(
        peer.allowed_ips,
        vec!["10.0.0.2/32".parse::<wgmesh_common::IpNetwork>().unwrap()]
    );
    assert_eq!(peer.persistent_keepalive, Some(25));

    // The mapping is one way, so alice learns nothing
    assert!(alice.peers().is_empty());

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_way_mesh_forms_through_reregistration() {
    init_tracing();
    let service = ServiceHandle::spawn(service_config(&[("alice", "bob"), ("bob", "alice")]))
        .await
        .unwrap();

    let mut bob_config = service.node_config("bob", TOKEN, "10.0.0.3/24");
    bob_config.interface_name = "wg-bob2".to_string();
    bob_config.reregister_interval_secs = 1;
    let bob = NodeHandle::spawn(bob_config).await.unwrap();
    service.wait_for_registration("bob", WAIT).await.unwrap();

    let mut alice_config = service.node_config("alice", TOKEN, "10.0.0.2/24");
    alice_config.interface_name = "wg-alice2".to_string();
    alice_config.reregister_interval_secs = 1;
    let alice = NodeHandle::spawn(alice_config).await.unwrap();

    // bob learns alice from alice's registration push, alice learns bob from the
    // push that follows bob's next re-registration
    bob.wait_for_peer(&alice.public_key, WAIT).await.unwrap();
    alice.wait_for_peer(&bob.public_key, WAIT).await.unwrap();

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
    service.stop().await.unwrap();
}

#[test_case("guess" ; "wrong token")]
#[test_case("S3CRET" ; "token is case sensitive")]
#[tokio::test]
async fn test_bad_token_stops_node(token: &str) {
    init_tracing();
    let service = ServiceHandle::spawn(service_config(&[])).await.unwrap();

    let mut config = service.node_config("mallory", token, "10.0.0.66/24");
    config.interface_name = format!("wg-m{}", token.len());
    let mallory = NodeHandle::spawn(config).await.unwrap();

    let err = mallory.join().await.unwrap_err();
    assert!(matches!(err, E2eError::Mesh(Error::Unauthorized(_))));
    assert!(service.registry().is_empty());

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_restarted_node_replaces_old_key() {
    init_tracing();
    let service = ServiceHandle::spawn(service_config(&[("carol", "dave")]))
        .await
        .unwrap();

    let dave = NodeHandle::spawn(service.node_config("dave", TOKEN, "10.0.0.5/24"))
        .await
        .unwrap();
    service.wait_for_registration("dave", WAIT).await.unwrap();

    let carol = NodeHandle::spawn(service.node_config("carol", TOKEN, "10.0.0.4/24"))
        .await
        .unwrap();
    let old_key = carol.public_key;
    dave.wait_for_peer(&old_key, WAIT).await.unwrap();
    carol.stop().await.unwrap();

    // A fresh key under the same id supersedes the old registration
    let carol = NodeHandle::spawn(service.node_config("carol", TOKEN, "10.0.0.4/24"))
        .await
        .unwrap();
    assert_ne!(carol.public_key, old_key);

    dave.wait_for_peer(&carol.public_key, WAIT).await.unwrap();
    dave.wait_for_peer_gone(&old_key, WAIT).await.unwrap();
    assert_eq!(dave.peers().len(), 1);

    let registered = service.registry().get("carol").unwrap();
    assert_eq!(registered.public_key, carol.public_key);

    carol.stop().await.unwrap();
    dave.stop().await.unwrap();
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_stopped_node_deregisters() {
    init_tracing();
    let service = ServiceHandle::spawn(service_config(&[])).await.unwrap();

    let erin = NodeHandle::spawn(service.node_config("erin", TOKEN, "10.0.0.7/24"))
        .await
        .unwrap();
    service.wait_for_registration("erin", WAIT).await.unwrap();

    erin.stop().await.unwrap();
    assert!(service.registry().get("erin").is_err());

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_registration_is_rejected() {
    init_tracing();
    let service = ServiceHandle::spawn(service_config(&[])).await.unwrap();
    let client = reqwest::Client::new();
    let url = format!("{}/register", service.base_url());

    let missing_key = serde_json::json!({ "id": "frank", "token": TOKEN });
    let resp = client.post(&url).json(&missing_key).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let not_json = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(not_json.status().as_u16(), 400);

    assert!(service.registry().is_empty());
    service.stop().await.unwrap();
}
