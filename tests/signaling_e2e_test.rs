//! E2E tests for the signaling relay
//!
//! Tests the full flow: connect → register → relay offers and answers →
//! disconnect. Also covers duplicate ids and unknown recipients.

use std::net::TcpListener;
use std::time::Duration;

use meshplay::network::{SignalingClient, SignalingMessage, SignalingServer};
use meshplay::protocol::PeerId;

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Helper to start a signaling server in background
async fn start_test_server(port: u16) -> tokio::task::JoinHandle<()> {
    let addr = format!("127.0.0.1:{}", port);
    let server = SignalingServer::new();

    tokio::spawn(async move {
        // Server runs until cancelled
        let _ = server.run(&addr).await;
    })
}

fn server_url(port: u16) -> String {
    format!("ws://127.0.0.1:{}", port)
}

/// Test: Connect to signaling server
/// Given a running signaling server
/// When client connects
/// Then connection is established
#[tokio::test]
async fn test_connect_to_signaling_server() {
    let port = find_available_port();
    let server_handle = start_test_server(port).await;

    // Wait for server to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = SignalingClient::new(&server_url(port));
    let result = client.connect().await;

    server_handle.abort();

    assert!(result.is_ok(), "Should connect to signaling server");
}

/// Test: Register under a peer id
/// Given a connected client
/// When it registers
/// Then the server confirms the id
#[tokio::test]
async fn test_register_peer() {
    let port = find_available_port();
    let server_handle = start_test_server(port).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = SignalingClient::new(&server_url(port));
    let mut conn = client.connect().await.expect("Failed to connect");

    conn.send(SignalingMessage::Register {
        peer_id: PeerId::new("alice"),
    })
    .await
    .expect("Failed to send register");

    let response = conn.recv().await.expect("Failed to receive response");

    let _ = conn.close().await;
    server_handle.abort();

    assert_eq!(
        response,
        SignalingMessage::Registered {
            peer_id: PeerId::new("alice")
        }
    );
}

/// Test: Offer and answer are relayed between peers
/// Given two registered peers
/// When alice sends an offer to bob and bob answers
/// Then each receives the other's candidates with the sender stamped
#[tokio::test]
async fn test_offer_answer_relay() {
    let port = find_available_port();
    let server_handle = start_test_server(port).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = SignalingClient::new(&server_url(port));
    let mut alice = client
        .register(&PeerId::new("alice"))
        .await
        .expect("Alice failed to register");
    let mut bob = client
        .register(&PeerId::new("bob"))
        .await
        .expect("Bob failed to register");

    let alice_addr = "127.0.0.1:7001".parse().unwrap();
    let bob_addr = "127.0.0.1:7002".parse().unwrap();

    // A forged sender is replaced by the registered id
    alice
        .send(SignalingMessage::Offer {
            from: PeerId::new("mallory"),
            to: PeerId::new("bob"),
            candidates: vec![alice_addr],
        })
        .await
        .expect("Failed to send offer");

    let offer = tokio::time::timeout(Duration::from_secs(2), bob.recv())
        .await
        .expect("Offer not relayed")
        .expect("Failed to receive offer");
    assert_eq!(
        offer,
        SignalingMessage::Offer {
            from: PeerId::new("alice"),
            to: PeerId::new("bob"),
            candidates: vec![alice_addr],
        }
    );

    bob.send(SignalingMessage::Answer {
        from: PeerId::new("bob"),
        to: PeerId::new("alice"),
        candidates: vec![bob_addr],
    })
    .await
    .expect("Failed to send answer");

    let answer = tokio::time::timeout(Duration::from_secs(2), alice.recv())
        .await
        .expect("Answer not relayed")
        .expect("Failed to receive answer");

    let _ = alice.close().await;
    let _ = bob.close().await;
    server_handle.abort();

    assert_eq!(
        answer,
        SignalingMessage::Answer {
            from: PeerId::new("bob"),
            to: PeerId::new("alice"),
            candidates: vec![bob_addr],
        }
    );
}

/// Test: Duplicate registration is refused
/// Given alice is registered
/// When a second connection registers as alice
/// Then it receives an error
#[tokio::test]
async fn test_duplicate_register_rejected() {
    let port = find_available_port();
    let server_handle = start_test_server(port).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = SignalingClient::new(&server_url(port));
    let first = client
        .register(&PeerId::new("alice"))
        .await
        .expect("First register failed");

    let second = client.register(&PeerId::new("alice")).await;

    let _ = first.close().await;
    server_handle.abort();

    assert!(second.is_err(), "Duplicate id should be rejected");
}

/// Test: Offer to an unknown peer
/// Given a registered peer
/// When it sends an offer to an id nobody registered
/// Then the server answers with PeerUnavailable
#[tokio::test]
async fn test_offer_to_unknown_peer() {
    let port = find_available_port();
    let server_handle = start_test_server(port).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = SignalingClient::new(&server_url(port));
    let mut alice = client
        .register(&PeerId::new("alice"))
        .await
        .expect("Failed to register");

    alice
        .send(SignalingMessage::Offer {
            from: PeerId::new("alice"),
            to: PeerId::new("nobody"),
            candidates: Vec::new(),
        })
        .await
        .expect("Failed to send offer");

    let response = alice.recv().await.expect("Failed to receive response");

    let _ = alice.close().await;
    server_handle.abort();

    assert_eq!(
        response,
        SignalingMessage::PeerUnavailable {
            peer_id: PeerId::new("nobody")
        }
    );
}

/// Test: Relaying before registering is refused
#[tokio::test]
async fn test_relay_requires_registration() {
    let port = find_available_port();
    let server_handle = start_test_server(port).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = SignalingClient::new(&server_url(port));
    let mut conn = client.connect().await.expect("Failed to connect");

    conn.send(SignalingMessage::Offer {
        from: PeerId::new("alice"),
        to: PeerId::new("bob"),
        candidates: Vec::new(),
    })
    .await
    .expect("Failed to send offer");

    let response = conn.recv().await.expect("Failed to receive response");

    let _ = conn.close().await;
    server_handle.abort();

    assert!(matches!(response, SignalingMessage::Error { .. }));
}

/// Test: Connection refused
/// Given no server running
/// When client tries to connect
/// Then it fails
#[tokio::test]
async fn test_connection_refused() {
    let port = find_available_port();

    let client = SignalingClient::new(&server_url(port));
    let result = client.connect().await;

    assert!(result.is_err(), "Should fail when no server is running");
}

/// Test: Disconnect frees the peer id
/// Given alice registered and then disconnected
/// When alice registers again
/// Then registration succeeds
#[tokio::test]
async fn test_disconnect_releases_id() {
    let port = find_available_port();
    let server_handle = start_test_server(port).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = SignalingClient::new(&server_url(port));
    let first = client
        .register(&PeerId::new("alice"))
        .await
        .expect("First register failed");
    first.close().await.expect("Failed to close");

    // Give the server time to notice the close
    tokio::time::sleep(Duration::from_millis(200)).await;

    let again = client.register(&PeerId::new("alice")).await;

    server_handle.abort();

    tokio_test::assert_ok!(again);
}
