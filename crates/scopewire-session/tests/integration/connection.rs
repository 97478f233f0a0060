//! Connection lifecycle tests: authentication, redirect, auto-reconnect.

use std::time::Duration;

use scopewire_protocol::REASON_AUTH_REJECTED;
use scopewire_session::transport::memory::MemoryNetwork;
use scopewire_session::transport::{TransportCmd, TransportEvent, TransportHandle};
use scopewire_session::{ClientBuilder, SessionConfig, SessionError, SessionEvent};
use tokio::sync::mpsc;

use crate::harness::{
    assert_quiet, join_at, start_client, start_server, wait_for, GOOD_CREDENTIALS, LOBBY,
};

/// A peer failing the gate is rejected with the reserved reason code and
/// never admitted to the default scope.
#[tokio::test]
async fn test_auth_rejection() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9400).await;
    let client = start_client(&net, b"wrong-token", false);
    let mut server_events = server.subscribe();
    let mut client_events = client.handle.subscribe();

    client.handle.connect("localhost", 9400).await.unwrap();

    wait_for(&mut server_events, "AuthRejected", |event| {
        matches!(event, SessionEvent::AuthRejected { .. })
    })
    .await;
    wait_for(&mut client_events, "auth Disconnected", |event| {
        matches!(
            event,
            SessionEvent::Disconnected { reason } if *reason == REASON_AUTH_REJECTED
        )
    })
    .await;
}

/// Auto-reconnect stays quiet after an authentication rejection.
#[tokio::test]
async fn test_no_reconnect_after_auth_rejection() {
    let net = MemoryNetwork::new();
    let _server = start_server(&net, 9401).await;
    let client = start_client(&net, b"wrong-token", true);
    let mut client_events = client.handle.subscribe();

    client.handle.connect("localhost", 9401).await.unwrap();
    wait_for(&mut client_events, "auth Disconnected", |event| {
        matches!(event, SessionEvent::Disconnected { .. })
    })
    .await;

    assert_quiet(
        &mut client_events,
        "reconnect after auth rejection",
        Duration::from_millis(300),
        |event| matches!(event, SessionEvent::Connected),
    )
    .await;
}

/// A kicked client with auto-reconnect enabled comes back and rejoins the
/// default scope.
#[tokio::test]
async fn test_auto_reconnect_after_kick() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9402).await;
    let client = start_client(&net, GOOD_CREDENTIALS, true);
    let mut client_events = client.handle.subscribe();

    let peer = join_at(&server, &client, 9402).await;
    server.disconnect_peer(peer, 42).await.unwrap();

    wait_for(&mut client_events, "kick Disconnected", |event| {
        matches!(event, SessionEvent::Disconnected { reason } if *reason == 42)
    })
    .await;
    wait_for(&mut client_events, "reconnect Connected", |event| {
        matches!(event, SessionEvent::Connected)
    })
    .await;
    wait_for(&mut client_events, "rejoin ScopeEntered", |event| {
        matches!(event, SessionEvent::ScopeEntered { scope_id, .. } if *scope_id == LOBBY)
    })
    .await;
}

/// A user-initiated disconnect does not auto-reconnect.
#[tokio::test]
async fn test_user_disconnect_stays_down() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9403).await;
    let client = start_client(&net, GOOD_CREDENTIALS, true);
    let mut client_events = client.handle.subscribe();

    join_at(&server, &client, 9403).await;
    client.handle.disconnect().await.unwrap();

    wait_for(&mut client_events, "Disconnected", |event| {
        matches!(event, SessionEvent::Disconnected { .. })
    })
    .await;
    assert_quiet(
        &mut client_events,
        "reconnect after user disconnect",
        Duration::from_millis(300),
        |event| matches!(event, SessionEvent::Connected),
    )
    .await;
}

/// A server-issued redirect moves the client to the second host, where it
/// authenticates and joins that host's default scope.
#[tokio::test]
async fn test_redirect_between_hosts() {
    let net = MemoryNetwork::new();
    let server_a = start_server(&net, 9404).await;
    let server_b = start_server(&net, 9405).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);
    let mut client_events = client.handle.subscribe();
    let mut b_events = server_b.subscribe();

    let peer = join_at(&server_a, &client, 9404).await;
    server_a
        .redirect_peer(peer, "localhost", 9405, false)
        .await
        .unwrap();

    wait_for(&mut client_events, "Redirecting", |event| {
        matches!(event, SessionEvent::Redirecting { port, .. } if *port == 9405)
    })
    .await;
    wait_for(&mut client_events, "redirect Connected", |event| {
        matches!(event, SessionEvent::Connected)
    })
    .await;
    wait_for(&mut b_events, "join at host B", |event| {
        matches!(event, SessionEvent::PeerJoined { .. })
    })
    .await;
    wait_for(&mut client_events, "lobby re-entered", |event| {
        matches!(event, SessionEvent::ScopeEntered { scope_id, .. } if *scope_id == LOBBY)
    })
    .await;
}

/// Re-entrant redirect is refused while one is in flight. Driven over a
/// hand-held transport so the in-flight window is deterministic.
#[tokio::test]
async fn test_redirect_refused_while_redirecting() {
    let (transport_cmd_tx, mut transport_cmd_rx) = mpsc::channel(16);
    let (transport_event_tx, transport_event_rx) = mpsc::channel(16);
    let transport = TransportHandle {
        cmd_tx: transport_cmd_tx,
        event_rx: transport_event_rx,
    };

    let (controller, handle) = ClientBuilder::new(SessionConfig::default())
        .build()
        .unwrap();
    tokio::spawn(controller.run(transport));
    let mut events = handle.subscribe();

    handle.connect("localhost", 1).await.unwrap();
    assert!(matches!(
        transport_cmd_rx.recv().await.unwrap(),
        TransportCmd::Connect { .. }
    ));
    transport_event_tx
        .send(TransportEvent::Connected)
        .await
        .unwrap();
    wait_for(&mut events, "Connected", |event| {
        matches!(event, SessionEvent::Connected)
    })
    .await;

    // First redirect goes into flight; the disconnect it asks for is never
    // delivered, so it stays in flight.
    handle.redirect("elsewhere", 2).await.unwrap();
    let second = handle.redirect("elsewhere", 3).await;
    assert!(matches!(second, Err(SessionError::AlreadyRedirecting)));
}
