//! Two-way call correlation tests.

use std::time::Duration;

use scopewire_session::transport::memory::MemoryNetwork;
use scopewire_session::SessionError;

use crate::harness::{join_at, start_client, start_server, GOOD_CREDENTIALS, LOBBY_CH};

/// A two-way call resolves with the remote handler's return value.
#[tokio::test]
async fn test_two_way_call_resolves() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9200).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);

    join_at(&server, &client, 9200).await;

    let answer: u32 = client.handle.call(LOBBY_CH, "Test3", &()).await.unwrap();
    assert_eq!(answer, 42);
}

/// Arguments round through the handler.
#[tokio::test]
async fn test_two_way_call_with_args() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9201).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);

    join_at(&server, &client, 9201).await;

    let echoed: String = client
        .handle
        .call(LOBBY_CH, "Echo", &"hello scopes")
        .await
        .unwrap();
    assert_eq!(echoed, "hello scopes");
}

/// Sequential calls each resolve exactly once and to their own value.
#[tokio::test]
async fn test_promise_ids_do_not_cross() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9202).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);

    join_at(&server, &client, 9202).await;

    for text in ["a", "b", "c"] {
        let echoed: String = client.handle.call(LOBBY_CH, "Echo", &text).await.unwrap();
        assert_eq!(echoed, text);
    }
}

/// The server can call into a client scope the same way.
#[tokio::test]
async fn test_server_calls_client() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9203).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);

    let peer = join_at(&server, &client, 9203).await;

    let info: String = server
        .call(peer, LOBBY_CH, "ClientInfo", &())
        .await
        .unwrap();
    assert_eq!(info, "scopewire-test-client");
}

/// A call whose signal the server does not handle never gets a response;
/// the promise is cancelled when the peer disconnects, so the caller is
/// not left hanging.
#[tokio::test]
async fn test_disconnect_cancels_pending_promise() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9204).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);

    let peer = join_at(&server, &client, 9204).await;

    let caller = client.handle.clone();
    let pending =
        tokio::spawn(async move { caller.call::<(), u32>(LOBBY_CH, "NoSuchSignal", &()).await });

    // Give the call time to reach the server and be dropped there.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.disconnect_peer(peer, 0).await.unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SessionError::PromiseCancelled)));
}

/// Calling while offline fails fast instead of parking a promise.
#[tokio::test]
async fn test_call_while_offline_fails() {
    let net = MemoryNetwork::new();
    let client = start_client(&net, GOOD_CREDENTIALS, false);
    let result = client.handle.call::<(), u32>(LOBBY_CH, "Test3", &()).await;
    assert!(matches!(result, Err(SessionError::NotConnected)));
}
