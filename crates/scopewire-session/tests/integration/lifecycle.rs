//! Scope lifecycle tests: default-scope admission, switch handover, exit.

use scopewire_session::transport::memory::MemoryNetwork;
use scopewire_session::{SessionError, SessionEvent};

use crate::harness::{
    join_at, start_client, start_server, wait_for, GOOD_CREDENTIALS, LOBBY, LOBBY_CH, MATCH,
    MATCH_CH, VAR_MOTD,
};

/// An authenticated peer is auto-admitted to the default scope: the client
/// sees an Enter for the lobby's scope identifier, and the join snapshot
/// carries the lobby's variables (it has some).
#[tokio::test]
async fn test_default_scope_admission() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9100).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);
    let mut client_events = client.handle.subscribe();

    join_at(&server, &client, 9100).await;

    // Snapshot applied on join: the lobby has >= 1 replicated variable, so
    // variable-change notifications accompany the Enter.
    wait_for(&mut client_events, "snapshot VariableChanged", |event| {
        matches!(
            event,
            SessionEvent::VariableChanged { channel, var_id }
                if *channel == LOBBY_CH && *var_id == VAR_MOTD
        )
    })
    .await;
}

/// The match scope has no replicated variables, so entering it raises no
/// variable notifications.
#[tokio::test]
async fn test_scope_without_vars_joins_clean() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9101).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);
    let mut client_events = client.handle.subscribe();

    let peer = join_at(&server, &client, 9101).await;
    server.add_peer(MATCH_CH, peer).await.unwrap();

    wait_for(&mut client_events, "match ScopeEntered", |event| {
        matches!(event, SessionEvent::ScopeEntered { scope_id, .. } if *scope_id == MATCH)
    })
    .await;
    // No VariableChanged may sneak in for the match channel.
    crate::harness::assert_quiet(
        &mut client_events,
        "match VariableChanged",
        std::time::Duration::from_millis(200),
        |event| matches!(event, SessionEvent::VariableChanged { channel, .. } if *channel == MATCH_CH),
    )
    .await;
}

/// Switch hands a peer from lobby to match: the client exits the lobby and
/// enters the match in that order, subsequent sends target the match scope,
/// and the lobby no longer counts the peer as a member.
#[tokio::test]
async fn test_switch_handover() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9102).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);
    let mut client_events = client.handle.subscribe();
    let mut server_events = server.subscribe();

    let peer = join_at(&server, &client, 9102).await;

    server.switch_peer(peer, LOBBY_CH, MATCH_CH).await.unwrap();

    wait_for(&mut server_events, "server PeerLeft lobby", |event| {
        matches!(event, SessionEvent::PeerLeft { channel, .. } if *channel == LOBBY_CH)
    })
    .await;
    wait_for(&mut client_events, "client lobby ScopeExited", |event| {
        matches!(event, SessionEvent::ScopeExited { scope_id, .. } if *scope_id == LOBBY)
    })
    .await;
    wait_for(&mut client_events, "client match ScopeEntered", |event| {
        matches!(
            event,
            SessionEvent::ScopeEntered { scope_id, channel }
                if *scope_id == MATCH && *channel == MATCH_CH
        )
    })
    .await;

    // The peer's next sends land in the match scope's dispatch table.
    client.handle.send(MATCH_CH, "Fire", &()).await.unwrap();
    client.handle.send(MATCH_CH, "Fire", &()).await.unwrap();
    let shots: u32 = client.handle.call(MATCH_CH, "Shots", &()).await.unwrap();
    assert_eq!(shots, 2);

    // The lobby scope is inactive on the client now.
    let result = client.handle.send(LOBBY_CH, "Announce", &"late").await;
    assert!(matches!(result, Err(SessionError::UnboundChannel(ch)) if ch == LOBBY_CH));
}

/// Removing a peer from a scope announces an Exit; the client's instance
/// returns to the inactive set.
#[tokio::test]
async fn test_remove_peer_exits_scope() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9103).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);
    let mut client_events = client.handle.subscribe();

    let peer = join_at(&server, &client, 9103).await;
    server.remove_peer(LOBBY_CH, peer).await.unwrap();

    wait_for(&mut client_events, "client lobby ScopeExited", |event| {
        matches!(
            event,
            SessionEvent::ScopeExited { scope_id, channel }
                if *scope_id == LOBBY && *channel == LOBBY_CH
        )
    })
    .await;
    let result = client.handle.send(LOBBY_CH, "Announce", &"gone").await;
    assert!(matches!(result, Err(SessionError::UnboundChannel(_))));
}

/// One-way signals reach the scope's handler; a two-way readback confirms
/// handler state.
#[tokio::test]
async fn test_one_way_signal_reaches_handler() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9104).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);

    join_at(&server, &client, 9104).await;

    client
        .handle
        .send(LOBBY_CH, "Announce", &"first")
        .await
        .unwrap();
    client
        .handle
        .send(LOBBY_CH, "Announce", &"second")
        .await
        .unwrap();

    let recent: Vec<String> = client.handle.call(LOBBY_CH, "Recent", &()).await.unwrap();
    assert_eq!(recent, vec!["first", "second"]);
}

/// Server-to-client signals: a handler's reply defaults to the signal's
/// sender, and handle-driven sends default to the last inbound sender.
#[tokio::test]
async fn test_reply_style_targeting() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9106).await;
    let mut client = start_client(&net, GOOD_CREDENTIALS, false);

    join_at(&server, &client, 9106).await;

    // Handler replies to the sender.
    client.handle.send(LOBBY_CH, "Ping", &"hello").await.unwrap();
    let notice = tokio::time::timeout(std::time::Duration::from_secs(5), client.notices.recv())
        .await
        .expect("notice timeout")
        .expect("notice channel closed");
    assert_eq!(notice, "pong: hello");

    // A handle-driven send with no explicit target falls back to the last
    // inbound sender on that scope.
    server
        .send(LOBBY_CH, None, "Notice", &"direct")
        .await
        .unwrap();
    let notice = tokio::time::timeout(std::time::Duration::from_secs(5), client.notices.recv())
        .await
        .expect("notice timeout")
        .expect("notice channel closed");
    assert_eq!(notice, "direct");
}

/// Disconnecting a peer clears it from every member set it was in.
#[tokio::test]
async fn test_disconnect_clears_memberships() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9105).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);
    let mut server_events = server.subscribe();

    let peer = join_at(&server, &client, 9105).await;
    server.add_peer(MATCH_CH, peer).await.unwrap();
    wait_for(&mut server_events, "match PeerJoined", |event| {
        matches!(event, SessionEvent::PeerJoined { channel, .. } if *channel == MATCH_CH)
    })
    .await;

    client.handle.disconnect().await.unwrap();

    wait_for(&mut server_events, "lobby PeerLeft", |event| {
        matches!(
            event,
            SessionEvent::PeerLeft { channel, peer: p } if *channel == LOBBY_CH && *p == peer
        )
    })
    .await;
    wait_for(&mut server_events, "match PeerLeft", |event| {
        matches!(
            event,
            SessionEvent::PeerLeft { channel, peer: p } if *channel == MATCH_CH && *p == peer
        )
    })
    .await;
}
