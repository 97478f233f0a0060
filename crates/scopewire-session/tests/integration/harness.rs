//! Test harness -- a lobby/match server and matching clients running in
//! the same tokio runtime over the memory transport.

use std::sync::Arc;
use std::time::Duration;

use scopewire_protocol::{Channel, ScopeId};
use scopewire_replication::{VarId, VariableSet};
use scopewire_session::transport::memory::MemoryNetwork;
use scopewire_session::{
    ClientBuilder, ClientHandle, DispatchTable, Scope, ScopeState, ServerBuilder, ServerHandle,
    SessionConfig, SessionEvent, SignalContext,
};
use tokio::sync::{broadcast, mpsc};

pub const LOBBY: ScopeId = 1;
pub const MATCH: ScopeId = 2;
pub const LOBBY_CH: Channel = 120;
pub const MATCH_CH: Channel = 121;

pub const VAR_MOTD: VarId = 0;
pub const VAR_ROSTER: VarId = 1;

pub const GOOD_CREDENTIALS: &[u8] = b"let-me-in";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Server scopes
// ============================================================================

#[derive(Default)]
pub struct LobbyServer {
    pub announcements: Vec<String>,
}

impl ScopeState for LobbyServer {}

fn lobby_server_table() -> Arc<DispatchTable<LobbyServer>> {
    DispatchTable::builder()
        .one_way("Announce", |state: &mut LobbyServer, _ctx, text: String| {
            state.announcements.push(text);
            Ok(())
        })
        .unwrap()
        .two_way("Recent", |state: &mut LobbyServer, _ctx, (): ()| {
            Ok(state.announcements.clone())
        })
        .unwrap()
        .two_way("Test3", |_state, _ctx, (): ()| Ok(42u32))
        .unwrap()
        .one_way("Ping", |_state, ctx, text: String| {
            // Reply-style: goes back to whoever sent this signal.
            ctx.send("Notice", &format!("pong: {text}"))
        })
        .unwrap()
        .two_way("Echo", |_state, _ctx, text: String| Ok(text))
        .unwrap()
        .build()
}

fn lobby_server_scope() -> Scope<LobbyServer> {
    let mut vars = VariableSet::owner();
    vars.register_value::<String>(VAR_MOTD, "welcome".into())
        .unwrap();
    vars.register_list::<String>(VAR_ROSTER, vec![]).unwrap();
    Scope::new(LOBBY, LobbyServer::default(), lobby_server_table(), vars)
}

#[derive(Default)]
pub struct MatchServer {
    pub shots: u32,
}

impl ScopeState for MatchServer {}

fn match_server_table() -> Arc<DispatchTable<MatchServer>> {
    DispatchTable::builder()
        .one_way("Fire", |state: &mut MatchServer, _ctx, (): ()| {
            state.shots += 1;
            Ok(())
        })
        .unwrap()
        .two_way("Shots", |state: &mut MatchServer, _ctx, (): ()| {
            Ok(state.shots)
        })
        .unwrap()
        .build()
}

fn match_server_scope() -> Scope<MatchServer> {
    // No replicated variables: join snapshots must be empty.
    Scope::new(MATCH, MatchServer::default(), match_server_table(), VariableSet::owner())
}

// ============================================================================
// Client scopes
// ============================================================================

pub struct LobbyClient {
    notices: mpsc::UnboundedSender<String>,
}

impl ScopeState for LobbyClient {}

fn lobby_client_scope(notices: mpsc::UnboundedSender<String>) -> Scope<LobbyClient> {
    let table = DispatchTable::builder()
        .one_way("Notice", |state: &mut LobbyClient, _ctx, text: String| {
            let _ = state.notices.send(text);
            Ok(())
        })
        .unwrap()
        .two_way("ClientInfo", |_state, _ctx, (): ()| {
            Ok("scopewire-test-client".to_string())
        })
        .unwrap()
        .build();
    let mut vars = VariableSet::replica();
    vars.register_value::<String>(VAR_MOTD, String::new())
        .unwrap();
    vars.register_list::<String>(VAR_ROSTER, vec![]).unwrap();
    Scope::new(LOBBY, LobbyClient { notices }, table, vars)
}

fn match_client_scope() -> Scope<()> {
    Scope::new(
        MATCH,
        (),
        DispatchTable::<()>::builder().build(),
        VariableSet::replica(),
    )
}

// ============================================================================
// Endpoint spawning
// ============================================================================

pub async fn start_server(net: &MemoryNetwork, port: u16) -> ServerHandle {
    init_tracing();
    let (manager, handle) = ServerBuilder::new(SessionConfig::default())
        .scope_on_channel(lobby_server_scope(), LOBBY_CH)
        .scope_on_channel(match_server_scope(), MATCH_CH)
        .default_scope(LOBBY)
        .auth_gate(|_, credentials| credentials == GOOD_CREDENTIALS)
        .build()
        .expect("server build");
    let transport = net.server(port).await;
    tokio::spawn(manager.run(transport));
    handle
}

pub struct TestClient {
    pub handle: ClientHandle,
    /// Server-to-client "Notice" signals land here.
    pub notices: mpsc::UnboundedReceiver<String>,
}

pub fn start_client(net: &MemoryNetwork, credentials: &[u8], auto_reconnect: bool) -> TestClient {
    init_tracing();
    let mut config = SessionConfig::default();
    config.reconnect.auto = auto_reconnect;
    config.reconnect.delay_ms = 50;
    config.reconnect.jitter_ms = 10;

    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let (controller, handle) = ClientBuilder::new(config)
        .credentials(credentials.to_vec())
        .scope(lobby_client_scope(notice_tx))
        .scope(match_client_scope())
        .build()
        .expect("client build");
    tokio::spawn(controller.run(net.client()));
    TestClient {
        handle,
        notices: notice_rx,
    }
}

/// Connect a client to `port` and wait for the default-scope join on both
/// sides. Returns the server-side peer id.
pub async fn join_at(
    server: &ServerHandle,
    client: &TestClient,
    port: u16,
) -> scopewire_session::PeerId {
    let mut server_events = server.subscribe();
    let mut client_events = client.handle.subscribe();
    client.handle.connect("localhost", port).await.expect("connect");

    let joined = wait_for(&mut server_events, "server PeerJoined", |event| {
        matches!(event, SessionEvent::PeerJoined { channel, .. } if *channel == LOBBY_CH)
    })
    .await;
    wait_for(&mut client_events, "client ScopeEntered", |event| {
        matches!(event, SessionEvent::ScopeEntered { scope_id, .. } if *scope_id == LOBBY)
    })
    .await;

    match joined {
        SessionEvent::PeerJoined { peer, .. } => peer,
        _ => unreachable!(),
    }
}

/// Wait up to five seconds for a matching event.
pub async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    what: &str,
    predicate: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timeout waiting for {what}"))
}

/// Assert no matching event arrives within `window`.
pub async fn assert_quiet(
    events: &mut broadcast::Receiver<SessionEvent>,
    what: &str,
    window: Duration,
    predicate: impl Fn(&SessionEvent) -> bool,
) {
    let outcome = tokio::time::timeout(window, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await;
    if let Ok(event) = outcome {
        panic!("unexpected {what}: {event:?}");
    }
}

/// Read a replicated value variable out of a running client scope.
pub async fn read_client_var(client: &ClientHandle, channel: Channel, var: VarId) -> String {
    let (tx, rx) = tokio::sync::oneshot::channel();
    client
        .update_scope(channel, move |ctx: &mut SignalContext<'_>| {
            let value = ctx.vars().get::<String>(var)?.clone();
            let _ = tx.send(value);
            Ok(())
        })
        .await
        .expect("update_scope");
    rx.await.expect("var read")
}

/// Read a replicated list variable out of a running client scope.
pub async fn read_client_list(
    client: &ClientHandle,
    channel: Channel,
    var: VarId,
) -> Vec<String> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    client
        .update_scope(channel, move |ctx: &mut SignalContext<'_>| {
            let values = ctx.vars().get_list::<String>(var)?.clone();
            let _ = tx.send(values);
            Ok(())
        })
        .await
        .expect("update_scope");
    rx.await.expect("list read")
}
