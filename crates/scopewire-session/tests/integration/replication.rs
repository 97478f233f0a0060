//! Replicated variable tests: join snapshots and live diffs.

use scopewire_session::transport::memory::MemoryNetwork;
use scopewire_session::{SessionError, SessionEvent};

use crate::harness::{
    join_at, read_client_list, read_client_var, start_client, start_server, wait_for,
    GOOD_CREDENTIALS, LOBBY_CH, VAR_MOTD, VAR_ROSTER,
};

/// Push-all-on-join: a newly-admitted peer sees the owner's current values.
#[tokio::test]
async fn test_join_snapshot() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9300).await;

    // Mutate before anyone joins.
    server
        .update_scope(LOBBY_CH, |ctx| {
            ctx.vars().set(VAR_MOTD, "maintenance at noon".to_string())?;
            ctx.vars().push(VAR_ROSTER, "ada".to_string())?;
            Ok(())
        })
        .await
        .unwrap();

    let client = start_client(&net, GOOD_CREDENTIALS, false);
    join_at(&server, &client, 9300).await;

    assert_eq!(
        read_client_var(&client.handle, LOBBY_CH, VAR_MOTD).await,
        "maintenance at noon"
    );
    assert_eq!(
        read_client_list(&client.handle, LOBBY_CH, VAR_ROSTER).await,
        vec!["ada"]
    );
}

/// Push-on-change: owner mutations arrive as diffs with change
/// notifications on the receiving side.
#[tokio::test]
async fn test_live_set_replicates() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9301).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);
    let mut client_events = client.handle.subscribe();

    join_at(&server, &client, 9301).await;

    server
        .update_scope(LOBBY_CH, |ctx| {
            ctx.vars().set(VAR_MOTD, "server restarting".to_string())
                .map_err(SessionError::from)
        })
        .await
        .unwrap();

    wait_for(&mut client_events, "motd VariableChanged", |event| {
        matches!(
            event,
            SessionEvent::VariableChanged { channel, var_id }
                if *channel == LOBBY_CH && *var_id == VAR_MOTD
        )
    })
    .await;
    assert_eq!(
        read_client_var(&client.handle, LOBBY_CH, VAR_MOTD).await,
        "server restarting"
    );
}

/// Ordered-collection diffs apply in mutation order.
#[tokio::test]
async fn test_list_ops_replicate() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9302).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);
    let mut client_events = client.handle.subscribe();

    join_at(&server, &client, 9302).await;

    server
        .update_scope(LOBBY_CH, |ctx| {
            let vars = ctx.vars();
            vars.push(VAR_ROSTER, "ada".to_string())?;
            vars.push(VAR_ROSTER, "cora".to_string())?;
            vars.insert_at(VAR_ROSTER, 1, "bel".to_string())?;
            vars.update_at(VAR_ROSTER, 2, "CORA".to_string())?;
            vars.remove_at::<String>(VAR_ROSTER, 0)?;
            Ok(())
        })
        .await
        .unwrap();

    // Five ops, five notifications; wait for the last and read back.
    for _ in 0..5 {
        wait_for(&mut client_events, "roster VariableChanged", |event| {
            matches!(
                event,
                SessionEvent::VariableChanged { channel, var_id }
                    if *channel == LOBBY_CH && *var_id == VAR_ROSTER
            )
        })
        .await;
    }
    assert_eq!(
        read_client_list(&client.handle, LOBBY_CH, VAR_ROSTER).await,
        vec!["bel", "CORA"]
    );
}

/// Clear empties the collection on every member.
#[tokio::test]
async fn test_clear_replicates() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9303).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);
    let mut client_events = client.handle.subscribe();

    join_at(&server, &client, 9303).await;

    server
        .update_scope(LOBBY_CH, |ctx| {
            let vars = ctx.vars();
            vars.push(VAR_ROSTER, "ada".to_string())?;
            vars.clear::<String>(VAR_ROSTER)?;
            Ok(())
        })
        .await
        .unwrap();

    for _ in 0..2 {
        wait_for(&mut client_events, "roster VariableChanged", |event| {
            matches!(
                event,
                SessionEvent::VariableChanged { var_id, .. } if *var_id == VAR_ROSTER
            )
        })
        .await;
    }
    assert!(read_client_list(&client.handle, LOBBY_CH, VAR_ROSTER)
        .await
        .is_empty());
}

/// Mutation never originates on the replica side.
#[tokio::test]
async fn test_replica_mutation_rejected() {
    let net = MemoryNetwork::new();
    let server = start_server(&net, 9304).await;
    let client = start_client(&net, GOOD_CREDENTIALS, false);

    join_at(&server, &client, 9304).await;

    let result = client
        .handle
        .update_scope(LOBBY_CH, |ctx| {
            ctx.vars()
                .set(VAR_MOTD, "hijacked".to_string())
                .map_err(SessionError::from)
        })
        .await;
    assert!(matches!(
        result,
        Err(SessionError::Replication(
            scopewire_replication::ReplicationError::NotOwner
        ))
    ));
}
