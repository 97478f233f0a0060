//! Plain TCP transport binding.
//!
//! Frames travel length-prefixed via `FrameCodec`. The first frame a client
//! sends after connecting is its credential blob; the server surfaces it in
//! `PeerConnected` before any scope traffic. One binding is enough to prove
//! the transport seam; anything fancier lives outside the engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use scopewire_protocol::{FrameCodec, REASON_TRANSPORT_LOST};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;

use crate::peer::PeerId;
use crate::transport::{TransportCmd, TransportEvent, TransportHandle};

const QUEUE_DEPTH: usize = 256;

/// Spawn a client transport task. Connects on command.
pub fn client() -> TransportHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
    let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);
    tokio::spawn(run_client(cmd_rx, event_tx));
    TransportHandle { cmd_tx, event_rx }
}

/// Bind a listener and spawn the server transport tasks. Returns the handle
/// and the actual bound address (useful with port 0).
pub async fn server(listen: SocketAddr) -> std::io::Result<(TransportHandle, SocketAddr)> {
    let listener = TcpListener::bind(listen).await?;
    let local = listener.local_addr()?;

    let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
    let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);
    let writers: Writers = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(run_accept_loop(listener, event_tx, writers.clone()));
    tokio::spawn(run_server_cmds(cmd_rx, writers));

    Ok((TransportHandle { cmd_tx, event_rx }, local))
}

// ============================================================================
// Client side
// ============================================================================

async fn run_client(
    mut cmd_rx: mpsc::Receiver<TransportCmd>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    'offline: while let Some(cmd) = cmd_rx.recv().await {
        let TransportCmd::Connect {
            host,
            port,
            credentials,
        } = cmd
        else {
            tracing::debug!("tcp: command while offline ignored");
            continue;
        };

        let mut framed = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => Framed::new(stream, FrameCodec),
            Err(e) => {
                tracing::warn!(host, port, "tcp: connect failed: {e}");
                let _ = event_tx.send(TransportEvent::ConnectFailed).await;
                continue;
            }
        };
        if framed.send(Bytes::from(credentials)).await.is_err() {
            let _ = event_tx.send(TransportEvent::ConnectFailed).await;
            continue;
        }
        tracing::info!(host, port, "tcp: connected");
        let _ = event_tx.send(TransportEvent::Connected).await;

        // Online loop for this connection.
        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        None => return,
                        Some(TransportCmd::Send { frame, .. })
                        | Some(TransportCmd::SendMany { frame, .. }) => {
                            if framed.send(frame).await.is_err() {
                                let _ = event_tx
                                    .send(TransportEvent::Disconnected { reason: REASON_TRANSPORT_LOST })
                                    .await;
                                continue 'offline;
                            }
                        }
                        Some(TransportCmd::Disconnect { reason }) => {
                            let _ = framed.close().await;
                            let _ = event_tx.send(TransportEvent::Disconnected { reason }).await;
                            continue 'offline;
                        }
                        Some(other) => {
                            tracing::debug!(?other, "tcp: unexpected command while online");
                        }
                    }
                }
                inbound = framed.next() => {
                    match inbound {
                        Some(Ok(frame)) => {
                            let _ = event_tx
                                .send(TransportEvent::Received { peer: PeerId::HOST, frame })
                                .await;
                        }
                        Some(Err(e)) => {
                            tracing::warn!("tcp: stream error: {e}");
                            let _ = event_tx
                                .send(TransportEvent::Disconnected { reason: REASON_TRANSPORT_LOST })
                                .await;
                            continue 'offline;
                        }
                        None => {
                            let _ = event_tx
                                .send(TransportEvent::Disconnected { reason: REASON_TRANSPORT_LOST })
                                .await;
                            continue 'offline;
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Server side
// ============================================================================

enum WriterMsg {
    Frame(Bytes),
    Close,
}

type Writers = Arc<Mutex<HashMap<PeerId, mpsc::Sender<WriterMsg>>>>;

async fn run_accept_loop(
    listener: TcpListener,
    event_tx: mpsc::Sender<TransportEvent>,
    writers: Writers,
) {
    let mut next_peer: u64 = 0;
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("tcp: accept failed: {e}");
                continue;
            }
        };
        next_peer += 1;
        let peer = PeerId(next_peer);
        tracing::info!(%peer, %addr, "tcp: connection accepted");

        let (writer_tx, writer_rx) = mpsc::channel(QUEUE_DEPTH);
        writers.lock().await.insert(peer, writer_tx);
        tokio::spawn(run_peer(
            stream,
            peer,
            event_tx.clone(),
            writer_rx,
            writers.clone(),
        ));
    }
}

async fn run_peer(
    stream: TcpStream,
    peer: PeerId,
    event_tx: mpsc::Sender<TransportEvent>,
    mut writer_rx: mpsc::Receiver<WriterMsg>,
    writers: Writers,
) {
    let mut framed = Framed::new(stream, FrameCodec);

    // First frame is the credential blob.
    let credentials = match framed.next().await {
        Some(Ok(frame)) => frame,
        _ => {
            tracing::debug!(%peer, "tcp: connection dropped before credentials");
            writers.lock().await.remove(&peer);
            return;
        }
    };
    let _ = event_tx
        .send(TransportEvent::PeerConnected { peer, credentials })
        .await;

    loop {
        tokio::select! {
            msg = writer_rx.recv() => {
                match msg {
                    Some(WriterMsg::Frame(frame)) => {
                        if framed.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(WriterMsg::Close) | None => {
                        let _ = framed.close().await;
                        break;
                    }
                }
            }
            inbound = framed.next() => {
                match inbound {
                    Some(Ok(frame)) => {
                        let _ = event_tx.send(TransportEvent::Received { peer, frame }).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(%peer, "tcp: stream error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    writers.lock().await.remove(&peer);
    let _ = event_tx.send(TransportEvent::PeerDisconnected { peer }).await;
}

async fn run_server_cmds(mut cmd_rx: mpsc::Receiver<TransportCmd>, writers: Writers) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            TransportCmd::Send { peer, frame } => {
                send_writer(&writers, peer, WriterMsg::Frame(frame)).await;
            }
            TransportCmd::SendMany { peers, frame } => {
                for peer in peers {
                    send_writer(&writers, peer, WriterMsg::Frame(frame.clone())).await;
                }
            }
            TransportCmd::DisconnectPeer { peer, .. } => {
                send_writer(&writers, peer, WriterMsg::Close).await;
            }
            TransportCmd::Connect { .. } | TransportCmd::Disconnect { .. } => {
                tracing::warn!("tcp: client-only command on server endpoint");
            }
        }
    }
    // Engine gone: close every peer connection.
    for (_, writer) in writers.lock().await.drain() {
        let _ = writer.send(WriterMsg::Close).await;
    }
}

async fn send_writer(writers: &Writers, peer: PeerId, msg: WriterMsg) {
    let writer = writers.lock().await.get(&peer).cloned();
    match writer {
        Some(tx) => {
            let _ = tx.send(msg).await;
        }
        None => tracing::debug!(%peer, "tcp: write to unknown peer dropped"),
    }
}
