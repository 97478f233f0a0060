//! In-process transport -- linked client/server endpoints over channels.
//!
//! Used by the integration harness and for single-process setups. Servers
//! bind to a port number inside one `MemoryNetwork`; clients connect by
//! port, so redirect paths can be exercised with several servers.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use scopewire_protocol::{DisconnectReason, REASON_TRANSPORT_LOST};
use tokio::sync::{mpsc, Mutex};

use crate::peer::PeerId;
use crate::transport::{TransportCmd, TransportEvent, TransportHandle};

const QUEUE_DEPTH: usize = 256;

struct ServerSlot {
    event_tx: mpsc::Sender<TransportEvent>,
    clients: HashMap<PeerId, mpsc::Sender<TransportEvent>>,
}

#[derive(Default)]
struct Inner {
    servers: HashMap<u16, ServerSlot>,
    next_peer: u64,
}

/// A little in-process internet.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a server endpoint at `port` and spawn its command task.
    pub async fn server(&self, port: u16) -> TransportHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);

        self.inner.lock().await.servers.insert(
            port,
            ServerSlot {
                event_tx: event_tx.clone(),
                clients: HashMap::new(),
            },
        );

        tokio::spawn(run_server_cmds(self.inner.clone(), port, cmd_rx));
        TransportHandle { cmd_tx, event_rx }
    }

    /// Create a client endpoint and spawn its command task. Connects are
    /// routed by port; the host string is ignored.
    pub fn client(&self) -> TransportHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);

        tokio::spawn(run_client_cmds(self.inner.clone(), cmd_rx, event_tx));
        TransportHandle { cmd_tx, event_rx }
    }
}

async fn run_server_cmds(
    inner: Arc<Mutex<Inner>>,
    port: u16,
    mut cmd_rx: mpsc::Receiver<TransportCmd>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            TransportCmd::Send { peer, frame } => {
                deliver_to_client(&inner, port, peer, frame).await;
            }
            TransportCmd::SendMany { peers, frame } => {
                for peer in peers {
                    deliver_to_client(&inner, port, peer, frame.clone()).await;
                }
            }
            TransportCmd::DisconnectPeer { peer, reason } => {
                drop_client(&inner, port, peer, reason).await;
            }
            TransportCmd::Connect { .. } | TransportCmd::Disconnect { .. } => {
                tracing::warn!("memory: client-only command on server endpoint");
            }
        }
    }
    // Server gone: drop every client still attached.
    let slot = inner.lock().await.servers.remove(&port);
    if let Some(slot) = slot {
        for (_, client_tx) in slot.clients {
            let _ = client_tx
                .send(TransportEvent::Disconnected {
                    reason: REASON_TRANSPORT_LOST,
                })
                .await;
        }
    }
}

async fn deliver_to_client(inner: &Mutex<Inner>, port: u16, peer: PeerId, frame: Bytes) {
    let client_tx = inner
        .lock()
        .await
        .servers
        .get(&port)
        .and_then(|slot| slot.clients.get(&peer).cloned());
    match client_tx {
        Some(tx) => {
            let _ = tx
                .send(TransportEvent::Received {
                    peer: PeerId::HOST,
                    frame,
                })
                .await;
        }
        None => tracing::debug!(%peer, "memory: send to unknown peer dropped"),
    }
}

async fn drop_client(inner: &Mutex<Inner>, port: u16, peer: PeerId, reason: DisconnectReason) {
    let removed = {
        let mut guard = inner.lock().await;
        guard
            .servers
            .get_mut(&port)
            .and_then(|slot| slot.clients.remove(&peer).map(|tx| (tx, slot.event_tx.clone())))
    };
    if let Some((client_tx, server_tx)) = removed {
        let _ = client_tx
            .send(TransportEvent::Disconnected { reason })
            .await;
        let _ = server_tx
            .send(TransportEvent::PeerDisconnected { peer })
            .await;
    }
}

async fn run_client_cmds(
    inner: Arc<Mutex<Inner>>,
    mut cmd_rx: mpsc::Receiver<TransportCmd>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    // (port, assigned peer id) while connected.
    let mut link: Option<(u16, PeerId)> = None;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            TransportCmd::Connect {
                port, credentials, ..
            } => {
                // A server-side kick delivers Disconnected straight to the
                // engine; notice it here so a reconnect is not refused.
                if let Some((old_port, old_peer)) = link {
                    if is_attached(&inner, old_port, old_peer).await {
                        tracing::warn!("memory: connect while already connected");
                        continue;
                    }
                    link = None;
                }
                let attached = {
                    let mut guard = inner.lock().await;
                    guard.next_peer += 1;
                    let peer = PeerId(guard.next_peer);
                    match guard.servers.get_mut(&port) {
                        Some(slot) => {
                            slot.clients.insert(peer, event_tx.clone());
                            Some((peer, slot.event_tx.clone()))
                        }
                        None => None,
                    }
                };
                match attached {
                    Some((peer, server_tx)) => {
                        link = Some((port, peer));
                        let _ = server_tx
                            .send(TransportEvent::PeerConnected {
                                peer,
                                credentials: Bytes::from(credentials),
                            })
                            .await;
                        let _ = event_tx.send(TransportEvent::Connected).await;
                    }
                    None => {
                        let _ = event_tx.send(TransportEvent::ConnectFailed).await;
                    }
                }
            }
            TransportCmd::Disconnect { reason } => {
                if let Some((port, peer)) = link.take() {
                    detach(&inner, port, peer).await;
                    let _ = event_tx.send(TransportEvent::Disconnected { reason }).await;
                }
            }
            TransportCmd::Send { frame, .. } | TransportCmd::SendMany { frame, .. } => {
                // Single remote endpoint; SendMany degenerates to Send.
                let Some((port, peer)) = link else {
                    tracing::debug!("memory: send while offline dropped");
                    continue;
                };
                let server_tx = {
                    let guard = inner.lock().await;
                    guard.servers.get(&port).and_then(|slot| {
                        slot.clients
                            .contains_key(&peer)
                            .then(|| slot.event_tx.clone())
                    })
                };
                match server_tx {
                    Some(tx) => {
                        let _ = tx.send(TransportEvent::Received { peer, frame }).await;
                    }
                    None => {
                        // Kicked or server gone; the Disconnected event was
                        // (or will be) delivered by whoever dropped us.
                        link = None;
                        tracing::debug!("memory: send on dead link dropped");
                    }
                }
            }
            TransportCmd::DisconnectPeer { .. } => {
                tracing::warn!("memory: server-only command on client endpoint");
            }
        }
    }
    // Client handle dropped: detach from the server if still linked.
    if let Some((port, peer)) = link {
        detach(&inner, port, peer).await;
    }
}

async fn is_attached(inner: &Mutex<Inner>, port: u16, peer: PeerId) -> bool {
    inner
        .lock()
        .await
        .servers
        .get(&port)
        .is_some_and(|slot| slot.clients.contains_key(&peer))
}

async fn detach(inner: &Mutex<Inner>, port: u16, peer: PeerId) {
    let server_tx = {
        let mut guard = inner.lock().await;
        guard.servers.get_mut(&port).and_then(|slot| {
            slot.clients
                .remove(&peer)
                .map(|_| slot.event_tx.clone())
        })
    };
    if let Some(tx) = server_tx {
        let _ = tx.send(TransportEvent::PeerDisconnected { peer }).await;
    }
}
