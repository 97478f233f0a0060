//! Abstract transport boundary.
//!
//! A transport is a task wired to the engine with two bounded channels:
//! commands in, events out. The engine never touches sockets; it only
//! requires reliable ordered delivery per peer and connect/disconnect
//! notifications with a sender identity. Pushes may come from any transport
//! task; the engine drains them single-writer.

use bytes::Bytes;
use scopewire_protocol::DisconnectReason;
use tokio::sync::mpsc;

use crate::peer::PeerId;

pub mod memory;
pub mod tcp;

/// Engine-to-transport instructions.
#[derive(Debug)]
pub enum TransportCmd {
    /// Client: establish a connection. `credentials` are presented to the
    /// remote authentication gate before any scope traffic.
    Connect {
        host: String,
        port: u16,
        credentials: Vec<u8>,
    },
    /// Client: drop the current connection.
    Disconnect { reason: DisconnectReason },
    /// Deliver one frame to one peer ([`PeerId::HOST`] from a client).
    Send { peer: PeerId, frame: Bytes },
    /// Deliver one frame to several peers.
    SendMany { peers: Vec<PeerId>, frame: Bytes },
    /// Server: drop one peer's connection.
    DisconnectPeer {
        peer: PeerId,
        reason: DisconnectReason,
    },
}

/// Transport-to-engine notifications. Per-peer arrival order is preserved.
#[derive(Debug)]
pub enum TransportEvent {
    /// Client: connection established.
    Connected,
    /// Client: connection attempt failed.
    ConnectFailed,
    /// Client: connection gone.
    Disconnected { reason: DisconnectReason },
    /// Server: a new peer connected and presented `credentials`.
    PeerConnected { peer: PeerId, credentials: Bytes },
    /// Server: a peer's connection is gone.
    PeerDisconnected { peer: PeerId },
    /// One inbound frame with its sender.
    Received { peer: PeerId, frame: Bytes },
}

/// The engine's grip on a spawned transport task.
pub struct TransportHandle {
    pub cmd_tx: mpsc::Sender<TransportCmd>,
    pub event_rx: mpsc::Receiver<TransportEvent>,
}
