//! Session events broadcast to subscribers.
//!
//! Emitted only from the drive loop (never from transport threads);
//! subscribe via the client/server handle, unsubscribe by dropping the
//! receiver.

use scopewire_protocol::{Channel, DisconnectReason, ScopeId};
use scopewire_replication::VarId;

use crate::peer::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Client: connection established.
    Connected,
    /// Client: connection attempt failed.
    ConnectFailed,
    /// Client: connection lost or closed, with the last-known reason.
    Disconnected { reason: DisconnectReason },
    /// Client: a redirect is being honored.
    Redirecting { host: String, port: u32 },
    /// A scope became active on a channel.
    ScopeEntered { scope_id: ScopeId, channel: Channel },
    /// A scope went back to inactive.
    ScopeExited { scope_id: ScopeId, channel: Channel },
    /// Server: a peer joined a scope's member set.
    PeerJoined { channel: Channel, peer: PeerId },
    /// Server: a peer left a scope's member set.
    PeerLeft { channel: Channel, peer: PeerId },
    /// A replicated variable changed on the receiving side.
    VariableChanged { channel: Channel, var_id: VarId },
    /// Server: a peer failed the authentication gate and was dropped.
    AuthRejected { peer: PeerId },
}
