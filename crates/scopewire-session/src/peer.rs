//! Peer identities and the server-side peer record.

use std::fmt;

/// Identifies one remote connection. Assigned by the transport on the
/// server; on the client the single remote endpoint is [`PeerId::HOST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl PeerId {
    /// The remote host as seen from a client session.
    pub const HOST: PeerId = PeerId(0);
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == PeerId::HOST {
            write!(f, "host")
        } else {
            write!(f, "peer-{}", self.0)
        }
    }
}

/// Server-side record for one connected peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    /// Passed the authentication gate.
    pub authenticated: bool,
    /// Set during a redirect-to-self so the coming disconnect is not
    /// announced as a departure.
    pub soft_disconnect: bool,
    /// Cleared during session teardown so no Exit frames are attempted
    /// for a connection that is going away wholesale.
    pub send_exit_on_disconnect: bool,
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            authenticated: false,
            soft_disconnect: false,
            send_exit_on_disconnect: true,
        }
    }
}
