//! Session error taxonomy.
//!
//! Setup-time errors (exhaustion, duplicate registration, missing default
//! scope) are fatal and surface from builders. Receipt-time errors
//! (unknown identifiers, stale promises) are logged at the drive loop and
//! the offending frame is dropped; the connection stays up.

use scopewire_protocol::{Channel, ProtocolError, PromiseId, ScopeId, SignalHash};
use scopewire_replication::ReplicationError;

use crate::peer::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("channel space exhausted")]
    ChannelsExhausted,
    #[error("channel {0} already allocated")]
    ChannelAlreadyAllocated(Channel),
    #[error("channel {0} outside the allocatable range")]
    ChannelOutOfRange(Channel),
    #[error("no registered scope with identifier {0}")]
    UnknownScopeIdentifier(ScopeId),
    #[error("no active scope bound to channel {0}")]
    UnboundChannel(Channel),
    #[error("no handler for signal {hash:#010x} on channel {channel}")]
    UnboundSignal { channel: Channel, hash: SignalHash },
    #[error("no outstanding promise {id} for {peer}")]
    UnknownPromise { peer: PeerId, id: PromiseId },
    #[error("a redirect is already in progress")]
    AlreadyRedirecting,
    #[error("signal \"{0}\" hashes onto an existing table entry")]
    DuplicateSignal(String),
    #[error("scope identifier {0} registered twice")]
    DuplicateScope(ScopeId),
    #[error("a default scope must be designated before the server starts")]
    DefaultScopeRequired,
    #[error("no reply target recorded for this scope yet")]
    NoReplyTarget,
    #[error("not connected")]
    NotConnected,
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
    #[error("two-way call cancelled by disconnect")]
    PromiseCancelled,
    #[error("session engine is gone")]
    EngineClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
}
