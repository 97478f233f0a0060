//! Scopewire Protocol -- wire types, frame layout, signal hashing.
//!
//! Every frame starts with a 16-bit channel. Channels inside the reserved
//! system band carry control opcodes (enter/exit/switch/disconnect/redirect);
//! all other channels carry scope traffic: a 32-bit signal hash followed by
//! handler-specific bytes. Typed payloads are serde JSON; headers are raw
//! big-endian binary.

pub mod codec;
pub mod frame;

pub use codec::FrameCodec;
pub use frame::{FrameReader, FrameWriter, SystemFrame};

/// A multiplexing channel: one logical stream over a shared connection.
pub type Channel = u16;

/// Stable application-assigned identifier for a scope *type*. Shared by both
/// endpoints independently of the ephemeral channel a scope binds to.
pub type ScopeId = u8;

/// 32-bit wire identifier for a signal, derived from its declared name.
pub type SignalHash = u32;

/// Correlation id for an outstanding two-way call.
pub type PromiseId = u32;

/// Single-byte disconnect reason carried in Disconnect control frames.
pub type DisconnectReason = u8;

/// Width of the reserved system band at the bottom of the channel range.
/// Values in `[floor, floor + SYSTEM_BAND_LEN)` are never allocated to scopes.
pub const SYSTEM_BAND_LEN: u16 = 10;

/// Maximum frame size accepted by the stream codec.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

// -- Reserved disconnect reasons --

/// Orderly session teardown.
pub const REASON_SHUTDOWN: DisconnectReason = 0;
/// Peer failed the authentication gate.
pub const REASON_AUTH_REJECTED: DisconnectReason = 1;
/// Disconnect issued as the first half of a redirect.
pub const REASON_REDIRECT: DisconnectReason = 2;
/// The transport lost the connection without a protocol-level reason.
pub const REASON_TRANSPORT_LOST: DisconnectReason = 3;
/// First reason code free for application use.
pub const REASON_APP_BASE: DisconnectReason = 16;

/// FNV-1a over a byte string. Const so derived hashes can live in constants.
const fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += 1;
    }
    hash
}

/// Hash a signal name into its wire identifier.
///
/// Deterministic and stable across endpoints and versions; collisions within
/// one scope type are a configuration error caught at table-build time.
pub fn signal_hash(name: &str) -> SignalHash {
    fnv1a(name.as_bytes())
}

/// Hash under which the reply to a two-way signal travels: the hash of the
/// name prefixed with `#`.
pub fn response_hash(name: &str) -> SignalHash {
    let mut prefixed = String::with_capacity(name.len() + 1);
    prefixed.push('#');
    prefixed.push_str(name);
    fnv1a(prefixed.as_bytes())
}

/// Reserved signal hash carrying replicated-variable diff operations.
pub const VAR_OP_SIGNAL: SignalHash = fnv1a(b"$var/op");

/// Errors raised while encoding or decoding wire frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame truncated: needed {needed} more byte(s)")]
    Truncated { needed: usize },
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("unknown system opcode {0:#04x}")]
    BadOpcode(u8),
    #[error("malformed string field")]
    BadString,
    #[error("payload codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a typed value into payload bytes.
pub fn encode_value<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode payload bytes into a typed value.
pub fn decode_value<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}
