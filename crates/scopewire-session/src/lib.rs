//! Scopewire Session -- the scope protocol engine.
//!
//! Multiplexes typed remote calls and replicated state over a reliable
//! ordered transport, partitioned into independently-activated scopes. All
//! engine state is single-writer: transport notifications and application
//! commands are queued into channels and drained by one drive loop per
//! endpoint (client session controller, server peer manager), which is the
//! only place scope state, dispatch tables, and promises are mutated.

pub mod channel_alloc;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod peer;
pub mod promise;
pub mod registry;
pub mod scope;
pub mod server;
pub mod transport;

pub use channel_alloc::ChannelAllocator;
pub use client::{ClientBuilder, ClientHandle, SessionController};
pub use config::SessionConfig;
pub use dispatch::{DispatchTable, DispatchTableBuilder, SignalContext};
pub use error::SessionError;
pub use event::SessionEvent;
pub use peer::{Peer, PeerId};
pub use promise::{PromiseCorrelator, PromiseOutcome};
pub use registry::ScopeRegistry;
pub use scope::{Scope, ScopeRuntime, ScopeState};
pub use server::{PeerManager, ServerBuilder, ServerHandle};
