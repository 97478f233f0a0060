//! Signal dispatch tables and the handler-side context.
//!
//! A table is built once per scope type from explicit registrations (no
//! runtime reflection), shared across instances via `Arc`, and immutable
//! after build. Entries are keyed by the 32-bit hash of the signal name;
//! a hash collision inside one table is a configuration error surfaced at
//! build time.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use scopewire_protocol::{
    decode_value, encode_value, response_hash, signal_hash, Channel, FrameReader, FrameWriter,
    PromiseId, SignalHash,
};
use scopewire_replication::VariableSet;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SessionError;
use crate::peer::PeerId;

/// Where an outbound frame queued from handler context is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// One specific peer ([`PeerId::HOST`] from a client).
    Peer(PeerId),
    /// Every current member of the scope active on this channel (the host,
    /// from a client).
    Members(Channel),
}

/// Frames queued during dispatch/hooks, drained by the drive loop.
#[derive(Default)]
pub struct Outbox {
    queued: Vec<(SendTarget, Bytes)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn queue(&mut self, target: SendTarget, frame: Bytes) {
        self.queued.push((target, frame));
    }

    pub(crate) fn drain(&mut self) -> Vec<(SendTarget, Bytes)> {
        std::mem::take(&mut self.queued)
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

/// Context handed to signal handlers and scope hooks. Sends queue into the
/// outbox; the drive loop flushes them after the handler returns, preserving
/// order.
pub struct SignalContext<'a> {
    channel: Channel,
    /// Peer whose frame is being dispatched, if any.
    sender: Option<PeerId>,
    /// Default target for reply-style sends: the sender of the last inbound
    /// signal on this scope.
    reply_to: Option<PeerId>,
    vars: &'a mut VariableSet,
    outbox: &'a mut Outbox,
}

impl<'a> SignalContext<'a> {
    pub(crate) fn new(
        channel: Channel,
        sender: Option<PeerId>,
        reply_to: Option<PeerId>,
        vars: &'a mut VariableSet,
        outbox: &'a mut Outbox,
    ) -> Self {
        Self {
            channel,
            sender,
            reply_to,
            vars,
            outbox,
        }
    }

    /// The channel this scope is currently bound to.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Sender of the frame being dispatched. `None` inside hooks and
    /// handle-driven updates.
    pub fn sender(&self) -> Option<PeerId> {
        self.sender
    }

    /// The scope's replicated variables. Mutations on the owning side are
    /// pushed to members as soon as the handler returns.
    pub fn vars(&mut self) -> &mut VariableSet {
        self.vars
    }

    fn scope_frame<A: Serialize>(
        &self,
        signal: &str,
        args: &A,
    ) -> Result<Bytes, SessionError> {
        let mut w = FrameWriter::new();
        w.u16(self.channel).u32(signal_hash(signal));
        w.raw(&encode_value(args)?);
        Ok(w.freeze())
    }

    /// One-way send defaulting to whoever sent the last inbound signal.
    pub fn send<A: Serialize>(&mut self, signal: &str, args: &A) -> Result<(), SessionError> {
        let target = self
            .sender
            .or(self.reply_to)
            .ok_or(SessionError::NoReplyTarget)?;
        let frame = self.scope_frame(signal, args)?;
        self.outbox.queue(SendTarget::Peer(target), frame);
        Ok(())
    }

    /// One-way send to a specific peer.
    pub fn send_to<A: Serialize>(
        &mut self,
        peer: PeerId,
        signal: &str,
        args: &A,
    ) -> Result<(), SessionError> {
        let frame = self.scope_frame(signal, args)?;
        self.outbox.queue(SendTarget::Peer(peer), frame);
        Ok(())
    }

    /// One-way send to every current member of the scope.
    pub fn broadcast<A: Serialize>(&mut self, signal: &str, args: &A) -> Result<(), SessionError> {
        let frame = self.scope_frame(signal, args)?;
        self.outbox.queue(SendTarget::Members(self.channel), frame);
        Ok(())
    }
}

/// What dispatching one scope frame produced.
pub enum DispatchOutcome {
    /// A handler ran (response frames, if any, are in the outbox).
    Handled,
    /// A replicated-variable diff was applied.
    VarChanged(scopewire_replication::VarId),
    /// The hash matched no table entry; the drive loop decides whether it
    /// is a two-way response or an unbound signal.
    Unbound { hash: SignalHash },
}

type OneWayFn<S> =
    Box<dyn Fn(&mut S, &mut SignalContext<'_>, Bytes) -> Result<(), SessionError> + Send + Sync>;
type TwoWayFn<S> = Box<
    dyn Fn(&mut S, &mut SignalContext<'_>, Bytes) -> Result<Vec<u8>, SessionError> + Send + Sync,
>;

enum Entry<S> {
    OneWay { name: String, f: OneWayFn<S> },
    TwoWay {
        name: String,
        response: SignalHash,
        f: TwoWayFn<S>,
    },
}

impl<S> Entry<S> {
    fn name(&self) -> &str {
        match self {
            Entry::OneWay { name, .. } => name,
            Entry::TwoWay { name, .. } => name,
        }
    }
}

/// Immutable hash-to-handler table for one scope type.
pub struct DispatchTable<S> {
    entries: HashMap<SignalHash, Entry<S>>,
}

impl<S> DispatchTable<S> {
    pub fn builder() -> DispatchTableBuilder<S> {
        DispatchTableBuilder {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dispatch a frame positioned after the channel header. The leading
    /// hash selects the entry; two-way requests queue their response frame
    /// onto the context's outbox, tagged with the caller's promise id.
    pub(crate) fn dispatch(
        &self,
        state: &mut S,
        ctx: &mut SignalContext<'_>,
        hash: SignalHash,
        r: &mut FrameReader,
    ) -> Result<DispatchOutcome, SessionError> {
        let Some(entry) = self.entries.get(&hash) else {
            return Ok(DispatchOutcome::Unbound { hash });
        };
        match entry {
            Entry::OneWay { f, .. } => {
                let payload = r.rest();
                f(state, ctx, payload)?;
                Ok(DispatchOutcome::Handled)
            }
            Entry::TwoWay { response, f, .. } => {
                let promise_id: PromiseId = r.u32()?;
                let payload = r.rest();
                let ret = f(state, ctx, payload)?;
                let caller = ctx.sender.ok_or(SessionError::NoReplyTarget)?;
                let mut w = FrameWriter::new();
                w.u16(ctx.channel).u32(*response).u32(promise_id).raw(&ret);
                ctx.outbox.queue(SendTarget::Peer(caller), w.freeze());
                Ok(DispatchOutcome::Handled)
            }
        }
    }
}

/// Explicit registration surface; replaces the reflection the wire design
/// assumes with compile-time-known closures.
pub struct DispatchTableBuilder<S> {
    entries: HashMap<SignalHash, Entry<S>>,
}

impl<S> DispatchTableBuilder<S> {
    fn insert(mut self, hash: SignalHash, entry: Entry<S>) -> Result<Self, SessionError> {
        if let Some(existing) = self.entries.get(&hash) {
            return Err(SessionError::DuplicateSignal(format!(
                "{} vs {}",
                entry.name(),
                existing.name()
            )));
        }
        self.entries.insert(hash, entry);
        Ok(self)
    }

    /// Register a one-way signal: decode parameters, invoke, no reply.
    pub fn one_way<A, F>(self, name: &str, f: F) -> Result<Self, SessionError>
    where
        A: DeserializeOwned,
        F: Fn(&mut S, &mut SignalContext<'_>, A) -> Result<(), SessionError>
            + Send
            + Sync
            + 'static,
    {
        let wrapped: OneWayFn<S> = Box::new(move |state, ctx, payload| {
            let args: A = decode_value(&payload)?;
            f(state, ctx, args)
        });
        self.insert(
            signal_hash(name),
            Entry::OneWay {
                name: name.to_string(),
                f: wrapped,
            },
        )
    }

    /// Register a two-way signal: decode parameters, invoke, send the
    /// serialized return back under the derived response hash.
    pub fn two_way<A, R, F>(self, name: &str, f: F) -> Result<Self, SessionError>
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&mut S, &mut SignalContext<'_>, A) -> Result<R, SessionError>
            + Send
            + Sync
            + 'static,
    {
        let response = response_hash(name);
        let wrapped: TwoWayFn<S> = Box::new(move |state, ctx, payload| {
            let args: A = decode_value(&payload)?;
            let ret = f(state, ctx, args)?;
            Ok(encode_value(&ret)?)
        });
        self.insert(
            signal_hash(name),
            Entry::TwoWay {
                name: name.to_string(),
                response,
                f: wrapped,
            },
        )
    }

    pub fn build(self) -> Arc<DispatchTable<S>> {
        Arc::new(DispatchTable {
            entries: self.entries,
        })
    }
}
