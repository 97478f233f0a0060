//! Scope instances -- typed state + dispatch table + replicated variables
//! behind an object-safe runtime seam.

use bytes::Bytes;
use scopewire_protocol::{Channel, FrameReader, FrameWriter, ScopeId, VAR_OP_SIGNAL};
use scopewire_replication::{VarId, VariableSet};
use std::sync::Arc;

use crate::dispatch::{DispatchOutcome, DispatchTable, Outbox, SignalContext};
use crate::error::SessionError;
use crate::peer::PeerId;

/// Application-side state of one scope type. Hooks default to no-ops.
pub trait ScopeState: Send + Sync + 'static {
    /// The scope became active on a channel.
    fn on_enter(&mut self, _ctx: &mut SignalContext<'_>) {}
    /// The scope is going back to inactive.
    fn on_exit(&mut self, _ctx: &mut SignalContext<'_>) {}
}

impl ScopeState for () {}

/// Object-safe seam the registry and drive loops work through. Exactly one
/// instance exists per (endpoint, scope type); it is either parked in the
/// registry's inactive set or bound to a channel in the active set.
pub trait ScopeRuntime: Send + Sync {
    fn scope_id(&self) -> ScopeId;

    /// Activation: apply the join snapshot (when non-empty) and run the
    /// enter hook. Returns the variable ids the snapshot changed.
    fn enter(
        &mut self,
        channel: Channel,
        snapshot: &mut FrameReader,
        outbox: &mut Outbox,
    ) -> Result<Vec<VarId>, SessionError>;

    /// Deactivation: run the exit hook.
    fn exit(&mut self, channel: Channel, outbox: &mut Outbox);

    /// Dispatch one inbound scope frame (reader positioned after the
    /// channel field).
    fn dispatch(
        &mut self,
        channel: Channel,
        sender: PeerId,
        reply_to: Option<PeerId>,
        outbox: &mut Outbox,
        r: &mut FrameReader,
    ) -> Result<DispatchOutcome, SessionError>;

    /// Run an application closure with this scope's context (handle-driven
    /// variable mutation and sends, outside any inbound frame).
    fn update(
        &mut self,
        channel: Channel,
        reply_to: Option<PeerId>,
        outbox: &mut Outbox,
        f: Box<dyn FnOnce(&mut SignalContext<'_>) -> Result<(), SessionError> + Send>,
    ) -> Result<(), SessionError>;

    /// Full variable snapshot for push-all-on-join; empty when the scope
    /// has no replicated variables.
    fn snapshot(&self) -> Result<Bytes, SessionError>;

    /// Diffs produced by owner-side mutations since the last drain.
    fn take_var_ops(&mut self) -> Vec<Bytes>;

    fn var_count(&self) -> usize;
}

/// A concrete scope: user state `S`, a shared dispatch table, and this
/// instance's replicated variables.
pub struct Scope<S: ScopeState> {
    scope_id: ScopeId,
    state: S,
    table: Arc<DispatchTable<S>>,
    vars: VariableSet,
}

impl<S: ScopeState> Scope<S> {
    pub fn new(
        scope_id: ScopeId,
        state: S,
        table: Arc<DispatchTable<S>>,
        vars: VariableSet,
    ) -> Self {
        Self {
            scope_id,
            state,
            table,
            vars,
        }
    }

    pub fn boxed(self) -> Box<dyn ScopeRuntime> {
        Box::new(self)
    }
}

impl<S: ScopeState> ScopeRuntime for Scope<S> {
    fn scope_id(&self) -> ScopeId {
        self.scope_id
    }

    fn enter(
        &mut self,
        channel: Channel,
        snapshot: &mut FrameReader,
        outbox: &mut Outbox,
    ) -> Result<Vec<VarId>, SessionError> {
        let changed = if snapshot.is_empty() {
            Vec::new()
        } else {
            self.vars.apply_snapshot(snapshot)?
        };
        let mut ctx = SignalContext::new(channel, None, None, &mut self.vars, outbox);
        self.state.on_enter(&mut ctx);
        Ok(changed)
    }

    fn exit(&mut self, channel: Channel, outbox: &mut Outbox) {
        let mut ctx = SignalContext::new(channel, None, None, &mut self.vars, outbox);
        self.state.on_exit(&mut ctx);
    }

    fn dispatch(
        &mut self,
        channel: Channel,
        sender: PeerId,
        reply_to: Option<PeerId>,
        outbox: &mut Outbox,
        r: &mut FrameReader,
    ) -> Result<DispatchOutcome, SessionError> {
        let hash = r.u32()?;
        if hash == VAR_OP_SIGNAL {
            let changed = self.vars.apply_op(r)?;
            return Ok(DispatchOutcome::VarChanged(changed));
        }
        let mut ctx = SignalContext::new(channel, Some(sender), reply_to, &mut self.vars, outbox);
        self.table.dispatch(&mut self.state, &mut ctx, hash, r)
    }

    fn update(
        &mut self,
        channel: Channel,
        reply_to: Option<PeerId>,
        outbox: &mut Outbox,
        f: Box<dyn FnOnce(&mut SignalContext<'_>) -> Result<(), SessionError> + Send>,
    ) -> Result<(), SessionError> {
        let mut ctx = SignalContext::new(channel, None, reply_to, &mut self.vars, outbox);
        f(&mut ctx)
    }

    fn snapshot(&self) -> Result<Bytes, SessionError> {
        if self.vars.is_empty() {
            return Ok(Bytes::new());
        }
        let mut w = FrameWriter::new();
        self.vars.write_snapshot(&mut w)?;
        Ok(w.freeze())
    }

    fn take_var_ops(&mut self) -> Vec<Bytes> {
        self.vars.take_pending()
    }

    fn var_count(&self) -> usize {
        self.vars.len()
    }
}
