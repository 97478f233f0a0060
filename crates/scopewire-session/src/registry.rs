//! Scope registry -- the inactive/active sets and the lifecycle state
//! machine shared by both endpoints.
//!
//! Inactive scopes are keyed by their stable scope identifier; active ones
//! by the ephemeral channel they are bound to. Exactly one instance exists
//! per scope type and it is never in both sets at once.

use scopewire_protocol::{Channel, FrameReader, ScopeId};
use scopewire_replication::VarId;

use std::collections::HashMap;

use crate::dispatch::Outbox;
use crate::error::SessionError;
use crate::scope::ScopeRuntime;

#[derive(Default)]
pub struct ScopeRegistry {
    inactive: HashMap<ScopeId, Box<dyn ScopeRuntime>>,
    active: HashMap<Channel, Box<dyn ScopeRuntime>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scope into the inactive set. Duplicate identifiers are a
    /// setup-time configuration error.
    pub fn register(&mut self, scope: Box<dyn ScopeRuntime>) -> Result<(), SessionError> {
        let id = scope.scope_id();
        if self.inactive.contains_key(&id)
            || self.active.values().any(|s| s.scope_id() == id)
        {
            return Err(SessionError::DuplicateScope(id));
        }
        self.inactive.insert(id, scope);
        Ok(())
    }

    /// Move a scope from inactive to active, bound to `channel`. Applies
    /// the snapshot and fires the enter hook; returns the changed var ids.
    pub fn enter(
        &mut self,
        scope_id: ScopeId,
        channel: Channel,
        snapshot: &mut FrameReader,
        outbox: &mut Outbox,
    ) -> Result<Vec<VarId>, SessionError> {
        if self.active.contains_key(&channel) {
            return Err(SessionError::ChannelAlreadyAllocated(channel));
        }
        let mut scope = self
            .inactive
            .remove(&scope_id)
            .ok_or(SessionError::UnknownScopeIdentifier(scope_id))?;
        let changed = match scope.enter(channel, snapshot, outbox) {
            Ok(changed) => changed,
            Err(e) => {
                self.inactive.insert(scope_id, scope);
                return Err(e);
            }
        };
        self.active.insert(channel, scope);
        Ok(changed)
    }

    /// Move the scope bound to `channel` back to inactive. Fires the exit
    /// hook. Fails with `UnboundChannel` without mutating either set.
    pub fn exit(&mut self, channel: Channel, outbox: &mut Outbox) -> Result<ScopeId, SessionError> {
        let mut scope = self
            .active
            .remove(&channel)
            .ok_or(SessionError::UnboundChannel(channel))?;
        scope.exit(channel, outbox);
        let scope_id = scope.scope_id();
        self.inactive.insert(scope_id, scope);
        Ok(scope_id)
    }

    /// Exit `prev_channel`, then enter `scope_id` on `new_channel` -- in
    /// exactly that order, never atomically, because the other endpoint
    /// assumes that ordering. Works for self-switches too.
    pub fn switch(
        &mut self,
        prev_channel: Channel,
        new_channel: Channel,
        scope_id: ScopeId,
        snapshot: &mut FrameReader,
        outbox: &mut Outbox,
    ) -> Result<(ScopeId, Vec<VarId>), SessionError> {
        let exited = self.exit(prev_channel, outbox)?;
        let changed = self.enter(scope_id, new_channel, snapshot, outbox)?;
        Ok((exited, changed))
    }

    pub fn active_mut(&mut self, channel: Channel) -> Option<&mut Box<dyn ScopeRuntime>> {
        self.active.get_mut(&channel)
    }

    pub fn active(&self, channel: Channel) -> Option<&dyn ScopeRuntime> {
        self.active.get(&channel).map(|s| s.as_ref())
    }

    pub fn active_channels(&self) -> Vec<Channel> {
        self.active.keys().copied().collect()
    }

    /// Channel of the active instance of `scope_id`, if any.
    pub fn channel_of(&self, scope_id: ScopeId) -> Option<Channel> {
        self.active
            .iter()
            .find(|(_, s)| s.scope_id() == scope_id)
            .map(|(ch, _)| *ch)
    }

    pub fn is_registered(&self, scope_id: ScopeId) -> bool {
        self.inactive.contains_key(&scope_id)
            || self.active.values().any(|s| s.scope_id() == scope_id)
    }

    pub fn inactive_count(&self) -> usize {
        self.inactive.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
