//! Per-scope variable set -- registration, owner mutation, diff apply.

use std::collections::BTreeMap;

use bytes::Bytes;
use scopewire_protocol::{FrameReader, FrameWriter};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{AnyVar, Authority, ListVar, ReplicationError, ValueVar, VarId, VarOp};

/// The ordered collection of trackable variables owned by one scope instance.
///
/// Mutations are only legal on the owning side; each produces exactly one
/// encoded diff which the session layer pushes immediately, in mutation
/// order, to every current member of the scope.
pub struct VariableSet {
    authority: Authority,
    vars: BTreeMap<VarId, Box<dyn AnyVar>>,
    pending: Vec<Bytes>,
}

impl VariableSet {
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            vars: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    /// Owning-side set (server authoritative scopes).
    pub fn owner() -> Self {
        Self::new(Authority::Owner)
    }

    /// Receiving-side set (the local view of a remote scope).
    pub fn replica() -> Self {
        Self::new(Authority::Replica)
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    // -- Registration (setup time) --

    /// Register a single-value variable. Ids must be unique for the scope's
    /// lifetime; a duplicate is a configuration error.
    pub fn register_value<T>(&mut self, id: VarId, initial: T) -> Result<(), ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register(id, Box::new(ValueVar { id, value: initial }))
    }

    /// Register an ordered-collection variable.
    pub fn register_list<T>(&mut self, id: VarId, initial: Vec<T>) -> Result<(), ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register(id, Box::new(ListVar { id, items: initial }))
    }

    fn register(&mut self, id: VarId, var: Box<dyn AnyVar>) -> Result<(), ReplicationError> {
        if self.vars.contains_key(&id) {
            return Err(ReplicationError::DuplicateVariableId(id));
        }
        self.vars.insert(id, var);
        Ok(())
    }

    // -- Reads --

    pub fn get<T>(&self, id: VarId) -> Result<&T, ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let var = self
            .vars
            .get(&id)
            .ok_or(ReplicationError::UnknownVariableId(id))?;
        var.as_any()
            .downcast_ref::<ValueVar<T>>()
            .map(|v| &v.value)
            .ok_or(ReplicationError::TypeMismatch(id))
    }

    pub fn get_list<T>(&self, id: VarId) -> Result<&Vec<T>, ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let var = self
            .vars
            .get(&id)
            .ok_or(ReplicationError::UnknownVariableId(id))?;
        var.as_any()
            .downcast_ref::<ListVar<T>>()
            .map(|v| &v.items)
            .ok_or(ReplicationError::TypeMismatch(id))
    }

    // -- Owner mutations --

    fn ensure_owner(&self) -> Result<(), ReplicationError> {
        match self.authority {
            Authority::Owner => Ok(()),
            Authority::Replica => Err(ReplicationError::NotOwner),
        }
    }

    fn value_mut<T>(&mut self, id: VarId) -> Result<&mut ValueVar<T>, ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let var = self
            .vars
            .get_mut(&id)
            .ok_or(ReplicationError::UnknownVariableId(id))?;
        var.as_any_mut()
            .downcast_mut::<ValueVar<T>>()
            .ok_or(ReplicationError::TypeMismatch(id))
    }

    fn list_mut<T>(&mut self, id: VarId) -> Result<&mut ListVar<T>, ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let var = self
            .vars
            .get_mut(&id)
            .ok_or(ReplicationError::UnknownVariableId(id))?;
        var.as_any_mut()
            .downcast_mut::<ListVar<T>>()
            .ok_or(ReplicationError::TypeMismatch(id))
    }

    fn push_op(&mut self, id: VarId, op: VarOp, body: impl FnOnce(&mut FrameWriter)) {
        let mut w = FrameWriter::new();
        w.u8(id).u8(op.as_u8());
        body(&mut w);
        self.pending.push(w.freeze());
    }

    /// Replace a value variable's whole value.
    pub fn set<T>(&mut self, id: VarId, value: T) -> Result<(), ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.ensure_owner()?;
        let encoded = scopewire_protocol::encode_value(&value)?;
        self.value_mut::<T>(id)?.value = value;
        self.push_op(id, VarOp::Set, |w| {
            w.blob(&encoded);
        });
        Ok(())
    }

    /// Replace a list variable's whole contents.
    pub fn set_all<T>(&mut self, id: VarId, values: Vec<T>) -> Result<(), ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.ensure_owner()?;
        let encoded = scopewire_protocol::encode_value(&values)?;
        self.list_mut::<T>(id)?.items = values;
        self.push_op(id, VarOp::Set, |w| {
            w.blob(&encoded);
        });
        Ok(())
    }

    /// Append one element to a list variable.
    pub fn push<T>(&mut self, id: VarId, value: T) -> Result<(), ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.ensure_owner()?;
        let encoded = scopewire_protocol::encode_value(&value)?;
        self.list_mut::<T>(id)?.items.push(value);
        self.push_op(id, VarOp::Add, |w| {
            w.blob(&encoded);
        });
        Ok(())
    }

    /// Insert one element at `index`.
    pub fn insert_at<T>(&mut self, id: VarId, index: u16, value: T) -> Result<(), ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.ensure_owner()?;
        let encoded = scopewire_protocol::encode_value(&value)?;
        let list = self.list_mut::<T>(id)?;
        if index as usize > list.items.len() {
            return Err(ReplicationError::BadIndex {
                var: id,
                index: index as usize,
                len: list.items.len(),
            });
        }
        list.items.insert(index as usize, value);
        self.push_op(id, VarOp::Insert, |w| {
            w.u16(index).blob(&encoded);
        });
        Ok(())
    }

    /// Remove the element at `index`.
    pub fn remove_at<T>(&mut self, id: VarId, index: u16) -> Result<(), ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.ensure_owner()?;
        let list = self.list_mut::<T>(id)?;
        if index as usize >= list.items.len() {
            return Err(ReplicationError::BadIndex {
                var: id,
                index: index as usize,
                len: list.items.len(),
            });
        }
        list.items.remove(index as usize);
        self.push_op(id, VarOp::RemoveAt, |w| {
            w.u16(index);
        });
        Ok(())
    }

    /// Replace the element at `index`.
    pub fn update_at<T>(&mut self, id: VarId, index: u16, value: T) -> Result<(), ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.ensure_owner()?;
        let encoded = scopewire_protocol::encode_value(&value)?;
        let list = self.list_mut::<T>(id)?;
        if index as usize >= list.items.len() {
            return Err(ReplicationError::BadIndex {
                var: id,
                index: index as usize,
                len: list.items.len(),
            });
        }
        list.items[index as usize] = value;
        self.push_op(id, VarOp::UpdateAt, |w| {
            w.u16(index).blob(&encoded);
        });
        Ok(())
    }

    /// Remove every element of a list variable.
    pub fn clear<T>(&mut self, id: VarId) -> Result<(), ReplicationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.ensure_owner()?;
        self.list_mut::<T>(id)?.items.clear();
        self.push_op(id, VarOp::Clear, |_| {});
        Ok(())
    }

    /// Drain the diffs produced by mutations since the last drain, in
    /// mutation order. The session layer sends one frame per diff.
    pub fn take_pending(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.pending)
    }

    // -- Wire: snapshot & diff apply --

    /// Write every variable's full value (push-all-on-join).
    pub fn write_snapshot(&self, w: &mut FrameWriter) -> Result<(), ReplicationError> {
        w.u8(self.vars.len() as u8);
        for (id, var) in &self.vars {
            w.u8(*id);
            var.write_full(w)?;
        }
        Ok(())
    }

    /// Replace listed variables' full values from a snapshot. Returns the
    /// changed ids so the session can raise change notifications.
    pub fn apply_snapshot(&mut self, r: &mut FrameReader) -> Result<Vec<VarId>, ReplicationError> {
        let count = r.u8()?;
        let mut changed = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = r.u8()?;
            let var = self
                .vars
                .get_mut(&id)
                .ok_or(ReplicationError::UnknownVariableId(id))?;
            var.read_full(r)?;
            changed.push(id);
        }
        Ok(changed)
    }

    /// Apply exactly one inbound diff operation. Returns the changed id.
    pub fn apply_op(&mut self, r: &mut FrameReader) -> Result<VarId, ReplicationError> {
        if self.authority == Authority::Owner {
            return Err(ReplicationError::UnexpectedOp);
        }
        let id = r.u8()?;
        let tag = r.u8()?;
        let op = VarOp::from_u8(tag).ok_or(ReplicationError::BadOp(tag))?;
        let var = self
            .vars
            .get_mut(&id)
            .ok_or(ReplicationError::UnknownVariableId(id))?;
        var.apply(op, r)?;
        Ok(id)
    }
}
