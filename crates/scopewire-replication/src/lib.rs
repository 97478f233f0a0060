//! Scopewire Replication -- scope-owned variables pushed to peers as diffs.
//!
//! Each variable is addressed by a small integer id stable for the scope's
//! lifetime. The owning side mutates and pushes one operation per mutation;
//! receivers apply operations one at a time and surface change notifications.
//! Full-value snapshots cover the push-all-on-join path.

use std::any::Any;

use scopewire_protocol::{FrameReader, FrameWriter, ProtocolError};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod set;

pub use set::VariableSet;

/// Variable identifier within one scope.
pub type VarId = u8;

/// Which side of the session owns (and may mutate) a variable set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// This endpoint mutates; diffs flow outward.
    Owner,
    /// This endpoint applies inbound diffs; local mutation is an error.
    Replica,
}

/// Diff operation tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarOp {
    /// Replace the whole value.
    Set = 0,
    /// Append one element (list variables).
    Add = 1,
    /// Insert one element at an index (list variables).
    Insert = 2,
    /// Remove the element at an index (list variables).
    RemoveAt = 3,
    /// Replace the element at an index (list variables).
    UpdateAt = 4,
    /// Remove every element (list variables).
    Clear = 5,
}

impl VarOp {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(VarOp::Set),
            1 => Some(VarOp::Add),
            2 => Some(VarOp::Insert),
            3 => Some(VarOp::RemoveAt),
            4 => Some(VarOp::UpdateAt),
            5 => Some(VarOp::Clear),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("unknown variable id {0}")]
    UnknownVariableId(VarId),
    #[error("variable id {0} registered twice")]
    DuplicateVariableId(VarId),
    #[error("unknown variable operation tag {0:#04x}")]
    BadOp(u8),
    #[error("variable {var}: index {index} out of range (len {len})")]
    BadIndex { var: VarId, index: usize, len: usize },
    #[error("variable {0}: list operation on a value variable")]
    WrongKind(VarId),
    #[error("variable {0}: value type does not match registration")]
    TypeMismatch(VarId),
    #[error("local mutation attempted on the replica side")]
    NotOwner,
    #[error("inbound diff received on the owning side")]
    UnexpectedOp,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Object-safe seam over a typed variable.
pub(crate) trait AnyVar: Send + Sync {
    /// Write the full value (snapshot form).
    fn write_full(&self, w: &mut FrameWriter) -> Result<(), ReplicationError>;
    /// Replace the full value from snapshot form.
    fn read_full(&mut self, r: &mut FrameReader) -> Result<(), ReplicationError>;
    /// Apply exactly one diff operation.
    fn apply(&mut self, op: VarOp, r: &mut FrameReader) -> Result<(), ReplicationError>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A single typed value. Supports `Set` only.
pub(crate) struct ValueVar<T> {
    pub(crate) id: VarId,
    pub(crate) value: T,
}

impl<T> AnyVar for ValueVar<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn write_full(&self, w: &mut FrameWriter) -> Result<(), ReplicationError> {
        let encoded = scopewire_protocol::encode_value(&self.value)?;
        w.blob(&encoded);
        Ok(())
    }

    fn read_full(&mut self, r: &mut FrameReader) -> Result<(), ReplicationError> {
        let raw = r.blob()?;
        self.value = scopewire_protocol::decode_value(&raw)?;
        Ok(())
    }

    fn apply(&mut self, op: VarOp, r: &mut FrameReader) -> Result<(), ReplicationError> {
        match op {
            VarOp::Set => self.read_full(r),
            _ => Err(ReplicationError::WrongKind(self.id)),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// An ordered collection. Supports the full diff protocol.
pub(crate) struct ListVar<T> {
    pub(crate) id: VarId,
    pub(crate) items: Vec<T>,
}

impl<T> AnyVar for ListVar<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn write_full(&self, w: &mut FrameWriter) -> Result<(), ReplicationError> {
        let encoded = scopewire_protocol::encode_value(&self.items)?;
        w.blob(&encoded);
        Ok(())
    }

    fn read_full(&mut self, r: &mut FrameReader) -> Result<(), ReplicationError> {
        let raw = r.blob()?;
        self.items = scopewire_protocol::decode_value(&raw)?;
        Ok(())
    }

    fn apply(&mut self, op: VarOp, r: &mut FrameReader) -> Result<(), ReplicationError> {
        match op {
            VarOp::Set => self.read_full(r),
            VarOp::Add => {
                let raw = r.blob()?;
                self.items.push(scopewire_protocol::decode_value(&raw)?);
                Ok(())
            }
            VarOp::Insert => {
                let index = r.u16()? as usize;
                let raw = r.blob()?;
                if index > self.items.len() {
                    return Err(ReplicationError::BadIndex {
                        var: self.id,
                        index,
                        len: self.items.len(),
                    });
                }
                self.items
                    .insert(index, scopewire_protocol::decode_value(&raw)?);
                Ok(())
            }
            VarOp::RemoveAt => {
                let index = r.u16()? as usize;
                if index >= self.items.len() {
                    return Err(ReplicationError::BadIndex {
                        var: self.id,
                        index,
                        len: self.items.len(),
                    });
                }
                self.items.remove(index);
                Ok(())
            }
            VarOp::UpdateAt => {
                let index = r.u16()? as usize;
                let raw = r.blob()?;
                if index >= self.items.len() {
                    return Err(ReplicationError::BadIndex {
                        var: self.id,
                        index,
                        len: self.items.len(),
                    });
                }
                self.items[index] = scopewire_protocol::decode_value(&raw)?;
                Ok(())
            }
            VarOp::Clear => {
                self.items.clear();
                Ok(())
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
