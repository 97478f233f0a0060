//! Frame reader/writer and system control frames.
//!
//! Readers are checked: running past the end of a frame yields
//! `ProtocolError::Truncated` so a malformed frame is dropped without
//! tearing down the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Channel, DisconnectReason, ProtocolError, ScopeId};

/// System control opcodes (first byte after a system-band channel).
const OP_ENTER: u8 = 1;
const OP_EXIT: u8 = 2;
const OP_SWITCH: u8 = 3;
const OP_DISCONNECT: u8 = 4;
const OP_REDIRECT: u8 = 5;

/// Checked cursor over one received frame.
pub struct FrameReader {
    buf: Bytes,
}

impl FrameReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn ensure(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            Err(ProtocolError::Truncated {
                needed: n - self.buf.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    /// Read a `u32` length prefix followed by that many bytes.
    pub fn blob(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.u32()? as usize;
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Read a `u16` length prefix followed by UTF-8 bytes.
    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        self.ensure(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::BadString)
    }

    /// Consume and return everything left in the frame.
    pub fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.remaining() == 0
    }
}

/// Builder for one outbound frame.
#[derive(Default)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    /// Write a `u32` length prefix followed by the bytes.
    pub fn blob(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Write a `u16` length prefix followed by UTF-8 bytes.
    pub fn string(&mut self, s: &str) -> &mut Self {
        self.buf.put_u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// A decoded system control frame (the part after the system-band channel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemFrame {
    /// Activate the scope type `scope_id` on `channel`. `snapshot` is the
    /// full replicated-variable state, empty when the scope has none.
    Enter {
        channel: Channel,
        scope_id: ScopeId,
        snapshot: Bytes,
    },
    /// Deactivate whatever scope is bound to `channel`.
    Exit { channel: Channel },
    /// Exit `prev_channel`, then enter `scope_id` on `new_channel`.
    /// Deliberately one instruction so the receiver preserves that ordering.
    Switch {
        prev_channel: Channel,
        new_channel: Channel,
        scope_id: ScopeId,
        snapshot: Bytes,
    },
    /// Connection is being closed with a reason byte.
    Disconnect { reason: DisconnectReason },
    /// Drop this connection and reconnect to `host:port`.
    Redirect { host: String, port: u32 },
}

impl SystemFrame {
    /// Encode onto `system_channel` (the lowest channel of the system band).
    pub fn encode(&self, system_channel: Channel) -> Bytes {
        let mut w = FrameWriter::new();
        w.u16(system_channel);
        match self {
            SystemFrame::Enter {
                channel,
                scope_id,
                snapshot,
            } => {
                w.u8(OP_ENTER).u16(*channel).u8(*scope_id).raw(snapshot);
            }
            SystemFrame::Exit { channel } => {
                w.u8(OP_EXIT).u16(*channel);
            }
            SystemFrame::Switch {
                prev_channel,
                new_channel,
                scope_id,
                snapshot,
            } => {
                w.u8(OP_SWITCH)
                    .u16(*prev_channel)
                    .u16(*new_channel)
                    .u8(*scope_id)
                    .raw(snapshot);
            }
            SystemFrame::Disconnect { reason } => {
                w.u8(OP_DISCONNECT).u8(*reason);
            }
            SystemFrame::Redirect { host, port } => {
                w.u8(OP_REDIRECT).string(host).u32(*port);
            }
        }
        w.freeze()
    }

    /// Decode from a reader positioned just after the channel field.
    pub fn decode(r: &mut FrameReader) -> Result<Self, ProtocolError> {
        let opcode = r.u8()?;
        match opcode {
            OP_ENTER => Ok(SystemFrame::Enter {
                channel: r.u16()?,
                scope_id: r.u8()?,
                snapshot: r.rest(),
            }),
            OP_EXIT => Ok(SystemFrame::Exit { channel: r.u16()? }),
            OP_SWITCH => Ok(SystemFrame::Switch {
                prev_channel: r.u16()?,
                new_channel: r.u16()?,
                scope_id: r.u8()?,
                snapshot: r.rest(),
            }),
            OP_DISCONNECT => Ok(SystemFrame::Disconnect { reason: r.u8()? }),
            OP_REDIRECT => Ok(SystemFrame::Redirect {
                host: r.string()?,
                port: r.u32()?,
            }),
            other => Err(ProtocolError::BadOpcode(other)),
        }
    }
}
