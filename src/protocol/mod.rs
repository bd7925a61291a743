//! Replica wire protocol.
//!
//! Every frame on a peer connection is laid out as:
//!
//! ```text
//! len: u32 | type: u16 | body: [u8; len - 2]
//! ```
//!
//! All integers are little-endian. The body layout of a message may depend on the protocol
//! version negotiated for the connection by the `HELLO` handshake, which is the first frame sent
//! in each direction. The `HELLO` body itself never depends on the protocol version.

mod stored;
#[cfg(test)]
mod stored_test;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::types::{NodeIndex, PeerRole};
pub use stored::{StoredFlags, StoredHeader, StoredMessage, TrafficClass};

/// Protocol version gates.
pub mod compat {
    /// The STORED header carries the shard index from this version onwards.
    pub const SHARD_ID_IN_STORED_MSG: u16 = 2;
    /// The oldest protocol version this replica will talk. STORED from older peers has no shard.
    pub const MIN_PROTOCOL_SUPPORTED: u16 = SHARD_ID_IN_STORED_MSG;
    /// The rebuilding section of STORED carries the rebuilding id from this version onwards.
    pub const REBUILDING_WITHOUT_WAL_2: u16 = 3;
    /// The newest protocol version this replica will talk.
    pub const MAX_PROTOCOL_SUPPORTED: u16 = 3;
}

/// The upper bound on a frame's length prefix.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;
/// The size of the frame length prefix.
pub const FRAME_LEN_PREFIX: usize = 4;

/// The message type tag which leads every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Hello = 1,
    Stored = 2,
}

impl MessageType {
    pub fn from_tag(tag: u16) -> Result<Self, ProtocolError> {
        match tag {
            1 => Ok(MessageType::Hello),
            2 => Ok(MessageType::Stored),
            _ => Err(ProtocolError::UnknownMessageType(tag)),
        }
    }
}

/// All messages which may travel over a peer connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Stored(StoredMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Stored(_) => MessageType::Stored,
        }
    }

    /// Encode this message as a complete frame for a connection speaking `proto`.
    pub fn encode_frame(&self, proto: u16) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(0);
        buf.put_u16_le(self.message_type() as u16);
        let mut writer = ProtocolWriter::new(&mut buf, proto);
        match self {
            Message::Hello(hello) => hello.serialize(&mut writer),
            Message::Stored(stored) => stored.serialize(&mut writer),
        }
        let len = (buf.len() - FRAME_LEN_PREFIX) as u32;
        buf[..FRAME_LEN_PREFIX].copy_from_slice(&len.to_le_bytes());
        buf
    }

    /// Decode a message from a frame's tag & body, for a connection speaking `proto`.
    pub fn decode(tag: u16, body: &[u8], proto: u16) -> Result<Self, ProtocolError> {
        let mut reader = ProtocolReader::new(body, proto);
        let msg = match MessageType::from_tag(tag)? {
            MessageType::Hello => Message::Hello(Hello::deserialize(&mut reader)?),
            MessageType::Stored => Message::Stored(StoredMessage::deserialize(&mut reader)?),
        };
        reader.finish()?;
        Ok(msg)
    }
}

/// Validate a frame length prefix, returning the number of bytes which follow it.
pub fn check_frame_len(len: u32) -> Result<usize, ProtocolError> {
    let len = len as usize;
    if len < 2 || len > MAX_FRAME_LEN {
        return Err(ProtocolError::BadFrameLength(len));
    }
    Ok(len)
}

/// The connection handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hello {
    /// The newest protocol version the sender can speak.
    pub proto_max: u16,
    /// The role of the sender.
    pub role: PeerRole,
}

impl Hello {
    const ROLE_CLIENT: u8 = 0;
    const ROLE_SERVER: u8 = 1;

    fn serialize(&self, writer: &mut ProtocolWriter<'_>) {
        writer.write_u16(self.proto_max);
        let (role, node_index): (u8, NodeIndex) = match self.role {
            PeerRole::Client => (Self::ROLE_CLIENT, -1),
            PeerRole::Server(idx) => (Self::ROLE_SERVER, idx),
        };
        writer.write_u8(role);
        writer.write_i16(node_index);
    }

    fn deserialize(reader: &mut ProtocolReader<'_>) -> Result<Self, ProtocolError> {
        let proto_max = reader.read_u16("hello.proto_max")?;
        let role = reader.read_u8("hello.role")?;
        let node_index = reader.read_i16("hello.node_index")?;
        let role = match role {
            Self::ROLE_SERVER if node_index >= 0 => PeerRole::Server(node_index),
            _ => PeerRole::Client,
        };
        Ok(Self { proto_max, role })
    }

    /// The protocol version a connection should speak given the peer's handshake.
    pub fn negotiate(&self) -> Result<u16, ProtocolError> {
        if self.proto_max < compat::MIN_PROTOCOL_SUPPORTED {
            return Err(ProtocolError::UnsupportedProtocol(self.proto_max));
        }
        Ok(self.proto_max.min(compat::MAX_PROTOCOL_SUPPORTED))
    }
}

/// A cursor over a message body which knows the connection's protocol version.
///
/// Every read checks the remaining length first, so a truncated body yields an error rather
/// than a partially populated message.
pub struct ProtocolReader<'a> {
    buf: &'a [u8],
    proto: u16,
}

impl<'a> ProtocolReader<'a> {
    pub fn new(buf: &'a [u8], proto: u16) -> Self {
        Self { buf, proto }
    }

    pub fn proto(&self) -> u16 {
        self.proto
    }

    fn ensure(&self, field: &'static str, needed: usize) -> Result<(), ProtocolError> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(ProtocolError::Truncated { field, needed, remaining });
        }
        Ok(())
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self, field: &'static str) -> Result<u16, ProtocolError> {
        self.ensure(field, 2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_i16(&mut self, field: &'static str) -> Result<i16, ProtocolError> {
        self.ensure(field, 2)?;
        Ok(self.buf.get_i16_le())
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self, field: &'static str) -> Result<u64, ProtocolError> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Finish reading, failing if any bytes remain.
    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.buf.remaining() {
            0 => Ok(()),
            extra => Err(ProtocolError::TrailingBytes(extra)),
        }
    }
}

/// A writer of message bodies which knows the connection's protocol version.
pub struct ProtocolWriter<'a> {
    buf: &'a mut BytesMut,
    proto: u16,
}

impl<'a> ProtocolWriter<'a> {
    pub fn new(buf: &'a mut BytesMut, proto: u16) -> Self {
        Self { buf, proto }
    }

    pub fn proto(&self) -> u16 {
        self.proto
    }

    pub fn write_u8(&mut self, val: u8) {
        self.buf.put_u8(val);
    }

    pub fn write_u16(&mut self, val: u16) {
        self.buf.put_u16_le(val);
    }

    pub fn write_i16(&mut self, val: i16) {
        self.buf.put_i16_le(val);
    }

    pub fn write_u32(&mut self, val: u32) {
        self.buf.put_u32_le(val);
    }

    pub fn write_u64(&mut self, val: u64) {
        self.buf.put_u64_le(val);
    }
}
