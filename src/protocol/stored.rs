//! The STORED message: a storage replica's acknowledgment of one STORE.
//!
//! ```text
//! header:     rid.log_id u64 | rid.lsn u64 | wave u32 | status u16 |
//!             redirect.index i16 | redirect.generation u16 | flags u8 |
//!             shard i16                                   (proto >= SHARD_ID_IN_STORED_MSG)
//! rebuilding: version u64 | wave u32 | flush_token u64 | server_instance_id u64 |
//!             rebuilding_id u64                           (proto >= REBUILDING_WITHOUT_WAL_2)
//!                                                         (only when flags & REBUILDING)
//! recipient:  node i16 | shard i16                        (only when status == REBUILDING)
//! ```

use std::fmt;

use serde_json::{json, Value};

use super::{compat, ProtocolReader, ProtocolWriter};
use crate::error::ProtocolError;
use crate::types::{
    lsn_to_string, FlushToken, Lsn, NodeId, RebuildingId, RecordId, ServerInstanceId, ShardId, ShardIndex, Status, Wave, FLUSH_TOKEN_INVALID,
    INDEX_INVALID, LSN_INVALID, REBUILDING_ID_INVALID, SERVER_INSTANCE_ID_INVALID,
};

/// The flag bits of a STORED header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StoredFlags(pub u8);

impl StoredFlags {
    /// The record was synced to durable storage before replying.
    pub const SYNCED: u8 = 1 << 0;
    /// The storage node is overloaded.
    pub const OVERLOADED: u8 = 1 << 1;
    pub const AMENDABLE_DEPRECATED: u8 = 1 << 2;
    /// This is a reply to a rebuilding store; the rebuilding section follows the header.
    pub const REBUILDING: u8 = 1 << 3;
    /// PREEMPTED was caused by a soft seal only.
    pub const PREEMPTED_BY_SOFT_SEAL_ONLY: u8 = 1 << 4;
    /// NOSPC was caused by crossing the low watermark.
    pub const LOW_WATERMARK_NOSPC: u8 = 1 << 5;

    const NAMES: [(u8, &'static str); 6] = [
        (Self::SYNCED, "SYNCED"),
        (Self::OVERLOADED, "OVERLOADED"),
        (Self::AMENDABLE_DEPRECATED, "AMENDABLE_DEPRECATED"),
        (Self::REBUILDING, "REBUILDING"),
        (Self::PREEMPTED_BY_SOFT_SEAL_ONLY, "PREMPTED_BY_SOFT_SEAL_ONLY"),
        (Self::LOW_WATERMARK_NOSPC, "LOW_WATERMARK_NOSPC"),
    ];

    pub fn contains(&self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    pub fn insert(&mut self, bits: u8) {
        self.0 |= bits;
    }

    pub fn is_rebuilding(&self) -> bool {
        self.contains(Self::REBUILDING)
    }
}

impl fmt::Display for StoredFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES.iter().filter(|(bit, _)| self.contains(*bit)).map(|(_, name)| *name).collect();
        f.write_str(&names.join("|"))
    }
}

/// The traffic class a message is accounted under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrafficClass {
    Append,
    Rebuild,
}

impl TrafficClass {
    pub fn name(self) -> &'static str {
        match self {
            TrafficClass::Append => "append",
            TrafficClass::Rebuild => "rebuild",
        }
    }
}

/// The fixed header of a STORED message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredHeader {
    /// The record being acknowledged.
    pub rid: RecordId,
    /// The wave of the STORE being acknowledged.
    pub wave: Wave,
    /// The outcome of the store.
    pub status: Status,
    /// With PREEMPTED, the sequencer which preempted the store.
    pub redirect: NodeId,
    pub flags: StoredFlags,
    /// The shard on the sending node which handled the store.
    ///
    /// Decoded as `INDEX_INVALID` from peers which predate sharding.
    pub shard: ShardIndex,
}

impl StoredHeader {
    /// A header with the given record, wave, status & shard, no flags and no redirect.
    pub fn new(rid: RecordId, wave: Wave, status: Status, shard: ShardIndex) -> Self {
        Self {
            rid,
            wave,
            status,
            redirect: NodeId::INVALID,
            flags: StoredFlags::default(),
            shard,
        }
    }

    fn serialize(&self, writer: &mut ProtocolWriter<'_>) {
        writer.write_u64(self.rid.log_id.0);
        writer.write_u64(self.rid.lsn);
        writer.write_u32(self.wave);
        writer.write_u16(self.status.code());
        writer.write_i16(self.redirect.index);
        writer.write_u16(self.redirect.generation);
        writer.write_u8(self.flags.0);
        if writer.proto() >= compat::SHARD_ID_IN_STORED_MSG {
            writer.write_i16(self.shard);
        }
    }

    fn deserialize(reader: &mut ProtocolReader<'_>) -> Result<Self, ProtocolError> {
        let log_id = reader.read_u64("header.rid.log_id")?;
        let lsn = reader.read_u64("header.rid.lsn")?;
        let wave = reader.read_u32("header.wave")?;
        let status_code = reader.read_u16("header.status")?;
        let status = Status::from_code(status_code).ok_or(ProtocolError::UnknownStatus(status_code))?;
        let redirect = NodeId::new(reader.read_i16("header.redirect.index")?, reader.read_u16("header.redirect.generation")?);
        let flags = StoredFlags(reader.read_u8("header.flags")?);
        let shard = if reader.proto() >= compat::SHARD_ID_IN_STORED_MSG {
            reader.read_i16("header.shard")?
        } else {
            INDEX_INVALID
        };
        Ok(Self {
            rid: RecordId::new(log_id, lsn),
            wave,
            status,
            redirect,
            flags,
            shard,
        })
    }
}

/// A STORED message: header plus the optional rebuilding & recipient sections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub header: StoredHeader,
    pub rebuilding_version: Lsn,
    pub rebuilding_wave: u32,
    pub rebuilding_id: RebuildingId,
    pub flush_token: FlushToken,
    pub server_instance_id: ServerInstanceId,
    /// With status REBUILDING, the donor shard subsequent retries should be addressed to.
    pub rebuilding_recipient: ShardId,
}

impl StoredMessage {
    pub fn new(
        header: StoredHeader, rebuilding_version: Lsn, rebuilding_wave: u32, rebuilding_id: RebuildingId, flush_token: FlushToken,
        server_instance_id: ServerInstanceId, rebuilding_recipient: ShardId,
    ) -> Self {
        Self {
            header,
            rebuilding_version,
            rebuilding_wave,
            rebuilding_id,
            flush_token,
            server_instance_id,
            rebuilding_recipient,
        }
    }

    /// A message carrying only a header; the optional sections hold their invalid defaults.
    pub fn from_header(header: StoredHeader) -> Self {
        Self::new(
            header,
            LSN_INVALID,
            0,
            REBUILDING_ID_INVALID,
            FLUSH_TOKEN_INVALID,
            SERVER_INSTANCE_ID_INVALID,
            ShardId::INVALID,
        )
    }

    pub fn traffic_class(&self) -> TrafficClass {
        if self.header.flags.is_rebuilding() {
            TrafficClass::Rebuild
        } else {
            TrafficClass::Append
        }
    }

    pub(super) fn serialize(&self, writer: &mut ProtocolWriter<'_>) {
        self.header.serialize(writer);
        if self.header.flags.is_rebuilding() {
            writer.write_u64(self.rebuilding_version);
            writer.write_u32(self.rebuilding_wave);
            writer.write_u64(self.flush_token);
            writer.write_u64(self.server_instance_id);
            if writer.proto() >= compat::REBUILDING_WITHOUT_WAL_2 {
                writer.write_u64(self.rebuilding_id);
            }
        }
        if self.header.status == Status::Rebuilding {
            writer.write_i16(self.rebuilding_recipient.node);
            writer.write_i16(self.rebuilding_recipient.shard);
        }
    }

    pub(super) fn deserialize(reader: &mut ProtocolReader<'_>) -> Result<Self, ProtocolError> {
        let header = StoredHeader::deserialize(reader)?;
        let mut msg = Self::from_header(header);
        if header.flags.is_rebuilding() {
            msg.rebuilding_version = reader.read_u64("rebuilding.version")?;
            msg.rebuilding_wave = reader.read_u32("rebuilding.wave")?;
            msg.flush_token = reader.read_u64("rebuilding.flush_token")?;
            msg.server_instance_id = reader.read_u64("rebuilding.server_instance_id")?;
            if reader.proto() >= compat::REBUILDING_WITHOUT_WAL_2 {
                msg.rebuilding_id = reader.read_u64("rebuilding.rebuilding_id")?;
            }
        }
        if header.status == Status::Rebuilding {
            let node = reader.read_i16("recipient.node")?;
            let shard = reader.read_i16("recipient.shard")?;
            msg.rebuilding_recipient = ShardId::new(node, shard);
        }
        Ok(msg)
    }

    /// A structured description of this message for admin & debug output.
    pub fn debug_info(&self) -> Vec<(&'static str, Value)> {
        let hdr = &self.header;
        let mut res = vec![
            ("log_id", json!(hdr.rid.log_id.0)),
            ("lsn", json!(lsn_to_string(hdr.rid.lsn))),
            ("wave", json!(hdr.wave)),
            ("status", json!(hdr.status.name())),
            ("redirect", json!(hdr.redirect.to_string())),
            ("flags", json!(hdr.flags.to_string())),
            ("shard", json!(hdr.shard)),
            ("rebuilding_version", json!(lsn_to_string(self.rebuilding_version))),
        ];
        if hdr.flags.is_rebuilding() {
            res.push(("rebuilding_wave", json!(self.rebuilding_wave)));
            res.push(("rebuilding_id", json!(self.rebuilding_id)));
            res.push(("flush_token", json!(self.flush_token)));
            res.push(("server_instance_id", json!(self.server_instance_id)));
            res.push(("rebuilding_recipient", json!(self.rebuilding_recipient.to_string())));
        }
        res
    }
}
