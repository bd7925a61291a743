//! Core identifiers of the replication data model.

use std::fmt;

/// The index of a node in the cluster.
pub type NodeIndex = i16;
/// The index of a shard on a node.
pub type ShardIndex = i16;
/// A log sequence number.
pub type Lsn = u64;
/// A per-record retry counter.
pub type Wave = u32;
/// A durability generation marker assigned by a storage node each time buffered writes become stable.
pub type FlushToken = u64;
/// The identifier of one process incarnation of a storage node.
pub type ServerInstanceId = u64;
/// The identifier of one rebuilding attempt of a log.
pub type RebuildingId = u64;

pub const LSN_INVALID: Lsn = 0;
pub const FLUSH_TOKEN_INVALID: FlushToken = 0;
pub const SERVER_INSTANCE_ID_INVALID: ServerInstanceId = 0;
pub const REBUILDING_ID_INVALID: RebuildingId = 0;

/// The sentinel used for an unresolved node or shard index.
pub const INDEX_INVALID: i16 = -1;

/// The identifier of a log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogId(pub u64);

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// The identity of one append: a log and a sequence number within it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub log_id: LogId,
    pub lsn: Lsn,
}

impl RecordId {
    pub fn new(log_id: u64, lsn: Lsn) -> Self {
        Self { log_id: LogId(log_id), lsn }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_id, lsn_to_string(self.lsn))
    }
}

/// Render an LSN as `e<epoch>n<esn>`.
pub fn lsn_to_string(lsn: Lsn) -> String {
    format!("e{}n{}", lsn >> 32, lsn & u64::from(u32::MAX))
}

/// A node of the cluster along with the generation of its config entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub index: NodeIndex,
    pub generation: u16,
}

impl NodeId {
    pub const INVALID: NodeId = NodeId { index: INDEX_INVALID, generation: 0 };

    pub fn new(index: NodeIndex, generation: u16) -> Self {
        Self { index, generation }
    }

    pub fn is_valid(&self) -> bool {
        self.index >= 0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "N{}:{}", self.index, self.generation)
        } else {
            f.write_str("[invalid NodeID]")
        }
    }
}

/// One physical storage partition: a shard index on a node.
///
/// The default value is the unresolved sentinel, which is never the same as node 0 / shard 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId {
    pub node: NodeIndex,
    pub shard: ShardIndex,
}

impl ShardId {
    pub const INVALID: ShardId = ShardId { node: INDEX_INVALID, shard: INDEX_INVALID };

    pub fn new(node: NodeIndex, shard: ShardIndex) -> Self {
        Self { node, shard }
    }

    pub fn is_valid(&self) -> bool {
        self.node >= 0 && self.shard >= 0
    }
}

impl Default for ShardId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "N{}:S{}", self.node, self.shard)
        } else {
            f.write_str("[invalid ShardID]")
        }
    }
}

/// The outcome of one replica's store attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Rebuilding,
    Preempted,
    NoSpc,
    Failed,
    Disabled,
    Dropped,
    Forward,
    NotStorage,
    Shutdown,
    ChecksumMismatch,
}

impl Status {
    /// All known status variants.
    pub const ALL: [Status; 11] = [
        Status::Ok,
        Status::Rebuilding,
        Status::Preempted,
        Status::NoSpc,
        Status::Failed,
        Status::Disabled,
        Status::Dropped,
        Status::Forward,
        Status::NotStorage,
        Status::Shutdown,
        Status::ChecksumMismatch,
    ];

    /// The wire code of this status.
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 0,
            Status::Failed => 1,
            Status::Preempted => 2,
            Status::NoSpc => 3,
            Status::Rebuilding => 4,
            Status::Disabled => 5,
            Status::Dropped => 6,
            Status::Forward => 7,
            Status::NotStorage => 8,
            Status::Shutdown => 9,
            Status::ChecksumMismatch => 10,
        }
    }

    /// Parse a status from its wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        Status::ALL.iter().copied().find(|status| status.code() == code)
    }

    /// The canonical upper case name of this status.
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Rebuilding => "REBUILDING",
            Status::Preempted => "PREEMPTED",
            Status::NoSpc => "NOSPC",
            Status::Failed => "FAILED",
            Status::Disabled => "DISABLED",
            Status::Dropped => "DROPPED",
            Status::Forward => "FORWARD",
            Status::NotStorage => "NOTSTORAGE",
            Status::Shutdown => "SHUTDOWN",
            Status::ChecksumMismatch => "CHECKSUM_MISMATCH",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An opaque identifier of an incoming connection, allocated by the processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const INVALID: ClientId = ClientId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// The role a peer declared during its handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    /// A client library connection, which never carries store acknowledgments.
    Client,
    /// Another server of the cluster, identified by its node index.
    Server(NodeIndex),
}

/// The origin of an inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Address {
    pub client: ClientId,
    pub role: PeerRole,
}

impl Address {
    pub fn is_client_address(&self) -> bool {
        matches!(self.role, PeerRole::Client)
    }

    /// The node index of the peer, if it is a server.
    pub fn node_index(&self) -> Option<NodeIndex> {
        match self.role {
            PeerRole::Server(idx) => Some(idx),
            PeerRole::Client => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            PeerRole::Client => write!(f, "client {}", self.client),
            PeerRole::Server(idx) => write!(f, "N{} ({})", idx, self.client),
        }
    }
}
