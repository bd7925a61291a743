//! Rebuilding runs as seen by the STORED dispatch path.
//!
//! A log rebuilding re-replicates the records of one (log, shard) which were lost or may have
//! been lost. It owns one record rebuilding per record currently being re-replicated. STORED
//! replies to rebuilding stores carry the generation of the rebuilding attempt they belong to,
//! so that record rebuildings can make sense of replies arriving in any order.

use std::collections::HashMap;

use crate::protocol::StoredHeader;
use crate::types::{FlushToken, LogId, Lsn, RebuildingId, ServerInstanceId, ShardId, ShardIndex};

/// The interface through which STORED replies reach a record rebuilding.
pub trait RecordRebuilding {
    /// Handle a STORED reply to a rebuilding store of this record.
    #[allow(clippy::too_many_arguments)]
    fn on_stored(
        &mut self, header: &StoredHeader, from: ShardId, rebuilding_version: Lsn, rebuilding_wave: u32, rebuilding_id: RebuildingId,
        server_instance_id: ServerInstanceId, flush_token: FlushToken,
    );
}

/// The interface of one running log rebuilding.
pub trait LogRebuilding {
    /// Find the record rebuilding in flight for the given LSN.
    fn find_record_rebuilding(&mut self, lsn: Lsn) -> Option<&mut dyn RecordRebuilding>;
}

/// The table of log rebuildings running on one worker, keyed by (log, shard).
#[derive(Default)]
pub struct RunningLogRebuildings {
    map: HashMap<(LogId, ShardIndex), Box<dyn LogRebuilding>>,
}

impl RunningLogRebuildings {
    pub fn insert(&mut self, log_id: LogId, shard: ShardIndex, rebuilding: Box<dyn LogRebuilding>) -> Option<Box<dyn LogRebuilding>> {
        self.map.insert((log_id, shard), rebuilding)
    }

    pub fn find(&mut self, log_id: LogId, shard: ShardIndex) -> Option<&mut (dyn LogRebuilding + 'static)> {
        self.map.get_mut(&(log_id, shard)).map(|rebuilding| rebuilding.as_mut())
    }

    pub fn remove(&mut self, log_id: LogId, shard: ShardIndex) -> Option<Box<dyn LogRebuilding>> {
        self.map.remove(&(log_id, shard))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// One acknowledgment of a rebuilding store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StoredAck {
    pub rebuilding_version: Lsn,
    pub rebuilding_wave: u32,
    pub rebuilding_id: RebuildingId,
    pub server_instance_id: ServerInstanceId,
    pub flush_token: FlushToken,
}

/// The latest rebuilding acknowledgment of each shard of a record's copyset.
///
/// Of two acknowledgments from the same shard, the one with the greater
/// (version, wave, id, server instance, flush token) tuple is kept, so the resulting state
/// depends only on the set of acknowledgments received and never on their arrival order.
#[derive(Debug, Default)]
pub struct StoredAcks {
    acks: HashMap<ShardId, StoredAck>,
}

impl StoredAcks {
    /// Record an acknowledgment from `from`, returning `true` if it replaced the shard's state.
    pub fn record(&mut self, from: ShardId, ack: StoredAck) -> bool {
        match self.acks.get(&from) {
            Some(current) if *current >= ack => false,
            _ => {
                self.acks.insert(from, ack);
                true
            }
        }
    }

    pub fn get(&self, shard: &ShardId) -> Option<&StoredAck> {
        self.acks.get(shard)
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    /// Whether the acknowledged copy on `shard` is known to be durable, given that the shard's
    /// node is running as `server_instance_id` and has flushed everything up to `flushed_up_to`.
    ///
    /// A copy acknowledged by a previous incarnation of the node may have been lost in the
    /// restart, unless it was flushed before it.
    pub fn is_durable(&self, shard: &ShardId, server_instance_id: ServerInstanceId, flushed_up_to: FlushToken) -> bool {
        match self.acks.get(shard) {
            Some(ack) => ack.server_instance_id == server_instance_id && ack.flush_token <= flushed_up_to,
            None => false,
        }
    }

    /// Drop all acknowledgments of the given rebuilding version or older.
    pub fn retain_newer_than(&mut self, rebuilding_version: Lsn) {
        self.acks.retain(|_, ack| ack.rebuilding_version > rebuilding_version);
    }
}
