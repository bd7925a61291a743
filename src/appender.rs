//! Appenders: the sequencer side trackers of in-flight record replication.
//!
//! An appender fans a record out to its copyset and collects STORED replies until enough copies
//! are durable, or until the operation fails. Appenders are created and destroyed by the
//! sequencer; this module only defines the interface through which replies are fed to them and
//! the per-worker table in which they live.

use std::collections::HashMap;

use crate::protocol::StoredHeader;
use crate::types::{RecordId, ShardId};

/// A STORED reply held back by the test-only reply holding mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeldReply {
    pub header: StoredHeader,
    pub from: ShardId,
    pub rebuilding_recipient: ShardId,
}

/// A buffer of held replies which appenders embed to support reply holding.
#[derive(Debug, Default)]
pub struct HeldReplies(Vec<HeldReply>);

impl HeldReplies {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, reply: HeldReply) {
        self.0.push(reply);
    }

    /// Take all held replies, in the order they were held.
    pub fn take(&mut self) -> Vec<HeldReply> {
        std::mem::take(&mut self.0)
    }
}

/// The interface through which STORED replies reach an appender.
pub trait Appender {
    /// Handle a reply from `from` for this appender's record.
    ///
    /// Returns `true` if the appender is now in an error state. That is used for logging only and
    /// never causes the connection which carried the reply to be closed.
    fn on_reply(&mut self, header: &StoredHeader, from: ShardId, rebuilding_recipient: ShardId) -> bool;

    /// Whether this appender has finished, and may be retired from the worker's table.
    fn is_done(&self) -> bool;

    /// The number of replies this appender is still waiting on, including held ones.
    fn replies_expected(&self) -> usize;

    fn held_replies(&self) -> &HeldReplies;

    fn held_replies_mut(&mut self) -> &mut HeldReplies;

    fn replies_held(&self) -> usize {
        self.held_replies().len()
    }

    fn hold_reply(&mut self, reply: HeldReply) {
        self.held_replies_mut().push(reply);
    }

    fn take_held_replies(&mut self) -> Vec<HeldReply> {
        self.held_replies_mut().take()
    }
}

/// The table of appenders active on one worker, keyed by the record they replicate.
///
/// Lookups key on the record ID alone; a reply for a stale wave reaches the current appender.
#[derive(Default)]
pub struct ActiveAppenders {
    map: HashMap<RecordId, Box<dyn Appender>>,
}

impl ActiveAppenders {
    pub fn insert(&mut self, rid: RecordId, appender: Box<dyn Appender>) -> Option<Box<dyn Appender>> {
        self.map.insert(rid, appender)
    }

    pub fn get_mut(&mut self, rid: &RecordId) -> Option<&mut (dyn Appender + 'static)> {
        self.map.get_mut(rid).map(|appender| appender.as_mut())
    }

    pub fn remove(&mut self, rid: &RecordId) -> Option<Box<dyn Appender>> {
        self.map.remove(rid)
    }

    pub fn contains(&self, rid: &RecordId) -> bool {
        self.map.contains_key(rid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
