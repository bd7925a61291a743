use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::appender::{Appender, HeldReplies};
use crate::config::Config;
use crate::processor::{Processor, WorkerMsg};
use crate::protocol::{compat, Message, StoredHeader, StoredMessage, FRAME_LEN_PREFIX};
use crate::rebuilding::{LogRebuilding, RecordRebuilding, StoredAck, StoredAcks};
use crate::sender::Connection;
use crate::types::{ClientId, FlushToken, Lsn, PeerRole, RebuildingId, ServerInstanceId, ShardId};
use crate::worker::Worker;

/// One reply as seen by a `TestAppender`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeenReply {
    pub header: StoredHeader,
    pub from: ShardId,
    pub rebuilding_recipient: ShardId,
}

/// An appender which records the replies it is given.
pub struct TestAppender {
    pub expected: usize,
    pub received: usize,
    pub error_on_reply: bool,
    pub seen: Arc<Mutex<Vec<SeenReply>>>,
    pub held: HeldReplies,
}

impl TestAppender {
    /// An appender expecting `expected` replies, `received` of which have already arrived.
    pub fn new(expected: usize, received: usize) -> (Self, Arc<Mutex<Vec<SeenReply>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let appender = Self {
            expected,
            received,
            error_on_reply: false,
            seen: seen.clone(),
            held: HeldReplies::default(),
        };
        (appender, seen)
    }
}

impl Appender for TestAppender {
    fn on_reply(&mut self, header: &StoredHeader, from: ShardId, rebuilding_recipient: ShardId) -> bool {
        self.received += 1;
        self.seen.lock().unwrap().push(SeenReply { header: *header, from, rebuilding_recipient });
        self.error_on_reply
    }

    fn is_done(&self) -> bool {
        self.received >= self.expected
    }

    fn replies_expected(&self) -> usize {
        self.expected.saturating_sub(self.received)
    }

    fn held_replies(&self) -> &HeldReplies {
        &self.held
    }

    fn held_replies_mut(&mut self) -> &mut HeldReplies {
        &mut self.held
    }
}

/// A record rebuilding which folds the acknowledgments it is given into shared `StoredAcks`.
pub struct TestRecordRebuilding {
    pub acks: Arc<Mutex<StoredAcks>>,
}

impl RecordRebuilding for TestRecordRebuilding {
    fn on_stored(
        &mut self, _header: &StoredHeader, from: ShardId, rebuilding_version: Lsn, rebuilding_wave: u32, rebuilding_id: RebuildingId,
        server_instance_id: ServerInstanceId, flush_token: FlushToken,
    ) {
        self.acks.lock().unwrap().record(
            from,
            StoredAck {
                rebuilding_version,
                rebuilding_wave,
                rebuilding_id,
                server_instance_id,
                flush_token,
            },
        );
    }
}

/// A log rebuilding with a fixed set of record rebuildings.
#[derive(Default)]
pub struct TestLogRebuilding {
    pub records: HashMap<Lsn, TestRecordRebuilding>,
}

impl TestLogRebuilding {
    /// A log rebuilding with one record rebuilding in flight for `lsn`.
    pub fn with_record(lsn: Lsn) -> (Self, Arc<Mutex<StoredAcks>>) {
        let acks = Arc::new(Mutex::new(StoredAcks::default()));
        let mut records = HashMap::new();
        records.insert(lsn, TestRecordRebuilding { acks: acks.clone() });
        (Self { records }, acks)
    }
}

impl LogRebuilding for TestLogRebuilding {
    fn find_record_rebuilding(&mut self, lsn: Lsn) -> Option<&mut dyn RecordRebuilding> {
        self.records.get_mut(&lsn).map(|record| record as &mut dyn RecordRebuilding)
    }
}

/// Build a processor with the given number of workers and reply holding mode.
pub fn setup_processor(num_workers: usize, hold_store_replies: bool) -> (Arc<Processor>, Vec<mpsc::Receiver<WorkerMsg>>) {
    let mut config = Config::new_test();
    config.num_workers = num_workers;
    config.hold_store_replies = hold_store_replies;
    Processor::new(Arc::new(config))
}

/// Register a fake server connection on the given worker, returning the receiving end of its
/// outbound queue.
pub fn register_peer(worker: &mut Worker, client: ClientId, node_index: i16) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(16);
    worker.sender_mut().register(
        client,
        Connection {
            role: PeerRole::Server(node_index),
            proto: compat::MAX_PROTOCOL_SUPPORTED,
            tx,
        },
    );
    rx
}

/// Decode a frame taken off a connection's outbound queue as a STORED message.
pub fn decode_stored_frame(frame: &[u8]) -> Result<StoredMessage> {
    let tag = u16::from_le_bytes([frame[FRAME_LEN_PREFIX], frame[FRAME_LEN_PREFIX + 1]]);
    match Message::decode(tag, &frame[FRAME_LEN_PREFIX + 2..], compat::MAX_PROTOCOL_SUPPORTED).context("error decoding frame")? {
        Message::Stored(msg) => Ok(msg),
        other => anyhow::bail!("expected STORED frame, got {:?}", other),
    }
}

/// Take the next worker message off a queue, expecting it to be a posted request.
pub fn expect_request(queue: &mut mpsc::Receiver<WorkerMsg>) -> Result<Box<dyn crate::processor::Request>> {
    match queue.try_recv() {
        Ok(WorkerMsg::Request(request)) => Ok(request),
        Ok(WorkerMsg::NewConnection { client, .. }) => anyhow::bail!("expected posted request, got new connection {}", client),
        Err(err) => anyhow::bail!("expected posted request, got {:?}", err),
    }
}
