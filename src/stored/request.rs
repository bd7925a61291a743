use std::time::Duration;

use crate::processor::Request;
use crate::ratelimit;
use crate::stats::StoredRoute;
use crate::stored::reply::{send_direct, StoredReply};
use crate::types::ClientId;
use crate::worker::Worker;

/// A request which delivers a STORED reply on a connection owned by another worker.
///
/// Posted by the worker which produced the reply to the worker which owns the connection it must
/// go out on.
#[derive(Debug)]
pub struct SendStoredRequest {
    reply: StoredReply,
    /// The connection to send the reply on.
    to: ClientId,
    /// The worker which owns `to`.
    target_worker: usize,
}

impl SendStoredRequest {
    pub fn new(reply: StoredReply, to: ClientId, target_worker: usize) -> Self {
        Self { reply, to, target_worker }
    }
}

impl Request for SendStoredRequest {
    fn execute(self: Box<Self>, worker: &mut Worker) {
        debug_assert_eq!(worker.idx(), self.target_worker, "SendStoredRequest executed on the wrong worker");
        if let Err(err) = send_direct(worker, self.reply, self.to) {
            ratelimit!(
                info,
                Duration::from_secs(1),
                10,
                error = %err,
                "failed to send a STORED message for {} to {}",
                self.reply.header.rid,
                self.to,
            );
            worker.stats_mut().record_route(StoredRoute::SendFailed);
        }
    }
}
