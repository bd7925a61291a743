use std::time::Duration;

use crate::error::SendError;
use crate::processor::{ClientLookup, WorkerType};
use crate::protocol::{Message, StoredHeader, StoredMessage};
use crate::ratelimit;
use crate::stats::StoredRoute;
use crate::stored::SendStoredRequest;
use crate::types::{ClientId, FlushToken, Lsn, RebuildingId, ServerInstanceId, ShardId, Status, FLUSH_TOKEN_INVALID, LSN_INVALID, REBUILDING_ID_INVALID};
use crate::worker::Worker;

/// The content of an outbound STORED reply, minus the server instance ID, which is stamped by
/// the worker that finally sends it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredReply {
    pub header: StoredHeader,
    pub rebuilding_version: Lsn,
    pub rebuilding_wave: u32,
    pub rebuilding_id: RebuildingId,
    pub flush_token: FlushToken,
    pub rebuilding_recipient: ShardId,
}

impl StoredReply {
    /// A reply with the given header and no rebuilding information.
    pub fn new(header: StoredHeader) -> Self {
        Self {
            header,
            rebuilding_version: LSN_INVALID,
            rebuilding_wave: 0,
            rebuilding_id: REBUILDING_ID_INVALID,
            flush_token: FLUSH_TOKEN_INVALID,
            rebuilding_recipient: ShardId::INVALID,
        }
    }

    pub fn into_message(self, server_instance_id: ServerInstanceId) -> StoredMessage {
        StoredMessage::new(
            self.header,
            self.rebuilding_version,
            self.rebuilding_wave,
            self.rebuilding_id,
            self.flush_token,
            server_instance_id,
            self.rebuilding_recipient,
        )
    }
}

/// The route an outbound STORED reply took. Informational only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sent on a connection owned by the current worker.
    SentDirect,
    /// Posted to the worker with the given index.
    Posted(usize),
    /// Dropped for the given reason.
    Dropped(DropReason),
}

/// Why an outbound STORED reply was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The connection is closed or never existed.
    InvalidClient,
    /// The connection belongs to a non-general worker.
    WrongWorkerType(WorkerType, usize),
    /// The connection's sender refused the message.
    SendFailed,
    /// The owning worker's queue refused the request.
    PostFailed,
}

/// Send a STORED reply on the connection `send_to`, from whichever worker owns it.
///
/// Delivery is best effort: every failure is logged and dropped, as the sender of the store is
/// responsible for retrying.
///
/// # Panics
/// Panics if the reply's status is FAILED, or if it is REBUILDING without a valid recipient.
#[tracing::instrument(level = "trace", skip(worker, reply), fields(worker = worker.idx(), rid = %reply.header.rid))]
pub fn create_and_send(worker: &mut Worker, reply: StoredReply, send_to: ClientId) -> RouteOutcome {
    debug_assert!(send_to.is_valid(), "STORED reply addressed to the invalid client ID");
    if reply.header.status == Status::Rebuilding {
        assert!(reply.rebuilding_recipient.is_valid(), "STORED with REBUILDING must carry a valid rebuilding recipient");
    }
    worker.stats_mut().record_stored_sent(reply.header.status);

    let (kind, target) = match worker.processor().clients().resolve(send_to) {
        ClientLookup::Worker(kind, target) => (kind, target),
        ClientLookup::Invalid => {
            // Probably closed while the store was being processed; the store's sender retries.
            tracing::debug!(
                "dropping a STORED for {} for delivery to {} as the client ID is no longer valid",
                reply.header.rid,
                send_to
            );
            worker.stats_mut().record_route(StoredRoute::DroppedInvalidClient);
            return RouteOutcome::Dropped(DropReason::InvalidClient);
        }
    };

    if kind != WorkerType::General {
        ratelimit!(
            warn,
            Duration::from_secs(10),
            10,
            "dropping a STORED for {} for delivery to {} because this client ID refers to a gossip or background connection (on {}{})",
            reply.header.rid,
            send_to,
            kind.name(),
            target,
        );
        worker.stats_mut().record_route(StoredRoute::DroppedWrongWorkerType);
        return RouteOutcome::Dropped(DropReason::WrongWorkerType(kind, target));
    }

    if target == worker.idx() {
        return match send_direct(worker, reply, send_to) {
            Ok(_) => {
                worker.stats_mut().record_route(StoredRoute::SentDirect);
                RouteOutcome::SentDirect
            }
            Err(err) => {
                ratelimit!(
                    info,
                    Duration::from_secs(1),
                    10,
                    error = %err,
                    "failed to send STORED for {} (wave {}) to {}",
                    reply.header.rid,
                    reply.header.wave,
                    send_to,
                );
                worker.stats_mut().record_route(StoredRoute::SendFailed);
                RouteOutcome::Dropped(DropReason::SendFailed)
            }
        };
    }

    tracing::debug!(
        "{}{} is passing a STORED for {} to {}{} for delivery to {}",
        WorkerType::General.name(),
        worker.idx(),
        reply.header.rid,
        kind.name(),
        target,
        send_to
    );
    let request = Box::new(SendStoredRequest::new(reply, send_to, target));
    match worker.processor().post_request(target, request) {
        Ok(()) => {
            worker.stats_mut().record_route(StoredRoute::Posted);
            RouteOutcome::Posted(target)
        }
        Err(err) => {
            ratelimit!(
                info,
                Duration::from_secs(1),
                10,
                error = %err,
                "failed to post SendStoredRequest for {} to {}{}",
                reply.header.rid,
                kind.name(),
                target,
            );
            worker.stats_mut().record_route(StoredRoute::PostFailed);
            RouteOutcome::Dropped(DropReason::PostFailed)
        }
    }
}

/// Stamp the reply with this process's server instance ID and send it on a connection owned by
/// `worker`.
pub(super) fn send_direct(worker: &mut Worker, reply: StoredReply, send_to: ClientId) -> Result<usize, SendError> {
    let msg = Message::Stored(reply.into_message(worker.processor().server_instance_id()));
    worker.sender_mut().send_message(&msg, send_to)
}
