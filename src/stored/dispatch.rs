use std::time::Duration;

use crate::appender::HeldReply;
use crate::error::{Disposition, DispositionError};
use crate::protocol::{StoredHeader, StoredMessage};
use crate::ratelimit;
use crate::stats::StoredInbound;
use crate::types::{lsn_to_string, Address, ShardId, Status, INDEX_INVALID};
use crate::worker::Worker;

/// Handle a STORED message received by `worker` from `from`.
///
/// Replies flagged as rebuilding go to the record rebuilding of their (log, shard); all others go
/// to the appender of their record. A missing consumer is an expected race and is dropped.
///
/// # Panics
/// Panics if the header's shard is unresolved. Connections refuse such messages before they are
/// handed to the worker.
#[tracing::instrument(level = "trace", skip(worker, msg, from), fields(worker = worker.idx(), rid = %msg.header.rid))]
pub fn on_received(worker: &mut Worker, msg: &StoredMessage, from: &Address) -> Disposition {
    worker.stats_mut().record_inbound(StoredInbound::Received);
    let header = &msg.header;

    let node_index = match from.node_index() {
        Some(node_index) => node_index,
        None => {
            tracing::error!(
                peer = %from,
                "PROTOCOL ERROR: got a STORED message for record {} from a client connection; STORED can only arrive from servers",
                header.rid,
            );
            worker.stats_mut().record_inbound(StoredInbound::ProtocolError);
            return Disposition::Error(DispositionError::Protocol);
        }
    };

    assert!(header.shard != INDEX_INVALID, "STORED for record {} from {} carries an unresolved shard", header.rid, from);
    let shard = ShardId::new(node_index, header.shard);

    if header.status == Status::Rebuilding && !msg.rebuilding_recipient.is_valid() {
        tracing::error!(
            peer = %from,
            "PROTOCOL ERROR: got a STORED message for record {} with status REBUILDING but no valid rebuilding recipient",
            header.rid,
        );
        worker.stats_mut().record_inbound(StoredInbound::ProtocolError);
        return Disposition::Error(DispositionError::Protocol);
    }

    if header.flags.is_rebuilding() {
        let record = worker
            .rebuildings_mut()
            .find(header.rid.log_id, header.shard)
            .and_then(|log_rebuilding| log_rebuilding.find_record_rebuilding(header.rid.lsn));
        match record {
            Some(record) => {
                tracing::trace!(%shard, server_instance_id = msg.server_instance_id, flush_token = msg.flush_token, "STORED received for rebuilding");
                record.on_stored(
                    header,
                    shard,
                    msg.rebuilding_version,
                    msg.rebuilding_wave,
                    msg.rebuilding_id,
                    msg.server_instance_id,
                    msg.flush_token,
                );
            }
            None => {
                worker.stats_mut().record_inbound(StoredInbound::RecordRebuildingNotFound);
                ratelimit!(
                    info,
                    Duration::from_secs(1),
                    5,
                    peer = %from,
                    "couldn't find record rebuilding for STORED of record {}{}; this is expected if the rebuilding set changed or the store was slow",
                    header.rid.log_id.0,
                    lsn_to_string(header.rid.lsn),
                );
            }
        }
        return Disposition::Normal;
    }

    if worker.processor().config().hold_store_replies {
        let appender = match worker.appenders_mut().get_mut(&header.rid) {
            Some(appender) => appender,
            None => return appender_not_found(worker, header, shard),
        };
        if appender.replies_held() + 1 < appender.replies_expected() {
            appender.hold_reply(HeldReply {
                header: *header,
                from: shard,
                rebuilding_recipient: msg.rebuilding_recipient,
            });
            worker.stats_mut().record_inbound(StoredInbound::Held);
            return Disposition::Normal;
        }

        // This is the last reply; replay the held ones first. The appender may retire after any
        // of them, so they are moved out of it beforehand.
        for held in appender.take_held_replies() {
            if let Disposition::Error(err) = handle_one_message(worker, &held.header, held.from, held.rebuilding_recipient) {
                tracing::info!(error = %err, "got an error processing a held STORED message, not closing connection");
            }
        }
    }

    handle_one_message(worker, header, shard, msg.rebuilding_recipient)
}

/// Deliver one reply to the appender of its record, retiring the appender if it is done.
fn handle_one_message(worker: &mut Worker, header: &StoredHeader, from: ShardId, rebuilding_recipient: ShardId) -> Disposition {
    let appender = match worker.appenders_mut().get_mut(&header.rid) {
        Some(appender) => appender,
        None => return appender_not_found(worker, header, from),
    };

    let is_error = appender.on_reply(header, from, rebuilding_recipient);
    if appender.is_done() {
        worker.appenders_mut().remove(&header.rid);
    }
    if is_error {
        Disposition::Error(DispositionError::Appender)
    } else {
        Disposition::Normal
    }
}

/// A reply for a record with no appender on this worker. A reply from an extra will often hit this.
fn appender_not_found(worker: &mut Worker, header: &StoredHeader, from: ShardId) -> Disposition {
    worker.stats_mut().record_inbound(StoredInbound::AppenderNotFound);
    tracing::debug!(%from, "appender for record {} not found", header.rid);
    Disposition::Normal
}
