//! Worker stats & process metrics.
//!
//! Every worker keeps its own plain counters, which are only ever touched from the worker's
//! thread. Each increment is mirrored into the global `metrics` recorder for export.

use crate::types::Status;

pub const METRIC_STORED_SENT: &str = "hadron_replica_stored_sent";
pub const METRIC_STORED_RECEIVED: &str = "hadron_replica_stored_received";
pub const METRIC_STORED_PROTOCOL_ERRORS: &str = "hadron_replica_stored_protocol_errors";
pub const METRIC_STORED_ROUTED: &str = "hadron_replica_stored_routed";
pub const METRIC_BYTES_SENT: &str = "hadron_replica_bytes_sent";

/// Register all metrics of this crate with the global recorder.
///
/// This function should be called only once, early in the lifetime of the process.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_STORED_SENT, metrics::Unit::Count, "STORED replies built for sending, by status");
    metrics::register_counter!(METRIC_STORED_RECEIVED, metrics::Unit::Count, "STORED replies received, by outcome");
    metrics::register_counter!(METRIC_STORED_PROTOCOL_ERRORS, metrics::Unit::Count, "STORED replies rejected as protocol violations");
    metrics::register_counter!(METRIC_STORED_ROUTED, metrics::Unit::Count, "outbound STORED replies, by route taken");
    metrics::register_counter!(METRIC_BYTES_SENT, metrics::Unit::Bytes, "bytes queued on peer connections, by traffic class");
}

/// The counters of one worker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    // Inbound STORED.
    pub stored_received: u64,
    pub stored_protocol_errors: u64,
    pub stored_appender_not_found: u64,
    pub stored_record_rebuilding_not_found: u64,
    pub stored_replies_held: u64,

    // Outbound STORED, by status.
    pub node_stored_success_sent: u64,
    pub node_stored_unsuccessful_total: u64,
    pub node_stored_preempted_sent: u64,
    pub node_stored_out_of_space_sent: u64,
    pub node_stored_disabled_sent: u64,
    pub node_stored_dropped_sent: u64,
    pub node_stored_not_storage_sent: u64,
    pub node_stored_rebuilding_sent: u64,

    // Outbound STORED, by route.
    pub stored_sent_direct: u64,
    pub stored_posted: u64,
    pub stored_dropped_invalid_client: u64,
    pub stored_dropped_wrong_worker_type: u64,
    pub stored_send_failed: u64,
    pub stored_post_failed: u64,
}

impl WorkerStats {
    /// Count one STORED reply about to be sent with the given status.
    ///
    /// # Panics
    /// Panics if the status is FAILED, which a storage node never reports.
    pub fn record_stored_sent(&mut self, status: Status) {
        metrics::increment_counter!(METRIC_STORED_SENT, "status" => status.name());
        let specific = match status {
            Status::Ok => {
                self.node_stored_success_sent += 1;
                return;
            }
            Status::Preempted => Some(&mut self.node_stored_preempted_sent),
            Status::NoSpc => Some(&mut self.node_stored_out_of_space_sent),
            Status::Disabled => Some(&mut self.node_stored_disabled_sent),
            Status::Dropped => Some(&mut self.node_stored_dropped_sent),
            Status::NotStorage => Some(&mut self.node_stored_not_storage_sent),
            Status::Rebuilding => Some(&mut self.node_stored_rebuilding_sent),
            Status::Forward | Status::Shutdown | Status::ChecksumMismatch => None,
            Status::Failed => panic!("INTERNAL ERROR: sending STORED with FAILED, this should never happen"),
        };
        self.node_stored_unsuccessful_total += 1;
        if let Some(counter) = specific {
            *counter += 1;
        }
    }

    /// Count one inbound STORED event.
    pub fn record_inbound(&mut self, event: StoredInbound) {
        let counter = match event {
            StoredInbound::Received => &mut self.stored_received,
            StoredInbound::ProtocolError => {
                metrics::increment_counter!(METRIC_STORED_PROTOCOL_ERRORS);
                &mut self.stored_protocol_errors
            }
            StoredInbound::AppenderNotFound => &mut self.stored_appender_not_found,
            StoredInbound::RecordRebuildingNotFound => &mut self.stored_record_rebuilding_not_found,
            StoredInbound::Held => &mut self.stored_replies_held,
        };
        *counter += 1;
        metrics::increment_counter!(METRIC_STORED_RECEIVED, "event" => event.name());
    }

    /// Count one outbound STORED reply by the route it took.
    pub fn record_route(&mut self, route: StoredRoute) {
        let counter = match route {
            StoredRoute::SentDirect => &mut self.stored_sent_direct,
            StoredRoute::Posted => &mut self.stored_posted,
            StoredRoute::DroppedInvalidClient => &mut self.stored_dropped_invalid_client,
            StoredRoute::DroppedWrongWorkerType => &mut self.stored_dropped_wrong_worker_type,
            StoredRoute::SendFailed => &mut self.stored_send_failed,
            StoredRoute::PostFailed => &mut self.stored_post_failed,
        };
        *counter += 1;
        metrics::increment_counter!(METRIC_STORED_ROUTED, "route" => route.name());
    }
}

/// Inbound STORED events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoredInbound {
    Received,
    ProtocolError,
    AppenderNotFound,
    RecordRebuildingNotFound,
    Held,
}

impl StoredInbound {
    pub fn name(self) -> &'static str {
        match self {
            StoredInbound::Received => "received",
            StoredInbound::ProtocolError => "protocol_error",
            StoredInbound::AppenderNotFound => "appender_not_found",
            StoredInbound::RecordRebuildingNotFound => "record_rebuilding_not_found",
            StoredInbound::Held => "held",
        }
    }
}

/// Routes an outbound STORED reply may take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoredRoute {
    SentDirect,
    Posted,
    DroppedInvalidClient,
    DroppedWrongWorkerType,
    SendFailed,
    PostFailed,
}

impl StoredRoute {
    pub fn name(self) -> &'static str {
        match self {
            StoredRoute::SentDirect => "sent_direct",
            StoredRoute::Posted => "posted",
            StoredRoute::DroppedInvalidClient => "dropped_invalid_client",
            StoredRoute::DroppedWrongWorkerType => "dropped_wrong_worker_type",
            StoredRoute::SendFailed => "send_failed",
            StoredRoute::PostFailed => "post_failed",
        }
    }
}
