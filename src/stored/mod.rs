//! STORED: the acknowledgment a storage node sends back for each store request.
//!
//! Inbound STORED replies are dispatched on the receiving worker to either the appender or the
//! record rebuilding which issued the store. Outbound replies are routed to the worker which owns
//! the connection they must go out on, posting a `SendStoredRequest` when that is another worker.

mod dispatch;
#[cfg(test)]
pub(crate) mod fixtures;
mod reply;
mod request;

pub use dispatch::on_received;
pub use reply::{create_and_send, DropReason, RouteOutcome, StoredReply};
pub use request::SendStoredRequest;
