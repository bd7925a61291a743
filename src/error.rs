//! Hadron replica error abstractions.

use crate::types::{ClientId, RecordId};

/// An error encountered while reading a message off the wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The input ended before the named field could be read.
    #[error("message truncated while reading {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated { field: &'static str, needed: usize, remaining: usize },
    /// The body had bytes left over after the message was fully read.
    #[error("{0} unexpected trailing bytes after message body")]
    TrailingBytes(usize),
    /// The frame carried an unknown message type tag.
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    /// The message carried an unknown status code.
    #[error("unknown status code {0}")]
    UnknownStatus(u16),
    /// The frame length is out of bounds.
    #[error("invalid frame length {0}")]
    BadFrameLength(usize),
    /// The peer speaks a protocol older than the minimum supported.
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u16),
    /// The first frame of a connection was not a handshake.
    #[error("expected HELLO as first message on connection")]
    ExpectedHello,
    /// A STORED message arrived without a resolved shard.
    #[error("STORED for record {0} carries an unresolved shard")]
    UnresolvedShard(RecordId),
}

/// An error encountered while sending a message on a worker's connection.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The connection is not (or no longer) registered with this worker.
    #[error("connection {0} is not registered on this worker")]
    NotConnected(ClientId),
    /// The connection's outbound queue is full.
    #[error("outbound queue of connection {0} is full")]
    QueueFull(ClientId),
    /// The connection's writer has gone away.
    #[error("connection {0} has been closed")]
    Closed(ClientId),
}

/// An error encountered while posting a request to a worker.
#[derive(Debug, thiserror::Error)]
pub enum PostError {
    /// No worker with the given index exists.
    #[error("no worker with index {0}")]
    NoSuchWorker(usize),
    /// The worker's queue is at capacity.
    #[error("request queue of worker {0} is full")]
    QueueFull(usize),
    /// The worker is shutting down.
    #[error("worker {0} is shutting down")]
    Shutdown(usize),
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

/// The outcome of handling one inbound message.
///
/// An `Error` disposition never propagates beyond the connection which carried the message; the
/// caller logs it and closes that connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Normal,
    Error(DispositionError),
}

/// The reason attached to an `Error` disposition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispositionError {
    /// The peer violated the protocol.
    #[error("protocol violation")]
    Protocol,
    /// The appender which consumed the message reported an error state.
    #[error("appender reported an error")]
    Appender,
}
