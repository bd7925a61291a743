//! The per-worker sender: the outbound side of every connection owned by a worker.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::SendError;
use crate::protocol::{Message, TrafficClass};
use crate::stats::METRIC_BYTES_SENT;
use crate::types::{Address, ClientId, PeerRole};

/// The outbound half of one handshaken connection.
#[derive(Debug)]
pub struct Connection {
    /// The role the peer declared in its handshake.
    pub role: PeerRole,
    /// The protocol version negotiated for this connection.
    pub proto: u16,
    /// The queue of encoded frames drained by the connection's writer task.
    pub tx: mpsc::Sender<Bytes>,
}

/// The outbound side of all connections owned by one worker.
#[derive(Debug, Default)]
pub struct Sender {
    conns: HashMap<ClientId, Connection>,
}

impl Sender {
    pub fn register(&mut self, client: ClientId, conn: Connection) {
        self.conns.insert(client, conn);
    }

    pub fn remove(&mut self, client: ClientId) -> Option<Connection> {
        self.conns.remove(&client)
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.conns.contains_key(&client)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// The address of the given connection, if it is registered here.
    pub fn address(&self, client: ClientId) -> Option<Address> {
        self.conns.get(&client).map(|conn| Address { client, role: conn.role })
    }

    /// Encode the given message for the connection's protocol and queue it for writing.
    ///
    /// Never blocks; a full outbound queue is reported as an error. Returns the number of bytes
    /// queued.
    pub fn send_message(&mut self, msg: &Message, client: ClientId) -> Result<usize, SendError> {
        let conn = self.conns.get(&client).ok_or(SendError::NotConnected(client))?;
        let frame = msg.encode_frame(conn.proto).freeze();
        let len = frame.len();
        conn.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull(client),
            mpsc::error::TrySendError::Closed(_) => SendError::Closed(client),
        })?;

        let class = match msg {
            Message::Stored(stored) => stored.traffic_class(),
            Message::Hello(_) => TrafficClass::Append,
        };
        metrics::counter!(METRIC_BYTES_SENT, len as u64, "traffic_class" => class.name());
        Ok(len)
    }
}
