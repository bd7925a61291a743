//! Per-connection I/O tasks.
//!
//! Each accepted connection is split into a reader task and a writer task running on the owning
//! worker's runtime. The reader performs the handshake, decodes frames and forwards them to the
//! worker as `ConnEvent`s; the worker is the only place where messages are acted upon. The writer
//! drains the connection's outbound frame queue, which is owned by the worker's `Sender`.

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use crate::error::ProtocolError;
use crate::protocol::{check_frame_len, Message, MessageType};
use crate::types::{ClientId, PeerRole, INDEX_INVALID};

/// An event from a connection's reader task to its worker.
pub enum ConnEvent {
    /// The peer completed its handshake; the connection may now be registered for sending.
    Ready {
        client: ClientId,
        role: PeerRole,
        proto: u16,
        tx: mpsc::Sender<Bytes>,
    },
    /// A message was received on the connection.
    Message { client: ClientId, msg: Message },
    /// The connection was closed by the peer or failed.
    Closed { client: ClientId, error: Option<anyhow::Error> },
}

/// Read one frame, returning `None` if the peer closed the connection cleanly between frames.
pub async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<(u16, Vec<u8>)>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("error reading frame length"),
    };
    let len = check_frame_len(len)?;
    let tag = reader.read_u16_le().await.context("error reading frame type")?;
    let mut body = vec![0u8; len - 2];
    reader.read_exact(&mut body).await.context("error reading frame body")?;
    Ok(Some((tag, body)))
}

/// The reader task of a connection.
///
/// The outbound queue sender is handed to the worker with the `Ready` event, after which this
/// task holds no reference to it.
pub async fn reader_loop(client: ClientId, read_half: OwnedReadHalf, tx: mpsc::Sender<Bytes>, events: mpsc::Sender<ConnEvent>) {
    let mut reader = BufReader::new(read_half);
    let error = match read_until_closed(client, &mut reader, tx, &events).await {
        Ok(()) => None,
        Err(err) => Some(err),
    };
    let _res = events.send(ConnEvent::Closed { client, error }).await;
}

async fn read_until_closed(client: ClientId, reader: &mut BufReader<OwnedReadHalf>, tx: mpsc::Sender<Bytes>, events: &mpsc::Sender<ConnEvent>) -> Result<()> {
    // Handshake.
    let (tag, body) = match read_frame(reader).await? {
        Some(frame) => frame,
        None => return Ok(()),
    };
    if MessageType::from_tag(tag)? != MessageType::Hello {
        return Err(ProtocolError::ExpectedHello.into());
    }
    let hello = match Message::decode(tag, &body, 0)? {
        Message::Hello(hello) => hello,
        Message::Stored(_) => return Err(ProtocolError::ExpectedHello.into()),
    };
    let proto = hello.negotiate()?;
    tracing::debug!(%client, proto, role = ?hello.role, "connection handshake complete");
    if events.send(ConnEvent::Ready { client, role: hello.role, proto, tx }).await.is_err() {
        return Ok(());
    }

    loop {
        let (tag, body) = match read_frame(reader).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let msg = Message::decode(tag, &body, proto)?;
        if let Message::Stored(stored) = &msg {
            if stored.header.shard == INDEX_INVALID {
                return Err(ProtocolError::UnresolvedShard(stored.header.rid).into());
            }
        }
        if events.send(ConnEvent::Message { client, msg }).await.is_err() {
            return Ok(());
        }
    }
}

/// The writer task of a connection.
///
/// Exits once every sender of the queue is dropped and the queue is drained, or on the first
/// write error.
pub async fn writer_loop(client: ClientId, mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = write_half.write_all(&frame).await {
            tracing::debug!(error = ?err, %client, "error writing to connection");
            return;
        }
    }
    let _res = write_half.shutdown().await;
}
