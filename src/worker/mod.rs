//! Workers: the single threaded event loops of the processor.
//!
//! A worker exclusively owns the connections assigned to it along with its appender and
//! rebuilding tables. It is created on, and never leaves, its own OS thread; everything else in
//! the process reaches it only by posting requests to its queue.

mod connection;
#[cfg(test)]
mod mod_test;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::appender::ActiveAppenders;
use crate::error::{Disposition, DispositionError, ShutdownError, ShutdownResult};
use crate::processor::{Processor, WorkerMsg};
use crate::protocol::{compat, Hello, Message};
use crate::rebuilding::RunningLogRebuildings;
use crate::sender::{Connection, Sender};
use crate::stats::WorkerStats;
use crate::stored;
use crate::types::{ClientId, PeerRole};
pub use connection::{read_frame, ConnEvent};

/// One worker of the processor.
pub struct Worker {
    /// The index of this worker in the processor's pool.
    idx: usize,
    /// The processor which owns this worker.
    processor: Arc<Processor>,

    /// The appenders active on this worker.
    appenders: ActiveAppenders,
    /// The log rebuildings running on this worker.
    rebuildings: RunningLogRebuildings,
    /// The outbound side of this worker's connections.
    sender: Sender,
    /// This worker's counters.
    stats: WorkerStats,

    /// A channel of events from this worker's connection tasks.
    events_tx: mpsc::Sender<ConnEvent>,
    /// A channel of events from this worker's connection tasks.
    events_rx: mpsc::Receiver<ConnEvent>,
    /// The reader tasks of this worker's connections.
    readers: HashMap<ClientId, JoinHandle<()>>,
}

impl Worker {
    /// Create a new instance.
    pub fn new(idx: usize, processor: Arc<Processor>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(processor.config().connection_queue_size);
        Self {
            idx,
            processor,
            appenders: ActiveAppenders::default(),
            rebuildings: RunningLogRebuildings::default(),
            sender: Sender::default(),
            stats: WorkerStats::default(),
            events_tx,
            events_rx,
            readers: HashMap::new(),
        }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub fn appenders(&self) -> &ActiveAppenders {
        &self.appenders
    }

    pub fn appenders_mut(&mut self) -> &mut ActiveAppenders {
        &mut self.appenders
    }

    pub fn rebuildings_mut(&mut self) -> &mut RunningLogRebuildings {
        &mut self.rebuildings
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn sender_mut(&mut self) -> &mut Sender {
        &mut self.sender
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut WorkerStats {
        &mut self.stats
    }

    /// Run this worker's event loop on the calling thread until shutdown.
    pub fn run_on_thread(self, queue: mpsc::Receiver<WorkerMsg>, shutdown: broadcast::Receiver<()>) -> ShutdownResult<()> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("error building worker runtime")
            .map_err(ShutdownError::from)?;
        rt.block_on(self.run(queue, shutdown));
        Ok(())
    }

    async fn run(mut self, queue: mpsc::Receiver<WorkerMsg>, shutdown: broadcast::Receiver<()>) {
        tracing::debug!(worker = self.idx, "worker has started");
        let (mut queue, mut shutdown) = (ReceiverStream::new(queue), BroadcastStream::new(shutdown));

        loop {
            tokio::select! {
                Some(msg) = queue.next() => self.handle_worker_msg(msg),
                Some(event) = self.events_rx.recv() => self.handle_conn_event(event),
                _ = shutdown.next() => break,
            }
        }

        // Begin shutdown routine.
        for (_, reader) in self.readers.drain() {
            reader.abort();
        }
        tracing::debug!(worker = self.idx, connections = self.sender.len(), "worker has shutdown");
    }

    #[tracing::instrument(level = "trace", skip(self, msg), fields(worker = self.idx))]
    fn handle_worker_msg(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Request(request) => request.execute(self),
            WorkerMsg::NewConnection { client, stream } => self.spawn_connection(client, stream),
        }
    }

    /// Spawn the I/O tasks of a newly assigned connection.
    fn spawn_connection(&mut self, client: ClientId, stream: std::net::TcpStream) {
        let stream = match stream.set_nonblocking(true).and_then(|_| tokio::net::TcpStream::from_std(stream)) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(error = ?err, %client, "error adopting accepted connection");
                self.processor.clients().release(client);
                return;
            }
        };
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.processor.config().connection_queue_size);
        tokio::spawn(connection::writer_loop(client, write_half, rx));
        let reader = tokio::spawn(connection::reader_loop(client, read_half, tx, self.events_tx.clone()));
        self.readers.insert(client, reader);
    }

    #[tracing::instrument(level = "trace", skip(self, event), fields(worker = self.idx))]
    fn handle_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Ready { client, role, proto, tx } => self.handle_ready(client, role, proto, tx),
            ConnEvent::Message { client, msg } => self.handle_message(client, msg),
            ConnEvent::Closed { client, error } => {
                match error {
                    Some(err) => tracing::debug!(error = ?err, %client, "connection closed with error"),
                    None => tracing::debug!(%client, "connection closed by peer"),
                }
                self.close_connection(client);
            }
        }
    }

    /// Register a handshaken connection and answer the peer's handshake.
    ///
    /// The connection is registered before the answer is queued, so a peer which has seen the
    /// answer may assume its connection is routable.
    fn handle_ready(&mut self, client: ClientId, role: PeerRole, proto: u16, tx: mpsc::Sender<bytes::Bytes>) {
        self.sender.register(client, Connection { role, proto, tx });
        let hello = Message::Hello(Hello {
            proto_max: compat::MAX_PROTOCOL_SUPPORTED,
            role: PeerRole::Server(self.processor.config().node_index),
        });
        if let Err(err) = self.sender.send_message(&hello, client) {
            tracing::debug!(error = ?err, %client, "error answering handshake");
            self.close_connection(client);
        }
    }

    fn handle_message(&mut self, client: ClientId, msg: Message) {
        let from = match self.sender.address(client) {
            Some(from) => from,
            None => return,
        };
        let disposition = match msg {
            Message::Stored(stored) => stored::on_received(self, &stored, &from),
            Message::Hello(_) => {
                tracing::error!(peer = %from, "PROTOCOL ERROR: got a HELLO on an established connection");
                Disposition::Error(DispositionError::Protocol)
            }
        };
        match disposition {
            Disposition::Normal => (),
            // An appender's error state is its own business; the connection stays up.
            Disposition::Error(DispositionError::Appender) => tracing::debug!(peer = %from, "appender reported an error on STORED"),
            Disposition::Error(err @ DispositionError::Protocol) => {
                tracing::debug!(error = %err, peer = %from, "closing connection after message handling error");
                self.close_connection(client);
            }
        }
    }

    /// Tear down the given connection; its ID resolves as invalid from now on.
    pub fn close_connection(&mut self, client: ClientId) {
        self.sender.remove(client);
        if let Some(reader) = self.readers.remove(&client) {
            reader.abort();
        }
        self.processor.clients().release(client);
    }
}
