use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};

use super::*;
use crate::config::Config;
use crate::processor::{ClientLookup, FnRequest, WorkerType};
use crate::protocol::{StoredFlags, StoredHeader, StoredMessage};
use crate::server::PeerServer;
use crate::stored::fixtures::TestAppender;
use crate::stored::{create_and_send, RouteOutcome, StoredReply};
use crate::types::{RecordId, ShardId, Status, INDEX_INVALID};

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestNode {
    processor: Arc<Processor>,
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<std::thread::JoinHandle<()>>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl TestNode {
    async fn start() -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (processor, queues) = Processor::new(Arc::new(Config::new_test()));
        let server = PeerServer::new(processor.clone(), 0, shutdown_tx.clone()).await?;
        let port = server.local_addr()?.port();
        let workers = processor.spawn_workers(queues, &shutdown_tx)?;
        let server = server.spawn();
        Ok(Self {
            processor,
            addr: ([127, 0, 0, 1], port).into(),
            shutdown_tx,
            workers,
            server,
        })
    }

    /// Run the given closure on the given worker, returning its output.
    async fn on_worker<T, F>(&self, worker: usize, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Worker) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.processor.post_request(
            worker,
            Box::new(FnRequest(move |worker: &mut Worker| {
                let _res = tx.send(f(worker));
            })),
        )?;
        tokio::time::timeout(TIMEOUT, rx).await?.context("worker dropped request")
    }

    async fn stop(self) -> Result<()> {
        let _res = self.shutdown_tx.send(());
        self.server.await??;
        for worker in self.workers {
            tokio::task::spawn_blocking(move || worker.join()).await?.map_err(|_| anyhow::anyhow!("worker thread panicked"))?;
        }
        Ok(())
    }
}

struct TestPeer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestPeer {
    async fn connect(addr: SocketAddr, role: PeerRole) -> Result<Self> {
        let mut peer = Self::connect_raw(addr).await?;
        peer.hello(99, role).await?;
        match peer.recv().await? {
            Some(Message::Hello(hello)) => {
                assert_eq!(hello.proto_max, compat::MAX_PROTOCOL_SUPPORTED, "unexpected proto_max in server handshake");
                assert_eq!(hello.role, PeerRole::Server(1), "unexpected role in server handshake, got {:?}", hello.role);
            }
            other => anyhow::bail!("expected HELLO from server, got {:?}", other),
        }
        Ok(peer)
    }

    async fn connect_raw(addr: SocketAddr) -> Result<Self> {
        let (read_half, writer) = TcpStream::connect(addr).await?.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    async fn hello(&mut self, proto_max: u16, role: PeerRole) -> Result<()> {
        self.send(&Message::Hello(Hello { proto_max, role })).await
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        self.writer.write_all(&msg.encode_frame(compat::MAX_PROTOCOL_SUPPORTED)).await?;
        Ok(())
    }

    /// Receive the next message, or `None` if the server closed the connection.
    async fn recv(&mut self) -> Result<Option<Message>> {
        match tokio::time::timeout(TIMEOUT, read_frame(&mut self.reader)).await?? {
            Some((tag, body)) => Ok(Some(Message::decode(tag, &body, compat::MAX_PROTOCOL_SUPPORTED)?)),
            None => Ok(None),
        }
    }
}

fn stored_ok(rid: RecordId, shard: i16) -> StoredMessage {
    StoredMessage::from_header(StoredHeader::new(rid, 1, Status::Ok, shard))
}

#[tokio::test]
async fn stored_flows_between_peers_and_workers() -> Result<()> {
    let node = TestNode::start().await?;
    let mut peer = TestPeer::connect(node.addr, PeerRole::Server(9)).await?;
    // First connection of a fresh processor, assigned round robin.
    let client = ClientId(1);
    let lookup = node.processor.clients().resolve(client);
    assert_eq!(lookup, ClientLookup::Worker(WorkerType::General, 0), "expected first connection on worker 0, got {:?}", lookup);

    // A reply produced on worker 1 reaches the peer through worker 0.
    let mut header = StoredHeader::new(RecordId::new(7, 100), 2, Status::Ok, 3);
    header.flags.insert(StoredFlags::REBUILDING);
    let mut reply = StoredReply::new(header);
    reply.rebuilding_version = 12;
    reply.flush_token = 4;
    let outcome = node.on_worker(1, move |worker| create_and_send(worker, reply, client)).await?;
    assert_eq!(outcome, RouteOutcome::Posted(0), "expected reply to be posted to worker 0, got {:?}", outcome);
    match peer.recv().await? {
        Some(Message::Stored(msg)) => assert_eq!(msg, reply.into_message(42), "unexpected STORED received by peer"),
        other => anyhow::bail!("expected STORED from server, got {:?}", other),
    }

    // A reply sent by the peer reaches the appender on worker 0.
    let rid = RecordId::new(8, 200);
    let (appender, seen) = TestAppender::new(1, 0);
    node.on_worker(0, move |worker| worker.appenders_mut().insert(rid, Box::new(appender)).is_none()).await?;
    peer.send(&Message::Stored(stored_ok(rid, 2))).await?;
    tokio::time::timeout(TIMEOUT, async {
        while seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    let seen_reply = seen.lock().unwrap()[0];
    assert_eq!(seen_reply.from, ShardId::new(9, 2), "expected reply from N9:S2, got {}", seen_reply.from);
    let retired = node.on_worker(0, move |worker| !worker.appenders().contains(&rid)).await?;
    assert!(retired, "expected done appender to be retired");

    node.stop().await
}

#[tokio::test]
async fn protocol_violations_close_the_connection() -> Result<()> {
    let node = TestNode::start().await?;

    // STORED from a client connection.
    let mut client_peer = TestPeer::connect(node.addr, PeerRole::Client).await?;
    client_peer.send(&Message::Stored(stored_ok(RecordId::new(1, 1), 0))).await?;
    let next = client_peer.recv().await?;
    assert!(next.is_none(), "expected client connection to be closed, got {:?}", next);

    // STORED before the handshake.
    let mut raw_peer = TestPeer::connect_raw(node.addr).await?;
    raw_peer.send(&Message::Stored(stored_ok(RecordId::new(1, 1), 0))).await?;
    let next = raw_peer.recv().await?;
    assert!(next.is_none(), "expected connection without handshake to be closed, got {:?}", next);

    // Closed connections are released from the registry.
    tokio::time::timeout(TIMEOUT, async {
        while !node.processor.clients().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    node.stop().await
}

#[tokio::test]
async fn peers_without_a_resolved_shard_are_disconnected() -> Result<()> {
    let node = TestNode::start().await?;

    // A peer which predates sharding is refused at the handshake.
    let mut old_peer = TestPeer::connect_raw(node.addr).await?;
    old_peer.hello(compat::SHARD_ID_IN_STORED_MSG - 1, PeerRole::Server(9)).await?;
    let next = old_peer.recv().await?;
    assert!(next.is_none(), "expected pre-sharding peer to be disconnected, got {:?}", next);

    // A current peer sending STORED without a shard.
    let mut peer = TestPeer::connect(node.addr, PeerRole::Server(9)).await?;
    peer.send(&Message::Stored(stored_ok(RecordId::new(1, 1), INDEX_INVALID))).await?;
    let next = peer.recv().await?;
    assert!(next.is_none(), "expected connection to be closed, got {:?}", next);

    // Every worker is still serving.
    for idx in 0..node.processor.num_workers() {
        let served_by = node.on_worker(idx, |worker| worker.idx()).await?;
        assert_eq!(served_by, idx, "expected worker {} to handle its own request, got {}", idx, served_by);
    }
    let mut peer = TestPeer::connect(node.addr, PeerRole::Server(9)).await?;
    let rid = RecordId::new(2, 2);
    let (appender, seen) = TestAppender::new(1, 0);
    let owner = match node.processor.clients().resolve(ClientId(3)) {
        ClientLookup::Worker(_, owner) => owner,
        other => anyhow::bail!("expected third connection to be registered, got {:?}", other),
    };
    node.on_worker(owner, move |worker| worker.appenders_mut().insert(rid, Box::new(appender)).is_none()).await?;
    peer.send(&Message::Stored(stored_ok(rid, 1))).await?;
    tokio::time::timeout(TIMEOUT, async {
        while seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    node.stop().await
}
