//! The processor: the process wide pool of workers.
//!
//! Each worker is a single threaded event loop which exclusively owns its connections, appenders
//! and rebuildings. The processor is the only way for one worker to reach another: it owns one
//! bounded request queue per worker, through which owned `Request` values are posted. It also
//! owns the registry mapping connection IDs to the worker which owns each connection.

use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::error::PostError;
use crate::types::{ClientId, ServerInstanceId};
use crate::worker::Worker;

/// The kinds of workers a connection may be assigned to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerType {
    /// Workers which handle data path traffic, including all STORE & STORED messages.
    General,
    /// Workers which handle background tasks.
    Background,
    /// The worker which handles failure detector gossip.
    Gossip,
}

impl WorkerType {
    pub fn name(self) -> &'static str {
        match self {
            WorkerType::General => "W",
            WorkerType::Background => "BW",
            WorkerType::Gossip => "GW",
        }
    }
}

/// The result of resolving a connection ID against the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientLookup {
    /// The connection is owned by the given worker.
    Worker(WorkerType, usize),
    /// The connection is closed or was never allocated.
    Invalid,
}

/// The registry of incoming connections and the workers which own them.
#[derive(Debug)]
pub struct ClientIdxAllocator {
    next: AtomicU32,
    map: DashMap<ClientId, (WorkerType, usize)>,
}

impl Default for ClientIdxAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(1),
            map: DashMap::new(),
        }
    }
}

impl ClientIdxAllocator {
    /// Allocate a new connection ID owned by the given worker.
    pub fn allocate(&self, kind: WorkerType, worker: usize) -> ClientId {
        loop {
            let id = ClientId(self.next.fetch_add(1, Ordering::Relaxed));
            // Wrapped around; skip the invalid ID and any ID still in use.
            if !id.is_valid() || self.map.contains_key(&id) {
                continue;
            }
            self.map.insert(id, (kind, worker));
            return id;
        }
    }

    /// Release the given connection ID; it resolves as invalid from now on.
    pub fn release(&self, id: ClientId) {
        self.map.remove(&id);
    }

    /// Resolve the worker which owns the given connection.
    pub fn resolve(&self, id: ClientId) -> ClientLookup {
        match self.map.get(&id) {
            Some(entry) => {
                let (kind, idx) = *entry.value();
                ClientLookup::Worker(kind, idx)
            }
            None => ClientLookup::Invalid,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A unit of work which is executed on a specific worker.
///
/// Requests own everything they need; they never carry references to state owned by the worker
/// which posted them.
pub trait Request: Send + 'static {
    /// Execute this request on the worker it was posted to.
    fn execute(self: Box<Self>, worker: &mut Worker);
}

/// A request built from a closure.
pub struct FnRequest<F>(pub F);

impl<F> Request for FnRequest<F>
where
    F: FnOnce(&mut Worker) + Send + 'static,
{
    fn execute(self: Box<Self>, worker: &mut Worker) {
        (self.0)(worker)
    }
}

/// A message on a worker's queue.
pub enum WorkerMsg {
    /// A request posted by another component or worker.
    Request(Box<dyn Request>),
    /// A newly accepted connection assigned to this worker.
    NewConnection { client: ClientId, stream: TcpStream },
}

/// The process wide pool of workers.
pub struct Processor {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The identity of this incarnation of the process.
    server_instance_id: ServerInstanceId,
    /// The registry of connections to their owning workers.
    clients: ClientIdxAllocator,
    /// The request queue of each general worker.
    workers: Vec<mpsc::Sender<WorkerMsg>>,
    /// Round robin cursor for assigning new connections.
    next_worker: AtomicUsize,
}

impl Processor {
    /// Create a new instance, along with the receiving side of each worker's queue.
    pub fn new(config: Arc<Config>) -> (Arc<Self>, Vec<mpsc::Receiver<WorkerMsg>>) {
        let (workers, queues): (Vec<_>, Vec<_>) = (0..config.num_workers).map(|_| mpsc::channel(config.worker_queue_size)).unzip();
        let server_instance_id = config.resolve_server_instance_id();
        let this = Arc::new(Self {
            config,
            server_instance_id,
            clients: ClientIdxAllocator::default(),
            workers,
            next_worker: AtomicUsize::new(0),
        });
        (this, queues)
    }

    /// Spawn one OS thread per worker, each running the worker's event loop over its queue.
    pub fn spawn_workers(self: &Arc<Self>, queues: Vec<mpsc::Receiver<WorkerMsg>>, shutdown: &broadcast::Sender<()>) -> Result<Vec<JoinHandle<()>>> {
        queues
            .into_iter()
            .enumerate()
            .map(|(idx, queue)| {
                let (processor, shutdown_rx, shutdown_tx) = (self.clone(), shutdown.subscribe(), shutdown.clone());
                std::thread::Builder::new()
                    .name(format!("{}{}", WorkerType::General.name(), idx))
                    .spawn(move || {
                        if let Err(err) = Worker::new(idx, processor).run_on_thread(queue, shutdown_rx) {
                            tracing::error!(error = ?err, worker = idx, "worker exited with error");
                            let _res = shutdown_tx.send(());
                        }
                    })
                    .with_context(|| format!("error spawning worker thread {}", idx))
            })
            .collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server_instance_id(&self) -> ServerInstanceId {
        self.server_instance_id
    }

    pub fn clients(&self) -> &ClientIdxAllocator {
        &self.clients
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Post a request for execution on the given worker.
    ///
    /// This never blocks. Failure means the request was dropped.
    pub fn post_request(&self, worker: usize, request: Box<dyn Request>) -> Result<(), PostError> {
        self.post(worker, WorkerMsg::Request(request))
    }

    /// Assign a newly accepted connection to a worker, round robin.
    pub fn assign_connection(&self, stream: TcpStream) -> Result<ClientId, PostError> {
        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len().max(1);
        let client = self.clients.allocate(WorkerType::General, worker);
        match self.post(worker, WorkerMsg::NewConnection { client, stream }) {
            Ok(()) => Ok(client),
            Err(err) => {
                self.clients.release(client);
                Err(err)
            }
        }
    }

    fn post(&self, worker: usize, msg: WorkerMsg) -> Result<(), PostError> {
        let queue = self.workers.get(worker).ok_or(PostError::NoSuchWorker(worker))?;
        queue.try_send(msg).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PostError::QueueFull(worker),
            mpsc::error::TrySendError::Closed(_) => PostError::Shutdown(worker),
        })
    }
}
