use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::processor::Processor;
use crate::server::{spawn_prom_server, PeerServer};

/// The application object for when the replica is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The pool of workers.
    _processor: Arc<Processor>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handles of the worker threads.
    workers: Vec<std::thread::JoinHandle<()>>,
    /// The join handle of the peer server.
    peer_server: JoinHandle<Result<()>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (processor, queues) = Processor::new(config.clone());
        tracing::info!(server_instance_id = processor.server_instance_id(), "initialized processor");

        // Bind before spawning anything, so that a failure here leaves nothing running.
        let peer_server = PeerServer::new(processor.clone(), config.server_port, shutdown_tx.clone())
            .await
            .context("error setting up peer server")?;
        let workers = processor.spawn_workers(queues, &shutdown_tx)?;
        let peer_server = peer_server.spawn();
        let metrics_server = spawn_prom_server(&config, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _processor: processor,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            workers,
            peer_server,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("replica is shutting down");
        if let Err(err) = self.peer_server.await.context("error joining peer server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down peer server");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }
        for (idx, worker) in self.workers.into_iter().enumerate() {
            let joined = tokio::task::spawn_blocking(move || worker.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::error!(worker = idx, "error joining worker thread");
            }
        }

        tracing::debug!("replica shutdown complete");
        Ok(())
    }
}
