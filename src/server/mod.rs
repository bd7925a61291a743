//! Network servers: the peer listener and the metrics endpoint.

mod prom;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::processor::Processor;
pub use prom::{get_metrics_recorder, spawn_prom_server};

/// The listener for connections from other nodes of the cluster.
///
/// Accepted connections are handed to the processor, which assigns each one to a worker.
pub struct PeerServer {
    processor: Arc<Processor>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: broadcast::Receiver<()>,

    listener: TcpListener,
}

impl PeerServer {
    /// Construct a new instance, binding the given port on all interfaces.
    pub async fn new(processor: Arc<Processor>, port: u16, shutdown: broadcast::Sender<()>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await.context("error binding socket address for peer server")?;
        Ok(Self {
            processor,
            shutdown_rx: shutdown.subscribe(),
            shutdown_tx: shutdown,
            listener,
        })
    }

    /// The address this server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("error getting peer server local address")
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "peer server is listening");
        loop {
            tokio::select! {
                sock_res = self.listener.accept() => {
                    let (stream, addr) = match sock_res {
                        Ok((stream, addr)) => (stream, addr),
                        Err(err) => {
                            tracing::error!(error = ?err, "error accepting peer socket connection");
                            let _res = self.shutdown_tx.send(());
                            break;
                        }
                    };
                    let assigned = stream.into_std().map_err(anyhow::Error::from).and_then(|stream| self.processor.assign_connection(stream).map_err(anyhow::Error::from));
                    match assigned {
                        Ok(client) => tracing::debug!(%client, %addr, "accepted peer connection"),
                        Err(err) => tracing::warn!(error = ?err, %addr, "dropping peer connection which could not be assigned to a worker"),
                    }
                },
                _ = self.shutdown_rx.recv() => break,
            }
        }
        tracing::debug!("peer server has shutdown");
        Ok(())
    }
}
