//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::{NodeIndex, ServerInstanceId};

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port which cluster internal network traffic is to use.
    pub server_port: u16,
    /// The port on which Prometheus metrics are served.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,
    /// The index of this node in the cluster's nodes config.
    pub node_index: NodeIndex,

    /// The number of general workers, each running its own single threaded event loop.
    #[serde(default = "Config::default_num_workers")]
    pub num_workers: usize,
    /// The capacity of each worker's request queue.
    #[serde(default = "Config::default_worker_queue_size")]
    pub worker_queue_size: usize,
    /// The capacity of each connection's outbound frame queue.
    #[serde(default = "Config::default_connection_queue_size")]
    pub connection_queue_size: usize,

    /// Hold all STORED replies of an appender until the last expected one arrives, then replay
    /// them in order. This exists only for deterministic test timing.
    #[serde(default)]
    pub hold_store_replies: bool,

    /// The instance ID of this process.
    ///
    /// When unset, this is derived from the process start time in milliseconds, which changes on
    /// every restart.
    #[serde(default)]
    pub server_instance_id: Option<ServerInstanceId>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the contents of this config.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            anyhow::bail!("NUM_WORKERS must be greater than 0");
        }
        if self.worker_queue_size == 0 || self.connection_queue_size == 0 {
            anyhow::bail!("WORKER_QUEUE_SIZE and CONNECTION_QUEUE_SIZE must be greater than 0");
        }
        if self.node_index < 0 {
            anyhow::bail!("NODE_INDEX must not be negative, got {}", self.node_index);
        }
        Ok(())
    }

    /// The server instance ID of this process, derived from the clock if not configured.
    pub fn resolve_server_instance_id(&self) -> ServerInstanceId {
        match self.server_instance_id {
            Some(id) => id,
            None => {
                let millis = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
                u64::try_from(millis).unwrap_or(1).max(1)
            }
        }
    }

    fn default_metrics_port() -> u16 {
        7002
    }

    fn default_num_workers() -> usize {
        4
    }

    fn default_worker_queue_size() -> usize {
        1024
    }

    fn default_connection_queue_size() -> usize {
        256
    }
}

#[cfg(test)]
impl Config {
    /// Create a config suitable for tests.
    pub fn new_test() -> Self {
        Self {
            rust_log: "error".into(),
            server_port: 0,
            metrics_port: 0,
            node_index: 1,
            num_workers: 2,
            worker_queue_size: 64,
            connection_queue_size: 64,
            hold_store_replies: false,
            server_instance_id: Some(42),
        }
    }
}
