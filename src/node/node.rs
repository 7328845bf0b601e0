//! dfstore storage node: a chunk server plus liveness announcements.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::master::validate_node_id;
use crate::node::heartbeat::Heartbeater;
use crate::node::server::ChunkServer;
use crate::node::{ChunkStore, DiskChunkStore, MemoryChunkStore};
use crate::utils::DfsError;

use serde::Deserialize;

use tokio::sync::watch;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeConfig {
    /// Interval between heartbeats in millisecs.
    pub heartbeat_interval_ms: u64,

    /// Maximum random delay added to each heartbeat interval.
    pub heartbeat_jitter_ms: u64,

    /// Timeout of every read/write step on any connection.
    pub io_timeout_ms: u64,

    /// Directory to keep chunk files in. Empty means in-memory only.
    pub chunks_dir: String,

    /// Largest chunk a STORE may carry, in bytes.
    pub max_chunk_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            heartbeat_interval_ms: 3000,
            heartbeat_jitter_ms: 200,
            io_timeout_ms: 5000,
            chunks_dir: "".into(),
            max_chunk_size: 16 * 1024 * 1024,
        }
    }
}

impl NodeConfig {
    /// Parses a config from an optional TOML string over the defaults, then
    /// validates it.
    pub fn from_config_str(config_str: Option<&str>) -> Result<Self, DfsError> {
        let config = parsed_config!(config_str => NodeConfig;
                                    heartbeat_interval_ms, heartbeat_jitter_ms,
                                    io_timeout_ms, chunks_dir,
                                    max_chunk_size)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects nonsensical parameter values.
    pub fn validate(&self) -> Result<(), DfsError> {
        if self.heartbeat_interval_ms == 0 {
            return logged_err!(
                "invalid config.heartbeat_interval_ms '{}'",
                self.heartbeat_interval_ms
            );
        }
        if self.io_timeout_ms == 0 {
            return logged_err!(
                "invalid config.io_timeout_ms '{}'",
                self.io_timeout_ms
            );
        }
        if self.max_chunk_size == 0 {
            return logged_err!(
                "invalid config.max_chunk_size '{}'",
                self.max_chunk_size
            );
        }
        Ok(())
    }
}

/// Standalone dfstore storage node.
pub struct StorageNode {
    /// My node ID.
    id: String,

    /// ChunkServer module.
    chunk_server: ChunkServer,

    /// Heartbeater module; moved onto its own task by `run()`.
    heartbeater: Option<Heartbeater>,
}

impl StorageNode {
    /// Creates a new storage node, prepares its chunk store, and binds its
    /// chunk server. The port announced to the master is the one actually
    /// bound, so `chunk_addr` may carry port 0.
    pub async fn new_and_setup(
        id: &str,
        chunk_addr: SocketAddr,
        master_addr: SocketAddr,
        config: NodeConfig,
    ) -> Result<Self, DfsError> {
        validate_node_id(id)?;
        config.validate()?;

        let store: Arc<dyn ChunkStore> = if config.chunks_dir.is_empty() {
            Arc::new(MemoryChunkStore::new())
        } else {
            Arc::new(
                DiskChunkStore::new_and_setup(Path::new(&config.chunks_dir))
                    .await?,
            )
        };

        let io_timeout = Duration::from_millis(config.io_timeout_ms);
        let chunk_server = ChunkServer::new_and_setup(
            chunk_addr,
            store,
            config.max_chunk_size,
            io_timeout,
        )
        .await?;
        let heartbeater = Heartbeater::new_and_setup(
            id.into(),
            chunk_server.local_addr()?.port(),
            master_addr,
            Duration::from_millis(config.heartbeat_interval_ms),
            Duration::from_millis(config.heartbeat_jitter_ms),
            io_timeout,
        )?;

        Ok(StorageNode {
            id: id.into(),
            chunk_server,
            heartbeater: Some(heartbeater),
        })
    }

    /// Actual bound address of the chunk server.
    pub fn chunk_addr(&self) -> Result<SocketAddr, DfsError> {
        self.chunk_server.local_addr()
    }

    /// Main event loop of the node. Returns when a termination signal is
    /// caught.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), DfsError> {
        let heartbeater = match self.heartbeater.take() {
            Some(heartbeater) => heartbeater,
            None => return logged_err!("node {} has already run", self.id),
        };
        let heartbeat_handle = tokio::spawn(heartbeater.heartbeat_thread());

        loop {
            tokio::select! {
                // chunk request from the master
                conn = self.chunk_server.accept() => {
                    match conn {
                        Ok((stream, peer)) => {
                            self.chunk_server.serve(stream, peer);
                        }
                        Err(e) => {
                            pf_error!("error accepting chunk conn: {}", e);
                        }
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("node {} caught termination signal", self.id);
                    break;
                }
            }
        }

        heartbeat_handle.abort();
        if let Err(e) = heartbeat_handle.await {
            if !e.is_cancelled() {
                pf_error!("heartbeat thread join error: {}", e);
            }
        }
        Ok(())
    }
}
