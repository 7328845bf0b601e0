//! dfstore master: node liveness, placement, and the file catalog behind two
//! TCP endpoints.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::chunk::{ChunkTransport, TcpChunkTransport};
use crate::master::reactor::ClientReactor;
use crate::master::reigner::NodeReigner;
use crate::master::{
    DownloadPipeline, FileCatalog, NodeRegistry, Sweeper, UploadPipeline,
};
use crate::utils::DfsError;

use serde::Deserialize;

use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MasterConfig {
    /// Fixed chunk size in bytes; the last chunk of a file may be shorter.
    pub chunk_size: usize,

    /// Desired number of replicas per chunk.
    pub replication_factor: usize,

    /// A node not heard from for longer than this is evicted.
    pub heartbeat_timeout_ms: u64,

    /// Interval between liveness sweeps.
    pub sweep_interval_ms: u64,

    /// Timeout of connecting to a storage node.
    pub connect_timeout_ms: u64,

    /// Timeout of every read/write step on any connection.
    pub io_timeout_ms: u64,

    /// Maximum number of chunks of one upload in flight at the same time.
    pub upload_parallelism: usize,

    /// Largest upload accepted, in bytes.
    pub max_upload_size: usize,

    /// Path to catalog snapshot file. Empty means no persistence.
    pub snapshot_path: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            chunk_size: 64 * 1024,
            replication_factor: 2,
            heartbeat_timeout_ms: 10000,
            sweep_interval_ms: 2000,
            connect_timeout_ms: 2000,
            io_timeout_ms: 5000,
            upload_parallelism: 4,
            max_upload_size: 1024 * 1024 * 1024,
            snapshot_path: "".into(),
        }
    }
}

impl MasterConfig {
    /// Parses a config from an optional TOML string over the defaults, then
    /// validates it.
    pub fn from_config_str(config_str: Option<&str>) -> Result<Self, DfsError> {
        let config = parsed_config!(config_str => MasterConfig;
                                    chunk_size, replication_factor,
                                    heartbeat_timeout_ms, sweep_interval_ms,
                                    connect_timeout_ms, io_timeout_ms,
                                    upload_parallelism, max_upload_size,
                                    snapshot_path)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects nonsensical parameter combinations.
    pub fn validate(&self) -> Result<(), DfsError> {
        if self.chunk_size == 0 {
            return logged_err!("invalid config.chunk_size '{}'", self.chunk_size);
        }
        if self.replication_factor == 0 {
            return logged_err!(
                "invalid config.replication_factor '{}'",
                self.replication_factor
            );
        }
        if self.sweep_interval_ms == 0
            || self.heartbeat_timeout_ms <= self.sweep_interval_ms
        {
            return logged_err!(
                "invalid config.heartbeat_timeout_ms '{}' vs. \
                 config.sweep_interval_ms '{}'",
                self.heartbeat_timeout_ms,
                self.sweep_interval_ms
            );
        }
        if self.connect_timeout_ms == 0 || self.io_timeout_ms == 0 {
            return logged_err!(
                "invalid config.connect_timeout_ms '{}' or \
                 config.io_timeout_ms '{}'",
                self.connect_timeout_ms,
                self.io_timeout_ms
            );
        }
        if self.upload_parallelism == 0 {
            return logged_err!(
                "invalid config.upload_parallelism '{}'",
                self.upload_parallelism
            );
        }
        Ok(())
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        if self.snapshot_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.snapshot_path))
        }
    }
}

/// Standalone dfstore master.
pub struct Master {
    config: MasterConfig,

    /// Live storage nodes.
    registry: Arc<NodeRegistry>,

    /// Published files.
    catalog: Arc<FileCatalog>,

    /// NodeReigner module.
    node_reigner: NodeReigner,

    /// ClientReactor module.
    client_reactor: ClientReactor,

    /// Liveness sweeper.
    sweeper: Sweeper,
}

impl Master {
    /// Creates a new master, restores the catalog snapshot if one is
    /// configured, and binds both listeners.
    pub async fn new_and_setup(
        config: MasterConfig,
        node_addr: SocketAddr,
        client_addr: SocketAddr,
    ) -> Result<Self, DfsError> {
        config.validate()?;
        if node_addr.port() != 0 && node_addr == client_addr {
            return logged_err!(
                "node and client endpoints share address '{}'",
                node_addr
            );
        }

        let registry = Arc::new(NodeRegistry::new(Duration::from_millis(
            config.heartbeat_timeout_ms,
        )));
        let catalog = Arc::new(FileCatalog::new());
        if let Some(path) = config.snapshot_path() {
            catalog.load_snapshot(&path).await?;
        }

        let io_timeout = Duration::from_millis(config.io_timeout_ms);
        let transport: Arc<dyn ChunkTransport> =
            Arc::new(TcpChunkTransport::new(
                Duration::from_millis(config.connect_timeout_ms),
                io_timeout,
            ));

        let mut upload = UploadPipeline::new(
            registry.clone(),
            catalog.clone(),
            transport.clone(),
            config.chunk_size,
            config.replication_factor,
            config.upload_parallelism,
        );
        if let Some(path) = config.snapshot_path() {
            upload = upload.with_snapshot(path);
        }
        let download =
            DownloadPipeline::new(registry.clone(), catalog.clone(), transport);

        let node_reigner =
            NodeReigner::new_and_setup(node_addr, registry.clone(), io_timeout)
                .await?;
        let client_reactor = ClientReactor::new_and_setup(
            client_addr,
            registry.clone(),
            Arc::new(upload),
            Arc::new(download),
            io_timeout,
            config.max_upload_size,
        )
        .await?;

        let sweeper = Sweeper::new_and_setup(
            registry.clone(),
            Duration::from_millis(config.sweep_interval_ms),
        )?;

        Ok(Master {
            config,
            registry,
            catalog,
            node_reigner,
            client_reactor,
            sweeper,
        })
    }

    /// Actual bound address of the node-facing endpoint.
    pub fn node_addr(&self) -> Result<SocketAddr, DfsError> {
        self.node_reigner.local_addr()
    }

    /// Actual bound address of the client-facing endpoint.
    pub fn client_addr(&self) -> Result<SocketAddr, DfsError> {
        self.client_reactor.local_addr()
    }

    /// Handle to the node registry.
    pub fn registry(&self) -> Arc<NodeRegistry> {
        self.registry.clone()
    }

    /// Handle to the file catalog.
    pub fn catalog(&self) -> Arc<FileCatalog> {
        self.catalog.clone()
    }

    /// Main event loop of the master. Returns when a termination signal is
    /// caught; in-flight request handlers are left to finish on their own.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), DfsError> {
        loop {
            tokio::select! {
                // new node connection
                conn = self.node_reigner.accept() => {
                    match conn {
                        Ok((stream, peer)) => {
                            self.node_reigner.serve(stream, peer);
                        }
                        Err(e) => {
                            pf_error!("error accepting node conn: {}", e);
                        }
                    }
                },

                // new client connection
                conn = self.client_reactor.accept() => {
                    match conn {
                        Ok((stream, peer)) => {
                            self.client_reactor.serve(stream, peer);
                        }
                        Err(e) => {
                            pf_error!("error accepting client conn: {}", e);
                        }
                    }
                },

                // liveness sweep due
                _ = self.sweeper.tick() => {
                    self.sweeper.step(Instant::now());
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("master caught termination signal");
                    break;
                }
            }
        }

        if let Some(path) = self.config.snapshot_path() {
            self.catalog.save_snapshot(&path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MasterStub, StubError};
    use crate::master::ChunkMeta;
    use crate::node::{NodeConfig, StorageNode};
    use bytes::Bytes;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time;

    const KB: usize = 1024;

    fn test_config() -> MasterConfig {
        MasterConfig {
            heartbeat_timeout_ms: 600,
            sweep_interval_ms: 100,
            connect_timeout_ms: 500,
            io_timeout_ms: 1000,
            ..Default::default()
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            if Instant::now() > deadline {
                return false;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    struct Cluster {
        registry: Arc<NodeRegistry>,
        catalog: Arc<FileCatalog>,
        stub: MasterStub,
        node_addr: SocketAddr,
        tx_term: watch::Sender<bool>,
        nodes: Vec<(watch::Sender<bool>, JoinHandle<Result<(), DfsError>>)>,
    }

    impl Cluster {
        async fn start(config: MasterConfig) -> Result<Self, DfsError> {
            let config_io_timeout_ms = config.io_timeout_ms;
            let mut master = Master::new_and_setup(
                config,
                "127.0.0.1:0".parse()?,
                "127.0.0.1:0".parse()?,
            )
            .await?;
            let registry = master.registry();
            let catalog = master.catalog();
            let node_addr = master.node_addr()?;
            let stub = MasterStub::new(
                master.client_addr()?,
                Duration::from_secs(1),
                Duration::from_millis(config_io_timeout_ms),
            );
            let (tx_term, rx_term) = watch::channel(false);
            tokio::spawn(async move { master.run(rx_term).await });
            Ok(Cluster {
                registry,
                catalog,
                stub,
                node_addr,
                tx_term,
                nodes: vec![],
            })
        }

        /// Starts a node and waits until the master has registered it, so
        /// that ring order follows start order.
        async fn add_node(&mut self, id: &str) -> Result<(), DfsError> {
            let config = NodeConfig {
                heartbeat_interval_ms: 100,
                heartbeat_jitter_ms: 10,
                ..Default::default()
            };
            let mut node = StorageNode::new_and_setup(
                id,
                "127.0.0.1:0".parse()?,
                self.node_addr,
                config,
            )
            .await?;
            let (tx_term, rx_term) = watch::channel(false);
            let handle = tokio::spawn(async move { node.run(rx_term).await });
            self.nodes.push((tx_term, handle));

            let registry = self.registry.clone();
            let id = id.to_string();
            if !wait_until(|| registry.address_of(&id).is_some()).await {
                return Err(DfsError::msg(format!("{} never registered", id)));
            }
            Ok(())
        }

        /// Stops the `i`-th started node; its chunk server goes away.
        async fn kill_node(&mut self, i: usize) -> Result<(), DfsError> {
            let (tx_term, handle) = self.nodes.remove(i);
            tx_term.send(true)?;
            handle.await.map_err(|e| DfsError::msg(e.to_string()))??;
            Ok(())
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn three_nodes_scenario() -> Result<(), DfsError> {
        let mut cluster = Cluster::start(test_config()).await?;
        for id in ["node1", "node2", "node3"] {
            cluster.add_node(id).await?;
        }
        assert_eq!(
            cluster.stub.list_nodes().await?,
            vec!["node1", "node2", "node3"]
        );

        let data = payload(150 * KB);
        cluster.stub.upload("scenario.bin", &data).await?;
        let downloaded = cluster.stub.download("scenario.bin").await?;
        assert_eq!(downloaded, Bytes::from(data));
        cluster.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn placement_recorded() -> Result<(), DfsError> {
        let mut cluster = Cluster::start(test_config()).await?;
        for id in ["node1", "node2", "node3"] {
            cluster.add_node(id).await?;
        }

        cluster.stub.upload("placed.bin", &payload(150 * KB)).await?;
        let entry = cluster
            .catalog
            .lookup("placed.bin")
            .ok_or_else(|| DfsError::msg("entry missing"))?;
        let placed: Vec<(usize, Vec<String>)> = entry
            .chunks
            .into_iter()
            .map(|c| (c.length, c.replicas))
            .collect();
        assert_eq!(
            placed,
            vec![
                (64 * KB, vec!["node1".into(), "node2".into()]),
                (64 * KB, vec!["node2".into(), "node3".into()]),
                (22 * KB, vec!["node3".into(), "node1".into()]),
            ]
        );
        cluster.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_nodes_and_unknown_file() -> Result<(), DfsError> {
        let cluster = Cluster::start(test_config()).await?;
        assert!(cluster.stub.list_nodes().await?.is_empty());
        assert_eq!(
            cluster.stub.upload("f", b"hello").await,
            Err(StubError::Rejected("NO_NODES".into()))
        );
        assert_eq!(
            cluster.stub.download("f").await,
            Err(StubError::Rejected("NO_SUCH_FILE".into()))
        );
        assert_eq!(
            cluster.stub.download("never").await,
            Err(StubError::Rejected("NO_SUCH_FILE".into()))
        );
        cluster.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn killed_node_fallback_and_eviction() -> Result<(), DfsError> {
        let mut cluster = Cluster::start(test_config()).await?;
        for id in ["node1", "node2", "node3"] {
            cluster.add_node(id).await?;
        }
        let data = payload(200 * KB);
        cluster.stub.upload("f", &data).await?;

        // node1 is primary for chunks 0 and 3
        cluster.kill_node(0).await?;
        assert_eq!(cluster.stub.download("f").await?, Bytes::from(data.clone()));

        let registry = cluster.registry.clone();
        assert!(wait_until(|| registry.address_of("node1").is_none()).await);
        assert_eq!(cluster.stub.list_nodes().await?, vec!["node2", "node3"]);
        assert_eq!(cluster.stub.download("f").await?, Bytes::from(data));
        cluster.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn hung_replica_outlasted_by_client() -> Result<(), DfsError> {
        let mut cluster = Cluster::start(MasterConfig {
            heartbeat_timeout_ms: 60_000,
            upload_parallelism: 1,
            ..test_config()
        })
        .await?;

        // a storage node that accepts chunk connections and never answers
        let hung = TcpListener::bind("127.0.0.1:0").await?;
        let hung_addr = hung.local_addr()?;
        let holder = tokio::spawn(async move {
            let mut held = vec![];
            while let Ok((stream, _)) = hung.accept().await {
                held.push(stream);
            }
        });
        cluster.registry.register("hung", hung_addr);
        cluster.add_node("node1").await?;

        // each chunk waits out one master io_timeout on the hung node, so the
        // reply comes well after the client's own io_timeout
        let data = payload(150 * KB);
        cluster.stub.upload("f", &data).await?;
        let entry = cluster
            .catalog
            .lookup("f")
            .ok_or_else(|| DfsError::msg("entry missing"))?;
        assert_eq!(entry.chunks.len(), 3);
        assert!(entry
            .chunks
            .iter()
            .all(|c| c.replicas == vec!["node1".to_string()]));

        // list the hung node first for every chunk, then download
        let handle = cluster.catalog.begin_upload("f");
        for chunk in entry.chunks {
            cluster.catalog.record_chunk(
                &handle,
                ChunkMeta {
                    replicas: vec!["hung".into(), "node1".into()],
                    ..chunk
                },
            )?;
        }
        cluster.catalog.commit(handle)?;
        assert_eq!(cluster.stub.download("f").await?, Bytes::from(data));

        holder.abort();
        cluster.tx_term.send(true)?;
        Ok(())
    }

    #[tokio::test]
    async fn config_parsing() -> Result<(), DfsError> {
        let config = MasterConfig::from_config_str(Some(
            "chunk_size = 1024\nreplication_factor = 3",
        ))?;
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.sweep_interval_ms, 2000);

        assert!(MasterConfig::from_config_str(Some("chunk_size = 0")).is_err());
        assert!(MasterConfig::from_config_str(Some(
            "heartbeat_timeout_ms = 1000\nsweep_interval_ms = 1000"
        ))
        .is_err());
        assert!(MasterConfig::from_config_str(Some("bogus = 1")).is_err());
        assert_eq!(MasterConfig::from_config_str(None)?, MasterConfig::default());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn catalog_survives_restart() -> Result<(), DfsError> {
        let path = std::env::temp_dir()
            .join(format!("dfstore-master-{}.snap", std::process::id()));
        let config = MasterConfig {
            snapshot_path: path.to_string_lossy().into_owned(),
            ..test_config()
        };

        let mut cluster = Cluster::start(config.clone()).await?;
        cluster.add_node("node1").await?;
        cluster.stub.upload("kept", b"persist me").await?;
        cluster.tx_term.send(true)?;

        let master = Master::new_and_setup(
            config,
            "127.0.0.1:0".parse()?,
            "127.0.0.1:0".parse()?,
        )
        .await?;
        assert_eq!(
            master.catalog().lookup("kept").map(|e| e.size),
            Some(b"persist me".len())
        );
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }
}
