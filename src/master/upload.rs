//! Upload pipeline: split, place, replicate, and commit a file.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::chunk::{validate_filename, ChunkTransport};
use crate::master::placement::choose_replicas;
use crate::master::{ChunkMeta, FileCatalog, FileEntry, NodeRegistry};
use crate::utils::DfsError;

use bytes::Bytes;

use futures::stream::{self, StreamExt};

/// Why an upload failed. Nothing is ever published on failure.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum UploadError {
    /// Declared length does not match the bytes received.
    SizeMismatch { declared: usize, received: usize },

    /// No storage node is registered.
    NoNodesAvailable,

    /// Every replica target of this chunk failed to store it.
    ChunkUnreplicated(usize),

    /// Malformed request, e.g., an invalid filename.
    BadRequest(String),

    /// Unexpected catalog failure.
    Internal(DfsError),
}

impl UploadError {
    /// Error reason string sent back to clients.
    pub fn wire_reason(&self) -> &'static str {
        match self {
            UploadError::SizeMismatch { .. } => "SIZE_MISMATCH",
            UploadError::NoNodesAvailable
            | UploadError::ChunkUnreplicated(_) => "NO_NODES",
            UploadError::BadRequest(_) => "BAD_REQUEST",
            UploadError::Internal(_) => "INTERNAL",
        }
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UploadError::SizeMismatch { declared, received } => write!(
                f,
                "size mismatch: declared {} received {}",
                declared, received
            ),
            UploadError::NoNodesAvailable => write!(f, "no nodes available"),
            UploadError::ChunkUnreplicated(index) => {
                write!(f, "chunk {} could not be stored anywhere", index)
            }
            UploadError::BadRequest(reason) => {
                write!(f, "bad request: {}", reason)
            }
            UploadError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl From<DfsError> for UploadError {
    fn from(e: DfsError) -> Self {
        UploadError::Internal(e)
    }
}

/// Drives placement and chunk transport for incoming files, publishing to
/// the catalog only when every chunk has at least one replica.
pub struct UploadPipeline {
    registry: Arc<NodeRegistry>,
    catalog: Arc<FileCatalog>,
    transport: Arc<dyn ChunkTransport>,

    /// Chunk size in bytes.
    chunk_size: usize,

    /// Desired number of replicas per chunk.
    replication_factor: usize,

    /// Maximum number of chunks being replicated at the same time.
    parallelism: usize,

    /// If set, the catalog is snapshotted here after every commit.
    snapshot_path: Option<PathBuf>,
}

impl UploadPipeline {
    /// Creates a new upload pipeline. Zero-valued sizing parameters are
    /// clamped to 1.
    pub fn new(
        registry: Arc<NodeRegistry>,
        catalog: Arc<FileCatalog>,
        transport: Arc<dyn ChunkTransport>,
        chunk_size: usize,
        replication_factor: usize,
        parallelism: usize,
    ) -> Self {
        UploadPipeline {
            registry,
            catalog,
            transport,
            chunk_size: chunk_size.max(1),
            replication_factor: replication_factor.max(1),
            parallelism: parallelism.max(1),
            snapshot_path: None,
        }
    }

    /// Enables catalog snapshotting to `path` after each commit.
    pub fn with_snapshot(mut self, path: PathBuf) -> Self {
        self.snapshot_path = Some(path);
        self
    }

    /// Number of chunks a file of `size` bytes is split into.
    pub fn num_chunks(&self, size: usize) -> usize {
        (size + self.chunk_size - 1) / self.chunk_size
    }

    /// Uploads `data` under `filename`. `declared_len` is the length the
    /// client announced; a mismatch fails before the catalog is touched.
    pub async fn upload(
        &self,
        filename: &str,
        declared_len: usize,
        data: Bytes,
    ) -> Result<FileEntry, UploadError> {
        validate_filename(filename)
            .map_err(|e| UploadError::BadRequest(e.to_string()))?;
        if data.len() != declared_len {
            return Err(UploadError::SizeMismatch {
                declared: declared_len,
                received: data.len(),
            });
        }
        if self.registry.is_empty() {
            return Err(UploadError::NoNodesAvailable);
        }

        let handle = self.catalog.begin_upload(filename);
        pf_debug!(
            "upload '{}' splitting {} bytes into {} chunks",
            filename,
            data.len(),
            self.num_chunks(data.len())
        );

        let mut chunks = stream::iter(0..self.num_chunks(data.len()))
            .map(|index| {
                let start = index * self.chunk_size;
                let end = (start + self.chunk_size).min(data.len());
                self.replicate_chunk(filename, index, data.slice(start..end))
            })
            .buffered(self.parallelism);

        while let Some(result) = chunks.next().await {
            let recorded = result.and_then(|meta| {
                self.catalog
                    .record_chunk(&handle, meta)
                    .map_err(UploadError::from)
            });
            if let Err(e) = recorded {
                // drops the remaining in-flight chunk futures
                drop(chunks);
                self.catalog.abort(handle);
                pf_warn!("upload '{}' failed: {}", filename, e);
                return Err(e);
            }
        }
        drop(chunks);

        let entry = self.catalog.commit(handle)?;
        pf_info!(
            "upload '{}' committed: {} bytes in {} chunks",
            entry.filename,
            entry.size,
            entry.chunks.len()
        );

        // the commit already happened; a failed snapshot only loses durability
        if let Some(path) = &self.snapshot_path {
            if let Err(e) = self.catalog.save_snapshot(path).await {
                pf_error!("catalog snapshot to {:?} failed: {}", path, e);
            }
        }
        Ok(entry)
    }

    /// Replicates one chunk to the replica set chosen against a fresh
    /// membership snapshot. Failed targets are dropped from the set.
    async fn replicate_chunk(
        &self,
        filename: &str,
        index: usize,
        data: Bytes,
    ) -> Result<ChunkMeta, UploadError> {
        let members = self.registry.active_members();
        let targets = choose_replicas(index, &members, self.replication_factor);
        if targets.is_empty() {
            return Err(UploadError::NoNodesAvailable);
        }

        let mut replicas = Vec::with_capacity(targets.len());
        for (node, addr) in targets {
            match self
                .transport
                .store(addr, filename, index, data.clone())
                .await
            {
                Ok(()) => replicas.push(node),
                Err(e) => {
                    pf_warn!(
                        "store {}#{} -> {} '{}' failed: {}",
                        filename,
                        index,
                        node,
                        addr,
                        e
                    );
                }
            }
        }

        if replicas.is_empty() {
            Err(UploadError::ChunkUnreplicated(index))
        } else {
            pf_trace!("chunk {}#{} stored on {:?}", filename, index, replicas);
            Ok(ChunkMeta {
                index,
                length: data.len(),
                replicas,
            })
        }
    }
}
