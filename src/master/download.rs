//! Download pipeline: fetch every chunk from the first responsive replica and
//! reassemble the file, all or nothing.

use std::fmt;
use std::sync::Arc;

use crate::chunk::ChunkTransport;
use crate::master::{ChunkMeta, FileCatalog, NodeRegistry};
use crate::utils::DfsError;

use bytes::{Bytes, BytesMut};

/// Why a download failed. No partial content is ever returned.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum DownloadError {
    /// No file of that name in the catalog.
    FileNotFound,

    /// No replica of this chunk could deliver it.
    ChunkUnavailable(usize),

    /// Malformed request.
    BadRequest(String),

    /// Reassembled size disagrees with the catalog.
    Internal(DfsError),
}

impl DownloadError {
    /// Error reason string sent back to clients.
    pub fn wire_reason(&self) -> &'static str {
        match self {
            DownloadError::FileNotFound => "NO_SUCH_FILE",
            DownloadError::ChunkUnavailable(_) => "CHUNK_UNAVAILABLE",
            DownloadError::BadRequest(_) => "BAD_REQUEST",
            DownloadError::Internal(_) => "INTERNAL",
        }
    }
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DownloadError::FileNotFound => write!(f, "no such file"),
            DownloadError::ChunkUnavailable(index) => {
                write!(f, "chunk {} unavailable on every replica", index)
            }
            DownloadError::BadRequest(reason) => {
                write!(f, "bad request: {}", reason)
            }
            DownloadError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

/// A fully reassembled file.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DownloadedFile {
    /// Size recorded in the catalog; always equals `data.len()`.
    pub size: usize,

    pub data: Bytes,
}

/// Reads the catalog and pulls chunks back from storage nodes.
pub struct DownloadPipeline {
    registry: Arc<NodeRegistry>,
    catalog: Arc<FileCatalog>,
    transport: Arc<dyn ChunkTransport>,
}

impl DownloadPipeline {
    /// Creates a new download pipeline.
    pub fn new(
        registry: Arc<NodeRegistry>,
        catalog: Arc<FileCatalog>,
        transport: Arc<dyn ChunkTransport>,
    ) -> Self {
        DownloadPipeline {
            registry,
            catalog,
            transport,
        }
    }

    /// Downloads `filename`, chunk by chunk in index order.
    pub async fn download(
        &self,
        filename: &str,
    ) -> Result<DownloadedFile, DownloadError> {
        let entry = self
            .catalog
            .lookup(filename)
            .ok_or(DownloadError::FileNotFound)?;

        let mut assembled = BytesMut::with_capacity(entry.size);
        for chunk in &entry.chunks {
            let data = self.fetch_chunk(filename, chunk).await?;
            assembled.extend_from_slice(&data);
        }

        if assembled.len() != entry.size {
            return Err(DownloadError::Internal(DfsError::msg(format!(
                "'{}' reassembled to {} bytes, catalog says {}",
                filename,
                assembled.len(),
                entry.size
            ))));
        }
        pf_debug!(
            "download '{}' reassembled {} bytes from {} chunks",
            filename,
            entry.size,
            entry.chunks.len()
        );
        Ok(DownloadedFile {
            size: entry.size,
            data: assembled.freeze(),
        })
    }

    /// Tries each replica of a chunk in recorded order, returning the first
    /// complete copy. Replicas no longer in the registry are skipped.
    async fn fetch_chunk(
        &self,
        filename: &str,
        chunk: &ChunkMeta,
    ) -> Result<Bytes, DownloadError> {
        for node in &chunk.replicas {
            let addr = match self.registry.address_of(node) {
                Some(addr) => addr,
                None => {
                    pf_debug!(
                        "skip {}#{} on {}: not registered",
                        filename,
                        chunk.index,
                        node
                    );
                    continue;
                }
            };

            let fetched = self
                .transport
                .fetch(addr, filename, chunk.index, chunk.length)
                .await;
            match fetched {
                Ok(Some(data)) if data.len() == chunk.length => {
                    return Ok(data);
                }
                Ok(Some(data)) => {
                    pf_warn!(
                        "fetch {}#{} <- {}: got {} bytes, expected {}",
                        filename,
                        chunk.index,
                        node,
                        data.len(),
                        chunk.length
                    );
                }
                Ok(None) => {
                    pf_warn!(
                        "fetch {}#{} <- {}: not found",
                        filename,
                        chunk.index,
                        node
                    );
                }
                Err(e) => {
                    pf_warn!(
                        "fetch {}#{} <- {} '{}' failed: {}",
                        filename,
                        chunk.index,
                        node,
                        addr,
                        e
                    );
                }
            }
        }

        Err(DownloadError::ChunkUnavailable(chunk.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::testkit::{node_addr, payload, MemTransport};
    use crate::master::UploadPipeline;
    use tokio::time::{Duration, Instant};

    const KB: usize = 1024;

    struct Fixture {
        registry: Arc<NodeRegistry>,
        transport: Arc<MemTransport>,
        upload: UploadPipeline,
        download: DownloadPipeline,
    }

    fn setup(num_nodes: u16) -> Fixture {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(10)));
        for i in 1..=num_nodes {
            registry.register(&format!("node{}", i), node_addr(i));
        }
        let catalog = Arc::new(FileCatalog::new());
        let transport = Arc::new(MemTransport::new());
        let upload = UploadPipeline::new(
            registry.clone(),
            catalog.clone(),
            transport.clone(),
            64 * KB,
            2,
            4,
        );
        let download =
            DownloadPipeline::new(registry.clone(), catalog, transport.clone());
        Fixture {
            registry,
            transport,
            upload,
            download,
        }
    }

    #[tokio::test]
    async fn round_trip_sizes() -> Result<(), DfsError> {
        let fx = setup(3);
        for (name, size) in [
            ("zero", 0),
            ("small", 10 * KB),
            ("exact", 128 * KB),
            ("tail", 150 * KB),
            ("many", 5 * 64 * KB + 1),
        ] {
            let data = payload(size);
            fx.upload
                .upload(name, size, data.clone())
                .await
                .map_err(|e| DfsError::msg(e.to_string()))?;
            let file = fx
                .download
                .download(name)
                .await
                .map_err(|e| DfsError::msg(e.to_string()))?;
            assert_eq!(file.size, size);
            assert_eq!(file.data, data);
        }
        Ok(())
    }

    #[tokio::test]
    async fn unknown_file() {
        let fx = setup(1);
        assert_eq!(
            fx.download.download("never-uploaded").await,
            Err(DownloadError::FileNotFound)
        );
    }

    #[tokio::test]
    async fn primary_killed_falls_back() -> Result<(), DfsError> {
        let fx = setup(3);
        let data = payload(150 * KB);
        fx.upload
            .upload("f", data.len(), data.clone())
            .await
            .map_err(|e| DfsError::msg(e.to_string()))?;

        // node2 is the primary of chunk 1 and secondary of chunk 0
        fx.transport.kill(node_addr(2));
        let file = fx
            .download
            .download("f")
            .await
            .map_err(|e| DfsError::msg(e.to_string()))?;
        assert_eq!(file.data, data);
        Ok(())
    }

    #[tokio::test]
    async fn evicted_primary_skipped() -> Result<(), DfsError> {
        let fx = setup(3);
        let data = payload(100 * KB);
        fx.upload
            .upload("f", data.len(), data.clone())
            .await
            .map_err(|e| DfsError::msg(e.to_string()))?;

        // everyone but node1 keeps heartbeating
        let later = Instant::now() + Duration::from_secs(11);
        fx.registry.heartbeat_at("node2", later);
        fx.registry.heartbeat_at("node3", later);
        assert_eq!(fx.registry.sweep(later), vec!["node1"]);

        let file = fx
            .download
            .download("f")
            .await
            .map_err(|e| DfsError::msg(e.to_string()))?;
        assert_eq!(file.data, data);
        Ok(())
    }

    #[tokio::test]
    async fn not_found_and_short_copies_skipped() -> Result<(), DfsError> {
        let fx = setup(3);
        let data = payload(150 * KB);
        fx.upload
            .upload("f", data.len(), data.clone())
            .await
            .map_err(|e| DfsError::msg(e.to_string()))?;

        fx.transport.forget(node_addr(1), "f", 0);
        fx.transport.corrupt(node_addr(2), "f", 1, b"short");
        let file = fx
            .download
            .download("f")
            .await
            .map_err(|e| DfsError::msg(e.to_string()))?;
        assert_eq!(file.data, data);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_copy_skipped() -> Result<(), DfsError> {
        let fx = setup(3);
        let data = payload(150 * KB);
        fx.upload
            .upload("f", data.len(), data.clone())
            .await
            .map_err(|e| DfsError::msg(e.to_string()))?;

        // chunk 2 (22 KiB) lives on node3 + node1
        fx.transport.corrupt(node_addr(3), "f", 2, &[7u8; 30 * KB]);
        let file = fx
            .download
            .download("f")
            .await
            .map_err(|e| DfsError::msg(e.to_string()))?;
        assert_eq!(file.data, data);
        Ok(())
    }

    #[tokio::test]
    async fn total_loss_detected() -> Result<(), DfsError> {
        let fx = setup(3);
        let data = payload(150 * KB);
        fx.upload
            .upload("f", data.len(), data)
            .await
            .map_err(|e| DfsError::msg(e.to_string()))?;

        // chunk 2 lives on node3 + node1
        fx.transport.kill(node_addr(3));
        fx.transport.forget(node_addr(1), "f", 2);
        assert_eq!(
            fx.download.download("f").await,
            Err(DownloadError::ChunkUnavailable(2))
        );
        Ok(())
    }
}
