//! Node-side chunk storage backends.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::chunk::validate_filename;
use crate::utils::DfsError;

use async_trait::async_trait;

use bytes::Bytes;

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// Where a storage node keeps the chunks pushed to it. A chunk is keyed by
/// `(filename, index)`; storing the same key again overwrites it.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Durably stores one chunk.
    async fn put(
        &self,
        filename: &str,
        index: usize,
        data: Bytes,
    ) -> Result<(), DfsError>;

    /// Returns the chunk if held, `Ok(None)` otherwise.
    async fn get(
        &self,
        filename: &str,
        index: usize,
    ) -> Result<Option<Bytes>, DfsError>;
}

/// Volatile in-memory store.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<HashMap<(String, usize), Bytes>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(
        &self,
        filename: &str,
        index: usize,
        data: Bytes,
    ) -> Result<(), DfsError> {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((filename.into(), index), data);
        Ok(())
    }

    async fn get(
        &self,
        filename: &str,
        index: usize,
    ) -> Result<Option<Bytes>, DfsError> {
        Ok(self
            .chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(filename.to_string(), index))
            .cloned())
    }
}

/// File-per-chunk store under a directory; chunk `i` of `f` lives at
/// `<dir>/<f>_chunk<i>`.
#[derive(Debug)]
pub struct DiskChunkStore {
    dir: PathBuf,
}

impl DiskChunkStore {
    /// Creates the store, making `dir` if it does not exist yet.
    pub async fn new_and_setup(dir: &Path) -> Result<Self, DfsError> {
        if !fs::try_exists(dir).await? {
            fs::create_dir_all(dir).await?;
            pf_info!("created chunks dir '{}'", dir.display());
        } else {
            pf_info!("chunks dir '{}' already exists", dir.display());
        }
        Ok(DiskChunkStore { dir: dir.into() })
    }

    fn chunk_path(&self, filename: &str, index: usize) -> PathBuf {
        self.dir.join(format!("{}_chunk{}", filename, index))
    }
}

#[async_trait]
impl ChunkStore for DiskChunkStore {
    async fn put(
        &self,
        filename: &str,
        index: usize,
        data: Bytes,
    ) -> Result<(), DfsError> {
        // names reach here off the wire; never let one escape the dir
        validate_filename(filename)?;
        let path = self.chunk_path(filename, index);
        let mut file = File::create(&path).await?;
        file.write_all(&data).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn get(
        &self,
        filename: &str,
        index: usize,
    ) -> Result<Option<Bytes>, DfsError> {
        validate_filename(filename)?;
        match fs::read(self.chunk_path(filename, index)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
