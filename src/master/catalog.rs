//! File metadata catalog: filename -> ordered chunks and their replica sets.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::master::NodeId;
use crate::utils::DfsError;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

use tokio::fs;

/// Metadata of one chunk of a file.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Position of this chunk within the file.
    pub index: usize,

    /// Length of this chunk in bytes.
    pub length: usize,

    /// Nodes that successfully stored this chunk, in download preference
    /// order.
    pub replicas: Vec<NodeId>,
}

/// Published catalog entry of a file.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,

    /// Total size in bytes, i.e., sum of all chunk lengths.
    pub size: usize,

    /// Chunks indexed `0..N-1`.
    pub chunks: Vec<ChunkMeta>,
}

/// Handle to an in-progress upload. Consumed by `commit()` or `abort()`.
#[derive(Debug, PartialEq, Eq)]
pub struct UploadHandle {
    id: u64,
    filename: String,
}

impl UploadHandle {
    /// Filename this upload will be published under.
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

#[derive(Debug)]
struct PendingUpload {
    filename: String,
    chunks: BTreeMap<usize, ChunkMeta>,
}

#[derive(Debug, Default)]
struct CatalogInner {
    files: HashMap<String, FileEntry>,
    pending: HashMap<u64, PendingUpload>,
    next_upload: u64,

    /// Bumped on every publish; lets snapshotting skip stale writes.
    generation: u64,
}

/// On-disk snapshot format.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogSnapshot {
    generation: u64,
    files: Vec<FileEntry>,
}

/// File metadata catalog. Uploads build their entry privately through an
/// `UploadHandle` and only `commit()` makes it visible to `lookup()`.
#[derive(Debug, Default)]
pub struct FileCatalog {
    inner: Mutex<CatalogInner>,

    /// Generation of the last snapshot written to disk; also serializes
    /// concurrent snapshot writers.
    persisted: tokio::sync::Mutex<u64>,
}

impl FileCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CatalogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a new upload of `filename`. Nothing is published until the
    /// returned handle is committed; concurrent uploads of the same name are
    /// allowed and the last commit wins.
    pub fn begin_upload(&self, filename: &str) -> UploadHandle {
        let mut inner = self.lock();
        let id = inner.next_upload;
        inner.next_upload += 1;
        inner.pending.insert(
            id,
            PendingUpload {
                filename: filename.into(),
                chunks: BTreeMap::new(),
            },
        );
        UploadHandle {
            id,
            filename: filename.into(),
        }
    }

    /// Records a chunk of an in-progress upload. Chunks may be recorded in
    /// any order, but each index only once and never with an empty replica
    /// set.
    pub fn record_chunk(
        &self,
        handle: &UploadHandle,
        chunk: ChunkMeta,
    ) -> Result<(), DfsError> {
        if chunk.replicas.is_empty() {
            return Err(DfsError::msg(format!(
                "chunk {} of '{}' has no replica",
                chunk.index, handle.filename
            )));
        }

        let mut inner = self.lock();
        let pending = inner.pending.get_mut(&handle.id).ok_or_else(|| {
            DfsError::msg(format!("upload {} not in progress", handle.id))
        })?;
        if pending.chunks.contains_key(&chunk.index) {
            return Err(DfsError::msg(format!(
                "chunk {} of '{}' recorded twice",
                chunk.index, handle.filename
            )));
        }
        pending.chunks.insert(chunk.index, chunk);
        Ok(())
    }

    /// Atomically publishes the upload, replacing any previous entry under
    /// the same filename. Fails (and discards the upload) if the recorded
    /// chunks do not cover a contiguous `0..N-1` range.
    pub fn commit(&self, handle: UploadHandle) -> Result<FileEntry, DfsError> {
        let mut inner = self.lock();
        let pending = inner.pending.remove(&handle.id).ok_or_else(|| {
            DfsError::msg(format!("upload {} not in progress", handle.id))
        })?;

        // BTreeMap iterates in key order, so any gap shows up as a mismatch
        if let Some((expected, &index)) = pending
            .chunks
            .keys()
            .enumerate()
            .find(|&(expected, &index)| expected != index)
        {
            return Err(DfsError::msg(format!(
                "upload of '{}' is missing chunk {} (next recorded is {})",
                pending.filename, expected, index
            )));
        }

        let chunks: Vec<ChunkMeta> = pending.chunks.into_values().collect();
        let entry = FileEntry {
            filename: pending.filename,
            size: chunks.iter().map(|c| c.length).sum(),
            chunks,
        };
        inner.files.insert(entry.filename.clone(), entry.clone());
        inner.generation += 1;
        Ok(entry)
    }

    /// Discards an in-progress upload.
    pub fn abort(&self, handle: UploadHandle) {
        self.lock().pending.remove(&handle.id);
    }

    /// Looks up the published entry of a file.
    pub fn lookup(&self, filename: &str) -> Option<FileEntry> {
        self.lock().files.get(filename).cloned()
    }

    /// Names of all published files, sorted.
    pub fn filenames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().files.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of published files.
    pub fn len(&self) -> usize {
        self.lock().files.len()
    }

    /// True if no file is published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of uploads currently in progress.
    pub fn pending_uploads(&self) -> usize {
        self.lock().pending.len()
    }

    /// Writes the published entries to `path` (via a temporary file and a
    /// rename). Skips the write if a snapshot at least as new is already on
    /// disk. No lock on the catalog map is held across file I/O.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), DfsError> {
        let mut persisted = self.persisted.lock().await;

        let snapshot = {
            let inner = self.lock();
            if inner.generation <= *persisted && inner.generation > 0 {
                return Ok(());
            }
            CatalogSnapshot {
                generation: inner.generation,
                files: inner.files.values().cloned().collect(),
            }
        };

        let bytes = encode_to_vec(&snapshot)?;
        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, path).await?;

        *persisted = snapshot.generation;
        pf_debug!(
            "catalog snapshot gen {} saved to '{}'",
            snapshot.generation,
            path.display()
        );
        Ok(())
    }

    /// Replaces the published entries with those loaded from `path`. A
    /// missing file means a fresh start. Returns the number of entries
    /// loaded.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize, DfsError> {
        if !fs::try_exists(path).await? {
            pf_info!("no catalog snapshot at '{}'", path.display());
            return Ok(0);
        }

        let bytes = fs::read(path).await?;
        let snapshot: CatalogSnapshot = decode_from_slice(&bytes)?;
        let num_files = snapshot.files.len();

        {
            let mut inner = self.lock();
            inner.files = snapshot
                .files
                .into_iter()
                .map(|entry| (entry.filename.clone(), entry))
                .collect();
            inner.generation = snapshot.generation;
        }
        *self.persisted.lock().await = snapshot.generation;

        pf_info!(
            "loaded {} catalog entries from '{}'",
            num_files,
            path.display()
        );
        Ok(num_files)
    }
}
