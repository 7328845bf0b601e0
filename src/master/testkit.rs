//! In-memory chunk transport with killable nodes, for pipeline tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::chunk::ChunkTransport;
use crate::utils::DfsError;

use async_trait::async_trait;

use bytes::Bytes;

type BlobKey = (String, usize);

#[derive(Debug, Default)]
pub(crate) struct MemTransport {
    blobs: Mutex<HashMap<SocketAddr, HashMap<BlobKey, Bytes>>>,
    down: Mutex<HashSet<SocketAddr>>,
}

impl MemTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes every call to `addr` fail as if the node were unreachable.
    pub(crate) fn kill(&self, addr: SocketAddr) {
        self.down.lock().unwrap().insert(addr);
    }

    /// Drops one stored chunk from `addr` so that GET reports not-found.
    pub(crate) fn forget(&self, addr: SocketAddr, filename: &str, index: usize) {
        if let Some(blobs) = self.blobs.lock().unwrap().get_mut(&addr) {
            blobs.remove(&(filename.to_string(), index));
        }
    }

    /// Replaces a stored chunk's bytes on `addr`.
    pub(crate) fn corrupt(
        &self,
        addr: SocketAddr,
        filename: &str,
        index: usize,
        data: &'static [u8],
    ) {
        self.blobs
            .lock()
            .unwrap()
            .entry(addr)
            .or_default()
            .insert((filename.to_string(), index), Bytes::from_static(data));
    }

    pub(crate) fn holds(
        &self,
        addr: SocketAddr,
        filename: &str,
        index: usize,
    ) -> bool {
        self.blobs
            .lock()
            .unwrap()
            .get(&addr)
            .map_or(false, |b| b.contains_key(&(filename.to_string(), index)))
    }

    fn check_up(&self, addr: SocketAddr) -> Result<(), DfsError> {
        if self.down.lock().unwrap().contains(&addr) {
            Err(DfsError::msg(format!("{} unreachable", addr)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChunkTransport for MemTransport {
    async fn store(
        &self,
        addr: SocketAddr,
        filename: &str,
        index: usize,
        data: Bytes,
    ) -> Result<(), DfsError> {
        self.check_up(addr)?;
        self.blobs
            .lock()
            .unwrap()
            .entry(addr)
            .or_default()
            .insert((filename.to_string(), index), data);
        Ok(())
    }

    async fn fetch(
        &self,
        addr: SocketAddr,
        filename: &str,
        index: usize,
        max_len: usize,
    ) -> Result<Option<Bytes>, DfsError> {
        self.check_up(addr)?;
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(&addr)
            .and_then(|b| b.get(&(filename.to_string(), index)).cloned());
        match data {
            Some(data) if data.len() > max_len => Err(DfsError::msg(format!(
                "{} holds {} bytes, at most {} expected",
                addr,
                data.len(),
                max_len
            ))),
            data => Ok(data),
        }
    }
}

/// Loopback address with a fake port, standing in for node `i`.
pub(crate) fn node_addr(i: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6000 + i))
}

/// Deterministic test payload of `len` bytes.
pub(crate) fn payload(len: usize) -> Bytes {
    (0..len)
        .map(|i| (i % 251) as u8)
        .collect::<Vec<u8>>()
        .into()
}
