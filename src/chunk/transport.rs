//! Chunk push (STORE) and pull (GET) over one TCP connection per operation.

use std::net::SocketAddr;

use crate::chunk::{ChunkReply, ChunkRequest};
use crate::utils::{
    read_header_line, read_payload, tcp_connect_with_timeout, write_framed,
    DfsError,
};

use async_trait::async_trait;

use bytes::Bytes;

use tokio::io::BufReader;
use tokio::time::Duration;

/// Point-to-point chunk transfer to/from a storage node. Implementations must
/// fully drain or fully fail: a partial transfer is always an `Err`.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Pushes chunk `index` of `filename` to the node at `addr`. Any
    /// connection error, timeout, or non-acknowledgement is an `Err`.
    async fn store(
        &self,
        addr: SocketAddr,
        filename: &str,
        index: usize,
        data: Bytes,
    ) -> Result<(), DfsError>;

    /// Pulls chunk `index` of `filename` from the node at `addr`. Returns
    /// `Ok(None)` if the node does not hold the chunk. A node announcing more
    /// than `max_len` bytes is an `Err`, before any payload is read.
    async fn fetch(
        &self,
        addr: SocketAddr,
        filename: &str,
        index: usize,
        max_len: usize,
    ) -> Result<Option<Bytes>, DfsError>;
}

/// TCP implementation of the chunk transport.
#[derive(Debug, Clone)]
pub struct TcpChunkTransport {
    /// Bound on establishing each connection.
    connect_timeout: Duration,

    /// Bound on each individual read/write step.
    io_timeout: Duration,
}

impl TcpChunkTransport {
    /// Creates a new TCP chunk transport with given timeouts.
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        TcpChunkTransport {
            connect_timeout,
            io_timeout,
        }
    }
}

#[async_trait]
impl ChunkTransport for TcpChunkTransport {
    async fn store(
        &self,
        addr: SocketAddr,
        filename: &str,
        index: usize,
        data: Bytes,
    ) -> Result<(), DfsError> {
        let mut stream =
            tcp_connect_with_timeout(addr, self.connect_timeout).await?;
        let (conn_read, mut conn_write) = stream.split();

        let req = ChunkRequest::Store {
            filename: filename.into(),
            index,
            len: data.len(),
        };
        write_framed(
            &mut conn_write,
            &req.to_string(),
            Some(&data[..]),
            self.io_timeout,
        )
        .await?;

        let mut conn_read = BufReader::new(conn_read);
        match read_header_line(&mut conn_read, self.io_timeout, true).await? {
            Some(line) => match ChunkReply::parse(&line)? {
                ChunkReply::Stored => Ok(()),
                reply => Err(DfsError::msg(format!(
                    "store {}#{} rejected by {}: {}",
                    filename, index, addr, reply
                ))),
            },
            None => Err(DfsError::msg(format!(
                "store {}#{}: {} closed without ack",
                filename, index, addr
            ))),
        }
    }

    async fn fetch(
        &self,
        addr: SocketAddr,
        filename: &str,
        index: usize,
        max_len: usize,
    ) -> Result<Option<Bytes>, DfsError> {
        let mut stream =
            tcp_connect_with_timeout(addr, self.connect_timeout).await?;
        let (conn_read, mut conn_write) = stream.split();

        let req = ChunkRequest::Get {
            filename: filename.into(),
            index,
        };
        write_framed(&mut conn_write, &req.to_string(), None, self.io_timeout)
            .await?;

        let mut conn_read = BufReader::new(conn_read);
        let line = read_header_line(&mut conn_read, self.io_timeout, false)
            .await?
            .ok_or_else(|| {
                DfsError::msg(format!(
                    "fetch {}#{}: {} closed without reply",
                    filename, index, addr
                ))
            })?;
        match ChunkReply::parse(&line)? {
            ChunkReply::Size(0) => Ok(None),
            ChunkReply::Size(len) if len > max_len => {
                Err(DfsError::msg(format!(
                    "fetch {}#{}: {} announced {} bytes, at most {} expected",
                    filename, index, addr, len, max_len
                )))
            }
            ChunkReply::Size(len) => {
                let data =
                    read_payload(&mut conn_read, len, self.io_timeout).await?;
                Ok(Some(data))
            }
            reply => Err(DfsError::msg(format!(
                "fetch {}#{}: unexpected reply from {}: {}",
                filename, index, addr, reply
            ))),
        }
    }
}
