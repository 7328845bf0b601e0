//! Storage node chunk server: answers the master's STORE and GET requests.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::chunk::{ChunkReply, ChunkRequest};
use crate::node::ChunkStore;
use crate::utils::{
    read_header_line, read_payload, tcp_bind_with_retry, write_framed, DfsError,
};

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// The chunk-serving listener of a storage node. Each accepted connection
/// carries one request and is handled on its own task.
pub(crate) struct ChunkServer {
    chunk_listener: TcpListener,

    store: Arc<dyn ChunkStore>,

    /// Largest chunk accepted by STORE.
    max_chunk_size: usize,

    io_timeout: Duration,
}

impl ChunkServer {
    /// Creates the chunk server and binds its listener.
    pub(crate) async fn new_and_setup(
        chunk_addr: SocketAddr,
        store: Arc<dyn ChunkStore>,
        max_chunk_size: usize,
        io_timeout: Duration,
    ) -> Result<Self, DfsError> {
        let chunk_listener = tcp_bind_with_retry(chunk_addr, 10).await?;
        pf_info!("serving chunks on '{}'", chunk_listener.local_addr()?);
        Ok(ChunkServer {
            chunk_listener,
            store,
            max_chunk_size,
            io_timeout,
        })
    }

    /// Actual bound address of the listener.
    pub(crate) fn local_addr(&self) -> Result<SocketAddr, DfsError> {
        Ok(self.chunk_listener.local_addr()?)
    }

    /// Accepts the next connection from the master.
    pub(crate) async fn accept(
        &mut self,
    ) -> Result<(TcpStream, SocketAddr), DfsError> {
        Ok(self.chunk_listener.accept().await?)
    }

    /// Spawns a handler task for an accepted connection.
    pub(crate) fn serve(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let max_chunk_size = self.max_chunk_size;
        let io_timeout = self.io_timeout;
        tokio::spawn(async move {
            if let Err(e) =
                Self::handle_conn(store, stream, max_chunk_size, io_timeout)
                    .await
            {
                pf_warn!("chunk request from '{}' failed: {}", peer, e);
            }
        })
    }

    async fn handle_conn(
        store: Arc<dyn ChunkStore>,
        mut stream: TcpStream,
        max_chunk_size: usize,
        io_timeout: Duration,
    ) -> Result<(), DfsError> {
        let (conn_read, mut conn_write) = stream.split();
        let mut conn_read = BufReader::new(conn_read);

        let line = match read_header_line(&mut conn_read, io_timeout, false)
            .await?
        {
            Some(line) => line,
            None => return Ok(()),
        };

        match ChunkRequest::parse(&line)? {
            ChunkRequest::Store {
                filename,
                index,
                len,
            } if len > max_chunk_size => {
                pf_warn!(
                    "refusing {}#{}: {} bytes exceeds max chunk size {}",
                    filename,
                    index,
                    len,
                    max_chunk_size
                );
                write_framed(
                    &mut conn_write,
                    &ChunkReply::Failed.to_string(),
                    None,
                    io_timeout,
                )
                .await
            }

            ChunkRequest::Store {
                filename,
                index,
                len,
            } => {
                let data = read_payload(&mut conn_read, len, io_timeout).await?;
                let reply = match store.put(&filename, index, data).await {
                    Ok(()) => {
                        pf_trace!("stored {}#{} ({} bytes)", filename, index, len);
                        ChunkReply::Stored
                    }
                    Err(e) => {
                        pf_error!("storing {}#{} failed: {}", filename, index, e);
                        ChunkReply::Failed
                    }
                };
                write_framed(&mut conn_write, &reply.to_string(), None, io_timeout)
                    .await
            }

            ChunkRequest::Get { filename, index } => {
                let data = store.get(&filename, index).await?;
                let len = data.as_ref().map_or(0, |d| d.len());
                write_framed(
                    &mut conn_write,
                    &ChunkReply::Size(len).to_string(),
                    data.as_deref(),
                    io_timeout,
                )
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkTransport, TcpChunkTransport};
    use crate::node::MemoryChunkStore;
    use bytes::Bytes;

    async fn start_server() -> Result<SocketAddr, DfsError> {
        let mut server = ChunkServer::new_and_setup(
            "127.0.0.1:0".parse()?,
            Arc::new(MemoryChunkStore::new()),
            256 * 1024,
            Duration::from_secs(1),
        )
        .await?;
        let addr = server.local_addr()?;
        tokio::spawn(async move {
            while let Ok((stream, peer)) = server.accept().await {
                server.serve(stream, peer);
            }
        });
        Ok(addr)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_then_fetch() -> Result<(), DfsError> {
        let addr = start_server().await?;
        let transport =
            TcpChunkTransport::new(Duration::from_secs(1), Duration::from_secs(1));

        assert_eq!(transport.fetch(addr, "f", 0, 0).await?, None);
        let data = Bytes::from(vec![7u8; 200 * 1024]);
        transport.store(addr, "f", 0, data.clone()).await?;
        transport
            .store(addr, "f", 1, Bytes::from_static(b"tail"))
            .await?;
        assert_eq!(transport.fetch(addr, "f", 0, data.len()).await?, Some(data));
        assert_eq!(
            transport.fetch(addr, "f", 1, 4).await?,
            Some(Bytes::from_static(b"tail"))
        );
        assert_eq!(transport.fetch(addr, "g", 0, 4).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_store_refused() -> Result<(), DfsError> {
        let addr = start_server().await?;
        let mut stream = TcpStream::connect(addr).await?;
        let (conn_read, mut conn_write) = stream.split();

        // header alone; no payload follows
        let req = ChunkRequest::Store {
            filename: "f".into(),
            index: 0,
            len: usize::MAX,
        };
        write_framed(
            &mut conn_write,
            &req.to_string(),
            None,
            Duration::from_secs(1),
        )
        .await?;
        let mut conn_read = BufReader::new(conn_read);
        let line =
            read_header_line(&mut conn_read, Duration::from_secs(1), true)
                .await?;
        assert_eq!(line, Some(ChunkReply::Failed.to_string()));

        let transport =
            TcpChunkTransport::new(Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(transport.fetch(addr, "f", 0, 4).await?, None);
        Ok(())
    }
}
