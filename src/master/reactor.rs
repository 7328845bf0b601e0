//! Master client-facing request endpoint.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::chunk::validate_filename;
use crate::master::{DownloadPipeline, NodeRegistry, UploadPipeline};
use crate::utils::{
    read_header_line, read_up_to, tcp_bind_with_retry, write_framed, DfsError,
};

use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Request from a client. One request per connection.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ClientRequest {
    /// Query the currently registered nodes in ring order.
    ListNodes,

    /// Upload a file; `len` raw bytes follow the header.
    Upload { filename: String, len: usize },

    /// Download a whole file.
    Download { filename: String },
}

impl ClientRequest {
    /// Parses a request header line. Filenames are validated here so that a
    /// bad name is refused before any payload is read.
    pub fn parse(line: &str) -> Result<Self, DfsError> {
        if line == "LIST_NODES" {
            Ok(ClientRequest::ListNodes)
        } else if let Some(rest) = line.strip_prefix("UPLOAD::") {
            let (filename, len) = rest.rsplit_once("::").ok_or_else(|| {
                DfsError::msg(format!("malformed UPLOAD '{}'", line))
            })?;
            validate_filename(filename)?;
            Ok(ClientRequest::Upload {
                filename: filename.into(),
                len: len.parse()?,
            })
        } else if let Some(filename) = line.strip_prefix("DOWNLOAD::") {
            validate_filename(filename)?;
            Ok(ClientRequest::Download {
                filename: filename.into(),
            })
        } else {
            Err(DfsError::msg(format!("unknown request '{}'", line)))
        }
    }
}

impl fmt::Display for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientRequest::ListNodes => write!(f, "LIST_NODES"),
            ClientRequest::Upload { filename, len } => {
                write!(f, "UPLOAD::{}::{}", filename, len)
            }
            ClientRequest::Download { filename } => {
                write!(f, "DOWNLOAD::{}", filename)
            }
        }
    }
}

/// Reply header sent back to a client. A `Size` reply is followed by that
/// many raw bytes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ClientReply {
    /// Registered node IDs in ring order.
    Nodes(Vec<String>),

    /// Upload committed.
    Ok,

    /// Download succeeded with this many bytes following.
    Size(usize),

    /// Request failed with a wire reason string.
    Error(String),
}

impl ClientReply {
    /// Parses a reply header line.
    pub fn parse(line: &str) -> Result<Self, DfsError> {
        if line == "OK" {
            Ok(ClientReply::Ok)
        } else if let Some(list) = line.strip_prefix("NODES::") {
            Ok(ClientReply::Nodes(
                list.split(',')
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            ))
        } else if let Some(size) = line.strip_prefix("SIZE::") {
            Ok(ClientReply::Size(size.parse()?))
        } else if let Some(reason) = line.strip_prefix("ERROR::") {
            Ok(ClientReply::Error(reason.into()))
        } else {
            Err(DfsError::msg(format!("unknown reply '{}'", line)))
        }
    }
}

impl fmt::Display for ClientReply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientReply::Nodes(nodes) => write!(f, "NODES::{}", nodes.join(",")),
            ClientReply::Ok => write!(f, "OK"),
            ClientReply::Size(size) => write!(f, "SIZE::{}", size),
            ClientReply::Error(reason) => write!(f, "ERROR::{}", reason),
        }
    }
}

/// State shared by every client connection handler.
#[derive(Clone)]
struct ClientHandler {
    registry: Arc<NodeRegistry>,
    upload: Arc<UploadPipeline>,
    download: Arc<DownloadPipeline>,
    io_timeout: Duration,
    max_upload_size: usize,
}

/// The client-facing request listener. Each accepted connection is handled
/// on its own task.
pub(crate) struct ClientReactor {
    client_listener: TcpListener,

    handler: ClientHandler,
}

impl ClientReactor {
    /// Creates the client-facing endpoint and binds its listener.
    pub(crate) async fn new_and_setup(
        client_addr: SocketAddr,
        registry: Arc<NodeRegistry>,
        upload: Arc<UploadPipeline>,
        download: Arc<DownloadPipeline>,
        io_timeout: Duration,
        max_upload_size: usize,
    ) -> Result<Self, DfsError> {
        let client_listener = tcp_bind_with_retry(client_addr, 10).await?;
        pf_info!("accepting clients on '{}'", client_listener.local_addr()?);
        Ok(ClientReactor {
            client_listener,
            handler: ClientHandler {
                registry,
                upload,
                download,
                io_timeout,
                max_upload_size,
            },
        })
    }

    /// Actual bound address of the listener.
    pub(crate) fn local_addr(&self) -> Result<SocketAddr, DfsError> {
        Ok(self.client_listener.local_addr()?)
    }

    /// Accepts the next client connection.
    pub(crate) async fn accept(
        &mut self,
    ) -> Result<(TcpStream, SocketAddr), DfsError> {
        Ok(self.client_listener.accept().await?)
    }

    /// Spawns a handler task for an accepted client connection.
    pub(crate) fn serve(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> JoinHandle<()> {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle_conn(stream).await {
                pf_warn!("client '{}' request failed: {}", peer, e);
            }
        })
    }
}

impl ClientHandler {
    /// Serves the single request carried by a client connection.
    async fn handle_conn(&self, stream: TcpStream) -> Result<(), DfsError> {
        let (read_half, mut conn_write) = stream.into_split();
        let mut conn_read = BufReader::new(read_half);

        let req = match read_header_line(&mut conn_read, self.io_timeout, false)
            .await
            .and_then(|line| line.map(|l| ClientRequest::parse(&l)).transpose())
        {
            Ok(Some(req)) => req,
            Ok(None) => return Ok(()), // connected and left
            Err(e) => {
                self.reply_error(&mut conn_write, "BAD_REQUEST").await;
                return Err(e);
            }
        };
        pf_debug!("client request: {}", req);

        match req {
            ClientRequest::ListNodes => {
                let reply = ClientReply::Nodes(self.registry.active_nodes());
                self.reply(&mut conn_write, &reply, None).await
            }

            ClientRequest::Upload { filename, len } => {
                if len > self.max_upload_size {
                    self.reply_error(&mut conn_write, "BAD_REQUEST").await;
                    return Err(DfsError::msg(format!(
                        "upload of {} bytes exceeds limit {}",
                        len, self.max_upload_size
                    )));
                }

                let data =
                    read_up_to(&mut conn_read, len, self.io_timeout).await?;
                match self.upload.upload(&filename, len, data).await {
                    Ok(_) => {
                        self.reply(&mut conn_write, &ClientReply::Ok, None)
                            .await
                    }
                    Err(e) => {
                        self.reply_error(&mut conn_write, e.wire_reason())
                            .await;
                        Err(DfsError::msg(format!(
                            "upload '{}': {}",
                            filename, e
                        )))
                    }
                }
            }

            ClientRequest::Download { filename } => {
                match self.download.download(&filename).await {
                    Ok(file) => {
                        self.reply(
                            &mut conn_write,
                            &ClientReply::Size(file.size),
                            Some(&file.data[..]),
                        )
                        .await
                    }
                    Err(e) => {
                        self.reply_error(&mut conn_write, e.wire_reason())
                            .await;
                        Err(DfsError::msg(format!(
                            "download '{}': {}",
                            filename, e
                        )))
                    }
                }
            }
        }
    }

    async fn reply(
        &self,
        conn_write: &mut OwnedWriteHalf,
        reply: &ClientReply,
        payload: Option<&[u8]>,
    ) -> Result<(), DfsError> {
        write_framed(conn_write, &reply.to_string(), payload, self.io_timeout)
            .await
    }

    /// Best-effort error reply; the peer may already be gone.
    async fn reply_error(&self, conn_write: &mut OwnedWriteHalf, reason: &str) {
        let reply = ClientReply::Error(reason.into());
        if let Err(e) = self.reply(conn_write, &reply, None).await {
            pf_debug!("error reply '{}' not delivered: {}", reply, e);
        }
    }
}
