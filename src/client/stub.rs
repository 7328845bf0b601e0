//! Client-side stub of the master's client-facing API.

use std::error;
use std::fmt;
use std::net::SocketAddr;

use crate::master::{ClientReply, ClientRequest};
use crate::utils::{
    read_header_line, read_payload, tcp_connect_with_timeout, write_framed,
    DfsError,
};

use bytes::Bytes;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::Duration;

/// Outcome of a failed stub call.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum StubError {
    /// The master answered with `ERROR::<reason>`.
    Rejected(String),

    /// Connection, framing, or protocol failure.
    Failed(DfsError),
}

impl fmt::Display for StubError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StubError::Rejected(reason) => {
                write!(f, "rejected by master: {}", reason)
            }
            StubError::Failed(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for StubError {}

impl From<DfsError> for StubError {
    fn from(e: DfsError) -> Self {
        StubError::Failed(e)
    }
}

impl From<StubError> for DfsError {
    fn from(e: StubError) -> Self {
        DfsError::msg(e)
    }
}

/// Default bound on waiting for the master's reply header. The master
/// answers only after every chunk has been replicated or fetched, possibly
/// falling back across slow replicas, so this is far above `io_timeout`.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(300);

/// Master client API stub. Every call opens its own connection.
#[derive(Debug, Clone)]
pub struct MasterStub {
    /// Master's client-facing address.
    addr: SocketAddr,

    connect_timeout: Duration,

    /// Bound on each byte-level read/write step.
    io_timeout: Duration,

    /// Bound on waiting for the reply header once the request is sent.
    reply_timeout: Duration,
}

impl MasterStub {
    /// Creates a new stub talking to the master at `addr`, waiting up to
    /// `DEFAULT_REPLY_TIMEOUT` for each reply.
    pub fn new(
        addr: SocketAddr,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Self {
        MasterStub {
            addr,
            connect_timeout,
            io_timeout,
            reply_timeout: DEFAULT_REPLY_TIMEOUT.max(io_timeout),
        }
    }

    /// Overrides the bound on waiting for reply headers.
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Lists registered node IDs in ring order.
    pub async fn list_nodes(&self) -> Result<Vec<String>, StubError> {
        let (reply, _) = self.call(&ClientRequest::ListNodes, None).await?;
        match reply {
            ClientReply::Nodes(nodes) => Ok(nodes),
            reply => Err(Self::unexpected(reply)),
        }
    }

    /// Uploads `data` as `filename`, replacing any previous version.
    pub async fn upload(
        &self,
        filename: &str,
        data: &[u8],
    ) -> Result<(), StubError> {
        let req = ClientRequest::Upload {
            filename: filename.into(),
            len: data.len(),
        };
        let (reply, _) = self.call(&req, Some(data)).await?;
        match reply {
            ClientReply::Ok => Ok(()),
            reply => Err(Self::unexpected(reply)),
        }
    }

    /// Downloads the whole of `filename`.
    pub async fn download(&self, filename: &str) -> Result<Bytes, StubError> {
        let req = ClientRequest::Download {
            filename: filename.into(),
        };
        match self.call(&req, None).await? {
            (ClientReply::Size(_), Some(data)) => Ok(data),
            (reply, _) => Err(Self::unexpected(reply)),
        }
    }

    /// Sends one request and reads its reply, including the payload that
    /// follows a `SIZE` header.
    async fn call(
        &self,
        req: &ClientRequest,
        payload: Option<&[u8]>,
    ) -> Result<(ClientReply, Option<Bytes>), StubError> {
        let mut stream: TcpStream =
            tcp_connect_with_timeout(self.addr, self.connect_timeout).await?;
        let (conn_read, mut conn_write) = stream.split();
        write_framed(&mut conn_write, &req.to_string(), payload, self.io_timeout)
            .await?;

        let mut conn_read = BufReader::new(conn_read);
        let line = read_header_line(&mut conn_read, self.reply_timeout, false)
            .await?
            .ok_or_else(|| DfsError::msg("master closed without reply"))?;
        match ClientReply::parse(&line)? {
            ClientReply::Error(reason) => Err(StubError::Rejected(reason)),
            ClientReply::Size(len) => {
                let data =
                    read_payload(&mut conn_read, len, self.io_timeout).await?;
                Ok((ClientReply::Size(len), Some(data)))
            }
            reply => Ok((reply, None)),
        }
    }

    fn unexpected(reply: ClientReply) -> StubError {
        StubError::Failed(DfsError::msg(format!("unexpected reply '{}'", reply)))
    }
}
