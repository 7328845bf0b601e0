//! Master node-facing registration endpoint.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::master::NodeRegistry;
use crate::utils::{read_header_line, tcp_bind_with_retry, DfsError};

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Longest node ID accepted, in bytes.
const MAX_NODE_ID_LEN: usize = 64;

/// Checks that a node ID is non-empty and made of `[A-Za-z0-9._-]` only, so
/// that it can never collide with a field or list separator.
pub fn validate_node_id(node: &str) -> Result<(), DfsError> {
    if node.is_empty() || node.len() > MAX_NODE_ID_LEN {
        return Err(DfsError::msg(format!(
            "node ID must be 1..={} bytes long",
            MAX_NODE_ID_LEN
        )));
    }
    if !node
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(DfsError::msg(format!("invalid node ID '{}'", node)));
    }
    Ok(())
}

/// One-shot message from a storage node. No reply is sent.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum NodeMsg {
    /// Registers (or refreshes) a node and the port its chunk server listens
    /// on; the host part is taken from the connection's peer address.
    Register { node: String, chunk_port: u16 },

    /// Refreshes liveness of an already registered node.
    Heartbeat { node: String },
}

impl NodeMsg {
    /// Parses a message line (without its terminator).
    pub fn parse(line: &str) -> Result<Self, DfsError> {
        if let Some(rest) = line.strip_prefix("REGISTER::") {
            let (node, port) = rest.split_once("::").ok_or_else(|| {
                DfsError::msg(format!("malformed REGISTER '{}'", line))
            })?;
            validate_node_id(node)?;
            Ok(NodeMsg::Register {
                node: node.into(),
                chunk_port: port.parse()?,
            })
        } else if let Some(node) = line.strip_prefix("HEARTBEAT::") {
            validate_node_id(node)?;
            Ok(NodeMsg::Heartbeat { node: node.into() })
        } else {
            Err(DfsError::msg(format!("unknown node message '{}'", line)))
        }
    }
}

impl fmt::Display for NodeMsg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeMsg::Register { node, chunk_port } => {
                write!(f, "REGISTER::{}::{}", node, chunk_port)
            }
            NodeMsg::Heartbeat { node } => write!(f, "HEARTBEAT::{}", node),
        }
    }
}

/// The node-facing registration listener. Each accepted connection carries
/// one message and is handled on its own task.
pub(crate) struct NodeReigner {
    registry: Arc<NodeRegistry>,

    node_listener: TcpListener,

    /// Bound on reading a node's message.
    io_timeout: Duration,
}

impl NodeReigner {
    /// Creates the node-facing endpoint and binds its listener.
    pub(crate) async fn new_and_setup(
        node_addr: SocketAddr,
        registry: Arc<NodeRegistry>,
        io_timeout: Duration,
    ) -> Result<Self, DfsError> {
        let node_listener = tcp_bind_with_retry(node_addr, 10).await?;
        pf_info!("accepting nodes on '{}'", node_listener.local_addr()?);
        Ok(NodeReigner {
            registry,
            node_listener,
            io_timeout,
        })
    }

    /// Actual bound address of the listener.
    pub(crate) fn local_addr(&self) -> Result<SocketAddr, DfsError> {
        Ok(self.node_listener.local_addr()?)
    }

    /// Accepts the next node connection.
    pub(crate) async fn accept(
        &mut self,
    ) -> Result<(TcpStream, SocketAddr), DfsError> {
        Ok(self.node_listener.accept().await?)
    }

    /// Spawns a handler task for an accepted node connection. Handler
    /// failures are logged and confined to that connection.
    pub(crate) fn serve(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let io_timeout = self.io_timeout;
        tokio::spawn(async move {
            if let Err(e) =
                Self::handle_conn(registry, stream, peer, io_timeout).await
            {
                pf_warn!("bad node message from '{}': {}", peer, e);
            }
        })
    }

    /// Reads and applies one node message.
    async fn handle_conn(
        registry: Arc<NodeRegistry>,
        stream: TcpStream,
        peer: SocketAddr,
        io_timeout: Duration,
    ) -> Result<(), DfsError> {
        let mut conn_read = BufReader::new(stream);
        let line = match read_header_line(&mut conn_read, io_timeout, true)
            .await?
        {
            Some(line) => line,
            None => return Ok(()), // connected and left; nothing to do
        };

        match NodeMsg::parse(&line)? {
            NodeMsg::Register { node, chunk_port } => {
                registry.register(&node, SocketAddr::new(peer.ip(), chunk_port));
            }
            NodeMsg::Heartbeat { node } => {
                if !registry.heartbeat(&node) {
                    pf_debug!("heartbeat from unknown node '{}' ignored", node);
                }
            }
        }
        Ok(())
    }
}
