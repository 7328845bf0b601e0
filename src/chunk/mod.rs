//! Chunk channel between the master and storage nodes: wire messages and
//! the push/pull transport.

mod messages;
mod transport;

pub use messages::{validate_filename, ChunkReply, ChunkRequest};
pub use transport::{ChunkTransport, TcpChunkTransport};
