//! dfstore storage node.

mod heartbeat;
mod node;
mod server;
mod store;

pub use node::{NodeConfig, StorageNode};
pub use store::{ChunkStore, DiskChunkStore, MemoryChunkStore};
