//! dfstore master: node registry, placement, catalog, and the upload and
//! download pipelines.

mod catalog;
mod download;
mod master;
mod placement;
mod reactor;
mod registry;
mod reigner;
mod sweeper;
mod upload;

#[cfg(test)]
mod testkit;

pub use catalog::{ChunkMeta, FileCatalog, FileEntry, UploadHandle};
pub use download::{DownloadError, DownloadPipeline, DownloadedFile};
pub use master::{Master, MasterConfig};
pub use placement::choose_replicas;
pub use reactor::{ClientReply, ClientRequest};
pub use registry::{NodeId, NodeRecord, NodeRegistry};
pub use reigner::{validate_node_id, NodeMsg};
pub use sweeper::Sweeper;
pub use upload::{UploadError, UploadPipeline};
