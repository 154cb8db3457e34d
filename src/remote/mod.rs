//! Client contract for talking to display nodes.
//!
//! The core only needs listings, byte streams in both directions with
//! progress, path creation, deletion and a liveness probe. `http` talks to
//! real nodes, `memory` keeps whole node filesystems in process.

#[cfg(feature = "http_client")]
pub mod http;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::RemoteError;
use crate::model::{FlatEntry, LivenessState, TreeEntry};

#[cfg(feature = "http_client")]
pub use http::HttpShellClient;
pub use memory::MemoryFleet;

/// Called with `(bytes_done, bytes_total)` while a stream is running
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub fn no_progress() -> ProgressFn {
    Arc::new(|_, _| {})
}

/// Mime types a node can render a preview image for
pub const THUMBNAIL_MIME_TYPES: &[&str] = &[
    "video/mp4",
    "image/jpeg",
    "image/png",
    "image/gif",
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.oasis.opendocument.presentation",
];

pub fn supports_thumbnail(mime_type: &str) -> bool {
    THUMBNAIL_MIME_TYPES.contains(&mime_type)
}

/// Operations every node transport provides. Paths are directory paths in
/// the `/a/b/` form; names are single path segments.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Never fails; a probe that could not run reports `Unknown`
    async fn ping(&self, address: &str) -> LivenessState;

    /// Recursive listing of the children of `path`
    async fn list_tree(&self, address: &str, path: &str) -> Result<Vec<TreeEntry>, RemoteError>;

    /// Immediate children of `path` with type and creation time
    async fn list_flat(&self, address: &str, path: &str) -> Result<Vec<FlatEntry>, RemoteError>;

    async fn upload(
        &self,
        address: &str,
        path: &str,
        name: &str,
        data: Bytes,
        progress: ProgressFn,
    ) -> Result<(), RemoteError>;

    async fn download(
        &self,
        address: &str,
        path: &str,
        name: &str,
        size: u64,
        progress: ProgressFn,
    ) -> Result<Bytes, RemoteError>;

    /// Create `path/dirs[0]/dirs[1]/...`, keeping levels that already exist
    async fn create_path(&self, address: &str, path: &str, dirs: &[String]) -> Result<(), RemoteError>;

    /// Remove the named entries of `path` recursively
    async fn delete(&self, address: &str, path: &str, names: &[String]) -> Result<(), RemoteError>;

    /// Preview image, `None` when the node cannot render one
    async fn thumbnail(&self, address: &str, path: &str, name: &str) -> Result<Option<Bytes>, RemoteError>;
}
