//! Remote object store abstraction.

use std::path::Path;

use async_trait::async_trait;
use shipyard_core::{FileId, FolderId, PartDescriptor, RemoteFile, RemoteFolder, UploadSession};

use crate::digest::ContentDigest;

/// Error type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors reported by a remote object store, named after the store's own
/// semantics.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error (credentials files)
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An object with the same name already exists
    #[error("{name} already exists (remote id {existing_id})")]
    Conflict {
        /// Name that clashed
        name: String,
        /// Identifier of the existing object
        existing_id: String,
    },

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store asked us to slow down
    #[error("rate limited by remote store")]
    RateLimited,

    /// Commit-time digest or part verification failed
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Any other error response
    #[error("remote store error {status}: {message}")]
    Server {
        /// HTTP-style status code
        status: u16,
        /// Message returned by the store
        message: String,
    },

    /// The request was malformed from the store's point of view
    #[error("{0}")]
    Invalid(String),
}

/// A remote object store the transfer engine can upload into.
///
/// Implementations map their own conflict responses to
/// [`StoreError::Conflict`] carrying the identifier of the existing object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// The folder uploads land in by default.
    async fn root_folder(&self) -> Result<RemoteFolder>;

    /// Create a sub-folder of `parent`.
    async fn create_folder(&self, parent: &FolderId, name: &str) -> Result<RemoteFolder>;

    /// Delete a folder and everything in it.
    async fn delete_folder(&self, id: &FolderId) -> Result<()>;

    /// Upload a whole file in one request.
    async fn upload_file(&self, folder: &FolderId, local_path: &Path) -> Result<RemoteFile>;

    /// Delete a file.
    async fn delete_file(&self, id: &FileId) -> Result<()>;

    /// Open a chunked upload; the store picks part size and count.
    async fn create_upload_session(
        &self,
        folder: &FolderId,
        file_size: u64,
        file_name: &str,
    ) -> Result<UploadSession>;

    /// Upload one part starting at `offset`.
    async fn upload_part(
        &self,
        session: &UploadSession,
        bytes: &[u8],
        offset: u64,
        total_size: u64,
    ) -> Result<PartDescriptor>;

    /// Close the session. The store verifies `digest` against what it received.
    async fn commit_session(
        &self,
        session: &UploadSession,
        digest: &ContentDigest,
        parts: &[PartDescriptor],
    ) -> Result<RemoteFile>;
}
