//! Records describing objects held by the remote object store.

use serde::{Deserialize, Serialize};

use crate::id::{FileId, FolderId, SessionId};

/// Files of at least this many bytes go through a chunked upload session.
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 20_000_000;

/// A folder owned by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    /// Store-issued identifier
    pub id: FolderId,

    /// Human readable name
    pub name: String,
}

impl RemoteFolder {
    /// Create a folder record.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: FolderId::new(id),
            name: name.into(),
        }
    }
}

/// A file stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Store-issued identifier
    pub id: FileId,

    /// File name inside its folder
    pub name: String,

    /// Size in bytes
    pub size: u64,
}

/// A chunked upload negotiated with the remote store.
///
/// The store decides `part_size` and `total_parts`; every part except the
/// last is exactly `part_size` bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Store-issued identifier
    pub id: SessionId,

    /// Bytes per part
    pub part_size: u64,

    /// Number of parts the store expects
    pub total_parts: u64,

    /// Size of the whole file
    pub file_size: u64,
}

impl UploadSession {
    /// Byte offset of part `index` (zero based).
    pub fn part_offset(&self, index: u64) -> u64 {
        index * self.part_size
    }

    /// Expected length of part `index`; the last part may be short.
    pub fn part_len(&self, index: u64) -> u64 {
        let offset = self.part_offset(index);
        self.file_size.saturating_sub(offset).min(self.part_size)
    }
}

/// Acknowledgement for one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDescriptor {
    /// Store-issued part identifier
    pub part_id: String,

    /// Offset of the part within the file
    pub offset: u64,

    /// Part length in bytes
    pub size: u64,

    /// Base64 SHA-1 of the part
    pub sha1: String,
}
