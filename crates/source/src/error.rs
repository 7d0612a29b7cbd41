//! Errors for source selection and archiving.

use std::io;
use std::path::PathBuf;

use shipyard_core::PolicyError;

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Errors that can occur while selecting or archiving sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Invalid include/exclude rules
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Filesystem failure
    #[error("failed to {operation} {}: {source}", .path.display())]
    Io {
        /// What was being attempted
        operation: &'static str,
        /// Path involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Directory traversal failure
    #[error("failed to walk {}: {source}", .path.display())]
    Walk {
        /// Directory being walked
        path: PathBuf,
        /// Underlying error
        source: walkdir::Error,
    },

    /// The archive would end up inside the directory being archived
    #[error("archive {} must not be written inside {}", .archive.display(), .directory.display())]
    ArchiveInsideSource {
        /// Requested archive path
        archive: PathBuf,
        /// Directory being archived
        directory: PathBuf,
    },
}

impl SourceError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}
