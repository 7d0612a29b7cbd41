//! Shipyard core data models.
//!
//! Types shared by source selection, artifact transfer and job graph
//! submission, plus the project configuration they are driven by.

#![warn(missing_docs)]

mod id;
mod fileset;
mod remote;
mod job;
pub mod config;

pub use id::{FileId, FolderId, RemoteJobId, SessionId};
pub use fileset::{normalize_lexically, FileSet, PolicyError, SelectionPolicy};
pub use remote::{PartDescriptor, RemoteFile, RemoteFolder, UploadSession, DEFAULT_CHUNK_THRESHOLD};
pub use job::{ContainerSpec, Dag, JobDefinitionRef, JobNode, SubmittedJob};
pub use config::{BatchConfig, ConfigError, Provider, ShipyardConfig, SourceConfig, StorageConfig};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
