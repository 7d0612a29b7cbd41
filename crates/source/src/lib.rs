//! Source packaging for shipyard.
//!
//! Picks the files of a project that belong in a deployable artifact and
//! compresses them into a single `.tar.gz`.

#![warn(missing_docs)]

pub mod error;
pub mod tracking;
pub mod select;
pub mod archive;

pub use error::{Result, SourceError};
pub use tracking::{AssumeTracked, GitOracle, TrackedFiles, TrackingError, TrackingOracle};
pub use select::{classify, copy_files, select, Decision, Reason, Selection, SelectionWarning, Selector};
pub use archive::compress;
