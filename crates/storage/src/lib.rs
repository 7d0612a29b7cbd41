//! Remote storage for shipyard artifacts.
//!
//! This crate provides an [`ObjectStore`] abstraction with Box and local
//! directory implementations, and a [`TransferEngine`] that uploads files
//! and directory trees into any store.

#![warn(missing_docs)]

pub mod trait_;
pub mod digest;
pub mod transfer;
pub mod local_store;
pub mod box_store;

pub use trait_::{ObjectStore, StoreError, Result};
pub use digest::ContentDigest;
pub use transfer::{read_part, NoProgress, TransferEngine, TransferError, TransferProgress, UploadReport};
pub use local_store::LocalStore;
pub use box_store::{BoxCredentials, BoxStore};
