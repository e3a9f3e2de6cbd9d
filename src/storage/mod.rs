//! Durable blob storage: a flat key namespace with get/put/list.
//!
//! Every persisted artifact (store snapshots, output-cache segments) is
//! content-addressed, so concurrent writers of the same key are writing
//! identical bytes and blind overwrite is safe.

mod fs;
mod mem;

pub use fs::FsStore;
pub use mem::MemoryStore;

use bytes::Bytes;
use thiserror::Error;

use crate::error::ErrorCode;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {key:?} not found")]
    NotFound { key: String },
    #[error("storage i/o on {key:?}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::NotFound { .. } => ErrorCode::NotFound,
            StorageError::Io { .. } => ErrorCode::Storage,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Blob interface over a flat namespace. Keys may contain `/` separators;
/// listing is by string prefix.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Bytes, StorageError>;
    fn put(&self, key: &str, payload: Bytes) -> Result<(), StorageError>;
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
