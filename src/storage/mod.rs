//! Storage backend trait and implementations.
//!
//! Write-tier tools go through a [`StorageBackend`] rooted at a KB directory.
//! The synchronizer reads the tree directly; storage is only the write path.

pub mod local;

use std::path::Path;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Failed to read: {0}")]
    ReadError(String),

    #[error("Failed to write: {0}")]
    WriteError(String),

    #[error("Failed to delete: {0}")]
    DeleteError(String),
}

/// Trait for storage backends holding a KB's entry files.
pub trait StorageBackend: Send + Sync {
    /// Read an entry file's raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the file is missing or cannot be read.
    fn read_entry(&self, path: &Path) -> Result<Vec<u8>, StorageError>;

    /// Write an entry file. The file is either fully written or untouched.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the file cannot be written.
    fn write_entry(&self, path: &Path, content: &str) -> Result<(), StorageError>;

    /// Delete an entry file.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if there is nothing to delete.
    fn delete_entry(&self, path: &Path) -> Result<(), StorageError>;

    /// Check if a path exists in storage.
    fn exists(&self, path: &Path) -> bool;
}
