//! Local filesystem storage backend.

use std::fs;
use std::path::{Path, PathBuf};

use crate::storage::{StorageBackend, StorageError};

/// Storage backend for local filesystem operations.
pub struct LocalStorageBackend {
    root: PathBuf,
}

impl LocalStorageBackend {
    /// Create a new local storage backend rooted at the given path.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Hidden sibling used for write-then-rename. The walk skips hidden files,
    /// so a half-written temp file is never indexed.
    fn temp_path(full_path: &Path) -> PathBuf {
        let name = full_path
            .file_name()
            .map_or_else(|| "entry".to_string(), |n| n.to_string_lossy().to_string());
        full_path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
    }
}

impl StorageBackend for LocalStorageBackend {
    fn read_entry(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        let full_path = self.root.join(path);

        if !full_path.exists() {
            return Err(StorageError::NotFound(full_path.display().to_string()));
        }

        fs::read(&full_path).map_err(|e| StorageError::ReadError(format!("{}: {e}", full_path.display())))
    }

    fn write_entry(&self, path: &Path, content: &str) -> Result<(), StorageError> {
        let full_path = self.root.join(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::WriteError(format!("create dir {}: {e}", parent.display())))?;
        }

        let temp = Self::temp_path(&full_path);
        fs::write(&temp, content).map_err(|e| StorageError::WriteError(format!("{}: {e}", temp.display())))?;
        fs::rename(&temp, &full_path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            StorageError::WriteError(format!("{}: {e}", full_path.display()))
        })
    }

    fn delete_entry(&self, path: &Path) -> Result<(), StorageError> {
        let full_path = self.root.join(path);

        match fs::remove_file(&full_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(full_path.display().to_string()))
            }
            Err(e) => Err(StorageError::DeleteError(format!("{}: {e}", full_path.display()))),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.root.join(path).exists()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn write_creates_parents_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorageBackend::new(dir.path().to_path_buf());

        storage.write_entry(Path::new("notes/a.md"), "hello").unwrap();

        assert_eq!(storage.read_entry(Path::new("notes/a.md")).unwrap(), b"hello");
        let names: Vec<_> = fs::read_dir(dir.path().join("notes"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["a.md"]);
    }

    #[test]
    fn write_replaces_existing_content() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorageBackend::new(dir.path().to_path_buf());

        storage.write_entry(Path::new("a.md"), "one").unwrap();
        storage.write_entry(Path::new("a.md"), "two").unwrap();

        assert_eq!(storage.read_entry(Path::new("a.md")).unwrap(), b"two");
    }

    #[test]
    fn delete_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorageBackend::new(dir.path().to_path_buf());

        assert!(matches!(
            storage.delete_entry(Path::new("gone.md")),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.read_entry(Path::new("gone.md")),
            Err(StorageError::NotFound(_))
        ));
    }
}
