//! Filesystem-backed object store.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::{ObjectStore, StorageError};

/// Stores each key as a file under a root directory. Writes go through a
/// temporary file and a rename so readers never observe a torn blob.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        path
    }
}

impl ObjectStore for FsStore {
    fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        match fs::read(self.path_for(key)) {
            Ok(buf) => Ok(Bytes::from(buf)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn put(&self, key: &str, payload: Bytes) -> Result<(), StorageError> {
        let final_path = self.path_for(key);
        let io_err = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp_path = final_path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(io_err)?;
        file.write_all(&payload).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp_path, &final_path).map_err(io_err)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        collect(&self.root, &self.root, &mut keys).map_err(|source| StorageError::Io {
            key: prefix.to_string(),
            source,
        })?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect(root, &path, out)?;
        } else if path.extension().map(|e| e != "tmp").unwrap_or(true) {
            if let Ok(rel) = path.strip_prefix(root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = FsStore::new(temp.path());
        store
            .put("totals/abc/full-0-100", Bytes::from_static(b"hello"))
            .unwrap();
        assert_eq!(
            store.get("totals/abc/full-0-100").unwrap(),
            Bytes::from_static(b"hello")
        );
    }

    #[test]
    fn missing_key_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = FsStore::new(temp.path());
        let err = store.get("nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_filters_by_prefix_and_sorts() {
        let temp = TempDir::new().unwrap();
        let store = FsStore::new(temp.path());
        store.put("a/fp/full-0-10", Bytes::new()).unwrap();
        store.put("a/fp/partial-10-20", Bytes::new()).unwrap();
        store.put("b/fp/full-0-10", Bytes::new()).unwrap();

        let keys = store.list("a/fp/").unwrap();
        assert_eq!(keys, vec!["a/fp/full-0-10", "a/fp/partial-10-20"]);
    }

    #[test]
    fn overwrite_is_atomic_replacement() {
        let temp = TempDir::new().unwrap();
        let store = FsStore::new(temp.path());
        store.put("k", Bytes::from_static(b"one")).unwrap();
        store.put("k", Bytes::from_static(b"two")).unwrap();
        assert_eq!(store.get("k").unwrap(), Bytes::from_static(b"two"));
    }
}
