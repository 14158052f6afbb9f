//! File-based local store for persistent storage.

use crate::backend::{LocalStore, Partition};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const VALUE_EXTENSION: &str = "bin";
const TEMP_EXTENSION: &str = "tmp";

/// A directory-backed local store.
///
/// Layout: `<root>/<partition>/<hex(key)>.bin`. Keys are hex-encoded so any
/// UTF-8 key maps onto a portable file name.
///
/// # Durability
///
/// `put` writes a temporary sibling file, syncs it and renames it over the
/// target, so a crash never leaves a half-written value behind.
///
/// # Example
///
/// ```no_run
/// use casesync_storage::{FileStore, LocalStore, Partition};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("casesync-data")).unwrap();
/// store.put(Partition::Snapshot, "owner-1", b"...").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    lock: RwLock<()>,
}

impl FileStore {
    /// Opens or creates a store rooted at `root`.
    ///
    /// Creates one directory per partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn open(root: &Path) -> StorageResult<Self> {
        for partition in Partition::ALL {
            fs::create_dir_all(root.join(partition.name()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            lock: RwLock::new(()),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, partition: Partition, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "empty key".into(),
            });
        }
        let name = format!("{}.{}", hex::encode(key.as_bytes()), VALUE_EXTENSION);
        Ok(self.root.join(partition.name()).join(name))
    }
}

fn decode_file_name(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != VALUE_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let bytes = hex::decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}

impl LocalStore for FileStore {
    fn get(&self, partition: Partition, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.value_path(partition, key)?;
        let _guard = self.lock.read();
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, partition: Partition, key: &str, value: &[u8]) -> StorageResult<()> {
        let path = self.value_path(partition, key)?;
        let temp = path.with_extension(TEMP_EXTENSION);
        let _guard = self.lock.write();

        {
            let mut file = File::create(&temp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn delete(&self, partition: Partition, key: &str) -> StorageResult<()> {
        let path = self.value_path(partition, key)?;
        let _guard = self.lock.write();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_all(&self, partition: Partition) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let dir = self.root.join(partition.name());
        let _guard = self.lock.read();

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match decode_file_name(&path) {
                Some(key) => entries.push((key, fs::read(&path)?)),
                None => {
                    tracing::debug!(path = %path.display(), "skipping foreign file in store");
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_open_creates_partitions() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        for partition in Partition::ALL {
            assert!(store.root().join(partition.name()).is_dir());
        }
    }

    #[test]
    fn file_put_and_get() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.put(Partition::Snapshot, "owner/1", b"hello").unwrap();
        assert_eq!(
            store.get(Partition::Snapshot, "owner/1").unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(store.get(Partition::Deletions, "owner/1").unwrap(), None);
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).unwrap();
            store.put(Partition::DocumentBlob, "doc-1", b"persistent data").unwrap();
        }

        {
            let store = FileStore::open(dir.path()).unwrap();
            assert_eq!(
                store.get(Partition::DocumentBlob, "doc-1").unwrap(),
                Some(b"persistent data".to_vec())
            );
        }
    }

    #[test]
    fn file_put_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put(Partition::Settings, "k", b"v").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path().join("settings"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].extension().unwrap(), VALUE_EXTENSION);
    }

    #[test]
    fn file_delete() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put(Partition::DocumentMeta, "doc", b"x").unwrap();
        store.delete(Partition::DocumentMeta, "doc").unwrap();
        assert_eq!(store.get(Partition::DocumentMeta, "doc").unwrap(), None);
        assert!(store.delete(Partition::DocumentMeta, "doc").is_ok());
    }

    #[test]
    fn file_get_all_sorted() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put(Partition::DocumentMeta, "zeta", b"3").unwrap();
        store.put(Partition::DocumentMeta, "alpha", b"1").unwrap();
        store.put(Partition::DocumentMeta, "mid", b"2").unwrap();

        let keys: Vec<_> = store
            .get_all(Partition::DocumentMeta)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn file_empty_key_rejected() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let result = store.put(Partition::Settings, "", b"v");
        assert!(matches!(result, Err(StorageError::InvalidKey { .. })));
    }
}
