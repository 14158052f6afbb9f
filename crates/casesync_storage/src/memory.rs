//! In-memory local store for testing.

use crate::backend::{LocalStore, Partition};
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory local store.
///
/// Suitable for unit tests, integration tests and sessions that do not
/// need to survive a restart.
///
/// # Example
///
/// ```rust
/// use casesync_storage::{InMemoryStore, LocalStore, Partition};
///
/// let store = InMemoryStore::new();
/// store.put(Partition::DocumentBlob, "doc-1", b"pdf bytes").unwrap();
/// assert_eq!(store.len(Partition::DocumentBlob), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: RwLock<BTreeMap<(Partition, String), Vec<u8>>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries in a partition.
    #[must_use]
    pub fn len(&self, partition: Partition) -> usize {
        self.data
            .read()
            .keys()
            .filter(|(p, _)| *p == partition)
            .count()
    }

    /// Returns true if the whole store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Drops every entry of a partition.
    ///
    /// Simulates a cleared blob store in tests.
    pub fn clear_partition(&self, partition: Partition) {
        self.data.write().retain(|(p, _), _| *p != partition);
    }
}

impl LocalStore for InMemoryStore {
    fn get(&self, partition: Partition, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(&(partition, key.to_string())).cloned())
    }

    fn put(&self, partition: Partition, key: &str, value: &[u8]) -> StorageResult<()> {
        self.data
            .write()
            .insert((partition, key.to_string()), value.to_vec());
        Ok(())
    }

    fn delete(&self, partition: Partition, key: &str) -> StorageResult<()> {
        self.data.write().remove(&(partition, key.to_string()));
        Ok(())
    }

    fn get_all(&self, partition: Partition) -> StorageResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .data
            .read()
            .iter()
            .filter(|((p, _), _)| *p == partition)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}
