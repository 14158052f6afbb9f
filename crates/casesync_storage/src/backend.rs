//! Local store trait definition.

use crate::error::StorageResult;
use std::fmt;

/// Logical partitions of the local store.
///
/// Each partition is an independent key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    /// Entity tree snapshot, one record per data owner.
    Snapshot,
    /// Pending deletion ids, one record per data owner.
    Deletions,
    /// User settings, one record per data owner.
    Settings,
    /// Attachment metadata, one record per document id.
    DocumentMeta,
    /// Attachment content, one record per document id.
    DocumentBlob,
}

impl Partition {
    /// All partitions, in a stable order.
    pub const ALL: [Partition; 5] = [
        Partition::Snapshot,
        Partition::Deletions,
        Partition::Settings,
        Partition::DocumentMeta,
        Partition::DocumentBlob,
    ];

    /// Stable name used on disk.
    pub fn name(&self) -> &'static str {
        match self {
            Partition::Snapshot => "snapshot",
            Partition::Deletions => "deletions",
            Partition::Settings => "settings",
            Partition::DocumentMeta => "document_meta",
            Partition::DocumentBlob => "document_blob",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A keyed blob store on the device.
///
/// # Invariants
///
/// - `get` returns exactly the bytes of the last successful `put` for the key
/// - `put` replaces the previous value atomically
/// - `delete` of a missing key succeeds
/// - `get_all` returns entries ordered by key
/// - Stores must be `Send + Sync`; all methods take `&self`
pub trait LocalStore: Send + Sync {
    /// Reads the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium cannot be read.
    fn get(&self, partition: Partition, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the write fails.
    fn put(&self, partition: Partition, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal fails.
    fn delete(&self, partition: Partition, key: &str) -> StorageResult<()>;

    /// Returns every `(key, value)` pair of a partition, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition cannot be listed.
    fn get_all(&self, partition: Partition) -> StorageResult<Vec<(String, Vec<u8>)>>;
}

impl<S: LocalStore + ?Sized> LocalStore for std::sync::Arc<S> {
    fn get(&self, partition: Partition, key: &str) -> StorageResult<Option<Vec<u8>>> {
        (**self).get(partition, key)
    }

    fn put(&self, partition: Partition, key: &str, value: &[u8]) -> StorageResult<()> {
        (**self).put(partition, key, value)
    }

    fn delete(&self, partition: Partition, key: &str) -> StorageResult<()> {
        (**self).delete(partition, key)
    }

    fn get_all(&self, partition: Partition) -> StorageResult<Vec<(String, Vec<u8>)>> {
        (**self).get_all(partition)
    }
}
