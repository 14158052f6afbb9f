//! Remote gateway abstraction.

use crate::error::SyncResult;
use casesync_model::{Row, Table, Tombstone};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Per-table access to the remote relational store.
///
/// This trait abstracts the network layer so the orchestrator can run
/// against HTTP, an in-memory store for tests, or anything else.
///
/// # Invariants
///
/// - `upsert` resolves conflicts on the table's key column and returns the
///   rows as stored (server-assigned timestamps included)
/// - `delete` of ids that do not exist succeeds
/// - `table_exists` is read-only
pub trait RemoteGateway: Send + Sync {
    /// Reads every row of a table visible to the caller.
    fn select(&self, table: Table) -> SyncResult<Vec<Row>>;

    /// Inserts or updates rows, returning the stored rows.
    fn upsert(&self, table: Table, rows: &[Row]) -> SyncResult<Vec<Row>>;

    /// Deletes rows by key.
    fn delete(&self, table: Table, ids: &[String]) -> SyncResult<()>;

    /// Checks that a table exists. `Ok(false)` means the table is missing;
    /// an error means the check itself failed.
    fn table_exists(&self, table: Table) -> SyncResult<bool>;

    /// Reads tombstones deleted at or after `since`.
    fn tombstones_since(&self, since: DateTime<Utc>) -> SyncResult<Vec<Tombstone>>;

    /// Appends tombstones.
    fn insert_tombstones(&self, tombstones: &[Tombstone]) -> SyncResult<()>;
}

/// The remote blob namespace holding attachment content.
pub trait BlobStore: Send + Sync {
    /// Writes content at `path`, replacing any previous content.
    fn put(&self, path: &str, bytes: &[u8]) -> SyncResult<()>;

    /// Reads content at `path`. `Ok(None)` means it does not exist.
    fn get(&self, path: &str) -> SyncResult<Option<Vec<u8>>>;

    /// Removes content. Paths that are already gone are not an error.
    fn remove(&self, paths: &[String]) -> SyncResult<()>;
}

/// A complete remote: tables plus blobs.
pub trait Remote: RemoteGateway + BlobStore {}

impl<T: RemoteGateway + BlobStore> Remote for T {}

/// The currently configured remote, shared by the orchestrator and the
/// attachment manager.
#[derive(Clone, Default)]
pub struct RemoteSlot {
    inner: Arc<RwLock<Option<Arc<dyn Remote>>>>,
}

impl RemoteSlot {
    /// Creates an empty slot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a slot holding `remote`.
    pub fn new(remote: Arc<dyn Remote>) -> Self {
        let slot = Self::default();
        slot.set(Some(remote));
        slot
    }

    /// Returns the current remote.
    pub fn get(&self) -> Option<Arc<dyn Remote>> {
        self.inner.read().clone()
    }

    /// Replaces the current remote.
    pub fn set(&self, remote: Option<Arc<dyn Remote>>) {
        *self.inner.write() = remote;
    }

    /// Returns true if a remote is configured.
    pub fn is_configured(&self) -> bool {
        self.inner.read().is_some()
    }
}

impl std::fmt::Debug for RemoteSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSlot")
            .field("configured", &self.is_configured())
            .finish()
    }
}
