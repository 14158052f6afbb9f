//! The explicitly owned, versioned local snapshot.

use crate::error::SyncResult;
use crate::local::LocalRepository;
use casesync_model::{AppData, PendingDeletions, Rejection, Table};
use parking_lot::RwLock;

/// A consistent copy of the snapshot taken at one version.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    /// The entity tree.
    pub data: AppData,
    /// Deletions queued and not yet pushed.
    pub deletions: PendingDeletions,
    /// Version the copy was taken at.
    pub version: u64,
}

#[derive(Debug)]
struct Inner {
    data: AppData,
    deletions: PendingDeletions,
    version: u64,
    dirty: bool,
}

/// The on-device snapshot of one data owner.
///
/// Every caller edit goes through [`SnapshotStore::update`] (or the deletion
/// queue methods), which bumps the version, marks the snapshot dirty and
/// persists it before returning. A sync result is only published if the
/// version it was computed from is still current.
#[derive(Debug)]
pub struct SnapshotStore {
    repo: LocalRepository,
    owner: String,
    inner: RwLock<Inner>,
    rejections: Vec<Rejection>,
}

impl SnapshotStore {
    /// Loads the snapshot and deletion ledger of `owner`.
    ///
    /// Entries rejected by validation are dropped and reported through
    /// [`SnapshotStore::load_rejections`].
    pub fn open(repo: LocalRepository, owner: impl Into<String>) -> SyncResult<Self> {
        let owner = owner.into();
        let validated = repo.load_snapshot(&owner)?;
        let deletions = repo.load_deletions(&owner)?;
        let dirty = !deletions.is_empty();
        tracing::debug!(
            owner = %owner,
            rejected = validated.rejections.len(),
            pending_deletions = deletions.len(),
            "snapshot loaded"
        );
        Ok(Self {
            repo,
            owner,
            inner: RwLock::new(Inner {
                data: validated.value,
                deletions,
                version: 0,
                dirty,
            }),
            rejections: validated.rejections,
        })
    }

    /// The data owner this snapshot belongs to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Entries dropped when the snapshot was loaded.
    pub fn load_rejections(&self) -> &[Rejection] {
        &self.rejections
    }

    /// Takes a consistent copy.
    pub fn view(&self) -> SnapshotView {
        let inner = self.inner.read();
        SnapshotView {
            data: inner.data.clone(),
            deletions: inner.deletions.clone(),
            version: inner.version,
        }
    }

    /// A copy of the entity tree.
    pub fn data(&self) -> AppData {
        self.inner.read().data.clone()
    }

    /// A copy of the deletion ledger.
    pub fn deletions(&self) -> PendingDeletions {
        self.inner.read().deletions.clone()
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Returns true if there are edits not yet pushed.
    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// Flags work for the next sync without changing the tree.
    pub(crate) fn mark_dirty(&self) {
        self.inner.write().dirty = true;
    }

    /// Applies a caller edit.
    ///
    /// The edit is persisted before it becomes visible; if persisting
    /// fails the snapshot is unchanged.
    pub fn update<R>(&self, f: impl FnOnce(&mut AppData) -> R) -> SyncResult<R> {
        let mut inner = self.inner.write();
        let mut data = inner.data.clone();
        let out = f(&mut data);
        self.repo.save_snapshot(&self.owner, &data)?;
        inner.data = data;
        inner.version += 1;
        inner.dirty = true;
        Ok(out)
    }

    /// Queues a record deletion. Returns false if it was already queued.
    pub fn queue_deletion(&self, table: Table, id: impl Into<String>) -> SyncResult<bool> {
        let id = id.into();
        self.edit_ledger(|ledger| ledger.queue(table, id))
    }

    /// Queues a remote blob removal. Returns false if it was already queued.
    pub fn queue_blob_removal(&self, path: impl Into<String>) -> SyncResult<bool> {
        let path = path.into();
        self.edit_ledger(|ledger| ledger.queue_blob(path))
    }

    fn edit_ledger(&self, f: impl FnOnce(&mut PendingDeletions) -> bool) -> SyncResult<bool> {
        let mut inner = self.inner.write();
        let mut ledger = inner.deletions.clone();
        if !f(&mut ledger) {
            return Ok(false);
        }
        self.repo.save_deletions(&self.owner, &ledger)?;
        inner.deletions = ledger;
        inner.version += 1;
        inner.dirty = true;
        Ok(true)
    }

    /// Clears deletions the remote acknowledged.
    pub(crate) fn clear_deletions(&self, table: Table, ids: &[String]) -> SyncResult<()> {
        self.settle_ledger(|ledger| ledger.clear(table, ids))
    }

    /// Clears blob removals the remote acknowledged.
    pub(crate) fn clear_blob_removals(&self, paths: &[String]) -> SyncResult<()> {
        self.settle_ledger(|ledger| ledger.clear_blobs(paths))
    }

    fn settle_ledger(&self, f: impl FnOnce(&mut PendingDeletions)) -> SyncResult<()> {
        let mut inner = self.inner.write();
        let mut ledger = inner.deletions.clone();
        f(&mut ledger);
        self.repo.save_deletions(&self.owner, &ledger)?;
        inner.deletions = ledger;
        Ok(())
    }

    /// Replaces the tree with a sync result computed from `expected_version`.
    ///
    /// Returns false, leaving everything untouched, when the snapshot was
    /// edited since. `settled` clears the dirty flag; a refresh that pushed
    /// nothing passes false.
    pub(crate) fn publish(
        &self,
        expected_version: u64,
        data: AppData,
        settled: bool,
    ) -> SyncResult<bool> {
        let mut inner = self.inner.write();
        if inner.version != expected_version {
            return Ok(false);
        }
        self.repo.save_snapshot(&self.owner, &data)?;
        inner.data = data;
        inner.version += 1;
        if settled {
            inner.dirty = !inner.deletions.is_empty();
        }
        Ok(true)
    }
}
