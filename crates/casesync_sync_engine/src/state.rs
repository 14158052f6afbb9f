//! Sync Orchestrator state machine.

use crate::attachments::{AttachmentManager, DocumentSync};
use crate::config::{SyncConfig, SyncSettings};
use crate::error::{SyncError, SyncResult};
use crate::gateway::{Remote, RemoteSlot};
use crate::local::LocalRepository;
use crate::probe::probe_schema;
use crate::snapshot::SnapshotStore;
use casesync_model::{
    flatten, reconcile_all, reconstruct, FlatTables, MergePolicy, MergedTables, PendingDeletions,
    Table, Tombstone, TombstoneIndex,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State of the sync orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No usable remote client. Terminal until reconfigured.
    Unconfigured,
    /// The remote is missing an expected table. Terminal until provisioned.
    Uninitialized,
    /// Configured, no cycle has completed yet.
    Loading,
    /// A cycle is running.
    Syncing,
    /// The last cycle completed.
    Synced,
    /// The last cycle failed.
    Error,
}

impl SyncState {
    /// Returns true if a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Syncing)
    }

    /// Returns true if a manual cycle may start.
    pub fn can_start_sync(&self) -> bool {
        !self.is_active()
    }

    /// Returns true if debounced automatic triggers may start a cycle.
    pub fn accepts_auto_trigger(&self) -> bool {
        matches!(
            self,
            SyncState::Loading | SyncState::Synced | SyncState::Error
        )
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unconfigured => "unconfigured",
            SyncState::Uninitialized => "uninitialized",
            SyncState::Loading => "loading",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of cycles completed (full and refresh).
    pub cycles_completed: u64,
    /// Total number of remote rows fetched.
    pub rows_pulled: u64,
    /// Total number of rows upserted remotely.
    pub rows_pushed: u64,
    /// Total number of record deletions pushed.
    pub deletions_pushed: u64,
    /// Total number of retries.
    pub retries: u64,
    /// Last successful cycle.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Which phases a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Fetch, reconcile, push and publish.
    Full,
    /// Fetch, reconcile and publish; nothing is pushed.
    Refresh,
}

/// Result of one cycle.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// Which phases ran.
    pub mode: SyncMode,
    /// Remote rows fetched.
    pub pulled: usize,
    /// Rows upserted remotely.
    pub pushed: usize,
    /// Record deletions pushed.
    pub deleted: usize,
    /// Blob removals acknowledged by the remote.
    pub blobs_removed: usize,
    /// Child rows left out of upsert batches because their parent is gone.
    pub orphans_dropped: usize,
    /// Document rows held back because their content is not uploaded yet.
    pub documents_held: usize,
    /// Effect on local document metadata.
    pub documents: DocumentSync,
    /// False when a local edit during the cycle made the result stale.
    pub published: bool,
    /// Wall time of the cycle.
    pub duration: Duration,
}

impl SyncOutcome {
    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            pulled: 0,
            pushed: 0,
            deleted: 0,
            blobs_removed: 0,
            orphans_dropped: 0,
            documents_held: 0,
            documents: DocumentSync::default(),
            published: false,
            duration: Duration::ZERO,
        }
    }
}

/// The sync orchestrator.
///
/// Runs reconciliation cycles between the local snapshot and the remote.
/// Cycles are synchronous and never overlap: a second caller gets
/// [`SyncError::AlreadySyncing`]. A failed cycle leaves the local snapshot
/// as it was, except for deletions the remote already acknowledged.
pub struct SyncEngine {
    config: SyncConfig,
    remote: RemoteSlot,
    repo: LocalRepository,
    snapshot: Arc<SnapshotStore>,
    attachments: Arc<AttachmentManager>,
    policy: MergePolicy,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl SyncEngine {
    /// Opens the engine over a local repository.
    ///
    /// Starts in `loading` when `remote` holds a client and in
    /// `unconfigured` otherwise.
    pub fn new(config: SyncConfig, repo: LocalRepository, remote: RemoteSlot) -> SyncResult<Self> {
        let snapshot = Arc::new(SnapshotStore::open(repo.clone(), config.owner_id.clone())?);
        let attachments = Arc::new(AttachmentManager::new(
            &config,
            repo.clone(),
            Arc::clone(&snapshot),
            remote.clone(),
        ));
        let state = if remote.is_configured() {
            SyncState::Loading
        } else {
            SyncState::Unconfigured
        };
        Ok(Self {
            policy: MergePolicy::new(config.skew_buffer_ms()),
            config,
            remote,
            repo,
            snapshot,
            attachments,
            state: RwLock::new(state),
            stats: RwLock::new(SyncStats::default()),
        })
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The local snapshot. Caller edits go through it.
    pub fn snapshot(&self) -> &Arc<SnapshotStore> {
        &self.snapshot
    }

    /// The attachment manager.
    pub fn attachments(&self) -> &Arc<AttachmentManager> {
        &self.attachments
    }

    /// The remote slot shared with the attachment manager.
    pub fn remote(&self) -> &RemoteSlot {
        &self.remote
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Persisted user settings.
    pub fn settings(&self) -> SyncResult<SyncSettings> {
        self.repo.load_settings(&self.config.owner_id)
    }

    /// Turns automatic syncing on or off.
    pub fn set_auto_sync(&self, enabled: bool) -> SyncResult<()> {
        let mut settings = self.settings()?;
        settings.auto_sync = enabled;
        self.repo.save_settings(&self.config.owner_id, &settings)
    }

    /// Replaces the remote client.
    ///
    /// `None` moves the engine to `unconfigured`; a client resets it to
    /// `loading`. A running cycle keeps the client it started with.
    pub fn reconfigure(&self, remote: Option<Arc<dyn Remote>>) {
        let configured = remote.is_some();
        self.remote.set(remote);
        let mut state = self.state.write();
        if !state.is_active() {
            *state = if configured {
                SyncState::Loading
            } else {
                SyncState::Unconfigured
            };
        }
        tracing::info!(configured, "remote reconfigured");
    }

    /// Performs a full cycle: probe, fetch, reconcile, push, publish.
    pub fn sync(&self) -> SyncResult<SyncOutcome> {
        self.run(SyncMode::Full)
    }

    /// Absorbs remote changes without pushing local edits.
    pub fn fetch_and_refresh(&self) -> SyncResult<SyncOutcome> {
        self.run(SyncMode::Refresh)
    }

    /// Performs a full sync, retrying transient errors.
    pub fn sync_with_retry(&self) -> SyncResult<SyncOutcome> {
        let retry_config = &self.config.retry;
        let mut last_error = None;

        for attempt in 0..retry_config.max_attempts {
            if attempt > 0 {
                let delay = retry_config.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, "retrying sync");
                std::thread::sleep(delay);
                self.stats.write().retries += 1;
            }

            match self.sync() {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    if e.is_retryable() && attempt + 1 < retry_config.max_attempts {
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::Configuration("no sync attempts made".into())))
    }

    fn run(&self, mode: SyncMode) -> SyncResult<SyncOutcome> {
        let start = Instant::now();
        let remote = self.begin()?;
        tracing::info!(?mode, "sync started");

        match self.cycle(remote.as_ref(), mode) {
            Ok(mut outcome) => {
                outcome.duration = start.elapsed();
                self.settle(SyncState::Synced);
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.rows_pulled += outcome.pulled as u64;
                    stats.rows_pushed += outcome.pushed as u64;
                    stats.deletions_pushed += outcome.deleted as u64;
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_error = None;
                }
                tracing::info!(
                    ?mode,
                    pulled = outcome.pulled,
                    pushed = outcome.pushed,
                    deleted = outcome.deleted,
                    published = outcome.published,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "sync completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    /// Enters `syncing` and returns the client to use.
    fn begin(&self) -> SyncResult<Arc<dyn Remote>> {
        let mut state = self.state.write();
        if state.is_active() {
            return Err(SyncError::AlreadySyncing);
        }
        let Some(remote) = self.remote.get() else {
            *state = SyncState::Unconfigured;
            return Err(SyncError::Configuration("no remote client".into()));
        };
        *state = SyncState::Syncing;
        Ok(remote)
    }

    fn cycle(&self, remote: &dyn Remote, mode: SyncMode) -> SyncResult<SyncOutcome> {
        let mut outcome = SyncOutcome::new(mode);

        probe_schema(remote)?;

        let view = self.snapshot.view();
        let documents = self.attachments.rows()?;
        let mut local = flatten(&view.data)?;
        local.insert(Table::Documents, documents.rows);

        let (fetched, tombstones) = self.fetch_remote(remote)?;
        outcome.pulled = fetched.total_rows();

        // metadata of content not yet uploaded stays local unless the remote has it
        let key = Table::Documents.key_fn();
        let remote_documents: HashSet<String> =
            fetched.rows(Table::Documents).iter().filter_map(key).collect();
        let held: HashSet<String> = documents
            .unpublished
            .into_iter()
            .filter(|id| !remote_documents.contains(id))
            .collect();

        let mut index = TombstoneIndex::new(self.config.grace_ms());
        index.add_remote(&tombstones);
        for (table, ids) in view.deletions.in_delete_order() {
            index.add_pending(table, ids);
        }
        tracing::debug!(
            remote_tombstones = index.remote_len(),
            pending = index.pending_len(),
            "tombstone index built"
        );

        let mut merged = reconcile_all(&local, &fetched, &index, &self.policy);

        if mode == SyncMode::Full {
            outcome.blobs_removed = self.push_blob_removals(remote, &view.deletions)?;
            outcome.deleted = self.push_deletions(remote, &view.deletions)?;
            let pushed = self.push_upserts(remote, &mut merged, &held)?;
            outcome.pushed = pushed.rows;
            outcome.orphans_dropped = pushed.orphans;
            outcome.documents_held = pushed.held;
        }

        outcome.documents = self
            .attachments
            .apply_merged(merged.merged.rows(Table::Documents), &documents.known)?;

        let rebuilt = reconstruct(&merged.merged);
        if !rebuilt.rejections.is_empty() {
            tracing::warn!(count = rebuilt.rejections.len(), "merged rows rejected");
        }
        outcome.published =
            self.snapshot
                .publish(view.version, rebuilt.data, mode == SyncMode::Full)?;
        if !outcome.published {
            tracing::info!("snapshot edited during sync; publish skipped");
        }

        if mode == SyncMode::Full {
            let mut settings = self.settings()?;
            settings.last_synced_at = Some(Utc::now());
            self.repo.save_settings(&self.config.owner_id, &settings)?;
        }
        Ok(outcome)
    }

    /// Fetches every table and the tombstone window concurrently.
    ///
    /// A failed table fetch fails the cycle; a failed tombstone fetch
    /// yields no tombstones.
    fn fetch_remote(&self, remote: &dyn Remote) -> SyncResult<(FlatTables, Vec<Tombstone>)> {
        let since = self.tombstone_cutoff();
        std::thread::scope(|scope| {
            let tables: Vec<_> = Table::PUSH_ORDER
                .into_iter()
                .map(|table| (table, scope.spawn(move || remote.select(table))))
                .collect();
            let tombstones = scope.spawn(move || remote.tombstones_since(since));

            let mut fetched = FlatTables::new();
            let mut failure = None;
            for (table, handle) in tables {
                match joined(handle.join()) {
                    Ok(rows) => fetched.insert(table, rows),
                    Err(e) => {
                        tracing::warn!(%table, error = %e, "fetch failed");
                        failure.get_or_insert(e);
                    }
                }
            }
            let tombstones = match joined(tombstones.join()) {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(error = %e, "tombstone fetch failed; continuing without");
                    Vec::new()
                }
            };

            match failure {
                Some(e) => Err(e),
                None => Ok((fetched, tombstones)),
            }
        })
    }

    fn tombstone_cutoff(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.config.tombstone_window)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Removes queued attachment blobs. Failures leave them queued.
    fn push_blob_removals(
        &self,
        remote: &dyn Remote,
        ledger: &PendingDeletions,
    ) -> SyncResult<usize> {
        let paths = ledger.blob_paths();
        if paths.is_empty() {
            return Ok(0);
        }
        match remote.remove(paths) {
            Ok(()) => {
                self.snapshot.clear_blob_removals(paths)?;
                tracing::debug!(count = paths.len(), "removed remote blobs");
                Ok(paths.len())
            }
            Err(e) => {
                tracing::warn!(count = paths.len(), error = %e, "blob removal failed; will retry");
                Ok(0)
            }
        }
    }

    /// Pushes queued deletions, children before parents.
    ///
    /// Each table is tombstoned (best effort), deleted and cleared from the
    /// ledger before the next one starts. A failed delete stops here and
    /// keeps that table's ids queued.
    fn push_deletions(&self, remote: &dyn Remote, ledger: &PendingDeletions) -> SyncResult<usize> {
        let now = Utc::now();
        let mut deleted = 0;
        for (table, ids) in ledger.in_delete_order() {
            let tombstones: Vec<Tombstone> = ids
                .iter()
                .map(|id| Tombstone::new(table, id.clone(), now, self.config.actor_id.clone()))
                .collect();
            if let Err(e) = remote.insert_tombstones(&tombstones) {
                tracing::warn!(%table, error = %e, "tombstone insert failed");
            }
            remote.delete(table, ids).map_err(|e| e.on_table(table))?;
            self.snapshot.clear_deletions(table, ids)?;
            deleted += ids.len();
            tracing::debug!(%table, count = ids.len(), "pushed deletions");
        }
        Ok(deleted)
    }

    /// Upserts local winners table by table, parents first, folding the
    /// server's copies back into the merged rows.
    ///
    /// Document rows listed in `held` stay local; they go out in the first
    /// cycle after their content is uploaded.
    fn push_upserts(
        &self,
        remote: &dyn Remote,
        merged: &mut MergedTables,
        held: &HashSet<String>,
    ) -> SyncResult<PushCounts> {
        let mut counts = PushCounts::default();
        for table in Table::PUSH_ORDER {
            let (mut batch, dropped) = merged.push_batch(table);
            counts.orphans += dropped;
            if table == Table::Documents && !held.is_empty() {
                let key = table.key_fn();
                let before = batch.len();
                batch.retain(|row| !key(row).is_some_and(|id| held.contains(&id)));
                counts.held += before - batch.len();
            }
            if batch.is_empty() {
                continue;
            }
            let returned = remote
                .upsert(table, &batch)
                .map_err(|e| e.on_table(table))?;
            counts.rows += batch.len();
            tracing::debug!(%table, count = batch.len(), "pushed upserts");
            merged.fold(table, returned);
        }
        if counts.held > 0 {
            tracing::debug!(held = counts.held, "document rows wait for their upload");
        }
        Ok(counts)
    }

    /// Sets the state a finished cycle leaves behind. A client removed
    /// while the cycle ran wins over the cycle's result.
    fn settle(&self, state: SyncState) {
        let state = if self.remote.is_configured() {
            state
        } else {
            SyncState::Unconfigured
        };
        *self.state.write() = state;
    }

    /// Handles an error by updating state and stats.
    fn handle_error(&self, error: &SyncError) {
        let state = match error {
            SyncError::AlreadySyncing => return,
            SyncError::Configuration(_) => SyncState::Unconfigured,
            SyncError::Schema { .. } => SyncState::Uninitialized,
            _ => SyncState::Error,
        };
        tracing::warn!(error = %error, %state, "sync failed");
        self.settle(state);
        self.stats.write().last_error = Some(error.to_string());
    }
}

#[derive(Debug, Default)]
struct PushCounts {
    rows: usize,
    orphans: usize,
    held: usize,
}

fn joined<T>(result: std::thread::Result<SyncResult<T>>) -> SyncResult<T> {
    result.unwrap_or_else(|_| Err(SyncError::transport_fatal("fetch worker panicked")))
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("owner", &self.config.owner_id)
            .field("state", &self.state())
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRemote, RemoteOp};
    use casesync_model::{Client, Row};
    use casesync_storage::InMemoryStore;

    fn engine_with(remote: Option<Arc<MemoryRemote>>) -> SyncEngine {
        let repo = LocalRepository::new(Arc::new(InMemoryStore::new()));
        let slot = match remote {
            Some(r) => RemoteSlot::new(r),
            None => RemoteSlot::empty(),
        };
        SyncEngine::new(SyncConfig::new("owner", "user-1"), repo, slot).unwrap()
    }

    #[test]
    fn sync_state_predicates() {
        assert!(SyncState::Syncing.is_active());
        assert!(!SyncState::Syncing.can_start_sync());
        assert!(SyncState::Uninitialized.can_start_sync());
        assert!(!SyncState::Uninitialized.accepts_auto_trigger());
        assert!(!SyncState::Unconfigured.accepts_auto_trigger());
        assert!(SyncState::Error.accepts_auto_trigger());
        assert_eq!(SyncState::Loading.to_string(), "loading");
    }

    #[test]
    fn initial_state_depends_on_remote() {
        assert_eq!(engine_with(None).state(), SyncState::Unconfigured);
        assert_eq!(
            engine_with(Some(Arc::new(MemoryRemote::new()))).state(),
            SyncState::Loading
        );
    }

    #[test]
    fn unconfigured_sync_fails() {
        let engine = engine_with(None);
        assert!(matches!(engine.sync(), Err(SyncError::Configuration(_))));
        assert_eq!(engine.state(), SyncState::Unconfigured);

        engine.reconfigure(Some(Arc::new(MemoryRemote::new())));
        assert_eq!(engine.state(), SyncState::Loading);
        assert!(engine.sync().is_ok());
        assert_eq!(engine.state(), SyncState::Synced);
    }

    #[test]
    fn sync_pushes_new_local_rows() {
        let remote = Arc::new(MemoryRemote::new());
        let engine = engine_with(Some(remote.clone()));
        engine
            .snapshot()
            .update(|d| {
                d.clients.push(Client {
                    id: "1".into(),
                    ..Default::default()
                })
            })
            .unwrap();

        let outcome = engine.sync().unwrap();
        assert_eq!(outcome.pushed, 1);
        assert!(outcome.published);
        assert_eq!(remote.rows(Table::Clients).len(), 1);
        assert!(!engine.snapshot().is_dirty());
        // server timestamp folded back
        assert!(engine.snapshot().data().clients[0].updated_at.is_some());
        assert!(engine.settings().unwrap().last_synced_at.is_some());
    }

    #[test]
    fn refresh_pulls_without_pushing() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(
            Table::Clients,
            vec![Row::new().with("id", "r").with("updated_at", "2024-01-01T00:00:00Z")],
        );
        let engine = engine_with(Some(remote.clone()));
        engine
            .snapshot()
            .update(|d| {
                d.clients.push(Client {
                    id: "l".into(),
                    ..Default::default()
                })
            })
            .unwrap();

        let outcome = engine.fetch_and_refresh().unwrap();
        assert_eq!(outcome.pushed, 0);
        assert_eq!(remote.rows(Table::Clients).len(), 1);
        assert_eq!(engine.snapshot().data().clients.len(), 2);
        assert!(engine.snapshot().is_dirty());
    }

    #[test]
    fn tombstone_fetch_failure_is_tolerated() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail(RemoteOp::FetchTombstones, None, true);
        let engine = engine_with(Some(remote));
        assert!(engine.sync().is_ok());
    }

    #[test]
    fn fetch_failure_sets_error_and_retries() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail(RemoteOp::Select, Some(Table::Cases), true);
        let config = SyncConfig::new("owner", "user-1").with_retry(
            crate::config::RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        );
        let repo = LocalRepository::new(Arc::new(InMemoryStore::new()));
        let engine = SyncEngine::new(config, repo, RemoteSlot::new(remote)).unwrap();

        let err = engine.sync_with_retry().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.state(), SyncState::Error);
        let stats = engine.stats();
        assert_eq!(stats.retries, 1);
        assert!(stats.last_error.is_some());
    }

    #[test]
    fn missing_table_is_uninitialized_until_provisioned() {
        let remote = Arc::new(MemoryRemote::new());
        remote.drop_table(Table::Sessions);
        let engine = engine_with(Some(remote.clone()));
        assert!(matches!(engine.sync(), Err(SyncError::Schema { .. })));
        assert_eq!(engine.state(), SyncState::Uninitialized);

        remote.provision();
        assert!(engine.sync().is_ok());
        assert_eq!(engine.state(), SyncState::Synced);
    }
}
