//! Attachment Lifecycle Manager.
//!
//! Drives each case document through its content states:
//!
//! ```text
//! pending_upload ──upload──▶ synced ──retention──▶ archived
//!       │                      ▲
//!       ▼                      │
//!     error ◀── downloading ◀── pending_download
//!                   │
//!                   ▼
//!                expired
//! ```
//!
//! The upload and download steps handle one document per call; the
//! scheduler calls them from a single task, so each kind has at most one
//! transfer in flight. `archived` is never downgraded automatically.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{Remote, RemoteSlot};
use crate::local::LocalRepository;
use crate::snapshot::SnapshotStore;
use casesync_model::{reconstruct_documents, CaseDocument, DocumentState, Row, Table};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// A state change applied to one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Affected document.
    pub document_id: String,
    /// State before.
    pub from: DocumentState,
    /// State after.
    pub to: DocumentState,
}

/// Result of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Documents archived.
    pub archived: usize,
    /// Documents whose remote removal failed; they stay `synced`.
    pub failed: usize,
}

/// Result of applying reconciled document rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentSync {
    /// Documents first seen remotely, now `pending_download`.
    pub registered: usize,
    /// Known documents whose metadata changed.
    pub updated: usize,
    /// Documents removed because the merge excluded them.
    pub removed: usize,
    /// Rows that could not be typed.
    pub rejected: usize,
}

/// Local document metadata taken at the start of a cycle.
#[derive(Debug, Default)]
pub(crate) struct LocalDocuments {
    /// Metadata rows, as pushed remotely.
    pub rows: Vec<Row>,
    /// Ids of every local document.
    pub known: HashSet<String>,
    /// Documents whose content may not be remote yet: `pending_upload`, and
    /// `error` after a failed upload. Their rows are held back from the
    /// upsert batch unless the remote already has them.
    pub unpublished: HashSet<String>,
}

/// Manages document content between this device and the remote blob store.
pub struct AttachmentManager {
    repo: LocalRepository,
    snapshot: Arc<SnapshotStore>,
    remote: RemoteSlot,
    actor_id: String,
    retention: chrono::Duration,
    // serializes metadata read-modify-write; never held across a transfer
    meta: Mutex<()>,
}

impl AttachmentManager {
    /// Creates a manager.
    pub fn new(
        config: &SyncConfig,
        repo: LocalRepository,
        snapshot: Arc<SnapshotStore>,
        remote: RemoteSlot,
    ) -> Self {
        let retention = chrono::Duration::from_std(config.retention_window)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            repo,
            snapshot,
            remote,
            actor_id: config.actor_id.clone(),
            retention,
            meta: Mutex::new(()),
        }
    }

    /// All documents, oldest first.
    pub fn documents(&self) -> SyncResult<Vec<CaseDocument>> {
        Ok(self.repo.documents()?.value)
    }

    /// One document's metadata.
    pub fn document(&self, id: &str) -> SyncResult<Option<CaseDocument>> {
        self.repo.document(id)
    }

    /// A document's content, if this device holds it.
    pub fn content(&self, id: &str) -> SyncResult<Option<Vec<u8>>> {
        self.repo.blob(id)
    }

    /// Adds a document whose content is on this device.
    ///
    /// The content is stored before the metadata, so a `pending_upload`
    /// record always has content unless it is lost later.
    pub fn add_document(
        &self,
        case_id: &str,
        name: &str,
        mime_type: &str,
        content: &[u8],
        now: DateTime<Utc>,
    ) -> SyncResult<CaseDocument> {
        let doc = CaseDocument::new_local(
            Uuid::new_v4().to_string(),
            case_id,
            self.actor_id.as_str(),
            name,
            mime_type,
            content.len() as u64,
            now,
        );
        self.repo.put_blob(&doc.id, content)?;
        self.repo.save_document(&doc)?;
        tracing::info!(document = %doc.id, case = case_id, size = doc.size, "document added");
        Ok(doc)
    }

    /// Deletes a document locally and queues its remote removal.
    ///
    /// Returns false if the document is unknown.
    pub fn remove_document(&self, id: &str) -> SyncResult<bool> {
        let _guard = self.meta.lock();
        let Some(doc) = self.repo.document(id)? else {
            return Ok(false);
        };
        self.snapshot.queue_deletion(Table::Documents, id)?;
        if doc.local_state != DocumentState::PendingUpload {
            self.snapshot.queue_blob_removal(doc.storage_path.clone())?;
        }
        self.repo.remove_document(id)?;
        tracing::info!(document = id, "document removed");
        Ok(true)
    }

    /// Resets documents left `downloading` by an interrupted run.
    pub fn recover_interrupted(&self) -> SyncResult<usize> {
        let _guard = self.meta.lock();
        let mut recovered = 0;
        for mut doc in self.repo.documents()?.value {
            if doc.local_state == DocumentState::Downloading {
                doc.local_state = DocumentState::PendingDownload;
                self.repo.save_document(&doc)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "reset interrupted downloads");
        }
        Ok(recovered)
    }

    /// Uploads the first `pending_upload` document.
    ///
    /// Returns `None` when there is nothing to do or no remote. Failures
    /// are recorded on the document, never returned.
    pub fn upload_next(&self) -> SyncResult<Option<Transition>> {
        let Some(remote) = self.remote.get() else {
            return Ok(None);
        };
        let next = self.documents()?.into_iter().find(|d| {
            d.local_state == DocumentState::PendingUpload && !d.storage_path.is_empty()
        });
        let Some(doc) = next else {
            return Ok(None);
        };

        let to = match self.repo.blob(&doc.id)? {
            None => {
                tracing::warn!(document = %doc.id, "content lost before upload");
                DocumentState::Error
            }
            Some(bytes) => match remote.put(&doc.storage_path, &bytes) {
                Ok(()) => {
                    tracing::info!(document = %doc.id, path = %doc.storage_path, "document uploaded");
                    DocumentState::Synced
                }
                Err(e) => {
                    tracing::warn!(document = %doc.id, error = %e, "upload failed");
                    DocumentState::Error
                }
            },
        };
        let done = self.transition(&doc.id, DocumentState::PendingUpload, to)?;
        if to == DocumentState::Synced && done.is_some() {
            // its metadata row was held back until now
            self.snapshot.mark_dirty();
        }
        Ok(done)
    }

    /// Downloads the first `pending_download` document.
    ///
    /// Skipped while any document is `downloading`.
    pub fn download_next(&self) -> SyncResult<Option<Transition>> {
        let Some(remote) = self.remote.get() else {
            return Ok(None);
        };
        let docs = self.documents()?;
        if docs
            .iter()
            .any(|d| d.local_state == DocumentState::Downloading)
        {
            tracing::debug!("download in flight; skipping");
            return Ok(None);
        }
        match docs
            .into_iter()
            .find(|d| d.local_state == DocumentState::PendingDownload)
        {
            Some(doc) => self.download(doc, remote.as_ref()),
            None => Ok(None),
        }
    }

    /// Downloads one document on request.
    ///
    /// Only documents in `pending_download` or `error` may be fetched.
    pub fn fetch_now(&self, id: &str) -> SyncResult<Option<Transition>> {
        let remote = self
            .remote
            .get()
            .ok_or_else(|| SyncError::Configuration("no remote for download".into()))?;
        let doc = self
            .repo
            .document(id)?
            .ok_or_else(|| SyncError::ContentMissing {
                document_id: id.to_string(),
            })?;
        if !doc.local_state.allows_manual_fetch() {
            return Err(SyncError::InvalidStateTransition {
                from: doc.local_state.to_string(),
                to: DocumentState::Downloading.to_string(),
            });
        }
        self.download(doc, remote.as_ref())
    }

    fn download(&self, doc: CaseDocument, remote: &dyn Remote) -> SyncResult<Option<Transition>> {
        let from = doc.local_state;
        if self
            .transition(&doc.id, from, DocumentState::Downloading)?
            .is_none()
        {
            return Ok(None);
        }

        let to = match remote.get(&doc.storage_path) {
            Ok(Some(bytes)) => match self.repo.put_blob(&doc.id, &bytes) {
                Ok(()) => {
                    tracing::info!(document = %doc.id, size = bytes.len(), "document downloaded");
                    DocumentState::Synced
                }
                Err(e) => {
                    tracing::warn!(document = %doc.id, error = %e, "could not store downloaded content");
                    DocumentState::Error
                }
            },
            Ok(None) => {
                tracing::info!(document = %doc.id, "content no longer available remotely");
                DocumentState::Expired
            }
            Err(e) => {
                tracing::warn!(document = %doc.id, error = %e, "download failed");
                DocumentState::Error
            }
        };
        Ok(self
            .transition(&doc.id, DocumentState::Downloading, to)?
            .map(|t| Transition { from, ..t }))
    }

    /// Evicts remote content of documents synced before the retention
    /// window, as of `now`.
    pub fn retention_sweep_at(&self, now: DateTime<Utc>) -> SyncResult<SweepReport> {
        let mut report = SweepReport::default();
        let Some(remote) = self.remote.get() else {
            return Ok(report);
        };
        let cutoff = now
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        for doc in self.documents()? {
            if doc.local_state != DocumentState::Synced || doc.added_at >= cutoff {
                continue;
            }
            match remote.remove(std::slice::from_ref(&doc.storage_path)) {
                Ok(()) => {
                    if self
                        .transition(&doc.id, DocumentState::Synced, DocumentState::Archived)?
                        .is_some()
                    {
                        report.archived += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(document = %doc.id, error = %e, "remote eviction failed");
                    report.failed += 1;
                }
            }
        }
        if report.archived > 0 || report.failed > 0 {
            tracing::info!(archived = report.archived, failed = report.failed, "retention sweep");
        }
        Ok(report)
    }

    /// [`AttachmentManager::retention_sweep_at`] with the current time.
    pub fn retention_sweep(&self) -> SyncResult<SweepReport> {
        self.retention_sweep_at(Utc::now())
    }

    /// Metadata rows of every local document, as pushed remotely.
    pub(crate) fn rows(&self) -> SyncResult<LocalDocuments> {
        let docs = self.documents()?;
        let known = docs.iter().map(|d| d.id.clone()).collect();
        let unpublished = docs
            .iter()
            .filter(|d| {
                matches!(
                    d.local_state,
                    DocumentState::PendingUpload | DocumentState::Error
                )
            })
            .map(|d| d.id.clone())
            .collect();
        Ok(LocalDocuments {
            rows: casesync_model::flatten_documents(&docs)?,
            known,
            unpublished,
        })
    }

    /// Applies reconciled document rows.
    ///
    /// Unknown documents are registered as `pending_download`; known ones
    /// keep their local state. Documents in `known_at_start` that the merge
    /// excluded are removed with their content. Documents added after the
    /// sync started are left alone.
    pub(crate) fn apply_merged(
        &self,
        rows: &[Row],
        known_at_start: &HashSet<String>,
    ) -> SyncResult<DocumentSync> {
        let _guard = self.meta.lock();
        let current = self.repo.documents()?.value;
        let (merged, rejections) = reconstruct_documents(rows, &current);

        let mut out = DocumentSync {
            rejected: rejections.len(),
            ..Default::default()
        };
        let merged_ids: HashSet<&str> = merged.iter().map(|d| d.id.as_str()).collect();

        for doc in &merged {
            match current.iter().find(|c| c.id == doc.id) {
                None => {
                    self.repo.save_document(doc)?;
                    out.registered += 1;
                }
                Some(existing) if existing != doc => {
                    self.repo.save_document(doc)?;
                    out.updated += 1;
                }
                Some(_) => {}
            }
        }
        for doc in &current {
            if !merged_ids.contains(doc.id.as_str()) && known_at_start.contains(&doc.id) {
                self.repo.remove_document(&doc.id)?;
                out.removed += 1;
            }
        }

        tracing::debug!(
            registered = out.registered,
            updated = out.updated,
            removed = out.removed,
            "applied document metadata"
        );
        Ok(out)
    }

    /// Moves a document from `from` to `to` if it is still in `from`.
    fn transition(
        &self,
        id: &str,
        from: DocumentState,
        to: DocumentState,
    ) -> SyncResult<Option<Transition>> {
        let _guard = self.meta.lock();
        let Some(mut doc) = self.repo.document(id)? else {
            tracing::debug!(document = id, "document vanished during transition");
            return Ok(None);
        };
        if doc.local_state != from {
            tracing::debug!(document = id, expected = %from, actual = %doc.local_state, "state changed concurrently");
            return Ok(None);
        }
        doc.local_state = to;
        self.repo.save_document(&doc)?;
        Ok(Some(Transition {
            document_id: id.to_string(),
            from,
            to,
        }))
    }
}

impl std::fmt::Debug for AttachmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentManager")
            .field("remote", &self.remote)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}
