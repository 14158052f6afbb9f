//! Typed access to the on-device store.
//!
//! Values are CBOR documents. Snapshots and document metadata are decoded
//! into loosely-typed JSON first and then pass the validation step, so a
//! corrupted or outdated entry costs only that entry.

use crate::config::SyncSettings;
use crate::error::SyncResult;
use casesync_model::{
    validate_document, validate_snapshot, AppData, CaseDocument, PendingDeletions, RawSnapshot,
    Rejection, Table, Validated,
};
use casesync_storage::{LocalStore, Partition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

fn encode<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)?;
    Ok(buf)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    Ok(ciborium::de::from_reader(bytes)?)
}

/// Repository over a [`LocalStore`].
///
/// Layout: one snapshot, one deletion ledger and one settings record per
/// data owner; one metadata record and one blob record per document id.
#[derive(Clone)]
pub struct LocalRepository {
    store: Arc<dyn LocalStore>,
}

impl LocalRepository {
    /// Wraps a store.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Loads and validates the snapshot of `owner`.
    ///
    /// A missing snapshot is an empty tree. An undecodable one is logged and
    /// treated as empty; the stored bytes are left untouched.
    pub fn load_snapshot(&self, owner: &str) -> SyncResult<Validated<AppData>> {
        let Some(bytes) = self.store.get(Partition::Snapshot, owner)? else {
            return Ok(Validated {
                value: AppData::default(),
                rejections: Vec::new(),
            });
        };
        let raw: RawSnapshot = match decode(&bytes) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(owner, error = %e, "snapshot undecodable; starting empty");
                RawSnapshot::default()
            }
        };
        let validated = validate_snapshot(raw);
        if !validated.is_clean() {
            tracing::warn!(
                owner,
                rejected = validated.rejections.len(),
                "snapshot entries rejected on load"
            );
        }
        Ok(validated)
    }

    /// Persists the snapshot of `owner`.
    pub fn save_snapshot(&self, owner: &str, data: &AppData) -> SyncResult<()> {
        self.store.put(Partition::Snapshot, owner, &encode(data)?)?;
        Ok(())
    }

    /// Loads the deletion ledger of `owner`.
    pub fn load_deletions(&self, owner: &str) -> SyncResult<PendingDeletions> {
        match self.store.get(Partition::Deletions, owner)? {
            Some(bytes) => decode(&bytes),
            None => Ok(PendingDeletions::default()),
        }
    }

    /// Persists the deletion ledger of `owner`.
    pub fn save_deletions(&self, owner: &str, ledger: &PendingDeletions) -> SyncResult<()> {
        self.store.put(Partition::Deletions, owner, &encode(ledger)?)?;
        Ok(())
    }

    /// Loads the settings of `owner`, or defaults.
    pub fn load_settings(&self, owner: &str) -> SyncResult<SyncSettings> {
        match self.store.get(Partition::Settings, owner)? {
            Some(bytes) => decode(&bytes),
            None => Ok(SyncSettings::default()),
        }
    }

    /// Persists the settings of `owner`.
    pub fn save_settings(&self, owner: &str, settings: &SyncSettings) -> SyncResult<()> {
        self.store.put(Partition::Settings, owner, &encode(settings)?)?;
        Ok(())
    }

    /// Loads every document's metadata, ordered by `added_at` then id.
    pub fn documents(&self) -> SyncResult<Validated<Vec<CaseDocument>>> {
        let mut docs = Vec::new();
        let mut rejections = Vec::new();
        for (index, (key, bytes)) in self
            .store
            .get_all(Partition::DocumentMeta)?
            .into_iter()
            .enumerate()
        {
            let parsed = decode::<Value>(&bytes)
                .map_err(|e| Rejection {
                    table: Table::Documents,
                    index,
                    key: Some(key.clone()),
                    reason: e.to_string(),
                })
                .and_then(|value| {
                    validate_document(value).map_err(|r| Rejection {
                        index,
                        key: Some(key.clone()),
                        ..r
                    })
                });
            match parsed {
                Ok(doc) => docs.push(doc),
                Err(rejection) => {
                    tracing::warn!(document = %key, reason = %rejection.reason, "document metadata rejected");
                    rejections.push(rejection);
                }
            }
        }
        docs.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));
        Ok(Validated {
            value: docs,
            rejections,
        })
    }

    /// Loads one document's metadata.
    pub fn document(&self, id: &str) -> SyncResult<Option<CaseDocument>> {
        let Some(bytes) = self.store.get(Partition::DocumentMeta, id)? else {
            return Ok(None);
        };
        let value: Value = decode(&bytes)?;
        match validate_document(value) {
            Ok(doc) => Ok(Some(doc)),
            Err(rejection) => {
                tracing::warn!(document = id, reason = %rejection.reason, "document metadata rejected");
                Ok(None)
            }
        }
    }

    /// Persists one document's metadata.
    pub fn save_document(&self, doc: &CaseDocument) -> SyncResult<()> {
        self.store
            .put(Partition::DocumentMeta, &doc.id, &encode(doc)?)?;
        Ok(())
    }

    /// Removes a document's metadata and content.
    pub fn remove_document(&self, id: &str) -> SyncResult<()> {
        self.store.delete(Partition::DocumentMeta, id)?;
        self.store.delete(Partition::DocumentBlob, id)?;
        Ok(())
    }

    /// Reads a document's content.
    pub fn blob(&self, id: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.store.get(Partition::DocumentBlob, id)?)
    }

    /// Stores a document's content.
    pub fn put_blob(&self, id: &str, bytes: &[u8]) -> SyncResult<()> {
        self.store.put(Partition::DocumentBlob, id, bytes)?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRepository").finish_non_exhaustive()
    }
}
