//! Typed domain entities.
//!
//! The tree is `Client → Case → Stage → Session` and `Invoice → InvoiceItem`.
//! Every other entity is flat. Attributes the sync core does not interpret
//! are carried in each entity's `attributes` map so nothing is lost when a
//! record travels through a flat row and back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A client and the cases opened for them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Client {
    /// Primary key.
    pub id: String,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Cases of this client.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<Case>,
    /// Uninterpreted attributes.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A case and its procedural stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// Primary key.
    pub id: String,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Stages of this case.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,
    /// Uninterpreted attributes.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A stage of a case and its sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Primary key.
    pub id: String,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Sessions held in this stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<Session>,
    /// Uninterpreted attributes.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A session (hearing) within a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Primary key.
    pub id: String,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Uninterpreted attributes.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// An invoice and its line items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Primary key.
    pub id: String,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Line items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<InvoiceItem>,
    /// Uninterpreted attributes.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A single invoice line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    /// Primary key.
    pub id: String,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Uninterpreted attributes.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A flat entity keyed by `id`.
///
/// Used for admin tasks, appointments, accounting entries, profiles and
/// site financial entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatRecord {
    /// Primary key.
    pub id: String,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Uninterpreted attributes.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// An assistant, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assistant {
    /// Primary key.
    pub name: String,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Uninterpreted attributes.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// The whole entity tree owned by one data owner.
///
/// Case documents are not part of the snapshot; they live in their own
/// metadata records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppData {
    /// Clients with their nested cases, stages and sessions.
    pub clients: Vec<Client>,
    /// Invoices with their items.
    pub invoices: Vec<Invoice>,
    /// Administrative tasks.
    pub admin_tasks: Vec<FlatRecord>,
    /// Appointments.
    pub appointments: Vec<FlatRecord>,
    /// Accounting entries.
    pub accounting_entries: Vec<FlatRecord>,
    /// Assistants.
    pub assistants: Vec<Assistant>,
    /// Profiles.
    pub profiles: Vec<FlatRecord>,
    /// Site financial entries.
    pub site_finances: Vec<FlatRecord>,
}

/// Where a document's content currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    /// Content is local and waits for upload.
    PendingUpload,
    /// Content is remote and waits for download.
    PendingDownload,
    /// A download is in flight.
    Downloading,
    /// Content exists both locally and remotely.
    Synced,
    /// Remote copy evicted; this device holds the only copy.
    Archived,
    /// The last transfer failed.
    Error,
    /// Content is gone remotely and was never cached here.
    Expired,
}

impl DocumentState {
    /// All states, for reporting.
    pub const ALL: [DocumentState; 7] = [
        DocumentState::PendingUpload,
        DocumentState::PendingDownload,
        DocumentState::Downloading,
        DocumentState::Synced,
        DocumentState::Archived,
        DocumentState::Error,
        DocumentState::Expired,
    ];

    /// Stable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::PendingUpload => "pending_upload",
            DocumentState::PendingDownload => "pending_download",
            DocumentState::Downloading => "downloading",
            DocumentState::Synced => "synced",
            DocumentState::Archived => "archived",
            DocumentState::Error => "error",
            DocumentState::Expired => "expired",
        }
    }

    /// Whether a manual fetch may re-attempt a download.
    pub fn allows_manual_fetch(&self) -> bool {
        matches!(self, DocumentState::PendingDownload | DocumentState::Error)
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of a binary attachment belonging to a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseDocument {
    /// Primary key.
    pub id: String,
    /// Owning case.
    pub case_id: String,
    /// Uploading user.
    pub user_id: String,
    /// Original file name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// Content size in bytes.
    pub size: u64,
    /// When the document was added.
    pub added_at: DateTime<Utc>,
    /// Remote blob path.
    pub storage_path: String,
    /// Device-local content state. Never pushed.
    pub local_state: DocumentState,
    /// Last modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CaseDocument {
    /// Creates metadata for content that is already on this device.
    ///
    /// The document starts in `pending_upload` with its deterministic
    /// storage path.
    pub fn new_local(
        id: impl Into<String>,
        case_id: impl Into<String>,
        user_id: impl Into<String>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        added_at: DateTime<Utc>,
    ) -> Self {
        let id = id.into();
        let case_id = case_id.into();
        let user_id = user_id.into();
        let name = name.into();
        let storage_path = Self::storage_path_for(&user_id, &case_id, &id, &name);
        Self {
            id,
            case_id,
            user_id,
            name,
            mime_type: mime_type.into(),
            size,
            added_at,
            storage_path,
            local_state: DocumentState::PendingUpload,
            updated_at: Some(added_at),
        }
    }

    /// Deterministic blob path: `{user}/{case}/{document}-{file name}`.
    ///
    /// The file name is reduced to ASCII alphanumerics, `.`, `-` and `_`.
    pub fn storage_path_for(user_id: &str, case_id: &str, document_id: &str, name: &str) -> String {
        let sanitized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if sanitized.is_empty() {
            format!("{user_id}/{case_id}/{document_id}")
        } else {
            format!("{user_id}/{case_id}/{document_id}-{sanitized}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_kept_in_attributes() {
        let client: Client = serde_json::from_value(json!({
            "id": "c1",
            "full_name": "Salma",
            "phone": "555",
        }))
        .unwrap();
        assert_eq!(client.attributes.get("full_name"), Some(&json!("Salma")));
        assert!(client.cases.is_empty());

        let back = serde_json::to_value(&client).unwrap();
        assert_eq!(back, json!({"id": "c1", "full_name": "Salma", "phone": "555"}));
    }

    #[test]
    fn document_state_names() {
        for state in DocumentState::ALL {
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, json!(state.as_str()));
        }
        assert!(DocumentState::Error.allows_manual_fetch());
        assert!(DocumentState::PendingDownload.allows_manual_fetch());
        assert!(!DocumentState::Expired.allows_manual_fetch());
        assert!(!DocumentState::Archived.allows_manual_fetch());
    }

    #[test]
    fn storage_path_is_deterministic_and_sanitized() {
        let path = CaseDocument::storage_path_for("u1", "case-9", "d1", "عقد final (v2).pdf");
        assert_eq!(path, "u1/case-9/d1-____final__v2_.pdf");
        assert_eq!(CaseDocument::storage_path_for("u", "c", "d", ""), "u/c/d");
    }

    #[test]
    fn new_local_document_is_pending_upload() {
        let now = Utc::now();
        let doc = CaseDocument::new_local("d1", "c1", "u1", "scan.png", "image/png", 10, now);
        assert_eq!(doc.local_state, DocumentState::PendingUpload);
        assert_eq!(doc.storage_path, "u1/c1/d1-scan.png");
        assert_eq!(doc.updated_at, Some(now));
    }
}
