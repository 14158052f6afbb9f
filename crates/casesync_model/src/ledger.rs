//! Pending-deletion ledger.

use crate::table::Table;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Deletions queued on this device and not yet pushed.
///
/// # Invariants
///
/// - Ids are unique per table and kept in queue order
/// - Blob paths are unique and kept in queue order
/// - Tables drain in [`Table::DELETE_ORDER`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingDeletions {
    tables: BTreeMap<Table, Vec<String>>,
    blob_paths: Vec<String>,
}

impl PendingDeletions {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a record deletion. Returns false if it was already queued.
    pub fn queue(&mut self, table: Table, id: impl Into<String>) -> bool {
        let id = id.into();
        let ids = self.tables.entry(table).or_default();
        if ids.contains(&id) {
            return false;
        }
        ids.push(id);
        true
    }

    /// Queues a remote blob removal. Returns false if it was already queued.
    pub fn queue_blob(&mut self, path: impl Into<String>) -> bool {
        let path = path.into();
        if self.blob_paths.contains(&path) {
            return false;
        }
        self.blob_paths.push(path);
        true
    }

    /// Pending ids of a table.
    pub fn ids(&self, table: Table) -> &[String] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pending blob paths.
    pub fn blob_paths(&self) -> &[String] {
        &self.blob_paths
    }

    /// Clears the given ids of a table.
    pub fn clear(&mut self, table: Table, ids: &[String]) {
        if let Some(pending) = self.tables.get_mut(&table) {
            pending.retain(|id| !ids.contains(id));
            if pending.is_empty() {
                self.tables.remove(&table);
            }
        }
    }

    /// Clears the given blob paths.
    pub fn clear_blobs(&mut self, paths: &[String]) {
        self.blob_paths.retain(|p| !paths.contains(p));
    }

    /// Tables with pending ids, children before parents.
    pub fn in_delete_order(&self) -> impl Iterator<Item = (Table, &[String])> {
        Table::DELETE_ORDER
            .into_iter()
            .map(|t| (t, self.ids(t)))
            .filter(|(_, ids)| !ids.is_empty())
    }

    /// Total number of pending record ids.
    pub fn len(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Returns true if nothing is pending (records or blobs).
    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.blob_paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_dedups() {
        let mut ledger = PendingDeletions::new();
        assert!(ledger.queue(Table::Cases, "1"));
        assert!(!ledger.queue(Table::Cases, "1"));
        assert!(ledger.queue(Table::Clients, "1"));
        assert!(ledger.queue_blob("u/c/d"));
        assert!(!ledger.queue_blob("u/c/d"));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn drains_children_first() {
        let mut ledger = PendingDeletions::new();
        ledger.queue(Table::Profiles, "p");
        ledger.queue(Table::Clients, "c");
        ledger.queue(Table::Sessions, "s");
        ledger.queue(Table::Documents, "d");

        let order: Vec<_> = ledger.in_delete_order().map(|(t, _)| t).collect();
        assert_eq!(
            order,
            vec![Table::Documents, Table::Sessions, Table::Clients, Table::Profiles]
        );
    }

    #[test]
    fn clear_removes_only_given_ids() {
        let mut ledger = PendingDeletions::new();
        ledger.queue(Table::Stages, "a");
        ledger.queue(Table::Stages, "b");
        ledger.clear(Table::Stages, &["a".to_string()]);
        assert_eq!(ledger.ids(Table::Stages), ["b".to_string()]);
        ledger.clear(Table::Stages, &["b".to_string()]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn serde_uses_table_names() {
        let mut ledger = PendingDeletions::new();
        ledger.queue(Table::Documents, "d1");
        let json = serde_json::to_value(&ledger).unwrap();
        assert_eq!(json["tables"]["case_documents"][0], "d1");
        let back: PendingDeletions = serde_json::from_value(json).unwrap();
        assert_eq!(back, ledger);
    }
}
