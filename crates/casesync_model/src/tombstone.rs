//! Deletion tombstones and the resurrection rule.

use crate::table::Table;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Remote table holding tombstones.
pub const TOMBSTONE_TABLE: &str = "sync_deletions";

/// Grace period added to a tombstone before a local edit may outlive it.
pub const DEFAULT_GRACE_MS: i64 = 2_000;

/// A durable record that an entity was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Remote name of the table the record lived in.
    pub table_name: String,
    /// Primary key of the deleted record.
    pub record_id: String,
    /// When it was deleted.
    pub deleted_at: DateTime<Utc>,
    /// Who deleted it.
    pub actor_id: String,
}

impl Tombstone {
    /// Creates a tombstone for a record of `table`.
    pub fn new(
        table: Table,
        record_id: impl Into<String>,
        deleted_at: DateTime<Utc>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table.remote_name().to_string(),
            record_id: record_id.into(),
            deleted_at,
            actor_id: actor_id.into(),
        }
    }
}

/// Everything that keeps a record out of a merge.
///
/// Combines remote tombstones (subject to the resurrection rule) with ids
/// queued for deletion on this device (always excluded).
#[derive(Debug, Clone)]
pub struct TombstoneIndex {
    remote: HashMap<(Table, String), i64>,
    pending: HashSet<(Table, String)>,
    grace_ms: i64,
}

impl Default for TombstoneIndex {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_MS)
    }
}

impl TombstoneIndex {
    /// Creates an empty index with the given grace period.
    pub fn new(grace_ms: i64) -> Self {
        Self {
            remote: HashMap::new(),
            pending: HashSet::new(),
            grace_ms,
        }
    }

    /// Adds remote tombstones. Unknown tables are ignored; for repeated
    /// records the latest deletion time is kept.
    pub fn add_remote<'a>(&mut self, tombstones: impl IntoIterator<Item = &'a Tombstone>) {
        for tombstone in tombstones {
            let Ok(table) = tombstone.table_name.parse::<Table>() else {
                tracing::debug!(table = %tombstone.table_name, "ignoring tombstone for unknown table");
                continue;
            };
            let deleted = tombstone.deleted_at.timestamp_millis();
            self.remote
                .entry((table, tombstone.record_id.clone()))
                .and_modify(|at| *at = (*at).max(deleted))
                .or_insert(deleted);
        }
    }

    /// Adds ids queued for deletion on this device.
    pub fn add_pending<'a>(&mut self, table: Table, ids: impl IntoIterator<Item = &'a String>) {
        for id in ids {
            self.pending.insert((table, id.clone()));
        }
    }

    /// Whether the record `key` of `table`, last updated at `updated_at_ms`,
    /// must be excluded.
    ///
    /// A remote tombstone only applies while
    /// `updated_at < deleted_at + grace`; an edit made after that resurrects
    /// the record.
    pub fn suppresses(&self, table: Table, key: &str, updated_at_ms: i64) -> bool {
        let id = (table, key.to_string());
        if self.pending.contains(&id) {
            return true;
        }
        match self.remote.get(&id) {
            Some(deleted_at) => updated_at_ms < deleted_at.saturating_add(self.grace_ms),
            None => false,
        }
    }

    /// Number of remote tombstones indexed.
    pub fn remote_len(&self) -> usize {
        self.remote.len()
    }

    /// Number of pending ids indexed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
