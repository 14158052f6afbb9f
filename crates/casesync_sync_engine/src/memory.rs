//! In-memory remote for tests and offline demos.

use crate::error::{SyncError, SyncResult};
use crate::gateway::{BlobStore, RemoteGateway};
use casesync_model::{Row, Table, Tombstone};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Remote operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    /// Table reads.
    Select,
    /// Table upserts.
    Upsert,
    /// Table deletes.
    Delete,
    /// Schema probe.
    Probe,
    /// Tombstone reads.
    FetchTombstones,
    /// Tombstone inserts.
    InsertTombstones,
    /// Blob writes.
    BlobPut,
    /// Blob reads.
    BlobGet,
    /// Blob removals.
    BlobRemove,
}

/// An in-memory relational remote.
///
/// Upserts stamp `updated_at` with the remote clock, like a database
/// trigger would. Tables can be dropped to simulate an unprovisioned
/// schema and any operation can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    tables: RwLock<HashMap<Table, Vec<Row>>>,
    tombstones: RwLock<Vec<Tombstone>>,
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
    missing: RwLock<HashSet<Table>>,
    failures: RwLock<HashMap<(RemoteOp, Option<Table>), bool>>,
    clock: RwLock<Option<DateTime<Utc>>>,
    log: RwLock<Vec<String>>,
}

impl MemoryRemote {
    /// Creates an empty remote with every table present.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the remote clock. Unpinned, it follows the system clock.
    pub fn set_clock(&self, now: Option<DateTime<Utc>>) {
        *self.clock.write() = now;
    }

    /// Seeds rows without stamping them.
    pub fn seed(&self, table: Table, rows: Vec<Row>) {
        self.tables.write().entry(table).or_default().extend(rows);
    }

    /// Seeds a tombstone.
    pub fn seed_tombstone(&self, tombstone: Tombstone) {
        self.tombstones.write().push(tombstone);
    }

    /// Seeds blob content.
    pub fn seed_blob(&self, path: &str, bytes: &[u8]) {
        self.blobs.write().insert(path.to_string(), bytes.to_vec());
    }

    /// Current rows of a table.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.tables.read().get(&table).cloned().unwrap_or_default()
    }

    /// Current tombstones.
    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.tombstones.read().clone()
    }

    /// Current content at a blob path.
    pub fn blob(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.read().get(path).cloned()
    }

    /// Marks a table as not provisioned.
    pub fn drop_table(&self, table: Table) {
        self.missing.write().insert(table);
    }

    /// Provisions every dropped table again.
    pub fn provision(&self) {
        self.missing.write().clear();
    }

    /// Makes `op` fail, for one table or for all of them.
    pub fn fail(&self, op: RemoteOp, table: Option<Table>, retryable: bool) {
        self.failures.write().insert((op, table), retryable);
    }

    /// Clears every injected failure.
    pub fn heal(&self) {
        self.failures.write().clear();
    }

    /// Mutating operations performed so far, e.g. `upsert:clients:2`.
    pub fn log(&self) -> Vec<String> {
        self.log.read().clone()
    }

    /// Clears the operation log.
    pub fn clear_log(&self) {
        self.log.write().clear();
    }

    fn now(&self) -> DateTime<Utc> {
        (*self.clock.read()).unwrap_or_else(Utc::now)
    }

    fn check(&self, op: RemoteOp, table: Option<Table>) -> SyncResult<()> {
        let failures = self.failures.read();
        let hit = table
            .and_then(|t| failures.get(&(op, Some(t))))
            .or_else(|| failures.get(&(op, None)));
        match hit {
            Some(&retryable) => Err(SyncError::Transport {
                message: format!("injected {op:?} failure"),
                retryable,
            }),
            None => Ok(()),
        }
    }

    fn check_table(&self, op: RemoteOp, table: Table) -> SyncResult<()> {
        self.check(op, Some(table))?;
        if self.missing.read().contains(&table) {
            return Err(SyncError::transport_fatal(format!(
                "relation \"{table}\" does not exist"
            )));
        }
        Ok(())
    }

    fn record(&self, entry: String) {
        self.log.write().push(entry);
    }
}

impl RemoteGateway for MemoryRemote {
    fn select(&self, table: Table) -> SyncResult<Vec<Row>> {
        self.check_table(RemoteOp::Select, table)?;
        Ok(self.rows(table))
    }

    fn upsert(&self, table: Table, rows: &[Row]) -> SyncResult<Vec<Row>> {
        self.check_table(RemoteOp::Upsert, table)?;
        let key = table.key_fn();
        let stamp = self.now().to_rfc3339();
        let mut tables = self.tables.write();
        let stored = tables.entry(table).or_default();

        let mut returned = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(k) = key(row) else {
                return Err(SyncError::transport_fatal(format!(
                    "{table}: row without {}",
                    table.key_column()
                )));
            };
            let row = row.clone().with("updated_at", stamp.as_str());
            match stored.iter_mut().find(|r| key(r).as_deref() == Some(k.as_str())) {
                Some(existing) => *existing = row.clone(),
                None => stored.push(row.clone()),
            }
            returned.push(row);
        }
        drop(tables);

        self.record(format!("upsert:{table}:{}", rows.len()));
        Ok(returned)
    }

    fn delete(&self, table: Table, ids: &[String]) -> SyncResult<()> {
        self.check_table(RemoteOp::Delete, table)?;
        let key = table.key_fn();
        if let Some(rows) = self.tables.write().get_mut(&table) {
            rows.retain(|r| !key(r).is_some_and(|k| ids.contains(&k)));
        }
        self.record(format!("delete:{table}:{}", ids.len()));
        Ok(())
    }

    fn table_exists(&self, table: Table) -> SyncResult<bool> {
        self.check(RemoteOp::Probe, Some(table))?;
        Ok(!self.missing.read().contains(&table))
    }

    fn tombstones_since(&self, since: DateTime<Utc>) -> SyncResult<Vec<Tombstone>> {
        self.check(RemoteOp::FetchTombstones, None)?;
        Ok(self
            .tombstones
            .read()
            .iter()
            .filter(|t| t.deleted_at >= since)
            .cloned()
            .collect())
    }

    fn insert_tombstones(&self, tombstones: &[Tombstone]) -> SyncResult<()> {
        self.check(RemoteOp::InsertTombstones, None)?;
        self.tombstones.write().extend(tombstones.iter().cloned());
        self.record(format!("tombstones:{}", tombstones.len()));
        Ok(())
    }
}

impl BlobStore for MemoryRemote {
    fn put(&self, path: &str, bytes: &[u8]) -> SyncResult<()> {
        self.check(RemoteOp::BlobPut, None)?;
        self.seed_blob(path, bytes);
        self.record(format!("blob_put:{path}"));
        Ok(())
    }

    fn get(&self, path: &str) -> SyncResult<Option<Vec<u8>>> {
        self.check(RemoteOp::BlobGet, None)?;
        Ok(self.blob(path))
    }

    fn remove(&self, paths: &[String]) -> SyncResult<()> {
        self.check(RemoteOp::BlobRemove, None)?;
        let mut blobs = self.blobs.write();
        for path in paths {
            blobs.remove(path);
        }
        drop(blobs);
        self.record(format!("blob_remove:{}", paths.len()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn upsert_stamps_and_replaces_by_key() {
        let remote = MemoryRemote::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        remote.set_clock(Some(now));

        let returned = remote
            .upsert(Table::Clients, &[Row::new().with("id", "1").with("v", 1)])
            .unwrap();
        assert_eq!(returned[0].updated_at_millis(), now.timestamp_millis());

        remote
            .upsert(Table::Clients, &[Row::new().with("id", "1").with("v", 2)])
            .unwrap();
        let rows = remote.rows(Table::Clients);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("v"), Some(&serde_json::json!(2)));
        assert_eq!(remote.log(), vec!["upsert:clients:1", "upsert:clients:1"]);
    }

    #[test]
    fn missing_tables_and_injected_failures() {
        let remote = MemoryRemote::new();
        remote.drop_table(Table::Stages);
        assert!(!remote.table_exists(Table::Stages).unwrap());
        assert!(remote.table_exists(Table::Cases).unwrap());
        assert!(remote.select(Table::Stages).is_err());

        remote.fail(RemoteOp::Delete, Some(Table::Cases), true);
        assert!(remote.delete(Table::Cases, &["1".into()]).unwrap_err().is_retryable());
        assert!(remote.delete(Table::Clients, &["1".into()]).is_ok());

        remote.heal();
        remote.provision();
        assert!(remote.delete(Table::Cases, &["1".into()]).is_ok());
        assert!(remote.select(Table::Stages).is_ok());
    }

    #[test]
    fn blob_namespace() {
        let remote = MemoryRemote::new();
        remote.put("u/c/d", b"pdf").unwrap();
        assert_eq!(remote.get("u/c/d").unwrap(), Some(b"pdf".to_vec()));
        remote.remove(&["u/c/d".into(), "gone".into()]).unwrap();
        assert_eq!(remote.get("u/c/d").unwrap(), None);
    }

    #[test]
    fn tombstones_filtered_by_window() {
        let remote = MemoryRemote::new();
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        remote.seed_tombstone(Tombstone::new(Table::Cases, "1", old, "a"));
        remote.seed_tombstone(Tombstone::new(Table::Cases, "2", recent, "a"));

        let since = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let fetched = remote.tombstones_since(since).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].record_id, "2");
    }
}
