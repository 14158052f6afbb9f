//! Merge Reconciler: per-table last-writer-wins.

use crate::mapper::FlatTables;
use crate::row::{KeyFn, Row};
use crate::table::Table;
use crate::tombstone::TombstoneIndex;
use std::collections::{HashMap, HashSet};

/// Lead a local record needs over its remote copy to win.
pub const DEFAULT_SKEW_BUFFER_MS: i64 = 1_000;

/// Outcome of comparing a local record with its remote copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the local record and push it.
    KeepLocal,
    /// Keep the remote record unchanged.
    AcceptRemote,
}

/// Timestamp policy for two copies of the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    /// Clock skew absorbed before local may win, in milliseconds.
    pub skew_buffer_ms: i64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            skew_buffer_ms: DEFAULT_SKEW_BUFFER_MS,
        }
    }
}

impl MergePolicy {
    /// Creates a policy with the given skew buffer.
    pub fn new(skew_buffer_ms: i64) -> Self {
        Self { skew_buffer_ms }
    }

    /// Resolves a conflict from the two `updated_at` values.
    ///
    /// Local wins only when strictly newer than `remote + buffer`. Exact
    /// ties and smaller leads go to the remote.
    pub fn resolve(&self, local_ms: i64, remote_ms: i64) -> Resolution {
        if local_ms > remote_ms.saturating_add(self.skew_buffer_ms) {
            Resolution::KeepLocal
        } else {
            Resolution::AcceptRemote
        }
    }
}

/// Result of reconciling one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableMerge {
    /// Deduplicated merged rows: resolved local rows first, then the
    /// remaining remote rows.
    pub merged: Vec<Row>,
    /// The subset of `merged` that must be pushed.
    pub to_upsert: Vec<Row>,
}

/// Reconciles a local table with its remote copy.
///
/// Rows without a usable key are dropped. Local rows excluded by
/// `tombstones` are skipped; a remote row with the same key is then judged
/// on its own timestamp.
pub fn reconcile_table(
    table: Table,
    key: KeyFn,
    local: &[Row],
    remote: &[Row],
    tombstones: &TombstoneIndex,
    policy: &MergePolicy,
) -> TableMerge {
    let mut remote_by_key: HashMap<String, &Row> = HashMap::with_capacity(remote.len());
    for row in remote {
        if let Some(k) = key(row) {
            remote_by_key.entry(k).or_insert(row);
        }
    }

    let mut out = TableMerge::default();
    let mut resolved: HashSet<String> = HashSet::new();
    let mut dropped = 0usize;

    for row in local {
        let Some(k) = key(row) else {
            dropped += 1;
            continue;
        };
        if resolved.contains(&k) || tombstones.suppresses(table, &k, row.updated_at_millis()) {
            continue;
        }
        match remote_by_key.get(&k) {
            None => {
                out.merged.push(row.clone());
                out.to_upsert.push(row.clone());
            }
            Some(theirs) => {
                match policy.resolve(row.updated_at_millis(), theirs.updated_at_millis()) {
                    Resolution::KeepLocal => {
                        out.merged.push(row.clone());
                        out.to_upsert.push(row.clone());
                    }
                    Resolution::AcceptRemote => out.merged.push((*theirs).clone()),
                }
            }
        }
        resolved.insert(k);
    }

    for row in remote {
        let Some(k) = key(row) else {
            dropped += 1;
            continue;
        };
        if resolved.contains(&k) || tombstones.suppresses(table, &k, row.updated_at_millis()) {
            continue;
        }
        out.merged.push(row.clone());
        resolved.insert(k);
    }

    if dropped > 0 {
        tracing::debug!(%table, dropped, "dropped rows without a key");
    }
    out
}

/// Reconciliation of every table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedTables {
    /// Merged rows per table.
    pub merged: FlatTables,
    /// Rows to push per table.
    pub to_upsert: FlatTables,
}

impl MergedTables {
    /// Keys of the merged rows of a table.
    pub fn keys(&self, table: Table) -> HashSet<String> {
        let key = table.key_fn();
        self.merged.rows(table).iter().filter_map(key).collect()
    }

    /// The rows of `table` to push, with orphans removed.
    ///
    /// A child is only pushed when its parent is part of the merged parent
    /// table. Returns the batch and the number of orphans dropped.
    pub fn push_batch(&self, table: Table) -> (Vec<Row>, usize) {
        let rows = self.to_upsert.rows(table).to_vec();
        match table.parent() {
            Some((parent, _)) => {
                let (kept, dropped) = filter_orphans(table, rows, &self.keys(parent));
                (kept, dropped.len())
            }
            None => (rows, 0),
        }
    }

    /// Folds server-returned rows of `table` back into the merged rows.
    pub fn fold(&mut self, table: Table, returned: Vec<Row>) {
        fold_returned(self.merged.rows_mut(table), table.key_fn(), returned);
    }

    /// Number of rows waiting to be pushed.
    pub fn pending_upserts(&self) -> usize {
        self.to_upsert.total_rows()
    }
}

/// Reconciles every table with its table key.
pub fn reconcile_all(
    local: &FlatTables,
    remote: &FlatTables,
    tombstones: &TombstoneIndex,
    policy: &MergePolicy,
) -> MergedTables {
    let mut out = MergedTables::default();
    for table in Table::PUSH_ORDER {
        let merge = reconcile_table(
            table,
            table.key_fn(),
            local.rows(table),
            remote.rows(table),
            tombstones,
            policy,
        );
        tracing::debug!(
            %table,
            merged = merge.merged.len(),
            to_upsert = merge.to_upsert.len(),
            "reconciled table"
        );
        out.merged.insert(table, merge.merged);
        out.to_upsert.insert(table, merge.to_upsert);
    }
    out
}

/// Splits `rows` into those whose parent key is in `parent_ids` and the
/// orphans. Tables without a parent keep everything.
pub fn filter_orphans(
    table: Table,
    rows: Vec<Row>,
    parent_ids: &HashSet<String>,
) -> (Vec<Row>, Vec<Row>) {
    let Some((_, fk)) = table.parent() else {
        return (rows, Vec::new());
    };
    let (kept, dropped): (Vec<Row>, Vec<Row>) = rows
        .into_iter()
        .partition(|row| row.text(fk).is_some_and(|p| parent_ids.contains(&p)));
    if !dropped.is_empty() {
        tracing::warn!(%table, count = dropped.len(), "dropped orphan rows from push");
    }
    (kept, dropped)
}

/// Replaces rows in `merged` by key with their server-returned version.
///
/// Returned rows with an unknown key are appended.
pub fn fold_returned(merged: &mut Vec<Row>, key: KeyFn, returned: Vec<Row>) {
    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .filter_map(|(i, row)| key(row).map(|k| (k, i)))
        .collect();
    for row in returned {
        let Some(k) = key(&row) else {
            continue;
        };
        match index.get(&k) {
            Some(&i) => merged[i] = row,
            None => {
                index.insert(k, merged.len());
                merged.push(row);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{key_by_id, key_by_name};
    use crate::tombstone::Tombstone;
    use chrono::{DateTime, TimeZone, Utc};

    const T: i64 = 1_700_000_000_000;

    fn ts(ms: i64) -> String {
        DateTime::<Utc>::from_timestamp_millis(ms)
            .unwrap()
            .to_rfc3339()
    }

    fn row(id: &str, updated_ms: i64) -> Row {
        Row::new().with("id", id).with("updated_at", ts(updated_ms))
    }

    fn merge(local: &[Row], remote: &[Row]) -> TableMerge {
        reconcile_table(
            Table::Clients,
            key_by_id,
            local,
            remote,
            &TombstoneIndex::default(),
            &MergePolicy::default(),
        )
    }

    #[test]
    fn sub_second_local_lead_loses() {
        let out = merge(&[row("1", T)], &[row("1", T + 500).with("src", "remote")]);
        assert_eq!(out.merged.len(), 1);
        assert_eq!(out.merged[0].get("src").and_then(|v| v.as_str()), Some("remote"));
        assert!(out.to_upsert.is_empty());
    }

    #[test]
    fn local_newer_beyond_buffer_wins() {
        let out = merge(&[row("1", T + 1500).with("src", "local")], &[row("1", T)]);
        assert_eq!(out.merged[0].get("src").and_then(|v| v.as_str()), Some("local"));
        assert_eq!(out.to_upsert.len(), 1);
    }

    #[test]
    fn exact_tie_goes_to_remote() {
        let policy = MergePolicy::default();
        assert_eq!(policy.resolve(T, T), Resolution::AcceptRemote);
        assert_eq!(policy.resolve(T + 1000, T), Resolution::AcceptRemote);
        assert_eq!(policy.resolve(T + 1001, T), Resolution::KeepLocal);
    }

    #[test]
    fn new_local_rows_pushed_and_remote_only_kept() {
        let out = merge(&[row("1", T)], &[row("2", T)]);
        assert_eq!(out.merged.len(), 2);
        assert_eq!(key_by_id(&out.merged[0]).as_deref(), Some("1"));
        assert_eq!(key_by_id(&out.merged[1]).as_deref(), Some("2"));
        assert_eq!(out.to_upsert.len(), 1);
    }

    #[test]
    fn duplicates_and_keyless_rows_removed() {
        let local = [row("1", T), row("1", T), Row::new().with("updated_at", ts(T))];
        let out = merge(&local, &[row("1", T - 5000), row("1", T - 5000)]);
        assert_eq!(out.merged.len(), 1);
        assert_eq!(out.to_upsert.len(), 1);
    }

    #[test]
    fn assistants_keyed_by_name() {
        let local = [Row::new().with("name", "Hind").with("updated_at", ts(T + 5000))];
        let remote = [Row::new().with("name", "Hind").with("updated_at", ts(T))];
        let out = reconcile_table(
            Table::Assistants,
            key_by_name,
            &local,
            &remote,
            &TombstoneIndex::default(),
            &MergePolicy::default(),
        );
        assert_eq!(out.merged.len(), 1);
        assert_eq!(out.to_upsert.len(), 1);
    }

    #[test]
    fn pending_deletions_exclude_both_sides() {
        let mut tombstones = TombstoneIndex::default();
        tombstones.add_pending(Table::Clients, &["1".to_string()]);
        let out = reconcile_table(
            Table::Clients,
            key_by_id,
            &[row("1", T + 10_000)],
            &[row("1", T)],
            &tombstones,
            &MergePolicy::default(),
        );
        assert!(out.merged.is_empty());
        assert!(out.to_upsert.is_empty());
    }

    #[test]
    fn orphan_cases_not_pushed() {
        let local = FlatTables::new()
            .with(Table::Clients, vec![row("1", T)])
            .with(
                Table::Cases,
                vec![
                    row("10", T).with("client_id", "1"),
                    row("12", T).with("client_id", "404"),
                ],
            );
        let merged = reconcile_all(
            &local,
            &FlatTables::new(),
            &TombstoneIndex::default(),
            &MergePolicy::default(),
        );
        let (batch, dropped) = merged.push_batch(Table::Cases);
        assert_eq!(batch.len(), 1);
        assert_eq!(dropped, 1);
        assert_eq!(key_by_id(&batch[0]).as_deref(), Some("10"));
    }

    #[test]
    fn returned_rows_replace_by_key() {
        let mut merged = vec![row("1", T), row("2", T)];
        fold_returned(
            &mut merged,
            key_by_id,
            vec![row("2", T + 99).with("server", true), row("3", T)],
        );
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1].get("server"), Some(&serde_json::Value::Bool(true)));
        assert_eq!(merged[1].updated_at_millis(), T + 99);
    }

    #[test]
    fn end_to_end_scenario() {
        let at = |h: u32, m: u32| Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap();
        let stamp = |h: u32, m: u32| at(h, m).to_rfc3339();

        let local = FlatTables::new()
            .with(
                Table::Clients,
                vec![Row::new().with("id", "1").with("updated_at", stamp(10, 0))],
            )
            .with(
                Table::Cases,
                vec![
                    Row::new().with("id", "10").with("client_id", "1"),
                    Row::new()
                        .with("id", "11")
                        .with("client_id", "1")
                        .with("updated_at", stamp(9, 0)),
                ],
            );
        let remote = FlatTables::new().with(
            Table::Clients,
            vec![Row::new().with("id", "1").with("updated_at", stamp(9, 0))],
        );
        let mut tombstones = TombstoneIndex::default();
        tombstones.add_remote(&[Tombstone::new(Table::Cases, "11", at(9, 30), "other")]);

        let out = reconcile_all(&local, &remote, &tombstones, &MergePolicy::default());

        let clients = out.merged.rows(Table::Clients);
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].updated_at_millis(), at(10, 0).timestamp_millis());
        assert_eq!(out.to_upsert.rows(Table::Clients).len(), 1);

        let cases: Vec<_> = out
            .merged
            .rows(Table::Cases)
            .iter()
            .filter_map(key_by_id)
            .collect();
        assert_eq!(cases, vec!["10".to_string()]);
    }
}
