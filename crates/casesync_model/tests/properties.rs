//! Property tests for the mapper and the reconciler.

use casesync_model::{
    flatten, key_by_id, reconcile_all, reconcile_table, reconstruct, AppData, Case, Client,
    FlatTables, Invoice, InvoiceItem, MergePolicy, Row, Session, Stage, Table, Tombstone,
    TombstoneIndex,
};
use chrono::{DateTime, Utc};
use proptest::prelude::*;
use serde_json::{Map, Value};

const BASE_MS: i64 = 1_700_000_000_000;

fn at(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
}

fn attrs(label: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("label".into(), Value::String(label.to_string()));
    map
}

/// (updated offset, label, cases: [stages: [session count]])
type ClientShape = (Option<i64>, String, Vec<Vec<usize>>);

fn tree_strategy() -> impl Strategy<Value = AppData> {
    let client = (
        prop::option::of(0i64..1_000_000),
        "[a-z]{0,8}",
        prop::collection::vec(prop::collection::vec(0usize..3, 0..3), 0..3),
    );
    let invoice = (prop::option::of(0i64..1_000_000), 0usize..4);
    (
        prop::collection::vec(client, 0..4),
        prop::collection::vec(invoice, 0..3),
    )
        .prop_map(|(clients, invoices)| build_tree(clients, invoices))
}

fn build_tree(clients: Vec<ClientShape>, invoices: Vec<(Option<i64>, usize)>) -> AppData {
    let clients = clients
        .into_iter()
        .enumerate()
        .map(|(ci, (offset, label, cases))| Client {
            id: format!("c{ci}"),
            updated_at: offset.map(|o| at(BASE_MS + o)),
            attributes: attrs(&label),
            cases: cases
                .into_iter()
                .enumerate()
                .map(|(ki, stages)| Case {
                    id: format!("c{ci}-k{ki}"),
                    stages: stages
                        .into_iter()
                        .enumerate()
                        .map(|(si, sessions)| Stage {
                            id: format!("c{ci}-k{ki}-s{si}"),
                            sessions: (0..sessions)
                                .map(|n| Session {
                                    id: format!("c{ci}-k{ki}-s{si}-n{n}"),
                                    ..Default::default()
                                })
                                .collect(),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                })
                .collect(),
        })
        .collect();

    let invoices = invoices
        .into_iter()
        .enumerate()
        .map(|(ii, (offset, items))| Invoice {
            id: format!("i{ii}"),
            updated_at: offset.map(|o| at(BASE_MS + o)),
            items: (0..items)
                .map(|n| InvoiceItem {
                    id: format!("i{ii}-l{n}"),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();

    AppData {
        clients,
        invoices,
        ..Default::default()
    }
}

fn rows_strategy() -> impl Strategy<Value = Vec<Row>> {
    prop::collection::vec((0u8..6, 0i64..10_000), 0..8).prop_map(|entries| {
        entries
            .into_iter()
            .map(|(id, offset)| {
                Row::new()
                    .with("id", id.to_string())
                    .with("updated_at", at(BASE_MS + offset).to_rfc3339())
            })
            .collect()
    })
}

fn tombstones_strategy() -> impl Strategy<Value = Vec<Tombstone>> {
    prop::collection::vec((0u8..6, 0i64..10_000), 0..4).prop_map(|entries| {
        entries
            .into_iter()
            .map(|(id, offset)| {
                Tombstone::new(Table::Clients, id.to_string(), at(BASE_MS + offset), "peer")
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn reconstruct_inverts_flatten(tree in tree_strategy()) {
        let rebuilt = reconstruct(&flatten(&tree).unwrap());
        prop_assert!(rebuilt.orphans.is_empty());
        prop_assert!(rebuilt.rejections.is_empty());
        prop_assert_eq!(rebuilt.data, tree);
    }

    #[test]
    fn reconcile_is_idempotent(
        local in rows_strategy(),
        remote in rows_strategy(),
        tombstones in tombstones_strategy(),
    ) {
        let mut index = TombstoneIndex::default();
        index.add_remote(&tombstones);
        let local = FlatTables::new().with(Table::Clients, local);
        let remote = FlatTables::new().with(Table::Clients, remote);
        let policy = MergePolicy::default();

        let first = reconcile_all(&local, &remote, &index, &policy);
        let second = reconcile_all(&local, &remote, &index, &policy);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn merged_keys_are_unique(local in rows_strategy(), remote in rows_strategy()) {
        let out = reconcile_table(
            Table::Clients,
            key_by_id,
            &local,
            &remote,
            &TombstoneIndex::default(),
            &MergePolicy::default(),
        );
        let mut keys: Vec<_> = out.merged.iter().filter_map(key_by_id).collect();
        let total = keys.len();
        keys.sort();
        keys.dedup();
        prop_assert_eq!(keys.len(), total);
        prop_assert!(out.to_upsert.iter().all(|r| out.merged.contains(r)));
    }

    #[test]
    fn tombstone_purges_or_yields_to_later_edit(
        updated in 0i64..20_000,
        deleted in 0i64..20_000,
    ) {
        let mut index = TombstoneIndex::default();
        index.add_remote(&[Tombstone::new(Table::Clients, "7", at(BASE_MS + deleted), "peer")]);
        let local = [Row::new()
            .with("id", "7")
            .with("updated_at", at(BASE_MS + updated).to_rfc3339())];

        let out = reconcile_table(
            Table::Clients,
            key_by_id,
            &local,
            &[],
            &index,
            &MergePolicy::default(),
        );
        if updated < deleted + 2_000 {
            prop_assert!(out.merged.is_empty());
            prop_assert!(out.to_upsert.is_empty());
        } else {
            prop_assert_eq!(out.merged.len(), 1);
            prop_assert_eq!(out.to_upsert.len(), 1);
        }
    }
}
