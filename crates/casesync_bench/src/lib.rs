//! Benchmark fixtures.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use casesync_model::{flatten, AppData, Case, Client, FlatTables, Row, Session, Stage, Table};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::Rng;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn jittered(rng: &mut impl Rng) -> Option<DateTime<Utc>> {
    Some(base_time() + Duration::seconds(rng.gen_range(0..86_400)))
}

/// Generate random payload bytes of the given size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate a tree of `clients`, each with `fanout` cases, stages per case
/// and sessions per stage.
pub fn generate_tree(clients: usize, fanout: usize) -> AppData {
    let mut rng = rand::thread_rng();
    let clients = (0..clients)
        .map(|c| Client {
            id: format!("c{c}"),
            updated_at: jittered(&mut rng),
            cases: (0..fanout)
                .map(|k| Case {
                    id: format!("c{c}-k{k}"),
                    updated_at: jittered(&mut rng),
                    stages: (0..fanout)
                        .map(|s| Stage {
                            id: format!("c{c}-k{k}-s{s}"),
                            updated_at: jittered(&mut rng),
                            sessions: (0..fanout)
                                .map(|n| Session {
                                    id: format!("c{c}-k{k}-s{s}-n{n}"),
                                    updated_at: jittered(&mut rng),
                                    ..Default::default()
                                })
                                .collect(),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();
    AppData {
        clients,
        ..Default::default()
    }
}

/// Flattened tree.
pub fn generate_flat(clients: usize, fanout: usize) -> FlatTables {
    flatten(&generate_tree(clients, fanout)).unwrap_or_default()
}

/// A remote copy of `local`: every row's timestamp moved by up to two
/// seconds either way, and a `missing_pct` share of rows left out.
pub fn diverge(local: &FlatTables, missing_pct: u32) -> FlatTables {
    let mut rng = rand::thread_rng();
    let mut remote = FlatTables::new();
    for table in Table::PUSH_ORDER {
        let mut rows: Vec<Row> = Vec::new();
        for row in local.rows(table) {
            if rng.gen_range(0..100) < missing_pct {
                continue;
            }
            let millis = row.updated_at_millis() + rng.gen_range(-2_000..2_000);
            rows.push(match Utc.timestamp_millis_opt(millis).single() {
                Some(shifted) => row.clone().with("updated_at", shifted.to_rfc3339()),
                None => row.clone(),
            });
        }
        remote.insert(table, rows);
    }
    remote
}
