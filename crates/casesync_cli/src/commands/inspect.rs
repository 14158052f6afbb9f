//! Inspect command implementation.

use super::open_repository;
use crate::Format;
use casesync_model::{flatten, DocumentState, Table};
use casesync_sync_engine::LocalRepository;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data owner inspected.
    pub owner: String,
    /// Rows per table after flattening the snapshot.
    pub tables: BTreeMap<String, usize>,
    /// Snapshot entries dropped by validation.
    pub rejected_entries: usize,
    /// Queued deletions per table.
    pub pending_deletions: BTreeMap<String, usize>,
    /// Queued remote blob removals.
    pub pending_blob_removals: usize,
    /// Documents per local state.
    pub documents: BTreeMap<String, usize>,
    /// Documents whose content is on this device.
    pub documents_with_content: usize,
    /// Whether edits trigger automatic syncs.
    pub auto_sync: bool,
    /// Last successful full sync.
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Runs the inspect command.
pub fn run(path: &Path, owner: &str, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let repo = open_repository(path)?;
    let result = collect(&repo, owner)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(path, &result),
    }
    Ok(())
}

/// Gathers the inspection result from a repository.
pub fn collect(
    repo: &LocalRepository,
    owner: &str,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let snapshot = repo.load_snapshot(owner)?;
    let flat = flatten(&snapshot.value)?;
    let ledger = repo.load_deletions(owner)?;
    let docs = repo.documents()?.value;
    let settings = repo.load_settings(owner)?;

    let mut tables: BTreeMap<String, usize> = flat
        .iter()
        .map(|(table, rows)| (table.remote_name().to_string(), rows.len()))
        .collect();
    tables.insert(Table::Documents.remote_name().to_string(), docs.len());

    let pending_deletions = ledger
        .in_delete_order()
        .map(|(table, ids)| (table.remote_name().to_string(), ids.len()))
        .collect();

    let mut documents: BTreeMap<String, usize> = DocumentState::ALL
        .iter()
        .map(|s| (s.to_string(), 0))
        .collect();
    let mut documents_with_content = 0;
    for doc in &docs {
        *documents.entry(doc.local_state.to_string()).or_default() += 1;
        if repo.blob(&doc.id)?.is_some() {
            documents_with_content += 1;
        }
    }

    Ok(InspectResult {
        owner: owner.to_string(),
        tables,
        rejected_entries: snapshot.rejections.len(),
        pending_deletions,
        pending_blob_removals: ledger.blob_paths().len(),
        documents,
        documents_with_content,
        auto_sync: settings.auto_sync,
        last_synced_at: settings.last_synced_at,
    })
}

fn print_text_output(path: &Path, result: &InspectResult) {
    println!("casesync Store Inspection");
    println!("=========================");
    println!();
    println!("Path:  {}", path.display());
    println!("Owner: {}", result.owner);
    println!();
    println!("Tables:");
    for (table, count) in &result.tables {
        println!("  {table:<20} {count}");
    }
    if result.rejected_entries > 0 {
        println!("  ({} entries rejected on load)", result.rejected_entries);
    }
    println!();
    println!("Pending deletions:");
    if result.pending_deletions.is_empty() {
        println!("  none");
    }
    for (table, count) in &result.pending_deletions {
        println!("  {table:<20} {count}");
    }
    println!("  blob removals        {}", result.pending_blob_removals);
    println!();
    println!("Documents:");
    for (state, count) in &result.documents {
        println!("  {state:<20} {count}");
    }
    println!("  with local content   {}", result.documents_with_content);
    println!();
    println!("Settings:");
    println!("  auto sync:   {}", result.auto_sync);
    match result.last_synced_at {
        Some(at) => println!("  last synced: {}", at.to_rfc3339()),
        None => println!("  last synced: never"),
    }
}
