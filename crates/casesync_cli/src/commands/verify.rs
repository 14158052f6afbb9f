//! Verify command implementation.

use super::open_repository;
use casesync_model::{flatten, flatten_documents, DocumentState, FlatTables, Table};
use casesync_sync_engine::LocalRepository;
use std::collections::HashSet;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of records checked.
    pub records_checked: usize,
    /// Problems that lose data or block a sync.
    pub errors: Vec<String>,
    /// Conditions worth knowing about.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, owner: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying local store at {}", path.display());
    println!();

    let repo = open_repository(path)?;
    let result = check(&repo, owner)?;

    println!("  records checked: {}", result.records_checked);
    for error in &result.errors {
        println!("    ERROR: {error}");
    }
    for warning in &result.warnings {
        println!("    WARN:  {warning}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

/// Checks the snapshot and documents of `owner`.
pub fn check(repo: &LocalRepository, owner: &str) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();

    let snapshot = repo.load_snapshot(owner)?;
    for r in &snapshot.rejections {
        result.errors.push(format!(
            "{} entry #{} ({}) rejected: {}",
            r.table,
            r.index,
            r.key.as_deref().unwrap_or("no key"),
            r.reason
        ));
    }

    let documents = repo.documents()?;
    for r in &documents.rejections {
        result.errors.push(format!(
            "document {} rejected: {}",
            r.key.as_deref().unwrap_or("?"),
            r.reason
        ));
    }

    let mut flat = flatten(&snapshot.value)?;
    flat.insert(Table::Documents, flatten_documents(&documents.value)?);
    result.records_checked = flat.total_rows();
    dangling_references(&flat, &mut result);

    for doc in &documents.value {
        let has_content = repo.blob(&doc.id)?.is_some();
        match doc.local_state {
            DocumentState::PendingUpload if !has_content => result
                .errors
                .push(format!("document {} awaits upload but has no content", doc.id)),
            DocumentState::Archived if !has_content => result.warnings.push(format!(
                "document {} is archived and has no local content; it is unrecoverable",
                doc.id
            )),
            DocumentState::Downloading => result
                .warnings
                .push(format!("document {} has an interrupted download", doc.id)),
            _ => {}
        }
    }

    tracing::debug!(
        checked = result.records_checked,
        errors = result.errors.len(),
        "verification finished"
    );
    Ok(result)
}

fn dangling_references(flat: &FlatTables, result: &mut VerifyResult) {
    for table in Table::PUSH_ORDER {
        let Some((parent, fk)) = table.parent() else {
            continue;
        };
        let key = parent.key_fn();
        let parents: HashSet<String> = flat.rows(parent).iter().filter_map(key).collect();
        for row in flat.rows(table) {
            let parent_key = row.text(fk);
            if !parent_key.as_ref().is_some_and(|p| parents.contains(p)) {
                result.errors.push(format!(
                    "{table} {} references missing {parent} {}",
                    row.text(table.key_column()).unwrap_or_default(),
                    parent_key.unwrap_or_default()
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casesync_model::{AppData, CaseDocument, Client};
    use casesync_storage::InMemoryStore;
    use chrono::Utc;
    use std::sync::Arc;

    #[test]
    fn clean_store_passes() {
        let repo = LocalRepository::new(Arc::new(InMemoryStore::new()));
        let result = check(&repo, "o").unwrap();
        assert!(result.is_ok());
        assert_eq!(result.records_checked, 0);
    }

    #[test]
    fn reports_dangling_document_and_missing_content() {
        let repo = LocalRepository::new(Arc::new(InMemoryStore::new()));
        let data = AppData {
            clients: vec![Client {
                id: "1".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        repo.save_snapshot("o", &data).unwrap();
        let doc = CaseDocument::new_local("d", "404", "u", "a.txt", "text/plain", 1, Utc::now());
        repo.save_document(&doc).unwrap();

        let result = check(&repo, "o").unwrap();
        assert!(!result.is_ok());
        assert_eq!(result.records_checked, 2);
        assert!(result.errors.iter().any(|e| e.contains("references missing cases 404")));
        assert!(result.errors.iter().any(|e| e.contains("awaits upload")));
    }
}
