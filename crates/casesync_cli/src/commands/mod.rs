//! CLI command implementations.

pub mod inspect;
pub mod verify;

use casesync_storage::FileStore;
use casesync_sync_engine::LocalRepository;
use std::path::Path;
use std::sync::Arc;

/// Opens the file store at `path` without creating it.
pub fn open_repository(path: &Path) -> Result<LocalRepository, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No local store found at {}", path.display()).into());
    }
    tracing::debug!(path = %path.display(), "opening local store");
    let store = FileStore::open(path)?;
    Ok(LocalRepository::new(Arc::new(store)))
}
