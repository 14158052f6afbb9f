//! # casesync sync engine
//!
//! Offline-first sync of the casesync entity tree and its attachments.
//!
//! This crate provides:
//! - The remote contract ([`RemoteGateway`], [`BlobStore`]) with an
//!   in-memory remote and a PostgREST-style HTTP mapping
//! - A typed repository and the versioned [`SnapshotStore`] over a
//!   [`casesync_storage::LocalStore`]
//! - The schema probe
//! - The sync orchestrator state machine ([`SyncEngine`])
//! - The attachment lifecycle ([`AttachmentManager`])
//! - Background scheduling on tokio ([`Scheduler`])
//!
//! ## Cycle
//!
//! A full cycle runs:
//! 1. Schema probe
//! 2. Concurrent fetch of every table and of recent tombstones
//! 3. Per-table last-writer-wins reconciliation, scoped by tombstones and
//!    locally queued deletions
//! 4. Queued blob removals, then queued deletions (children first)
//! 5. Upserts of local winners (parents first), folding the server's
//!    copies back in
//! 6. Publish of the rebuilt tree, unless the snapshot changed meanwhile
//!
//! A refresh runs the same steps without 4 and 5.
//!
//! ## Key Invariants
//!
//! - A failed cycle never overwrites the local snapshot
//! - Deletions acknowledged by the remote stay cleared even if a later
//!   step fails
//! - Cycles never overlap
//! - Attachment failures stay on their document

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attachments;
mod config;
mod error;
mod gateway;
mod http;
mod local;
mod memory;
mod probe;
mod scheduler;
mod snapshot;
mod state;

pub use attachments::{AttachmentManager, DocumentSync, SweepReport, Transition};
pub use config::{RetryConfig, SyncConfig, SyncSettings};
pub use error::{SyncError, SyncResult};
pub use gateway::{BlobStore, Remote, RemoteGateway, RemoteSlot};
pub use http::{HttpClient, HttpGateway, HttpRequest, HttpResponse, Method};
pub use local::LocalRepository;
pub use memory::{MemoryRemote, RemoteOp};
pub use probe::probe_schema;
pub use scheduler::{ChangeEvent, Scheduler, SchedulerHandle, SyncCommand};
pub use snapshot::{SnapshotStore, SnapshotView};
pub use state::{SyncEngine, SyncMode, SyncOutcome, SyncState, SyncStats};
