//! # casesync model
//!
//! Entity model and pure reconciliation logic for casesync.
//!
//! This crate provides:
//! - [`Table`] metadata: remote names, key columns, parent foreign keys,
//!   push and deletion orders
//! - [`Row`], the flat foreign-keyed record exchanged with the remote
//! - The typed domain tree ([`AppData`]) and the Entity Mapper
//!   ([`flatten`], [`reconstruct`])
//! - Tombstones, the resurrection rule and the pending-deletion ledger
//! - The last-writer-wins Merge Reconciler
//! - The load-time validation pass for loosely-typed persisted snapshots
//!
//! This is a pure crate with no I/O operations.
//!
//! ## Merge Model
//!
//! Conflict resolution is whole-record and timestamp based. A local record
//! only beats its remote copy when it is newer by more than the skew
//! buffer; ties resolve to the remote. The losing record is discarded.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod ledger;
mod mapper;
mod merge;
mod row;
mod table;
mod tombstone;
mod validate;

pub use entity::{
    AppData, Assistant, Case, CaseDocument, Client, DocumentState, FlatRecord, Invoice,
    InvoiceItem, Session, Stage,
};
pub use error::{ModelError, ModelResult};
pub use ledger::PendingDeletions;
pub use mapper::{
    document_row, flatten, flatten_documents, reconstruct, reconstruct_documents, FlatTables,
    Reconstruction, RowRef,
};
pub use merge::{
    filter_orphans, fold_returned, reconcile_all, reconcile_table, MergePolicy, MergedTables,
    Resolution, TableMerge, DEFAULT_SKEW_BUFFER_MS,
};
pub use row::{key_by_id, key_by_name, timestamp_millis, KeyFn, Row};
pub use table::Table;
pub use tombstone::{Tombstone, TombstoneIndex, DEFAULT_GRACE_MS, TOMBSTONE_TABLE};
pub use validate::{validate_document, validate_snapshot, RawSnapshot, Rejection, Validated};
