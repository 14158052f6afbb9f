//! # casesync storage
//!
//! The on-device key/value store used by the sync engine.
//!
//! Stores are **opaque byte stores** split into logical partitions. They
//! never interpret the values they hold; typing, validation and encoding
//! belong to the layers above.
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For tests and ephemeral sessions
//! - [`FileStore`] - One directory per partition, one file per key
//!
//! ## Example
//!
//! ```rust
//! use casesync_storage::{InMemoryStore, LocalStore, Partition};
//!
//! let store = InMemoryStore::new();
//! store.put(Partition::Settings, "owner-1", b"{}").unwrap();
//! assert_eq!(store.get(Partition::Settings, "owner-1").unwrap(), Some(b"{}".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{LocalStore, Partition};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
