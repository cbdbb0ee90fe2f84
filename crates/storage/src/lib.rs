//! Persistence boundary for Orca.
//!
//! This crate provides the [`Storage`] trait every stateful component talks
//! to, plus three backends: an in-process store, a JSON file store and (with
//! the `sqlite` feature) a SQLite store.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory;
#[cfg(feature = "json")]
pub mod json_storage;
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

pub use trait_::{Storage, StorageError, Result, CasOutcome};
pub use memory::MemoryStorage;
#[cfg(feature = "json")]
pub use json_storage::JsonStorage;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStorage;
