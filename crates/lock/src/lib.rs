//! Lease management - exclusive, time-bounded execution rights.
//!
//! The [`LockManager`] never blocks waiting for another holder: a conflict is
//! reported immediately as [`LockError::Conflict`] and retry policy belongs to
//! the caller. Every mutation goes through the storage compare-and-set, which
//! is what serializes callers racing on the same resource key.

#![warn(missing_docs)]

pub mod error;
pub mod manager;

pub use error::{LockError, Result};
pub use manager::{LockManager, ReleaseOutcome};
