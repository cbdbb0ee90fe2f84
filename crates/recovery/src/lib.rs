//! Recovery of orphaned work.
//!
//! A [`RecoverySweep`] periodically scans every lease, force-releases the ones
//! whose TTL has passed and decides what happens to the work that was running
//! under them: requeue it for a fresh routing decision, or escalate it for a
//! human when the retry budget is spent or the risk is too high to retry
//! unattended.

#![warn(missing_docs)]

pub mod alert;
pub mod policy;
pub mod sweep;

pub use alert::{AlertSink, LogAlertSink, RecoveryAlert};
pub use policy::{RecoveryAction, RecoveryPolicy};
pub use sweep::{RecoveryItemError, RecoveryReport, RecoveryStats, RecoverySweep};
