//! Orca core data models.
//!
//! This crate defines the value types shared by the lock manager, the
//! recovery sweep, the router and the task graph: identifiers, the injected
//! clock, lease tokens, routing decisions, work items and audit events.

#![warn(missing_docs)]

// Identities and time
mod id;
mod clock;

// Leases
mod lock;

// Tasks and their routing state
mod task;
mod work;
mod decision;

// Audit and correlation
mod event;
mod context;

// Risk gating and configuration
mod policy;
pub mod config;

// Re-exports
pub use id::*;
pub use clock::{Clock, SystemClock, ManualClock};

pub use lock::{LockToken, LockRecord};

pub use task::{NodeType, TaskNode, TaskSubmission};
pub use work::{WorkItem, RouteState, WorkFilter, InvalidTransition};
pub use decision::{
    RouteDecision, RerouteEvent, RerouteReason,
    ScoreBreakdown, ScoreContribution, ScoreDimension,
};

pub use event::{AuditEvent, AuditEventType, AgentId};
pub use context::RequestContext;

pub use policy::{RiskLevel, ExecutionMode};
pub use config::{OrcaConfig, ConfigError};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
