//! Audit events - the append-only trail consumed by replay tooling.

use crate::id::EventId;
use crate::Time;
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A lease was granted
    LockAcquired,
    /// A lease was released by its holder
    LockReleased,
    /// An expired lease was force-released by recovery
    LockReclaimed,
    /// A routing decision was recorded
    RouteDecided,
    /// A routing decision was superseded
    Rerouted,
    /// Recovered work was queued for a fresh decision
    WorkRequeued,
    /// Recovered work was surfaced for manual intervention
    WorkEscalated,
    /// Recovery of a single resource failed
    RecoveryItemFailed,
}

impl AuditEventType {
    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventType::LockAcquired => "lock_acquired",
            AuditEventType::LockReleased => "lock_released",
            AuditEventType::LockReclaimed => "lock_reclaimed",
            AuditEventType::RouteDecided => "route_decided",
            AuditEventType::Rerouted => "rerouted",
            AuditEventType::WorkRequeued => "work_requeued",
            AuditEventType::WorkEscalated => "work_escalated",
            AuditEventType::RecoveryItemFailed => "recovery_item_failed",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit event is an atomic record of something that happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique identifier
    pub event_id: EventId,

    /// What happened
    pub event_type: AuditEventType,

    /// Resource key or task id the event is about
    pub subject: String,

    /// Who performed the action
    pub actor: AgentId,

    /// When it happened
    pub timestamp: Time,

    /// Why it happened
    pub reason: String,

    /// Correlation id of the originating request
    pub correlation_id: Option<String>,
}

impl AuditEvent {
    /// Create a new event.
    pub fn new(
        event_type: AuditEventType,
        subject: impl Into<String>,
        actor: AgentId,
        timestamp: Time,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type,
            subject: subject.into(),
            actor,
            timestamp,
            reason: reason.into(),
            correlation_id: None,
        }
    }

    /// Attach a correlation id.
    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Identifier for an actor (worker, instance, operator or system).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    /// Create a new agent ID.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// System agent ID
    pub fn system() -> Self {
        Self("system".to_string())
    }

    /// Recovery sweep agent ID
    pub fn recovery() -> Self {
        Self("recovery".to_string())
    }

    /// Router agent ID
    pub fn router() -> Self {
        Self("router".to_string())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
