//! Request-scoped correlation data.

use crate::event::AgentId;
use serde::{Deserialize, Serialize};

/// Correlation data carried explicitly through every call chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Ties together every record produced by one request
    pub correlation_id: String,

    /// Optional longer-lived session
    pub session_id: Option<String>,

    /// Who issued the request
    pub actor: AgentId,
}

impl RequestContext {
    /// New context with a fresh correlation id.
    pub fn new(actor: AgentId) -> Self {
        Self {
            correlation_id: ulid::Ulid::new().to_string(),
            session_id: None,
            actor,
        }
    }

    /// Context for work the system starts on its own.
    pub fn system() -> Self {
        Self::new(AgentId::system())
    }

    /// Attach a session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Child context that keeps the correlation id but changes the actor.
    pub fn acting_as(&self, actor: AgentId) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            session_id: self.session_id.clone(),
            actor,
        }
    }
}
