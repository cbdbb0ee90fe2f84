//! Work items - persisted routing and execution state per task.

use crate::id::{DecisionId, TaskId};
use crate::policy::RiskLevel;
use crate::task::NodeType;
use crate::Time;
use serde::{Deserialize, Serialize};

/// Routing state machine of a task.
///
/// ```text
/// Unrouted → Scoring → Routed → Executing → {Completed | Rerouted | Failed}
///                       Routed → Scoring (re-scored)
///                                  Rerouted → Scoring
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    /// Submitted, no decision yet
    Unrouted,
    /// Candidates are being scored
    Scoring,
    /// A decision has been recorded
    Routed,
    /// The selected instance holds the execution lease
    Executing,
    /// Finished successfully
    Completed,
    /// Waiting for a fresh decision
    Rerouted,
    /// Gave up; needs attention
    Failed,
}

impl RouteState {
    /// Whether moving from `self` to `to` is allowed.
    pub fn can_transition_to(self, to: RouteState) -> bool {
        use RouteState::*;
        matches!(
            (self, to),
            (Unrouted, Scoring)
                | (Scoring, Routed)
                | (Scoring, Failed)
                | (Routed, Scoring)
                | (Routed, Executing)
                | (Routed, Rerouted)
                | (Executing, Completed)
                | (Executing, Rerouted)
                | (Executing, Failed)
                | (Rerouted, Scoring)
                | (Rerouted, Failed)
                // operator retry of escalated work
                | (Failed, Scoring)
        )
    }

    /// Completed is the only state with no way out.
    pub fn is_terminal(self) -> bool {
        self == RouteState::Completed
    }
}

impl std::fmt::Display for RouteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RouteState::Unrouted => "unrouted",
            RouteState::Scoring => "scoring",
            RouteState::Routed => "routed",
            RouteState::Executing => "executing",
            RouteState::Completed => "completed",
            RouteState::Rerouted => "rerouted",
            RouteState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid route state transition from {from} to {to}")]
pub struct InvalidTransition {
    /// State before the attempted change
    pub from: RouteState,
    /// Requested state
    pub to: RouteState,
}

/// Per-task routing and execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Task this item tracks
    pub task_id: TaskId,

    /// Kind of work
    pub node_type: NodeType,

    /// Risk used by recovery policy
    pub risk: RiskLevel,

    /// Current routing state
    pub state: RouteState,

    /// Number of times execution has been attempted
    pub attempts: u32,

    /// Most recent decision
    pub current_decision: Option<DecisionId>,

    /// Instance the task is routed to
    pub instance_id: Option<String>,

    /// Resource key of the execution lease
    pub resource_key: Option<String>,

    /// Surfaced for manual intervention
    #[serde(default)]
    pub escalated: bool,

    /// Last reason recorded against the item
    pub note: Option<String>,

    /// Last update timestamp
    pub updated_at: Time,

    /// Stored version; 0 until first saved. Saves are compare-and-set on it.
    #[serde(default)]
    pub version: u64,
}

impl WorkItem {
    /// Create an unrouted item.
    pub fn new(task_id: TaskId, node_type: NodeType, now: Time) -> Self {
        Self {
            task_id,
            node_type,
            risk: node_type.risk(),
            state: RouteState::Unrouted,
            attempts: 0,
            current_decision: None,
            instance_id: None,
            resource_key: None,
            escalated: false,
            note: None,
            updated_at: now,
            version: 0,
        }
    }

    /// Move to `to`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, to: RouteState, now: Time) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition { from: self.state, to });
        }
        self.state = to;
        self.updated_at = now;
        Ok(())
    }
}

/// Filter for listing work items.
#[derive(Debug, Clone, Default)]
pub struct WorkFilter {
    /// Only these states
    pub states: Option<Vec<RouteState>>,
    /// Only escalated / non-escalated items
    pub escalated: Option<bool>,
}

impl WorkFilter {
    /// Whether `item` passes the filter.
    pub fn matches(&self, item: &WorkItem) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&item.state) {
                return false;
            }
        }
        if let Some(escalated) = self.escalated {
            if item.escalated != escalated {
                return false;
            }
        }
        true
    }
}
