//! What to do with work whose lease was reclaimed.

use orca_core::config::RecoveryConfig;
use orca_core::{ExecutionMode, InvalidTransition, RouteState, Time, WorkItem};
use serde::{Deserialize, Serialize};

/// Outcome chosen for a recovered work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Queue the work for a fresh routing decision
    Requeue,
    /// Stop retrying and surface the work for manual intervention
    Escalate,
}

impl RecoveryAction {
    /// Apply the action to a work item.
    ///
    /// Requeue moves the item to `Rerouted`. Escalate moves it to `Failed`
    /// (through `Rerouted` when the state machine requires it) and flags it.
    pub fn apply(self, item: &mut WorkItem, now: Time, note: impl Into<String>) -> Result<(), InvalidTransition> {
        match self {
            RecoveryAction::Requeue => {
                if item.state != RouteState::Rerouted {
                    item.transition(RouteState::Rerouted, now)?;
                }
            }
            RecoveryAction::Escalate => {
                if !item.state.can_transition_to(RouteState::Failed) {
                    item.transition(RouteState::Rerouted, now)?;
                }
                item.transition(RouteState::Failed, now)?;
                item.escalated = true;
            }
        }
        item.resource_key = None;
        item.note = Some(note.into());
        Ok(())
    }
}

/// Chooses between requeue and escalation.
///
/// The risk gate lives here rather than on the work item: risk is data, the
/// execution mode is policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    /// Attempts after which work is no longer requeued
    pub max_attempts: u32,
    /// Which risk levels may be requeued without a human
    pub execution_mode: ExecutionMode,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for RecoveryPolicy {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            execution_mode: config.execution_mode,
        }
    }
}

impl RecoveryPolicy {
    /// Whether recovery has anything to do for this item.
    ///
    /// Only executing work holds an execution lease, so only it can be
    /// orphaned. Routed work is waiting for a dispatch and is left alone.
    pub fn is_recoverable(&self, item: &WorkItem) -> bool {
        item.state == RouteState::Executing
    }

    /// Decide the action for an orphaned item.
    pub fn decide(&self, item: &WorkItem) -> RecoveryAction {
        if item.attempts >= self.max_attempts {
            return RecoveryAction::Escalate;
        }
        if !self.execution_mode.permits(item.risk) {
            return RecoveryAction::Escalate;
        }
        RecoveryAction::Requeue
    }

    /// Human-readable reason for `action`, recorded on the item and in audit.
    pub fn explain(&self, item: &WorkItem, action: RecoveryAction) -> String {
        match action {
            RecoveryAction::Requeue => format!(
                "lease expired; requeued (attempt {} of {})",
                item.attempts, self.max_attempts
            ),
            RecoveryAction::Escalate if item.attempts >= self.max_attempts => format!(
                "lease expired; retry budget of {} attempts spent",
                self.max_attempts
            ),
            RecoveryAction::Escalate => format!(
                "lease expired; {} risk work is not retried automatically",
                item.risk
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orca_core::{NodeType, TaskId};

    fn executing(node_type: NodeType, attempts: u32) -> WorkItem {
        let now = chrono::Utc::now();
        let mut item = WorkItem::new(TaskId::new(), node_type, now);
        for to in [RouteState::Scoring, RouteState::Routed, RouteState::Executing] {
            item.transition(to, now).unwrap();
        }
        item.attempts = attempts;
        item
    }

    #[test]
    fn test_low_risk_within_budget_is_requeued() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.decide(&executing(NodeType::Scan, 1)), RecoveryAction::Requeue);
    }

    #[test]
    fn test_exhausted_budget_escalates() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.decide(&executing(NodeType::Scan, 3)), RecoveryAction::Escalate);
    }

    #[test]
    fn test_high_risk_escalates_unless_mode_allows() {
        let item = executing(NodeType::Apply, 1);
        assert_eq!(RecoveryPolicy::default().decide(&item), RecoveryAction::Escalate);

        let semi = RecoveryPolicy {
            execution_mode: ExecutionMode::SemiAuto,
            ..RecoveryPolicy::default()
        };
        assert_eq!(semi.decide(&executing(NodeType::Generate, 1)), RecoveryAction::Requeue);
        assert_eq!(semi.decide(&item), RecoveryAction::Escalate);
    }

    #[test]
    fn test_apply_requeue_and_escalate() {
        let now = chrono::Utc::now();
        let mut item = executing(NodeType::Scan, 1);
        item.resource_key = Some("task:x".to_string());
        RecoveryAction::Requeue.apply(&mut item, now, "requeued").unwrap();
        assert_eq!(item.state, RouteState::Rerouted);
        assert!(item.resource_key.is_none());

        // Routed cannot fail directly; escalation goes through Rerouted.
        let mut routed = executing(NodeType::Apply, 0);
        routed.state = RouteState::Routed;
        RecoveryAction::Escalate.apply(&mut routed, now, "escalated").unwrap();
        assert_eq!(routed.state, RouteState::Failed);
        assert!(routed.escalated);
    }

    #[test]
    fn test_only_executing_work_is_recoverable() {
        let policy = RecoveryPolicy::default();
        let mut item = executing(NodeType::Scan, 1);
        assert!(policy.is_recoverable(&item));
        item.state = RouteState::Routed;
        assert!(!policy.is_recoverable(&item));
        item.state = RouteState::Rerouted;
        assert!(!policy.is_recoverable(&item));
    }

    #[test]
    fn test_settled_work_is_not_recoverable() {
        let mut item = executing(NodeType::Scan, 1);
        item.transition(RouteState::Completed, chrono::Utc::now()).unwrap();
        assert!(!RecoveryPolicy::default().is_recoverable(&item));
    }
}
