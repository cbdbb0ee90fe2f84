//! Routing decisions and reroute events.
//!
//! Both are append-only: a reroute links an old decision to a new one and
//! never rewrites history.

use crate::id::{DecisionId, EventId, TaskId};
use crate::Time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dimension a score contribution belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDimension {
    /// A mandatory capability that the instance satisfies
    RequiredCapability,
    /// An optional capability that the instance satisfies
    PreferredCapability,
    /// Estimated cost of running the task on the instance
    Cost,
    /// Instance latency
    Latency,
    /// Free capacity on the instance
    Load,
}

impl std::fmt::Display for ScoreDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScoreDimension::RequiredCapability => "required_capability",
            ScoreDimension::PreferredCapability => "preferred_capability",
            ScoreDimension::Cost => "cost",
            ScoreDimension::Latency => "latency",
            ScoreDimension::Load => "load",
        };
        f.write_str(s)
    }
}

/// One term of a weighted score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreContribution {
    /// Dimension of the term
    pub dimension: ScoreDimension,

    /// What was matched (capability name, "cost", ...)
    pub key: String,

    /// Weight applied
    pub weight: f64,

    /// Normalised match value in `[0, 1]`
    pub value: f64,

    /// `weight * value`
    pub contribution: f64,

    /// Human-readable explanation
    pub detail: String,
}

/// A score together with the terms that produced it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Sum of all contributions
    pub total: f64,

    /// Individual terms
    pub contributions: Vec<ScoreContribution>,
}

impl ScoreBreakdown {
    /// Add a term and update the total.
    pub fn push(&mut self, contribution: ScoreContribution) {
        self.total += contribution.contribution;
        self.contributions.push(contribution);
    }

    /// Sum of contributions in one dimension.
    pub fn dimension_total(&self, dimension: ScoreDimension) -> f64 {
        self.contributions
            .iter()
            .filter(|c| c.dimension == dimension)
            .map(|c| c.contribution)
            .sum()
    }

    /// One line per contribution, suitable for a decision rationale.
    pub fn explain(&self) -> Vec<String> {
        self.contributions
            .iter()
            .map(|c| format!("{} {}: {} (+{:.3})", c.dimension, c.key, c.detail, c.contribution))
            .collect()
    }
}

/// The recorded outcome of routing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    /// Unique identifier
    pub decision_id: DecisionId,

    /// Routed task
    pub task_id: TaskId,

    /// Winning instance
    pub selected_instance_id: String,

    /// Winning score
    pub score: f64,

    /// Per-dimension contributions of the winning score
    pub breakdown: ScoreBreakdown,

    /// Human-readable reasons for the choice
    pub rationale: Vec<String>,

    /// References to the evidence used (capabilities, profiles)
    pub evidence_refs: Vec<String>,

    /// Instances that were rejected, with their reasons
    #[serde(default)]
    pub rejected: BTreeMap<String, Vec<String>>,

    /// Number of instances scored
    pub candidates_considered: usize,

    /// Decision this one replaces
    pub supersedes: Option<DecisionId>,

    /// Correlation id of the request that produced it
    pub correlation_id: String,

    /// When the decision was made
    pub decided_at: Time,
}

/// Why a task is being rerouted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerouteReason {
    /// The instance reported a failure
    InstanceFailed,
    /// The instance cannot be reached
    InstanceUnreachable,
    /// The execution lease expired and was reclaimed
    LeaseExpired,
    /// A better-scoring instance became available
    BetterMatch,
}

impl RerouteReason {
    /// Stable reason code.
    pub fn code(self) -> &'static str {
        match self {
            RerouteReason::InstanceFailed => "instance_failed",
            RerouteReason::InstanceUnreachable => "instance_unreachable",
            RerouteReason::LeaseExpired => "lease_expired",
            RerouteReason::BetterMatch => "better_match",
        }
    }

    /// Whether the previously selected instance must not be chosen again.
    pub fn excludes_previous(self) -> bool {
        !matches!(self, RerouteReason::BetterMatch)
    }
}

impl std::fmt::Display for RerouteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Link from a superseded decision to its replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerouteEvent {
    /// Unique identifier
    pub event_id: EventId,

    /// Rerouted task
    pub task_id: TaskId,

    /// Superseded decision
    pub previous_decision: DecisionId,

    /// Replacement decision
    pub new_decision: DecisionId,

    /// Instance of the superseded decision
    pub previous_instance_id: String,

    /// Instance of the replacement decision
    pub new_instance_id: String,

    /// Reason code
    pub reason: RerouteReason,

    /// Correlation id of the request that triggered it
    pub correlation_id: String,

    /// When the reroute happened
    pub occurred_at: Time,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakdown_totals_and_explains() {
        let mut b = ScoreBreakdown::default();
        b.push(ScoreContribution {
            dimension: ScoreDimension::RequiredCapability,
            key: "python".to_string(),
            weight: 10.0,
            value: 1.0,
            contribution: 10.0,
            detail: "3.11 satisfies >=3.10".to_string(),
        });
        b.push(ScoreContribution {
            dimension: ScoreDimension::Load,
            key: "load".to_string(),
            weight: 2.0,
            value: 0.5,
            contribution: 1.0,
            detail: "1/2 slots busy".to_string(),
        });
        assert_eq!(b.total, 11.0);
        assert_eq!(b.dimension_total(ScoreDimension::Load), 1.0);
        assert!(b.explain()[0].contains("python"));
    }

    #[test]
    fn test_better_match_keeps_previous_instance_eligible() {
        assert!(!RerouteReason::BetterMatch.excludes_previous());
        assert!(RerouteReason::LeaseExpired.excludes_previous());
    }
}
