//! Requirement extraction.

use crate::error::{Result, RoutingError};
use crate::version::VersionConstraint;
use orca_core::{NodeType, TaskId, TaskSubmission};
use std::collections::BTreeMap;

/// One capability an instance must (or should) offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequirement {
    /// Normalized (lowercase) capability name
    pub name: String,
    /// Acceptable versions
    pub constraint: VersionConstraint,
    /// Added because of the node type rather than by the submitter
    pub implied: bool,
}

/// Normalized requirements of one task, derived per decision.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequirements {
    /// Task being routed
    pub task_id: TaskId,
    /// Kind of work
    pub node_type: NodeType,
    /// Mandatory capabilities, sorted by name
    pub required: Vec<CapabilityRequirement>,
    /// Optional capabilities, sorted by name
    pub preferred: Vec<CapabilityRequirement>,
    /// Expected token usage
    pub estimated_tokens: u64,
    /// Cost ceiling
    pub max_cost: Option<f64>,
    /// Latency ceiling
    pub max_latency_ms: Option<u64>,
}

/// Capabilities each node type benefits from, whatever the submitter asked.
fn implied_preferences(node_type: NodeType) -> &'static [(&'static str, &'static str)] {
    match node_type {
        NodeType::Scan => &[("fs_read", "*")],
        NodeType::Apply | NodeType::Heal => &[("fs_write", "*")],
        NodeType::Verify => &[("test_runner", "*")],
        NodeType::Generate | NodeType::Review | NodeType::Learn => &[],
    }
}

/// Turns submissions into [`TaskRequirements`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RequirementsExtractor;

impl RequirementsExtractor {
    /// Create an extractor.
    pub fn new() -> Self {
        Self
    }

    /// Normalize and parse the submission's requirements.
    pub fn extract(&self, task: &TaskSubmission) -> Result<TaskRequirements> {
        let required = parse_all(&task.required_capabilities)?;
        let mut preferred = parse_all(&task.preferred_capabilities)?;

        // Preferring something already required adds nothing.
        preferred.retain(|p| !required.iter().any(|r| r.name == p.name));

        for (name, constraint) in implied_preferences(task.node_type) {
            let taken = required.iter().chain(preferred.iter()).any(|r| r.name == *name);
            if !taken {
                preferred.push(CapabilityRequirement {
                    name: name.to_string(),
                    constraint: parse_one(name, constraint)?,
                    implied: true,
                });
            }
        }
        preferred.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(TaskRequirements {
            task_id: task.task_id,
            node_type: task.node_type,
            required,
            preferred,
            estimated_tokens: task.estimated_tokens,
            max_cost: task.max_cost,
            max_latency_ms: task.max_latency_ms,
        })
    }
}

/// Lowercase, trimmed capability name.
pub(crate) fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn parse_one(name: &str, constraint: &str) -> Result<VersionConstraint> {
    VersionConstraint::parse(constraint).map_err(|e| RoutingError::InvalidRequirement {
        capability: name.to_string(),
        reason: e.to_string(),
    })
}

fn parse_all(caps: &BTreeMap<String, String>) -> Result<Vec<CapabilityRequirement>> {
    let mut normalized: BTreeMap<String, CapabilityRequirement> = BTreeMap::new();
    for (name, constraint) in caps {
        let key = normalize_name(name);
        if key.is_empty() {
            return Err(RoutingError::InvalidRequirement {
                capability: name.clone(),
                reason: "empty capability name".to_string(),
            });
        }
        let requirement = CapabilityRequirement {
            name: key.clone(),
            constraint: parse_one(&key, constraint)?,
            implied: false,
        };
        if normalized.insert(key.clone(), requirement).is_some() {
            return Err(RoutingError::InvalidRequirement {
                capability: key,
                reason: "listed twice with different casing".to_string(),
            });
        }
    }
    Ok(normalized.into_values().collect())
}
