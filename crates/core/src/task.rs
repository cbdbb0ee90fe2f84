//! Task model - the unit of work that gets routed and leased.

use crate::id::TaskId;
use crate::policy::RiskLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of work a task node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Inspect a codebase or environment
    Scan,
    /// Produce new artifacts
    Generate,
    /// Apply changes to shared state
    Apply,
    /// Run checks against applied changes
    Verify,
    /// Human-style review of results
    Review,
    /// Record lessons learned
    Learn,
    /// Repair a failed state
    Heal,
}

impl NodeType {
    /// Every node type, in declaration order.
    pub const ALL: [NodeType; 7] = [
        NodeType::Scan,
        NodeType::Generate,
        NodeType::Apply,
        NodeType::Verify,
        NodeType::Review,
        NodeType::Learn,
        NodeType::Heal,
    ];

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Scan => "scan",
            NodeType::Generate => "generate",
            NodeType::Apply => "apply",
            NodeType::Verify => "verify",
            NodeType::Review => "review",
            NodeType::Learn => "learn",
            NodeType::Heal => "heal",
        }
    }

    /// Risk of running this kind of node unattended.
    pub fn risk(self) -> RiskLevel {
        match self {
            NodeType::Scan | NodeType::Verify | NodeType::Review | NodeType::Learn => RiskLevel::Low,
            NodeType::Generate => RiskLevel::Medium,
            NodeType::Apply | NodeType::Heal => RiskLevel::High,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown node type: {}", s))
    }
}

/// A node in a task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique identifier
    pub task_id: TaskId,

    /// What kind of work this is
    pub node_type: NodeType,

    /// Short human-readable title
    pub title: String,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Expected token usage
    #[serde(default)]
    pub estimated_tokens: u64,

    /// Expected cost; when positive, instances estimated above it are not eligible
    #[serde(default)]
    pub estimated_cost: f64,

    /// Capabilities an instance must offer (name -> version constraint)
    #[serde(default)]
    pub required_capabilities: BTreeMap<String, String>,

    /// Capabilities that improve the match when present
    #[serde(default)]
    pub preferred_capabilities: BTreeMap<String, String>,
}

impl TaskNode {
    /// Create a node with no requirements.
    pub fn new(node_type: NodeType, title: impl Into<String>) -> Self {
        Self {
            task_id: TaskId::new(),
            node_type,
            title: title.into(),
            metadata: BTreeMap::new(),
            estimated_tokens: 0,
            estimated_cost: 0.0,
            required_capabilities: BTreeMap::new(),
            preferred_capabilities: BTreeMap::new(),
        }
    }

    /// Add a mandatory capability.
    pub fn require(mut self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.required_capabilities.insert(name.into(), constraint.into());
        self
    }

    /// Add a preferred capability.
    pub fn prefer(mut self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.preferred_capabilities.insert(name.into(), constraint.into());
        self
    }

    /// Set the token estimate.
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }
}

/// What an external caller submits for routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Task being routed
    pub task_id: TaskId,

    /// Kind of work
    pub node_type: NodeType,

    /// Description (carried for audit, not parsed)
    #[serde(default)]
    pub description: String,

    /// Capabilities an instance must offer (name -> version constraint)
    #[serde(default)]
    pub required_capabilities: BTreeMap<String, String>,

    /// Capabilities that improve the match when present
    #[serde(default)]
    pub preferred_capabilities: BTreeMap<String, String>,

    /// Expected token usage
    #[serde(default)]
    pub estimated_tokens: u64,

    /// Hard ceiling on the estimated cost of running on one instance
    #[serde(default)]
    pub max_cost: Option<f64>,

    /// Hard ceiling on instance latency
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
}

impl TaskSubmission {
    /// Create a submission with no requirements.
    pub fn new(task_id: TaskId, node_type: NodeType) -> Self {
        Self {
            task_id,
            node_type,
            description: String::new(),
            required_capabilities: BTreeMap::new(),
            preferred_capabilities: BTreeMap::new(),
            estimated_tokens: 0,
            max_cost: None,
            max_latency_ms: None,
        }
    }

    /// Add a mandatory capability.
    pub fn require(mut self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.required_capabilities.insert(name.into(), constraint.into());
        self
    }

    /// Add a preferred capability.
    pub fn prefer(mut self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.preferred_capabilities.insert(name.into(), constraint.into());
        self
    }
}

impl From<&TaskNode> for TaskSubmission {
    fn from(node: &TaskNode) -> Self {
        Self {
            task_id: node.task_id,
            node_type: node.node_type,
            description: node.title.clone(),
            required_capabilities: node.required_capabilities.clone(),
            preferred_capabilities: node.preferred_capabilities.clone(),
            estimated_tokens: node.estimated_tokens,
            max_cost: node
                .metadata
                .get("max_cost")
                .and_then(|v| v.as_f64())
                .or((node.estimated_cost > 0.0).then_some(node.estimated_cost)),
            max_latency_ms: node.metadata.get("max_latency_ms").and_then(|v| v.as_u64()),
        }
    }
}
