//! Instance descriptors and the profiles the scorer compares.

use crate::requirements::normalize_name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_capacity() -> u32 {
    1
}

fn default_healthy() -> bool {
    true
}

/// An execution instance as registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    /// Unique identifier, also the lease holder name
    pub instance_id: String,

    /// Offered capabilities (name -> version)
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,

    /// Largest task the instance accepts, in tokens
    #[serde(default)]
    pub max_context_tokens: Option<u64>,

    /// Price per thousand tokens
    #[serde(default)]
    pub cost_per_1k_tokens: f64,

    /// Typical response latency
    #[serde(default)]
    pub avg_latency_ms: u64,

    /// Concurrent task slots
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Slots currently in use
    #[serde(default)]
    pub active_tasks: u32,

    /// Whether the instance is accepting work
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

impl InstanceDescriptor {
    /// A healthy single-slot instance with no capabilities.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            capabilities: BTreeMap::new(),
            max_context_tokens: None,
            cost_per_1k_tokens: 0.0,
            avg_latency_ms: 0,
            capacity: default_capacity(),
            active_tasks: 0,
            healthy: true,
        }
    }

    /// Add a capability.
    pub fn with_capability(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.capabilities.insert(name.into(), version.into());
        self
    }

    /// Set the slot count.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the price.
    pub fn with_cost(mut self, cost_per_1k_tokens: f64) -> Self {
        self.cost_per_1k_tokens = cost_per_1k_tokens;
        self
    }

    /// Set the latency.
    pub fn with_latency(mut self, avg_latency_ms: u64) -> Self {
        self.avg_latency_ms = avg_latency_ms;
        self
    }

    /// Set the context window.
    pub fn with_max_context(mut self, tokens: u64) -> Self {
        self.max_context_tokens = Some(tokens);
        self
    }
}

/// Normalized view of an instance used for one decision. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceProfile {
    /// Instance identifier
    pub instance_id: String,
    /// Capabilities keyed by normalized name
    pub capabilities: BTreeMap<String, String>,
    /// Context window, if bounded
    pub max_context_tokens: Option<u64>,
    /// Price per thousand tokens
    pub cost_per_1k_tokens: f64,
    /// Typical latency
    pub avg_latency_ms: u64,
    /// Total slots
    pub capacity: u32,
    /// Unused slots
    pub free_slots: u32,
    /// Healthy at profile time
    pub healthy: bool,
}

impl InstanceProfile {
    /// Fraction of slots in use, `1.0` for an instance with no slots.
    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            1.0
        } else {
            1.0 - self.free_slots as f64 / self.capacity as f64
        }
    }

    /// Estimated cost of `tokens` on this instance.
    pub fn estimated_cost(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.cost_per_1k_tokens
    }

    /// Offered version of a capability.
    pub fn capability(&self, name: &str) -> Option<&str> {
        self.capabilities.get(name).map(String::as_str)
    }
}

/// Builds [`InstanceProfile`]s from descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceProfileBuilder;

impl InstanceProfileBuilder {
    /// Create a builder.
    pub fn new() -> Self {
        Self
    }

    /// Normalize a descriptor.
    pub fn build(&self, descriptor: &InstanceDescriptor) -> InstanceProfile {
        let capabilities = descriptor
            .capabilities
            .iter()
            .map(|(name, version)| (normalize_name(name), version.trim().to_string()))
            .collect();

        InstanceProfile {
            instance_id: descriptor.instance_id.clone(),
            capabilities,
            max_context_tokens: descriptor.max_context_tokens,
            cost_per_1k_tokens: descriptor.cost_per_1k_tokens.max(0.0),
            avg_latency_ms: descriptor.avg_latency_ms,
            capacity: descriptor.capacity,
            free_slots: descriptor.capacity.saturating_sub(descriptor.active_tasks),
            healthy: descriptor.healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_normalizes_and_computes_load() {
        let mut descriptor = InstanceDescriptor::new("a")
            .with_capability("Python", " 3.11 ")
            .with_capacity(4);
        descriptor.active_tasks = 1;

        let profile = InstanceProfileBuilder::new().build(&descriptor);
        assert_eq!(profile.capability("python"), Some("3.11"));
        assert_eq!(profile.free_slots, 3);
        assert_eq!(profile.load_ratio(), 0.25);
    }

    #[test]
    fn test_overcommitted_instance_has_no_free_slots() {
        let mut descriptor = InstanceDescriptor::new("a").with_capacity(2);
        descriptor.active_tasks = 5;
        let profile = InstanceProfileBuilder::new().build(&descriptor);
        assert_eq!(profile.free_slots, 0);
        assert_eq!(profile.load_ratio(), 1.0);
    }

    #[test]
    fn test_descriptor_defaults_from_json() {
        let descriptor: InstanceDescriptor =
            serde_json::from_str(r#"{"instance_id": "a", "capabilities": {"python": "3.11"}}"#).unwrap();
        assert!(descriptor.healthy);
        assert_eq!(descriptor.capacity, 1);
        assert_eq!(InstanceProfileBuilder::new().build(&descriptor).estimated_cost(2000), 0.0);
    }
}
