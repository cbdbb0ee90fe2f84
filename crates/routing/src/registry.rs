//! Where the router finds its candidates.

use crate::profile::InstanceDescriptor;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::RwLock;

/// The registry could not answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("instance registry error: {0}")]
pub struct RegistryError(pub String);

/// Source of execution instances.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Every known instance, healthy or not, ordered by instance id.
    async fn list_instances(&self) -> Result<Vec<InstanceDescriptor>, RegistryError>;
}

/// A registry held in memory, seeded at startup and updated by callers.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    instances: RwLock<BTreeMap<String, InstanceDescriptor>>,
}

impl StaticRegistry {
    /// Create a registry holding `instances`.
    pub fn new(instances: impl IntoIterator<Item = InstanceDescriptor>) -> Self {
        let map = instances
            .into_iter()
            .map(|d| (d.instance_id.clone(), d))
            .collect();
        Self {
            instances: RwLock::new(map),
        }
    }

    /// Load a JSON array of descriptors.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RegistryError(format!("reading {}: {}", path.display(), e)))?;
        let instances: Vec<InstanceDescriptor> = serde_json::from_str(&raw)
            .map_err(|e| RegistryError(format!("parsing {}: {}", path.display(), e)))?;
        Ok(Self::new(instances))
    }

    /// Add or replace an instance.
    pub async fn upsert(&self, descriptor: InstanceDescriptor) {
        self.instances
            .write()
            .await
            .insert(descriptor.instance_id.clone(), descriptor);
    }

    /// Remove an instance. Returns whether it was present.
    pub async fn remove(&self, instance_id: &str) -> bool {
        self.instances.write().await.remove(instance_id).is_some()
    }

    /// Mark an instance healthy or unhealthy. Returns whether it exists.
    pub async fn set_health(&self, instance_id: &str, healthy: bool) -> bool {
        match self.instances.write().await.get_mut(instance_id) {
            Some(d) => {
                d.healthy = healthy;
                true
            }
            None => false,
        }
    }

    /// Update the number of busy slots. Returns whether the instance exists.
    pub async fn set_active_tasks(&self, instance_id: &str, active_tasks: u32) -> bool {
        match self.instances.write().await.get_mut(instance_id) {
            Some(d) => {
                d.active_tasks = active_tasks;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl InstanceRegistry for StaticRegistry {
    async fn list_instances(&self) -> Result<Vec<InstanceDescriptor>, RegistryError> {
        Ok(self.instances.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_listing_is_sorted_and_mutable() {
        let registry = StaticRegistry::new(vec![InstanceDescriptor::new("b"), InstanceDescriptor::new("a")]);
        let ids: Vec<_> = registry.list_instances().await.unwrap().into_iter().map(|d| d.instance_id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(registry.set_health("a", false).await);
        assert!(!registry.set_health("zzz", false).await);
        assert!(!registry.list_instances().await.unwrap()[0].healthy);

        assert!(registry.remove("b").await);
        assert_eq!(registry.list_instances().await.unwrap().len(), 1);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"instance_id": "py311", "capabilities": {{"python": "3.11"}}, "capacity": 2}}]"#).unwrap();
        let registry = StaticRegistry::from_json_file(file.path()).unwrap();
        let instances = registry.instances.try_read().unwrap();
        assert_eq!(instances["py311"].capacity, 2);
    }
}
