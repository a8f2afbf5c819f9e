//! Schema registry collaborator.

use super::chain::TransformationSource;
use crate::error::Result;
use crate::notify::{ChangeBus, Signal};
use crate::types::TransformationKey;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Source of schemas and registered transformation steps.
pub trait SchemaRegistry: Send + Sync {
    fn resolve_schema(&self, key: &TransformationKey, version: u32) -> Result<Option<Value>>;

    /// The step registered for exactly `from -> to`, if any.
    fn resolve_transformation_step(
        &self,
        key: &TransformationKey,
        from: u32,
        to: u32,
    ) -> Result<Option<TransformationSource>>;

    /// Every step registered for `key`.
    fn transformation_steps(&self, key: &TransformationKey) -> Result<Vec<TransformationSource>>;
}

/// Registry held in memory.
pub struct MemoryRegistry {
    schemas: RwLock<HashMap<(TransformationKey, u32), Value>>,
    steps: RwLock<HashMap<TransformationKey, BTreeMap<(u32, u32), TransformationSource>>>,
    bus: Option<Arc<ChangeBus>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            steps: RwLock::new(HashMap::new()),
            bus: None,
        }
    }

    /// Registry announcing changes as [`Signal::Schema`] on `bus`.
    pub fn with_bus(bus: Arc<ChangeBus>) -> Self {
        Self {
            bus: Some(bus),
            ..Self::new()
        }
    }

    pub fn register_schema(&self, key: TransformationKey, version: u32, schema: Value) {
        self.schemas.write().insert((key, version), schema);
        self.changed();
    }

    /// Register a step. `code` of `None` registers a synthetic no-op step.
    ///
    /// Re-registering the same edge replaces it.
    pub fn register_step(&self, key: TransformationKey, from: u32, to: u32, code: Option<&str>) {
        let source = TransformationSource::new(key.clone(), from, to, code.map(str::to_string));
        debug!(%key, from, to, hash = %source.hash, "registered transformation step");
        self.steps
            .write()
            .entry(key)
            .or_default()
            .insert((from, to), source);
        self.changed();
    }

    fn changed(&self) {
        if let Some(bus) = &self.bus {
            bus.publish(Signal::Schema);
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry for MemoryRegistry {
    fn resolve_schema(&self, key: &TransformationKey, version: u32) -> Result<Option<Value>> {
        Ok(self.schemas.read().get(&(key.clone(), version)).cloned())
    }

    fn resolve_transformation_step(
        &self,
        key: &TransformationKey,
        from: u32,
        to: u32,
    ) -> Result<Option<TransformationSource>> {
        Ok(self
            .steps
            .read()
            .get(key)
            .and_then(|steps| steps.get(&(from, to)))
            .cloned())
    }

    fn transformation_steps(&self, key: &TransformationKey) -> Result<Vec<TransformationSource>> {
        Ok(self
            .steps
            .read()
            .get(key)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_register_and_resolve() {
        let registry = MemoryRegistry::new();
        let key = TransformationKey::new("users", "UserCreated");
        registry.register_schema(key.clone(), 1, json!({"type": "object"}));
        registry.register_step(key.clone(), 1, 2, Some("v1_to_v2"));

        assert!(registry.resolve_schema(&key, 1).unwrap().is_some());
        assert!(registry.resolve_schema(&key, 2).unwrap().is_none());

        let step = registry.resolve_transformation_step(&key, 1, 2).unwrap().unwrap();
        assert_eq!(step.code.as_deref(), Some("v1_to_v2"));
        assert!(registry.resolve_transformation_step(&key, 2, 1).unwrap().is_none());
        assert_eq!(registry.transformation_steps(&key).unwrap().len(), 1);
    }

    #[test]
    fn test_changes_are_announced() {
        let bus = Arc::new(ChangeBus::new());
        let rx = bus.subscribe();
        let registry = MemoryRegistry::with_bus(bus);

        registry.register_step(TransformationKey::new("a", "T"), 1, 2, None);
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)).unwrap(), Signal::Schema);
    }
}
