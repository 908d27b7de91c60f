//! Registry of protected entities.

use bulwark_merkle::{EntityKind, Result, VersionedStateStore};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A timeline shared between callers. Appends to one entity are
/// serialized by its mutex; different entities never contend.
pub type SharedStore = Arc<Mutex<VersionedStateStore>>;

/// Owns every registered entity's timeline. Entities are never removed;
/// a collective that must stop changing goes dormant instead.
#[derive(Default)]
pub struct EntityRegistry {
    entities: RwLock<HashMap<String, SharedStore>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity, creating its genesis checkpoint.
    ///
    /// Registering an existing entity returns the timeline already there.
    /// The boolean is true when the entity was newly created.
    pub fn register(&self, entity_id: &str, entity_kind: EntityKind) -> Result<(SharedStore, bool)> {
        if let Some(existing) = self.get(entity_id) {
            return Ok((existing, false));
        }

        let mut entities = self.entities.write();
        if let Some(existing) = entities.get(entity_id) {
            return Ok((existing.clone(), false));
        }

        let store = Arc::new(Mutex::new(VersionedStateStore::register(entity_id, entity_kind)?));
        entities.insert(entity_id.to_string(), store.clone());
        info!(entity_id = %entity_id, kind = ?entity_kind, "entity registered");

        Ok((store, true))
    }

    pub fn get(&self, entity_id: &str) -> Option<SharedStore> {
        self.entities.read().get(entity_id).cloned()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entities.read().contains_key(entity_id)
    }

    /// All registered entity IDs, sorted.
    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entities.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// IDs of registered collectives, sorted.
    pub fn collective_ids(&self) -> Vec<String> {
        let stores: Vec<(String, SharedStore)> = self
            .entities
            .read()
            .iter()
            .map(|(id, store)| (id.clone(), store.clone()))
            .collect();

        let mut ids: Vec<String> = stores
            .into_iter()
            .filter(|(_, store)| store.lock().entity_kind().is_collective())
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let registry = EntityRegistry::new();

        let (first, created) = registry.register("e1", EntityKind::Individual).unwrap();
        assert!(created);
        let (second, created) = registry.register("e1", EntityKind::Individual).unwrap();
        assert!(!created);

        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.contains("e1"));
        assert!(!registry.contains("e2"));
        assert_eq!(second.lock().len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_collective_ids() {
        let registry = EntityRegistry::new();
        registry.register("e1", EntityKind::Individual).unwrap();
        registry.register("g2", EntityKind::Collective).unwrap();
        registry.register("g1", EntityKind::Collective).unwrap();

        assert_eq!(registry.entity_ids(), vec!["e1", "g1", "g2"]);
        assert_eq!(registry.collective_ids(), vec!["g1", "g2"]);
    }
}
