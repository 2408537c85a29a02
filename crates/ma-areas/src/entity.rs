//! Identity of the entities this integration publishes
//!
//! Every published entity embeds a [`MagicEntity`] for its naming and
//! registration metadata. Capabilities are layered on as traits:
//! [`Restorable`] for entities whose state survives a restart and
//! [`StateObserving`] for components that react to other entities.

use std::sync::Arc;

use ma_core::{EntityId, EntityIdError, DOMAIN};
use ma_registries::{EntityEntry, EntityRegistry};
use ma_state_store::StateStore;

use crate::restore::PersistedState;

/// Translation keys of the published entities
pub mod names {
    pub const STATE: &str = "state";
    pub const SYSTEM_CONTROL: &str = "system_control";
    pub const HUMIDITY_OCCUPIED: &str = "humidity_occupancy";
    pub const HUMIDITY_EMPTY: &str = "humidity_empty";
}

/// Config entry that owns every entity published for `area_id`
pub fn config_entry_id(area_id: &str) -> String {
    format!("{DOMAIN}_{area_id}")
}

/// `{domain}.magic_areas_{name}_{slug}`
pub fn magic_entity_id(domain: &str, name: &str, slug: &str) -> Result<EntityId, EntityIdError> {
    EntityId::new(domain, format!("{DOMAIN}_{name}_{slug}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicEntity {
    pub entity_id: EntityId,
    pub unique_id: String,
    pub area_id: String,
    pub translation_key: &'static str,
}

impl MagicEntity {
    pub fn new(
        domain: &str,
        translation_key: &'static str,
        area_id: &str,
        slug: &str,
    ) -> Result<Self, EntityIdError> {
        Ok(Self {
            entity_id: magic_entity_id(domain, translation_key, slug)?,
            unique_id: format!("{DOMAIN}_{translation_key}_{area_id}"),
            area_id: area_id.to_string(),
            translation_key,
        })
    }

    /// Register under the area's config entry so the catalog files it as
    /// one of our own entities
    pub fn register(&self, registry: &EntityRegistry) -> Arc<EntityEntry> {
        registry.get_or_create(
            DOMAIN,
            self.entity_id.clone(),
            Some(&self.unique_id),
            Some(&config_entry_id(&self.area_id)),
            None,
        )
    }
}

/// An entity whose last state is handed back after a restart
pub trait Restorable {
    fn entity(&self) -> &MagicEntity;

    /// Seed from the persisted state before the first publish
    fn restore(&mut self, persisted: &PersistedState);

    /// Capture the currently published state for persistence
    fn persist(&self, store: &StateStore) -> Option<PersistedState> {
        persist_entity(self.entity(), store)
    }
}

pub(crate) fn persist_entity(entity: &MagicEntity, store: &StateStore) -> Option<PersistedState> {
    store
        .get(&entity.entity_id)
        .map(|state| PersistedState::from_state(&state))
}

/// A component driven by state changes of other entities
pub trait StateObserving {
    fn observed_entities(&self) -> Vec<EntityId>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ma_registries::Storage;
    use tempfile::TempDir;

    #[test]
    fn test_entity_naming() {
        let entity = MagicEntity::new("sensor", names::STATE, "living_room", "living_room").unwrap();
        assert_eq!(
            entity.entity_id.to_string(),
            "sensor.magic_areas_state_living_room"
        );
        assert_eq!(entity.unique_id, "magic_areas_state_living_room");
        assert_eq!(config_entry_id("living_room"), "magic_areas_living_room");
    }

    #[test]
    fn test_register_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = EntityRegistry::new(Arc::new(Storage::new(dir.path())));
        let entity = MagicEntity::new("switch", names::SYSTEM_CONTROL, "kitchen", "kitchen").unwrap();

        let first = entity.register(&registry);
        let second = entity.register(&registry);
        assert_eq!(first.id, second.id);
        assert_eq!(first.platform, DOMAIN);
        assert_eq!(first.config_entry_id.as_deref(), Some("magic_areas_kitchen"));
        assert_eq!(registry.len(), 1);
    }
}
