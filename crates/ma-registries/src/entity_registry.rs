//! Entity Registry
//!
//! Entity metadata (owning device, assigned area, disabled flag, platform)
//! with secondary indexes for the lookups the area catalog needs.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use ma_core::EntityId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageFile, StorageResult};

#[derive(Debug, Error, Clone)]
pub enum EntityRegistryError {
    #[error("Entity not found: {0}")]
    NotFound(EntityId),
}

pub const STORAGE_KEY: &str = "core.entity_registry";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Reason an entity was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledBy {
    ConfigEntry,
    Device,
    Integration,
    User,
}

/// A registered entity entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Internal ULID
    pub id: String,
    pub entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    /// Parent device ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Config entry that created this entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,
    /// Assigned area, overriding the device's area
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,

    /// Component/platform that provides this entity
    pub platform: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// User-set device class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    /// Platform default device class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl EntityEntry {
    pub fn new(entity_id: EntityId, platform: impl Into<String>, unique_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id,
            unique_id,
            device_id: None,
            config_entry_id: None,
            area_id: None,
            platform: platform.into(),
            name: None,
            device_class: None,
            original_device_class: None,
            unit_of_measurement: None,
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn domain(&self) -> &str {
        self.entity_id.domain()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    /// User-set device class, falling back to the platform default
    pub fn effective_device_class(&self) -> Option<&str> {
        self.device_class
            .as_deref()
            .or(self.original_device_class.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistryData {
    pub entities: Vec<EntityEntry>,
}

impl Storable for EntityRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Entity Registry with multi-index support
///
/// Entries are stored as `Arc<EntityEntry>`; secondary indexes keep
/// insertion order so lookups return entities in a stable order.
pub struct EntityRegistry {
    storage: Arc<Storage>,

    /// Primary index: entity_id -> EntityEntry
    by_entity_id: RwLock<IndexMap<EntityId, Arc<EntityEntry>>>,

    /// Index: unique_id -> entity_id
    by_unique_id: DashMap<String, EntityId>,

    /// Index: device_id -> entity_ids
    by_device_id: DashMap<String, IndexSet<EntityId>>,

    /// Index: config_entry_id -> entity_ids
    by_config_entry_id: DashMap<String, IndexSet<EntityId>>,

    /// Index: area_id -> entity_ids
    by_area_id: DashMap<String, IndexSet<EntityId>>,
}

impl EntityRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_entity_id: RwLock::new(IndexMap::new()),
            by_unique_id: DashMap::new(),
            by_device_id: DashMap::new(),
            by_config_entry_id: DashMap::new(),
            by_area_id: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<EntityRegistryData>(STORAGE_KEY).await? {
            info!(
                count = storage_file.data.entities.len(),
                "Loading entities from storage"
            );

            for entry in storage_file.data.entities {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let data = EntityRegistryData {
            entities: self.iter().iter().map(|e| (**e).clone()).collect(),
        };
        let count = data.entities.len();

        self.storage
            .save(&StorageFile::new(
                STORAGE_KEY,
                data,
                STORAGE_VERSION,
                STORAGE_MINOR_VERSION,
            ))
            .await?;
        debug!(count, "Saved entities to storage");
        Ok(())
    }

    fn index_entry(&self, entry: Arc<EntityEntry>) {
        let entity_id = entry.entity_id.clone();

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id.insert(unique_id.clone(), entity_id.clone());
        }
        if let Some(ref device_id) = entry.device_id {
            self.by_device_id
                .entry(device_id.clone())
                .or_default()
                .insert(entity_id.clone());
        }
        if let Some(ref config_entry_id) = entry.config_entry_id {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(entity_id.clone());
        }
        if let Some(ref area_id) = entry.area_id {
            self.by_area_id
                .entry(area_id.clone())
                .or_default()
                .insert(entity_id.clone());
        }

        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.insert(entity_id, entry);
        }
    }

    /// Remove an entry from the secondary indexes
    fn unindex_secondary(&self, entry: &EntityEntry) {
        let entity_id = &entry.entity_id;

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id.remove(unique_id);
        }
        if let Some(ref device_id) = entry.device_id {
            if let Some(mut ids) = self.by_device_id.get_mut(device_id) {
                ids.shift_remove(entity_id);
            }
        }
        if let Some(ref config_entry_id) = entry.config_entry_id {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.shift_remove(entity_id);
            }
        }
        if let Some(ref area_id) = entry.area_id {
            if let Some(mut ids) = self.by_area_id.get_mut(area_id) {
                ids.shift_remove(entity_id);
            }
        }
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .ok()
            .and_then(|idx| idx.get(entity_id).cloned())
    }

    pub fn get_by_unique_id(&self, unique_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_unique_id
            .get(unique_id)
            .and_then(|entity_id| self.get(&entity_id))
    }

    fn collect(&self, ids: Option<&IndexSet<EntityId>>) -> Vec<Arc<EntityEntry>> {
        ids.map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_by_device_id(&self, device_id: &str) -> Vec<Arc<EntityEntry>> {
        self.collect(self.by_device_id.get(device_id).as_deref())
    }

    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>> {
        self.collect(self.by_config_entry_id.get(config_entry_id).as_deref())
    }

    /// Entities explicitly assigned to an area
    pub fn get_by_area_id(&self, area_id: &str) -> Vec<Arc<EntityEntry>> {
        self.collect(self.by_area_id.get(area_id).as_deref())
    }

    /// Register an entity, or return the existing entry for its unique_id
    /// or entity_id
    pub fn get_or_create(
        &self,
        platform: &str,
        entity_id: EntityId,
        unique_id: Option<&str>,
        config_entry_id: Option<&str>,
        device_id: Option<&str>,
    ) -> Arc<EntityEntry> {
        if let Some(existing) = unique_id.and_then(|uid| self.get_by_unique_id(uid)) {
            debug!(entity_id = %existing.entity_id, "Found existing entity by unique_id");
            return existing;
        }
        if let Some(existing) = self.get(&entity_id) {
            return existing;
        }

        let mut entry = EntityEntry::new(entity_id, platform, unique_id.map(String::from));
        entry.config_entry_id = config_entry_id.map(String::from);
        entry.device_id = device_id.map(String::from);

        info!(entity_id = %entry.entity_id, platform, "Registered new entity");
        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        entry
    }

    /// Apply `f` to a copy of the entry and re-index it
    pub fn update<F>(&self, entity_id: &EntityId, f: F) -> Result<Arc<EntityEntry>, EntityRegistryError>
    where
        F: FnOnce(&mut EntityEntry),
    {
        let existing = self
            .by_entity_id
            .write()
            .ok()
            .and_then(|mut idx| idx.shift_remove(entity_id))
            .ok_or_else(|| EntityRegistryError::NotFound(entity_id.clone()))?;

        self.unindex_secondary(&existing);

        let mut entry = (*existing).clone();
        f(&mut entry);
        entry.modified_at = Utc::now();

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        Ok(entry)
    }

    pub fn remove(&self, entity_id: &EntityId) -> Option<Arc<EntityEntry>> {
        let removed = self
            .by_entity_id
            .write()
            .ok()
            .and_then(|mut idx| idx.shift_remove(entity_id))?;

        self.unindex_secondary(&removed);
        info!(entity_id = %entity_id, "Removed entity");
        Some(removed)
    }

    /// All entries in registration order
    pub fn iter(&self) -> Vec<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .map(|idx| idx.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_entity_id.read().map(|idx| idx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
