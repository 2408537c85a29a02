//! Area Registry
//!
//! Rooms and zones. Area ids are derived from the name at creation time and
//! never change afterwards, so they are safe to embed in entity ids.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ma_core::slugify;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageFile, StorageResult};

pub const STORAGE_KEY: &str = "core.area_registry";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaEntry {
    pub id: String,

    /// Area name (e.g., "Living Room")
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl AreaEntry {
    fn new(id: String, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.to_string(),
            icon: None,
            aliases: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// Normalize a name for searching
fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .trim()
        .replace(|c: char| !c.is_alphanumeric() && c != ' ', "")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AreaRegistryData {
    pub areas: Vec<AreaEntry>,
}

impl Storable for AreaRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

pub struct AreaRegistry {
    storage: Arc<Storage>,

    /// Primary index: area_id -> AreaEntry
    by_id: DashMap<String, Arc<AreaEntry>>,

    /// Index: normalized name -> area_id
    by_name: DashMap<String, String>,
}

impl AreaRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_id: DashMap::new(),
            by_name: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<AreaRegistryData>(STORAGE_KEY).await? {
            info!(count = storage_file.data.areas.len(), "Loading areas from storage");
            for entry in storage_file.data.areas {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut areas: Vec<AreaEntry> = self.by_id.iter().map(|r| (**r.value()).clone()).collect();
        areas.sort_by(|a, b| a.id.cmp(&b.id));
        let count = areas.len();

        self.storage
            .save(&StorageFile::new(
                STORAGE_KEY,
                AreaRegistryData { areas },
                STORAGE_VERSION,
                STORAGE_MINOR_VERSION,
            ))
            .await?;
        debug!(count, "Saved areas to storage");
        Ok(())
    }

    fn index_entry(&self, entry: Arc<AreaEntry>) {
        self.by_name
            .insert(normalize_name(&entry.name), entry.id.clone());
        self.by_id.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, area_id: &str) -> Option<Arc<AreaEntry>> {
        self.by_id.get(area_id).map(|r| Arc::clone(r.value()))
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<AreaEntry>> {
        self.by_name
            .get(&normalize_name(name))
            .and_then(|area_id| self.get(&area_id))
    }

    /// Create a new area with an id slugified from its name, suffixed
    /// `_2`, `_3`, ... on collision
    pub fn create(&self, name: &str) -> Arc<AreaEntry> {
        let base = match slugify(name) {
            slug if slug.is_empty() => "area".to_string(),
            slug => slug,
        };
        let mut id = base.clone();
        let mut tries = 1;
        while self.by_id.contains_key(&id) {
            tries += 1;
            id = format!("{base}_{tries}");
        }

        let entry = Arc::new(AreaEntry::new(id, name));
        info!(area_id = %entry.id, name, "Created area");
        self.index_entry(Arc::clone(&entry));
        entry
    }

    pub fn remove(&self, area_id: &str) -> Option<Arc<AreaEntry>> {
        let (_, removed) = self.by_id.remove(area_id)?;
        self.by_name.remove(&normalize_name(&removed.name));
        info!(area_id, "Removed area");
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Arc<AreaEntry>> + '_ {
        self.by_id.iter().map(|r| Arc::clone(r.value()))
    }
}
