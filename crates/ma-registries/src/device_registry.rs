//! Device Registry
//!
//! Only the parts of a device the area catalog relies on: its name, the
//! area it is placed in and whether it is disabled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::entity_registry::DisabledBy;
use crate::storage::{Storable, Storage, StorageFile, StorageResult};

pub const STORAGE_KEY: &str = "core.device_registry";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Internal UUID (hex, no dashes)
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_by_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_entries: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    pub fn new(name: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.map(String::from),
            name_by_user: None,
            area_id: None,
            config_entries: Vec::new(),
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name_by_user
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("Unnamed Device")
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    pub devices: Vec<DeviceEntry>,
}

impl Storable for DeviceRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

pub struct DeviceRegistry {
    storage: Arc<Storage>,

    /// Primary index: device_id -> DeviceEntry
    by_id: DashMap<String, Arc<DeviceEntry>>,

    /// Index: area_id -> device_ids, in placement order
    by_area_id: DashMap<String, IndexSet<String>>,
}

impl DeviceRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_id: DashMap::new(),
            by_area_id: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<DeviceRegistryData>(STORAGE_KEY).await? {
            info!(
                count = storage_file.data.devices.len(),
                "Loading devices from storage"
            );
            for entry in storage_file.data.devices {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut devices: Vec<DeviceEntry> = self.by_id.iter().map(|r| (**r.value()).clone()).collect();
        devices.sort_by_key(|d| d.created_at);
        let count = devices.len();

        self.storage
            .save(&StorageFile::new(
                STORAGE_KEY,
                DeviceRegistryData { devices },
                STORAGE_VERSION,
                STORAGE_MINOR_VERSION,
            ))
            .await?;
        debug!(count, "Saved devices to storage");
        Ok(())
    }

    fn index_entry(&self, entry: Arc<DeviceEntry>) {
        if let Some(ref area_id) = entry.area_id {
            self.by_area_id
                .entry(area_id.clone())
                .or_default()
                .insert(entry.id.clone());
        }
        self.by_id.insert(entry.id.clone(), entry);
    }

    fn unindex_area(&self, entry: &DeviceEntry) {
        if let Some(ref area_id) = entry.area_id {
            if let Some(mut ids) = self.by_area_id.get_mut(area_id) {
                ids.shift_remove(&entry.id);
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    /// Devices placed in an area
    pub fn get_by_area_id(&self, area_id: &str) -> Vec<Arc<DeviceEntry>> {
        let ids: Vec<String> = self
            .by_area_id
            .get(area_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn create(&self, name: &str) -> Arc<DeviceEntry> {
        let entry = Arc::new(DeviceEntry::new(Some(name)));
        info!(device_id = %entry.id, name, "Created device");
        self.index_entry(Arc::clone(&entry));
        entry
    }

    pub fn update<F>(&self, device_id: &str, f: F) -> Option<Arc<DeviceEntry>>
    where
        F: FnOnce(&mut DeviceEntry),
    {
        let (_, existing) = self.by_id.remove(device_id)?;
        self.unindex_area(&existing);

        let mut entry = (*existing).clone();
        f(&mut entry);
        entry.modified_at = Utc::now();

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        Some(entry)
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let (_, removed) = self.by_id.remove(device_id)?;
        self.unindex_area(&removed);
        info!(device_id, "Removed device");
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_area_index_moves_with_device() {
        let temp_dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::new(Arc::new(Storage::new(temp_dir.path())));

        let device = registry.create("Hue Motion");
        registry.update(&device.id, |d| d.area_id = Some("kitchen".into()));
        assert_eq!(registry.get_by_area_id("kitchen").len(), 1);

        registry.update(&device.id, |d| d.area_id = Some("hall".into()));
        assert!(registry.get_by_area_id("kitchen").is_empty());
        assert_eq!(registry.get_by_area_id("hall")[0].display_name(), "Hue Motion");

        registry.remove(&device.id);
        assert!(registry.get_by_area_id("hall").is_empty());
        assert!(registry.is_empty());
    }
}
