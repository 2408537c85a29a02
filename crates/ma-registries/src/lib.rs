//! Persistent registries
//!
//! This crate provides the registries the area catalog resolves against:
//! - Entities (EntityRegistry)
//! - Devices (DeviceRegistry)
//! - Areas (AreaRegistry)
//!
//! All registries use JSON persistence in the `.storage/` directory
//! with versioning.

pub mod storage;

pub mod area_registry;
pub mod device_registry;
pub mod entity_registry;

pub use storage::{load_storable, Storable, Storage, StorageError, StorageFile, StorageResult};

pub use entity_registry::{DisabledBy, EntityEntry, EntityRegistry, EntityRegistryError};

pub use device_registry::{DeviceEntry, DeviceRegistry};

pub use area_registry::{AreaEntry, AreaRegistry};

use std::sync::Arc;

/// All registries bundled together
pub struct Registries {
    pub storage: Arc<Storage>,
    pub entities: EntityRegistry,
    pub devices: DeviceRegistry,
    pub areas: AreaRegistry,
}

impl Registries {
    /// Create empty registries backed by `config_dir/.storage`
    pub fn new(config_dir: impl AsRef<std::path::Path>) -> Self {
        let storage = Arc::new(Storage::new(config_dir));

        Self {
            entities: EntityRegistry::new(storage.clone()),
            devices: DeviceRegistry::new(storage.clone()),
            areas: AreaRegistry::new(storage.clone()),
            storage,
        }
    }

    pub async fn load_all(&self) -> StorageResult<()> {
        self.entities.load().await?;
        self.devices.load().await?;
        self.areas.load().await?;
        Ok(())
    }

    pub async fn save_all(&self) -> StorageResult<()> {
        self.entities.save().await?;
        self.devices.save().await?;
        self.areas.save().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_registries_roundtrip_through_storage() {
        let temp_dir = TempDir::new().unwrap();
        let registries = Registries::new(temp_dir.path());

        let area = registries.areas.create("Kitchen");
        let device = registries.devices.create("Motion Sensor");
        registries
            .devices
            .update(&device.id, |d| d.area_id = Some(area.id.clone()));
        registries.entities.get_or_create(
            "zha",
            "binary_sensor.kitchen_motion".parse().unwrap(),
            Some("zha-1"),
            None,
            Some(&device.id),
        );

        registries.save_all().await.unwrap();

        let reloaded = Registries::new(temp_dir.path());
        reloaded.load_all().await.unwrap();

        assert_eq!(reloaded.areas.get("kitchen").unwrap().name, "Kitchen");
        assert_eq!(reloaded.devices.get_by_area_id("kitchen").len(), 1);
        assert_eq!(reloaded.entities.get_by_device_id(&device.id).len(), 1);
    }
}
