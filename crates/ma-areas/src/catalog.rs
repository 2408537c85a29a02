//! Resolution of the entities that belong to an area
//!
//! Membership is computed once at setup from the registries and the current
//! state snapshot. Later registry edits are not followed.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexSet;
use ma_config::{AdvancedLightGroups, AreaConfig};
use ma_core::{domains, EntityId, EntityState, DOMAIN};
use ma_registries::{DeviceEntry, EntityEntry, Registries};
use ma_state_store::{Attributes, StateStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::entity::config_entry_id;

const ATTR_ENTITY_ID: &str = "entity_id";
const ATTR_DEVICE_CLASS: &str = "device_class";
const ATTR_UNIT_OF_MEASUREMENT: &str = "unit_of_measurement";
const DEVICE_CLASS_HUMIDITY: &str = "humidity";

/// One catalogued entity with the attributes it had at resolution time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDescriptor {
    pub entity_id: EntityId,
    pub device_class: Option<String>,
    pub unit_of_measurement: Option<String>,
    pub attributes: Attributes,
}

/// Read access to the host's registries and current states
pub trait RegistrySnapshot {
    fn devices_in_area(&self, area_id: &str) -> Vec<Arc<DeviceEntry>>;
    fn for_device(&self, device_id: &str) -> Vec<Arc<EntityEntry>>;
    fn for_area(&self, area_id: &str) -> Vec<Arc<EntityEntry>>;
    fn for_config_entry(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>>;
    fn entry(&self, entity_id: &EntityId) -> Option<Arc<EntityEntry>>;
    fn get(&self, entity_id: &EntityId) -> Option<EntityState>;
}

/// [`RegistrySnapshot`] over the in-process registries and state store
pub struct HostSnapshot<'a> {
    registries: &'a Registries,
    states: &'a StateStore,
}

impl<'a> HostSnapshot<'a> {
    pub fn new(registries: &'a Registries, states: &'a StateStore) -> Self {
        Self { registries, states }
    }
}

impl RegistrySnapshot for HostSnapshot<'_> {
    fn devices_in_area(&self, area_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.registries.devices.get_by_area_id(area_id)
    }

    fn for_device(&self, device_id: &str) -> Vec<Arc<EntityEntry>> {
        self.registries.entities.get_by_device_id(device_id)
    }

    fn for_area(&self, area_id: &str) -> Vec<Arc<EntityEntry>> {
        self.registries.entities.get_by_area_id(area_id)
    }

    fn for_config_entry(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>> {
        self.registries.entities.get_by_config_entry_id(config_entry_id)
    }

    fn entry(&self, entity_id: &EntityId) -> Option<Arc<EntityEntry>> {
        self.registries.entities.get(entity_id)
    }

    fn get(&self, entity_id: &EntityId) -> Option<EntityState> {
        self.states.get(entity_id)
    }
}

#[derive(Debug, Error)]
enum DescribeError {
    #[error("entity is a group of {0} entities")]
    Group(usize),

    #[error("attribute '{0}' is not a string")]
    Malformed(&'static str),
}

/// Entities of one area keyed by domain; our own entities are keyed by
/// `magic_areas.<domain>`
#[derive(Debug, Clone, Default)]
pub struct EntityCatalog {
    entities: BTreeMap<String, Vec<EntityDescriptor>>,
}

impl EntityCatalog {
    /// Resolve the catalog of a non-meta area. Meta areas own no sensors and
    /// always resolve to an empty catalog.
    pub fn resolve(config: &AreaConfig, area_id: &str, snapshot: &impl RegistrySnapshot) -> Self {
        let mut catalog = Self::default();
        if config.is_meta() {
            return catalog;
        }

        let options = config.features.presence();
        let own_entry = config_entry_id(area_id);
        let mut members: IndexSet<EntityId> = IndexSet::new();

        for device in snapshot.devices_in_area(area_id) {
            if device.is_disabled() {
                trace!(area = area_id, device_id = %device.id, "Skipping disabled device");
                continue;
            }
            for entry in snapshot.for_device(&device.id) {
                if is_excluded(&entry, &own_entry, &options) {
                    continue;
                }
                // An explicit assignment elsewhere wins over the device's area
                if entry.area_id.as_deref().is_some_and(|other| other != area_id) {
                    continue;
                }
                members.insert(entry.entity_id.clone());
            }
        }

        for entry in snapshot.for_area(area_id) {
            if !is_excluded(&entry, &own_entry, &options) {
                members.insert(entry.entity_id.clone());
            }
        }

        for entity_id in &options.include_entities {
            let disabled = snapshot
                .entry(entity_id)
                .is_some_and(|entry| entry.is_disabled());
            if !disabled && !options.exclude_entities.contains(entity_id) {
                members.insert(entity_id.clone());
            }
        }

        catalog.load(area_id, "", members.iter(), snapshot);

        let own: Vec<EntityId> = snapshot
            .for_config_entry(&own_entry)
            .iter()
            .map(|entry| entry.entity_id.clone())
            .collect();
        catalog.load(area_id, &format!("{DOMAIN}."), own.iter(), snapshot);

        debug!(area = area_id, entities = catalog.len(), "Resolved entity catalog");
        catalog
    }

    fn load<'a>(
        &mut self,
        area_id: &str,
        prefix: &str,
        entity_ids: impl Iterator<Item = &'a EntityId>,
        snapshot: &impl RegistrySnapshot,
    ) {
        for entity_id in entity_ids {
            match describe(entity_id, snapshot) {
                Ok(descriptor) => self
                    .entities
                    .entry(format!("{prefix}{}", entity_id.domain()))
                    .or_default()
                    .push(descriptor),
                Err(err @ DescribeError::Group(_)) => {
                    debug!(area = area_id, entity_id = %entity_id, reason = %err, "Skipping group entity");
                }
                Err(err) => {
                    warn!(area = area_id, entity_id = %entity_id, error = %err, "Unable to load entity");
                }
            }
        }
    }

    pub fn domain(&self, domain: &str) -> &[EntityDescriptor] {
        self.entities.get(domain).map(Vec::as_slice).unwrap_or_default()
    }

    /// Entities this integration published for the area
    pub fn own(&self, domain: &str) -> &[EntityDescriptor] {
        self.domain(&format!("{DOMAIN}.{domain}"))
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, entity_id: &EntityId) -> bool {
        self.domain(entity_id.domain())
            .iter()
            .any(|e| &e.entity_id == entity_id)
    }

    /// Entities that count as presence evidence. Binary sensors must have
    /// one of the configured device classes.
    pub fn presence_sensors(&self, options: &AdvancedLightGroups) -> Vec<EntityId> {
        let mut sensors = Vec::new();
        for platform in &options.presence_device_platforms {
            for descriptor in self.domain(platform) {
                if platform == domains::BINARY_SENSOR {
                    let class_matches = descriptor
                        .device_class
                        .as_ref()
                        .is_some_and(|class| options.presence_sensor_device_class.contains(class));
                    if !class_matches {
                        continue;
                    }
                }
                sensors.push(descriptor.entity_id.clone());
            }
        }
        sensors
    }

    /// First humidity sensor that reports a unit
    pub fn humidity_sensor(&self) -> Option<EntityId> {
        self.domain(domains::SENSOR)
            .iter()
            .find(|e| {
                e.device_class.as_deref() == Some(DEVICE_CLASS_HUMIDITY)
                    && e.unit_of_measurement.is_some()
            })
            .map(|e| e.entity_id.clone())
    }
}

fn is_excluded(entry: &EntityEntry, own_entry: &str, options: &AdvancedLightGroups) -> bool {
    entry.config_entry_id.as_deref() == Some(own_entry)
        || entry.is_disabled()
        || options.exclude_entities.contains(&entry.entity_id)
}

fn describe(
    entity_id: &EntityId,
    snapshot: &impl RegistrySnapshot,
) -> Result<EntityDescriptor, DescribeError> {
    let mut attributes = snapshot
        .get(entity_id)
        .map(|state| state.attributes)
        .unwrap_or_default();

    // Groups list their members under `entity_id`
    if let Some(members) = attributes.remove(ATTR_ENTITY_ID) {
        if let Some(list) = members.as_array() {
            return Err(DescribeError::Group(list.len()));
        }
    }

    let entry = snapshot.entry(entity_id);
    let device_class = match attributes.get(ATTR_DEVICE_CLASS) {
        Some(value) => Some(
            value
                .as_str()
                .ok_or(DescribeError::Malformed(ATTR_DEVICE_CLASS))?
                .to_string(),
        ),
        None => entry
            .as_ref()
            .and_then(|e| e.effective_device_class().map(String::from)),
    };
    let unit_of_measurement = match attributes.get(ATTR_UNIT_OF_MEASUREMENT) {
        Some(value) => Some(
            value
                .as_str()
                .ok_or(DescribeError::Malformed(ATTR_UNIT_OF_MEASUREMENT))?
                .to_string(),
        ),
        None => entry.as_ref().and_then(|e| e.unit_of_measurement.clone()),
    };

    Ok(EntityDescriptor {
        entity_id: entity_id.clone(),
        device_class,
        unit_of_measurement,
        attributes,
    })
}
