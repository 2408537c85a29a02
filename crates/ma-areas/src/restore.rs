//! Last-state persistence across restarts
//!
//! Published entities are captured on teardown and handed back to each area
//! on the next setup. The data lives under `.storage/magic_areas.restore_state`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ma_core::{EntityId, EntityState};
use ma_registries::{load_storable, Storable, Storage, StorageResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const STORAGE_KEY: &str = "magic_areas.restore_state";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

pub const ATTR_LAST_OFF_TIME: &str = "last_off_time";

/// A previously published `(state, attributes)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub entity_id: EntityId,
    pub state: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub last_off_time: Option<DateTime<Utc>>,
}

impl PersistedState {
    pub fn new(entity_id: EntityId, state: impl Into<String>) -> Self {
        Self {
            entity_id,
            state: state.into(),
            attributes: HashMap::new(),
            last_off_time: None,
        }
    }

    pub fn from_state(state: &EntityState) -> Self {
        let last_off_time = state
            .attribute::<String>(ATTR_LAST_OFF_TIME)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Self {
            entity_id: state.entity_id.clone(),
            state: state.state.clone(),
            attributes: state.attributes.clone(),
            last_off_time,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RestoreData {
    states: Vec<PersistedState>,
}

impl Storable for RestoreData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

pub struct RestoreStore {
    storage: Arc<Storage>,
    states: DashMap<EntityId, PersistedState>,
}

impl RestoreStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            states: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = load_storable::<RestoreData>(&self.storage).await? {
            info!(count = data.states.len(), "Loaded restore state");
            for state in data.states {
                self.states.insert(state.entity_id.clone(), state);
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut states: Vec<PersistedState> =
            self.states.iter().map(|entry| entry.value().clone()).collect();
        states.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        let data = RestoreData { states };
        self.storage.save(&data.to_storage_file()).await?;
        debug!(count = data.states.len(), "Saved restore state");
        Ok(())
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<PersistedState> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    pub fn record(&self, state: PersistedState) {
        self.states.insert(state.entity_id.clone(), state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ma_core::Context;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_from_state_reads_last_off_time() {
        let state = EntityState::new(
            "sensor.magic_areas_state_den".parse().unwrap(),
            "extended",
            HashMap::from([(
                ATTR_LAST_OFF_TIME.to_string(),
                json!("2026-03-01T10:00:00+00:00"),
            )]),
            Context::new(),
        );
        let persisted = PersistedState::from_state(&state);
        assert_eq!(persisted.state, "extended");
        assert_eq!(
            persisted.last_off_time.map(|t| t.to_rfc3339()),
            Some("2026-03-01T10:00:00+00:00".to_string())
        );
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(dir.path()));

        let store = RestoreStore::new(storage.clone());
        store.record(PersistedState::new(
            "switch.magic_areas_system_control_den".parse().unwrap(),
            "off",
        ));
        store.save().await.unwrap();

        let reloaded = RestoreStore::new(storage);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.len(), 1);
        let state = reloaded
            .get(&"switch.magic_areas_system_control_den".parse().unwrap())
            .unwrap();
        assert_eq!(state.state, "off");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = RestoreStore::new(Arc::new(Storage::new(dir.path())));
        store.load().await.unwrap();
        assert!(store.is_empty());
    }
}
