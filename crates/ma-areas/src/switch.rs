//! Per-area automatic control switch

use ma_core::{domains, Context, EntityId, EntityIdError, STATE_OFF, STATE_ON};
use ma_state_store::{Attributes, StateStore};
use serde_json::json;
use tracing::debug;

use crate::entity::{names, MagicEntity, Restorable};
use crate::restore::PersistedState;

/// `switch.magic_areas_system_control_<slug>`; when off the area is in
/// manual mode
#[derive(Debug, Clone)]
pub struct SystemControlSwitch {
    entity: MagicEntity,
    initial_on: bool,
}

impl SystemControlSwitch {
    pub fn new(area_id: &str, slug: &str) -> Result<Self, EntityIdError> {
        Ok(Self {
            entity: MagicEntity::new(domains::SWITCH, names::SYSTEM_CONTROL, area_id, slug)?,
            initial_on: true,
        })
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity.entity_id
    }

    /// Write the initial (or restored) state
    pub fn publish(&self, store: &StateStore) {
        Self::write(store, self.entity_id(), self.initial_on, Context::new());
    }

    pub fn write(store: &StateStore, entity_id: &EntityId, on: bool, context: Context) {
        let attributes = Attributes::from([("icon".to_string(), json!("mdi:toggle-switch"))]);
        let state = if on { STATE_ON } else { STATE_OFF };
        debug!(entity_id = %entity_id, state, "Writing system control switch");
        store.set(entity_id.clone(), state, attributes, context);
    }

    /// Automatic control is enabled when the switch is missing or on
    pub fn is_enabled(store: &StateStore, entity_id: &EntityId) -> bool {
        store
            .get_state(entity_id)
            .map_or(true, |state| state == STATE_ON)
    }
}

impl Restorable for SystemControlSwitch {
    fn entity(&self) -> &MagicEntity {
        &self.entity
    }

    fn restore(&mut self, persisted: &PersistedState) {
        self.initial_on = persisted.state != STATE_OFF;
    }
}
