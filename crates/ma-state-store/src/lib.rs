//! Entity state storage with domain indexing
//!
//! The StateStore holds the current state of every entity the integration can
//! see: the host's sensors as well as the area state sensors, trend sensors
//! and control switches the integration publishes itself. Every write fires
//! STATE_CHANGED on the event bus.

use dashmap::DashMap;
use ma_core::events::StateChangedData;
use ma_core::{Context, EntityId, EntityState};
use ma_event_bus::EventBus;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Attribute map carried by an entity state
pub type Attributes = HashMap<String, serde_json::Value>;

/// The state store tracks all entity states
pub struct StateStore {
    /// All entity states keyed by entity_id
    states: DashMap<EntityId, EntityState>,
    /// Index of entity_ids by domain
    domain_index: DashMap<String, Vec<EntityId>>,
    event_bus: Arc<EventBus>,
}

impl StateStore {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            event_bus,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Set the state of an entity
    ///
    /// `last_changed` only moves when the state value changes. Fires a
    /// STATE_CHANGED event with the old and new state.
    #[instrument(skip(self, state, attributes, context), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        context: Context,
    ) -> EntityState {
        let old_state = self.states.get(&entity_id).map(|s| s.clone());

        let new_state = match &old_state {
            Some(existing) => existing.with_update(state, attributes, context.clone()),
            None => EntityState::new(entity_id.clone(), state, attributes, context.clone()),
        };

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map(|s| s.state != new_state.state).unwrap_or(true),
            "Setting entity state"
        );

        self.states.insert(entity_id.clone(), new_state.clone());

        if old_state.is_none() {
            self.domain_index
                .entry(entity_id.domain().to_string())
                .or_default()
                .push(entity_id.clone());
        }

        self.event_bus.fire_typed(
            StateChangedData {
                entity_id,
                old_state,
                new_state: Some(new_state.clone()),
            },
            context,
        );

        new_state
    }

    /// Get the current state of an entity
    pub fn get(&self, entity_id: &EntityId) -> Option<EntityState> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// Get the state value, or None if the entity doesn't exist
    pub fn get_state(&self, entity_id: &EntityId) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    pub fn is_state(&self, entity_id: &EntityId, state: &str) -> bool {
        self.states
            .get(entity_id)
            .is_some_and(|s| s.state == state)
    }

    /// All entity IDs for a domain, in insertion order
    pub fn entity_ids(&self, domain: &str) -> Vec<EntityId> {
        self.domain_index
            .get(domain)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn domain_states(&self, domain: &str) -> Vec<EntityState> {
        self.entity_ids(domain)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Remove an entity's state
    ///
    /// Fires a STATE_CHANGED event with None for new_state.
    #[instrument(skip(self, context), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId, context: Context) -> Option<EntityState> {
        let old_state = self.states.remove(entity_id).map(|(_, s)| s);

        if let Some(ref state) = old_state {
            trace!("Removing entity state");

            if let Some(mut ids) = self.domain_index.get_mut(entity_id.domain()) {
                ids.retain(|id| id != entity_id);
            }

            self.event_bus.fire_typed(
                StateChangedData {
                    entity_id: entity_id.clone(),
                    old_state: Some(state.clone()),
                    new_state: None,
                },
                context,
            );
        }

        old_state
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

/// Thread-safe wrapper for StateStore
pub type SharedStateStore = Arc<StateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_set_fires_state_changed() {
        let bus = Arc::new(EventBus::new());
        let store = StateStore::new(bus.clone());
        let mut rx = bus.subscribe_typed::<StateChangedData>();

        store.set(id("binary_sensor.den_motion"), "off", Attributes::new(), Context::new());
        store.set(
            id("binary_sensor.den_motion"),
            "on",
            Attributes::from([("device_class".into(), json!("motion"))]),
            Context::new(),
        );

        let first = rx.recv().await.unwrap().data;
        assert!(first.old_state.is_none());
        let second = rx.recv().await.unwrap().data;
        assert_eq!(second.old_state.unwrap().state, "off");
        assert_eq!(second.new_state.unwrap().state, "on");
        assert!(store.is_state(&id("binary_sensor.den_motion"), "on"));
    }

    #[test]
    fn test_domain_index_and_remove() {
        let store = StateStore::new(Arc::new(EventBus::new()));
        store.set(id("sensor.a"), "1", Attributes::new(), Context::new());
        store.set(id("sensor.b"), "2", Attributes::new(), Context::new());
        store.set(id("switch.c"), "on", Attributes::new(), Context::new());
        store.set(id("sensor.a"), "3", Attributes::new(), Context::new());

        assert_eq!(store.entity_ids("sensor"), vec![id("sensor.a"), id("sensor.b")]);
        assert_eq!(store.domain_states("switch").len(), 1);

        assert!(store.remove(&id("sensor.a"), Context::new()).is_some());
        assert_eq!(store.entity_ids("sensor"), vec![id("sensor.b")]);
        assert_eq!(store.get_state(&id("sensor.a")), None);
        assert_eq!(store.entity_count(), 2);
    }
}
