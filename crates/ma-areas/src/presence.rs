//! Occupancy evidence read from the state store

use ma_config::SecondaryState;
use ma_core::{AreaState, EntityId, EntityState, STATE_ON};
use ma_state_store::StateStore;
use tracing::debug;

use crate::entity::StateObserving;
use crate::machine::OccupancyInputs;
use crate::switch::SystemControlSwitch;

/// A child of a meta area, observed through its published state entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildArea {
    pub area_id: String,
    pub state_entity: EntityId,
}

/// What counts as presence for an area
#[derive(Debug, Clone)]
pub enum PresenceSources {
    /// Sensors whose state is in `on_states`
    Sensors {
        entities: Vec<EntityId>,
        on_states: Vec<String>,
    },
    /// Child areas in an occupied-class state
    Children(Vec<ChildArea>),
}

/// The trend binary sensors published for the area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HumiditySignals {
    pub rising: EntityId,
    pub falling: EntityId,
}

/// Every entity an area state machine depends on
#[derive(Debug, Clone)]
pub struct AreaSources {
    pub presence: PresenceSources,
    pub humidity: Option<HumiditySignals>,
    /// Overrides in priority order
    pub secondary: Vec<SecondaryState>,
    pub control_switch: EntityId,
}

impl AreaSources {
    pub fn presence_entities(&self) -> Vec<EntityId> {
        match &self.presence {
            PresenceSources::Sensors { entities, .. } => entities.clone(),
            PresenceSources::Children(children) => {
                children.iter().map(|c| c.state_entity.clone()).collect()
            }
        }
    }

    pub fn is_presence(&self, entity_id: &EntityId) -> bool {
        match &self.presence {
            PresenceSources::Sensors { entities, .. } => entities.contains(entity_id),
            PresenceSources::Children(children) => {
                children.iter().any(|c| &c.state_entity == entity_id)
            }
        }
    }

    pub fn is_humidity_signal(&self, entity_id: &EntityId) -> bool {
        self.humidity
            .as_ref()
            .is_some_and(|h| &h.rising == entity_id || &h.falling == entity_id)
    }

    /// Whether a readable state is presence evidence
    pub fn is_evidence(&self, state: &EntityState) -> bool {
        match &self.presence {
            PresenceSources::Sensors { on_states, .. } => on_states.contains(&state.state),
            PresenceSources::Children(_) => state
                .state
                .parse::<AreaState>()
                .is_ok_and(|s| s.is_occupied_class()),
        }
    }

    /// A readable on-state followed by a readable non-on state. Changes to
    /// or from unavailable/unknown never count.
    pub fn lost_evidence(&self, old: Option<&EntityState>, new: Option<&EntityState>) -> bool {
        match (old, new) {
            (Some(old), Some(new)) => {
                old.is_valid() && new.is_valid() && self.is_evidence(old) && !self.is_evidence(new)
            }
            _ => false,
        }
    }
}

impl StateObserving for AreaSources {
    fn observed_entities(&self) -> Vec<EntityId> {
        let mut entities = self.presence_entities();
        if let Some(humidity) = &self.humidity {
            entities.push(humidity.rising.clone());
            entities.push(humidity.falling.clone());
        }
        entities.extend(self.secondary.iter().map(|s| s.entity.clone()));
        entities.push(self.control_switch.clone());
        entities
    }
}

/// [`OccupancyInputs`] for one recompute pass
pub struct Evidence<'a> {
    sources: &'a AreaSources,
    store: &'a StateStore,
}

impl<'a> Evidence<'a> {
    pub fn new(sources: &'a AreaSources, store: &'a StateStore) -> Self {
        Self { sources, store }
    }

    fn readable(&self, entity_id: &EntityId) -> Option<EntityState> {
        match self.store.get(entity_id) {
            Some(state) if state.is_valid() => Some(state),
            Some(state) => {
                debug!(entity_id = %entity_id, state = %state.state, "Ignoring unreadable entity");
                None
            }
            None => {
                debug!(entity_id = %entity_id, "Ignoring missing entity");
                None
            }
        }
    }

    /// Rising and not falling. `None` without trend sensors or when the
    /// rising sensor is unreadable.
    pub fn humidity_active(&self) -> Option<bool> {
        let signals = self.sources.humidity.as_ref()?;
        let rising = self.readable(&signals.rising)?.state == STATE_ON;
        let falling = self
            .readable(&signals.falling)
            .is_some_and(|s| s.state == STATE_ON);
        Some(rising && !falling)
    }

    /// Presence entities currently showing evidence
    pub fn active_sensors(&self) -> Vec<EntityId> {
        self.sources
            .presence_entities()
            .into_iter()
            .filter(|id| {
                self.readable(id)
                    .is_some_and(|state| self.sources.is_evidence(&state))
            })
            .collect()
    }

    /// Occupied children of a meta area
    pub fn active_children(&self) -> Vec<String> {
        let PresenceSources::Children(children) = &self.sources.presence else {
            return Vec::new();
        };
        children
            .iter()
            .filter(|child| {
                self.readable(&child.state_entity)
                    .is_some_and(|state| self.sources.is_evidence(&state))
            })
            .map(|child| child.area_id.clone())
            .collect()
    }
}

impl OccupancyInputs for Evidence<'_> {
    fn control_enabled(&self) -> bool {
        SystemControlSwitch::is_enabled(self.store, &self.sources.control_switch)
    }

    fn occupied_now(&self) -> Option<bool> {
        let presence = self.sources.presence_entities();
        let mut readable = 0;
        for entity_id in &presence {
            if let Some(state) = self.readable(entity_id) {
                if self.sources.is_evidence(&state) {
                    return Some(true);
                }
                readable += 1;
            }
        }

        let humidity = self.humidity_active();
        if humidity == Some(true) {
            return Some(true);
        }
        if readable == 0 && humidity.is_none() && !presence.is_empty() {
            return None;
        }
        Some(false)
    }

    fn secondary_state(&self) -> Option<AreaState> {
        self.sources
            .secondary
            .iter()
            .find(|secondary| {
                self.readable(&secondary.entity)
                    .is_some_and(|state| state.state.to_lowercase() == secondary.on_value)
            })
            .map(|secondary| secondary.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ma_core::Context;
    use ma_event_bus::EventBus;
    use ma_state_store::Attributes;
    use std::sync::Arc;

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    fn store() -> StateStore {
        StateStore::new(Arc::new(EventBus::new()))
    }

    fn set(store: &StateStore, entity: &str, state: &str) {
        store.set(id(entity), state, Attributes::new(), Context::new());
    }

    fn leaf() -> AreaSources {
        AreaSources {
            presence: PresenceSources::Sensors {
                entities: vec![id("binary_sensor.pir"), id("media_player.tv")],
                on_states: vec!["on".to_string(), "playing".to_string()],
            },
            humidity: Some(HumiditySignals {
                rising: id("binary_sensor.magic_areas_humidity_occupancy_bath"),
                falling: id("binary_sensor.magic_areas_humidity_empty_bath"),
            }),
            secondary: vec![
                SecondaryState {
                    state: AreaState::Sleep,
                    entity: id("input_boolean.sleep"),
                    on_value: "on".to_string(),
                },
                SecondaryState {
                    state: AreaState::Bright,
                    entity: id("binary_sensor.bright"),
                    on_value: "on".to_string(),
                },
            ],
            control_switch: id("switch.magic_areas_system_control_bath"),
        }
    }

    #[tokio::test]
    async fn test_unreadable_sensors_are_absent() {
        let store = store();
        let sources = leaf();
        let evidence = Evidence::new(&sources, &store);
        assert_eq!(evidence.occupied_now(), None);

        set(&store, "binary_sensor.pir", "unavailable");
        assert_eq!(evidence.occupied_now(), None);

        set(&store, "media_player.tv", "idle");
        assert_eq!(evidence.occupied_now(), Some(false));

        set(&store, "media_player.tv", "playing");
        assert_eq!(evidence.occupied_now(), Some(true));
        assert_eq!(evidence.active_sensors(), vec![id("media_player.tv")]);
    }

    #[tokio::test]
    async fn test_humidity_rising_without_falling() {
        let store = store();
        let sources = leaf();
        let evidence = Evidence::new(&sources, &store);
        set(&store, "binary_sensor.magic_areas_humidity_occupancy_bath", "on");
        assert_eq!(evidence.occupied_now(), Some(true));

        set(&store, "binary_sensor.magic_areas_humidity_empty_bath", "on");
        assert_eq!(evidence.humidity_active(), Some(false));
        assert_eq!(evidence.occupied_now(), Some(false));
    }

    #[tokio::test]
    async fn test_secondary_priority() {
        let store = store();
        let sources = leaf();
        let evidence = Evidence::new(&sources, &store);
        set(&store, "binary_sensor.bright", "on");
        assert_eq!(evidence.secondary_state(), Some(AreaState::Bright));
        set(&store, "input_boolean.sleep", "ON");
        for _ in 0..3 {
            assert_eq!(evidence.secondary_state(), Some(AreaState::Sleep));
        }
    }

    #[tokio::test]
    async fn test_meta_children() {
        let store = store();
        let sources = AreaSources {
            presence: PresenceSources::Children(vec![
                ChildArea {
                    area_id: "kitchen".to_string(),
                    state_entity: id("sensor.magic_areas_state_kitchen"),
                },
                ChildArea {
                    area_id: "den".to_string(),
                    state_entity: id("sensor.magic_areas_state_den"),
                },
            ]),
            humidity: None,
            secondary: Vec::new(),
            control_switch: id("switch.magic_areas_system_control_global"),
        };
        let evidence = Evidence::new(&sources, &store);

        set(&store, "sensor.magic_areas_state_kitchen", "clear");
        set(&store, "sensor.magic_areas_state_den", "manual");
        assert_eq!(evidence.occupied_now(), Some(false));

        set(&store, "sensor.magic_areas_state_den", "extended");
        assert_eq!(evidence.occupied_now(), Some(true));
        assert_eq!(evidence.active_children(), vec!["den".to_string()]);
    }

    #[test]
    fn test_lost_evidence_ignores_unavailable() {
        let sources = leaf();
        let pir = |state: &str| {
            EntityState::new(id("binary_sensor.pir"), state, Attributes::new(), Context::new())
        };
        assert!(sources.lost_evidence(Some(&pir("on")), Some(&pir("off"))));
        assert!(!sources.lost_evidence(Some(&pir("on")), Some(&pir("unavailable"))));
        assert!(!sources.lost_evidence(Some(&pir("unknown")), Some(&pir("off"))));
        assert!(!sources.lost_evidence(None, Some(&pir("off"))));
    }
}
