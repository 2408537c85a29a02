//! Core types for Magic Areas
//!
//! This crate provides the fundamental types shared by every other crate in
//! the workspace: EntityId, EntityState, Event, Context, and the area
//! occupancy vocabulary (AreaState, AreaKind).

mod area;
mod context;
mod entity_id;
mod event;
mod slug;
mod state;

pub use area::{AreaKind, AreaState, ParseAreaStateError};
pub use context::Context;
pub use entity_id::{EntityId, EntityIdError};
pub use event::{Event, EventData, EventType};
pub use slug::slugify;
pub use state::EntityState;

/// Integration domain; prefixes every entity this integration publishes
pub const DOMAIN: &str = "magic_areas";

pub const STATE_ON: &str = "on";
pub const STATE_OFF: &str = "off";
pub const STATE_OPEN: &str = "open";
pub const STATE_UNAVAILABLE: &str = "unavailable";
pub const STATE_UNKNOWN: &str = "unknown";

/// Sentinel states that match neither an on-state nor an off-state
pub const INVALID_STATES: [&str; 2] = [STATE_UNAVAILABLE, STATE_UNKNOWN];

/// Returns true for the unavailable/unknown sentinels
pub fn is_invalid_state(state: &str) -> bool {
    INVALID_STATES.contains(&state)
}

/// Entity domains the integration reads or publishes
pub mod domains {
    pub const BINARY_SENSOR: &str = "binary_sensor";
    pub const SENSOR: &str = "sensor";
    pub const SWITCH: &str = "switch";
    pub const LIGHT: &str = "light";
    pub const FAN: &str = "fan";
    pub const COVER: &str = "cover";
    pub const MEDIA_PLAYER: &str = "media_player";
    pub const INPUT_BOOLEAN: &str = "input_boolean";
}

/// Event types fired by the integration
pub mod events {
    use super::*;

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Fired once per area after its state sensor is published
    pub const AREA_READY: &str = "magic_areas_area_ready";

    /// Fired once every non-meta area has finished setup
    pub const MAGIC_AREAS_READY: &str = "magic_areas_ready";

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<EntityState>,
        pub new_state: Option<EntityState>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Data for AREA_READY events
    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct AreaReadyData {
        pub id: String,
    }

    impl EventData for AreaReadyData {
        fn event_type() -> &'static str {
            AREA_READY
        }
    }

    /// Data for MAGIC_AREAS_READY events
    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    pub struct MagicAreasReadyData {}

    impl EventData for MagicAreasReadyData {
        fn event_type() -> &'static str {
            MAGIC_AREAS_READY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_states() {
        assert!(is_invalid_state("unavailable"));
        assert!(is_invalid_state("unknown"));
        assert!(!is_invalid_state("off"));
        assert!(!is_invalid_state("on"));
    }
}
