//! Typed area configuration
//!
//! Top-level area fields are strict: a wrong type fails that area. The
//! `features` map is converted feature by feature, and a feature whose value
//! has the wrong shape is logged and treated as disabled.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use ma_core::{AreaKind, AreaState, EntityId, STATE_ON, STATE_OPEN};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;

/// File read from the config directory
pub const CONFIG_FILE: &str = "magic_areas.yaml";

pub const DEFAULT_CLEAR_TIMEOUT: u64 = 360;
pub const DEFAULT_EXTENDED_TIMEOUT: u64 = 360;
pub const DEFAULT_UPDATE_INTERVAL: u64 = 1800;
pub const DEFAULT_MANUAL_TIMEOUT: u64 = 60;
pub const DEFAULT_HUMIDITY_UP: f64 = 0.03;
pub const DEFAULT_HUMIDITY_DOWN: f64 = -0.015;
pub const DEFAULT_OCCUPIED_DIM: u8 = 100;
pub const DEFAULT_SLEEP_DIM: u8 = 30;

pub const FEATURE_ADVANCED_LIGHT_GROUPS: &str = "advanced_light_groups";
pub const FEATURE_HUMIDITY: &str = "humidity";
/// Features accepted as on/off switches without options of their own
pub const FLAG_FEATURES: [&str; 4] = [
    "group_creation",
    "climate_groups",
    "health",
    "area_aware_media_player",
];

/// Meta area ids
pub const META_GLOBAL: &str = "global";
pub const META_INTERIOR: &str = "interior";
pub const META_EXTERIOR: &str = "exterior";

/// One secondary override: `state` wins over `occupied` while `entity` is `on_value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryState {
    pub state: AreaState,
    pub entity: EntityId,
    pub on_value: String,
}

/// Presence options of the `advanced_light_groups` feature
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdvancedLightGroups {
    pub include_entities: Vec<EntityId>,
    pub exclude_entities: Vec<EntityId>,
    /// States of a presence entity that count as presence
    pub on_states: Vec<String>,
    /// Domains whose entities can indicate presence
    pub presence_device_platforms: Vec<String>,
    /// Binary sensor device classes that indicate presence
    pub presence_sensor_device_class: Vec<String>,
    /// Light brightness in percent per area state; 0 turns the lights off
    pub clear_state_dim: u8,
    pub occupied_state_dim: u8,
    pub extended_state_dim: u8,
    pub bright_state_dim: u8,
    pub sleep_state_dim: u8,
    pub accented_state_dim: u8,
}

impl AdvancedLightGroups {
    /// Brightness for `state`, capped at 100; `None` in manual
    pub fn dim_level(&self, state: AreaState) -> Option<u8> {
        let level = match state {
            AreaState::Clear => self.clear_state_dim,
            AreaState::Occupied => self.occupied_state_dim,
            AreaState::Extended => self.extended_state_dim,
            AreaState::Bright => self.bright_state_dim,
            AreaState::Sleep => self.sleep_state_dim,
            AreaState::Accented => self.accented_state_dim,
            AreaState::Manual => return None,
        };
        Some(level.min(100))
    }
}

impl Default for AdvancedLightGroups {
    fn default() -> Self {
        Self {
            include_entities: Vec::new(),
            exclude_entities: Vec::new(),
            on_states: vec![STATE_ON.to_string(), STATE_OPEN.to_string()],
            presence_device_platforms: vec!["media_player".into(), "binary_sensor".into()],
            presence_sensor_device_class: vec![
                "motion".into(),
                "occupancy".into(),
                "presence".into(),
            ],
            clear_state_dim: 0,
            occupied_state_dim: DEFAULT_OCCUPIED_DIM,
            extended_state_dim: 0,
            bright_state_dim: 0,
            sleep_state_dim: DEFAULT_SLEEP_DIM,
            accented_state_dim: 0,
        }
    }
}

/// Options of the `humidity` feature
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HumidityFeature {
    /// Gradient (units per second) above which humidity counts as rising
    pub humidity_up: f64,
    /// Gradient below which humidity counts as falling; negative
    pub humidity_down: f64,
    /// Sensor to monitor; the first humidity sensor of the area otherwise
    pub entity: Option<EntityId>,
}

impl Default for HumidityFeature {
    fn default() -> Self {
        Self {
            humidity_up: DEFAULT_HUMIDITY_UP,
            humidity_down: DEFAULT_HUMIDITY_DOWN,
            entity: None,
        }
    }
}

/// The closed set of features an area can enable
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Features {
    pub advanced_light_groups: Option<AdvancedLightGroups>,
    pub humidity: Option<HumidityFeature>,
    /// Enabled features that carry no options here
    pub flags: BTreeSet<String>,
}

impl Features {
    /// Convert the raw `features` mapping, disabling malformed entries
    pub fn from_mapping(area: &str, raw: &Mapping) -> Self {
        let mut features = Features::default();

        for (key, value) in raw {
            let Some(name) = key.as_str() else {
                warn!(area, key = ?key, "Ignoring non-string feature name");
                continue;
            };

            match name {
                FEATURE_ADVANCED_LIGHT_GROUPS => {
                    features.advanced_light_groups = parse_feature(area, name, value);
                }
                FEATURE_HUMIDITY => {
                    features.humidity = parse_feature(area, name, value);
                }
                flag if FLAG_FEATURES.contains(&flag) => match value {
                    Value::Null | Value::Mapping(_) | Value::Bool(true) => {
                        features.flags.insert(flag.to_string());
                    }
                    Value::Bool(false) => {}
                    other => {
                        warn!(area, feature = flag, value = ?other, "Feature has the wrong shape, disabling");
                    }
                },
                unknown => warn!(area, feature = unknown, "Ignoring unknown feature"),
            }
        }

        features
    }

    /// Presence options, defaulted when the feature is not enabled
    pub fn presence(&self) -> AdvancedLightGroups {
        self.advanced_light_groups.clone().unwrap_or_default()
    }

    pub fn is_enabled(&self, feature: &str) -> bool {
        match feature {
            FEATURE_ADVANCED_LIGHT_GROUPS => self.advanced_light_groups.is_some(),
            FEATURE_HUMIDITY => self.humidity.is_some(),
            other => self.flags.contains(other),
        }
    }
}

/// `null` enables a feature with defaults; anything that fails to parse
/// disables it
fn parse_feature<T>(area: &str, feature: &str, value: &Value) -> Option<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    if value.is_null() {
        return Some(T::default());
    }
    match serde_yaml::from_value::<T>(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(area, feature, error = %err, "Feature has the wrong shape, disabling");
            None
        }
    }
}

/// Area entry as written in YAML
#[derive(Debug, Deserialize)]
struct RawAreaConfig {
    area: String,
    #[serde(rename = "type", default)]
    kind: AreaKind,
    #[serde(default = "default_clear_timeout")]
    clear_timeout: u64,
    #[serde(default = "default_extended_timeout")]
    extended_timeout: u64,
    #[serde(default = "default_update_interval")]
    update_interval: u64,
    #[serde(default = "default_true")]
    light_control: bool,
    #[serde(default = "default_true")]
    fan_control: bool,
    #[serde(default = "default_manual_timeout")]
    manual_timeout: u64,
    sleep_entity: Option<EntityId>,
    #[serde(default = "default_state_check")]
    sleep_state_check: String,
    bright_entity: Option<EntityId>,
    #[serde(default = "default_state_check")]
    bright_state_check: String,
    accented_entity: Option<EntityId>,
    #[serde(default = "default_state_check")]
    accented_state_check: String,
    #[serde(default)]
    features: Mapping,
}

fn default_clear_timeout() -> u64 {
    DEFAULT_CLEAR_TIMEOUT
}
fn default_extended_timeout() -> u64 {
    DEFAULT_EXTENDED_TIMEOUT
}
fn default_update_interval() -> u64 {
    DEFAULT_UPDATE_INTERVAL
}
fn default_manual_timeout() -> u64 {
    DEFAULT_MANUAL_TIMEOUT
}
fn default_true() -> bool {
    true
}
fn default_state_check() -> String {
    STATE_ON.to_string()
}

/// Validated configuration of one area
#[derive(Debug, Clone, PartialEq)]
pub struct AreaConfig {
    /// Area registry id or name; the meta id for meta areas
    pub area: String,
    pub kind: AreaKind,
    pub clear_timeout: Duration,
    pub extended_timeout: Duration,
    pub update_interval: Duration,
    pub light_control: bool,
    pub fan_control: bool,
    pub manual_timeout: Duration,
    /// Overrides in priority order: sleep, bright, accented
    pub secondary_states: Vec<SecondaryState>,
    pub features: Features,
}

impl AreaConfig {
    /// A config with every option at its default
    pub fn new(area: impl Into<String>, kind: AreaKind) -> Self {
        Self {
            area: area.into(),
            kind,
            clear_timeout: Duration::from_secs(DEFAULT_CLEAR_TIMEOUT),
            extended_timeout: Duration::from_secs(DEFAULT_EXTENDED_TIMEOUT),
            update_interval: Duration::from_secs(DEFAULT_UPDATE_INTERVAL),
            light_control: true,
            fan_control: true,
            manual_timeout: Duration::from_secs(DEFAULT_MANUAL_TIMEOUT),
            secondary_states: Vec::new(),
            features: Features::default(),
        }
    }

    pub fn is_meta(&self) -> bool {
        self.kind == AreaKind::Meta
    }

    fn from_raw(raw: RawAreaConfig) -> ConfigResult<Self> {
        if raw.kind == AreaKind::Meta
            && ![META_GLOBAL, META_INTERIOR, META_EXTERIOR].contains(&raw.area.as_str())
        {
            return Err(ConfigError::InvalidValue {
                key: "area".to_string(),
                reason: format!(
                    "meta area must be one of {META_GLOBAL}, {META_INTERIOR}, {META_EXTERIOR}, got '{}'",
                    raw.area
                ),
            });
        }
        if raw.update_interval == 0 {
            return Err(ConfigError::InvalidValue {
                key: "update_interval".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let secondary_states = [
            (AreaState::Sleep, raw.sleep_entity, raw.sleep_state_check),
            (AreaState::Bright, raw.bright_entity, raw.bright_state_check),
            (AreaState::Accented, raw.accented_entity, raw.accented_state_check),
        ]
        .into_iter()
        .filter_map(|(state, entity, on_value)| {
            entity.map(|entity| SecondaryState {
                state,
                entity,
                on_value: on_value.to_lowercase(),
            })
        })
        .collect();

        Ok(Self {
            features: Features::from_mapping(&raw.area, &raw.features),
            area: raw.area,
            kind: raw.kind,
            clear_timeout: Duration::from_secs(raw.clear_timeout),
            extended_timeout: Duration::from_secs(raw.extended_timeout),
            update_interval: Duration::from_secs(raw.update_interval),
            light_control: raw.light_control,
            fan_control: raw.fan_control,
            manual_timeout: Duration::from_secs(raw.manual_timeout),
            secondary_states,
        })
    }
}

/// Every area entry of the config file, parsed independently
#[derive(Debug, Default)]
pub struct MagicAreasConfig {
    pub areas: Vec<ConfigResult<AreaConfig>>,
}

impl MagicAreasConfig {
    /// Load `magic_areas.yaml` from `config_dir`; a missing file means no areas
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        if !config_dir.join(CONFIG_FILE).exists() {
            warn!(dir = %config_dir.display(), "No {CONFIG_FILE} found, no areas configured");
            return Ok(Self::default());
        }
        let value = YamlLoader::new(config_dir).load_file(CONFIG_FILE)?;
        Self::from_value(value)
    }

    /// Split the document into per-area results.
    ///
    /// Only a document without an `areas` list is an error for the whole
    /// file; a bad area entry is an error for that area alone.
    pub fn from_value(value: Value) -> ConfigResult<Self> {
        let areas = match value {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(mut map) => match map.remove("areas") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Sequence(seq)) => seq,
                Some(_) => {
                    return Err(ConfigError::InvalidValue {
                        key: "areas".to_string(),
                        reason: "must be a list".to_string(),
                    })
                }
            },
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "<root>".to_string(),
                    reason: "must be a mapping".to_string(),
                })
            }
        };

        let areas = areas
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let label = entry
                    .get("area")
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_string();
                serde_yaml::from_value::<RawAreaConfig>(entry)
                    .map_err(|source| ConfigError::Area {
                        index,
                        area: label,
                        source,
                    })
                    .and_then(AreaConfig::from_raw)
            })
            .collect();

        Ok(Self { areas })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> MagicAreasConfig {
        MagicAreasConfig::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse("areas:\n  - area: kitchen\n");
        let area = config.areas[0].as_ref().unwrap();
        assert_eq!(area.kind, AreaKind::Interior);
        assert_eq!(area.clear_timeout, Duration::from_secs(360));
        assert_eq!(area.extended_timeout, Duration::from_secs(360));
        assert_eq!(area.update_interval, Duration::from_secs(1800));
        assert!(area.light_control && area.fan_control);
        assert!(area.secondary_states.is_empty());
        assert_eq!(area.features.presence().on_states, vec!["on", "open"]);
    }

    #[test]
    fn test_secondary_states_in_priority_order() {
        let config = parse(
            r#"
areas:
  - area: bedroom
    accented_entity: switch.tv
    bright_entity: binary_sensor.sunny
    bright_state_check: "ON"
    sleep_entity: input_boolean.sleep
"#,
        );
        let area = config.areas[0].as_ref().unwrap();
        let order: Vec<_> = area.secondary_states.iter().map(|s| s.state).collect();
        assert_eq!(order, vec![AreaState::Sleep, AreaState::Bright, AreaState::Accented]);
        assert_eq!(area.secondary_states[1].on_value, "on");
    }

    #[test]
    fn test_bad_area_does_not_affect_others() {
        let config = parse(
            r#"
areas:
  - area: kitchen
    clear_timeout: soon
  - area: hall
    clear_timeout: 30
  - area: upstairs
    type: meta
"#,
        );
        assert!(matches!(
            config.areas[0],
            Err(ConfigError::Area { index: 0, ref area, .. }) if area == "kitchen"
        ));
        assert_eq!(
            config.areas[1].as_ref().unwrap().clear_timeout,
            Duration::from_secs(30)
        );
        assert!(matches!(config.areas[2], Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_malformed_feature_is_disabled() {
        let config = parse(
            r#"
areas:
  - area: bath
    features:
      humidity: [1, 2]
      advanced_light_groups:
        on_states: [on, playing]
        exclude_entities: [binary_sensor.cat_flap]
      health:
      bogus: {}
"#,
        );
        let features = &config.areas[0].as_ref().unwrap().features;
        assert!(features.humidity.is_none());
        assert!(!features.is_enabled(FEATURE_HUMIDITY));
        let presence = features.presence();
        assert_eq!(presence.on_states, vec!["on", "playing"]);
        assert_eq!(presence.exclude_entities.len(), 1);
        assert_eq!(presence.presence_sensor_device_class.len(), 3);
        assert!(features.is_enabled("health"));
        assert!(!features.is_enabled("bogus"));
    }

    #[test]
    fn test_humidity_null_enables_defaults() {
        let config = parse("areas:\n  - area: bath\n    features:\n      humidity:\n");
        let humidity = config.areas[0].as_ref().unwrap().features.humidity.clone().unwrap();
        assert_eq!(humidity, HumidityFeature::default());
    }

    #[test]
    fn test_light_levels_per_state() {
        let config = parse(
            r#"
areas:
  - area: lounge
    features:
      advanced_light_groups:
        sleep_state_dim: 10
        bright_state_dim: 250
"#,
        );
        let presence = config.areas[0].as_ref().unwrap().features.presence();
        assert_eq!(presence.dim_level(AreaState::Occupied), Some(100));
        assert_eq!(presence.dim_level(AreaState::Sleep), Some(10));
        assert_eq!(presence.dim_level(AreaState::Bright), Some(100));
        assert_eq!(presence.dim_level(AreaState::Clear), Some(0));
        assert_eq!(presence.dim_level(AreaState::Manual), None);
        assert_eq!(AdvancedLightGroups::default().dim_level(AreaState::Sleep), Some(30));
    }

    #[test]
    fn test_missing_file_means_no_areas() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(MagicAreasConfig::load(dir.path()).unwrap().areas.is_empty());
    }
}
