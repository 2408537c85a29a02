use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ma_areas::{bind, ActuatorAction, FanBinding, Host, LightBinding, MagicAreas, RestoreStore};
use ma_config::{AreaConfig, MagicAreasConfig, SecondaryState};
use ma_core::events::{AreaReadyData, MagicAreasReadyData};
use ma_core::{AreaKind, AreaState, Context, EntityId};
use ma_event_bus::EventBus;
use ma_registries::Registries;
use ma_state_store::{Attributes, StateStore};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_test::assert_ok;

struct Home {
    _dir: TempDir,
    registries: Arc<Registries>,
    states: Arc<StateStore>,
}

impl Home {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let registries = Arc::new(Registries::new(dir.path()));
        let states = Arc::new(StateStore::new(Arc::new(EventBus::new())));
        Self {
            _dir: dir,
            registries,
            states,
        }
    }

    /// Same registries and storage, fresh state store
    fn restart(&self) -> Self {
        Self {
            _dir: TempDir::new().unwrap(),
            registries: Arc::clone(&self.registries),
            states: Arc::new(StateStore::new(Arc::new(EventBus::new()))),
        }
    }

    fn area(&self, name: &str) -> String {
        self.registries.areas.create(name).id.clone()
    }

    fn sensor(&self, id: &str, area_id: &str, attributes: Attributes, state: &str) -> EntityId {
        let entity_id: EntityId = id.parse().unwrap();
        let device_class = attributes
            .get("device_class")
            .and_then(|v| v.as_str())
            .map(String::from);
        self.registries
            .entities
            .get_or_create("test", entity_id.clone(), None, None, None);
        self.registries
            .entities
            .update(&entity_id, |e| {
                e.area_id = Some(area_id.to_string());
                e.original_device_class = device_class;
            })
            .unwrap();
        self.states
            .set(entity_id.clone(), state, attributes, Context::new());
        entity_id
    }

    fn motion(&self, id: &str, area_id: &str) -> EntityId {
        self.sensor(
            id,
            area_id,
            Attributes::from([("device_class".to_string(), json!("motion"))]),
            "off",
        )
    }

    fn set(&self, entity_id: &EntityId, state: &str) {
        let attributes = self
            .states
            .get(entity_id)
            .map(|s| s.attributes)
            .unwrap_or_default();
        self.states
            .set(entity_id.clone(), state, attributes, Context::new());
    }

    fn restore(&self) -> Arc<RestoreStore> {
        Arc::new(RestoreStore::new(Arc::clone(&self.registries.storage)))
    }

    async fn start(&self, areas: Vec<AreaConfig>, restore: Arc<RestoreStore>) -> MagicAreas {
        let config = MagicAreasConfig {
            areas: areas.into_iter().map(Ok).collect(),
        };
        let host = Host::new(Arc::clone(&self.registries), Arc::clone(&self.states));
        let areas = MagicAreas::setup(host, config, restore).await;
        settle().await;
        areas
    }
}

fn quick(area: &str, kind: AreaKind) -> AreaConfig {
    let mut config = AreaConfig::new(area, kind);
    config.clear_timeout = Duration::from_secs(3);
    config.extended_timeout = Duration::from_secs(2);
    config
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_clear_occupied_extended_clear() {
    let home = Home::new();
    let kitchen = home.area("Kitchen");
    let pir = home.motion("binary_sensor.kitchen_pir", &kitchen);

    let areas = home
        .start(vec![quick("kitchen", AreaKind::Interior)], home.restore())
        .await;
    let area = areas.area("kitchen").unwrap();
    assert_eq!(area.current_state(), AreaState::Clear);

    home.set(&pir, "on");
    settle().await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    sleep(Duration::from_millis(100)).await;
    home.set(&pir, "off");
    settle().await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    sleep(Duration::from_millis(2800)).await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(area.current_state(), AreaState::Extended);

    sleep(Duration::from_millis(1800)).await;
    assert_eq!(area.current_state(), AreaState::Extended);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(area.current_state(), AreaState::Clear);

    let published = home.states.get(area.state_entity()).unwrap();
    assert_eq!(published.entity_id.to_string(), "sensor.magic_areas_state_kitchen");
    assert_eq!(published.state, "clear");
    assert_eq!(
        published.attribute::<Vec<String>>("presence_sensors"),
        Some(vec!["binary_sensor.kitchen_pir".to_string()])
    );
    assert_eq!(
        published.attribute::<Vec<String>>("last_active_sensors"),
        Some(vec!["binary_sensor.kitchen_pir".to_string()])
    );
    assert!(published.attribute::<String>("last_off_time").is_some());

    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_sensor_does_not_start_clearing() {
    let home = Home::new();
    let den = home.area("Den");
    let pir = home.motion("binary_sensor.den_pir", &den);
    let areas = home
        .start(vec![quick("den", AreaKind::Interior)], home.restore())
        .await;
    let area = areas.area("den").unwrap();

    home.set(&pir, "on");
    settle().await;
    home.set(&pir, "unavailable");
    sleep(Duration::from_secs(30)).await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_sensor_lost_to_unavailable_starts_clearing() {
    let home = Home::new();
    let den = home.area("Den");
    let sofa = home.motion("binary_sensor.den_sofa", &den);
    home.motion("binary_sensor.den_door", &den);
    let areas = home
        .start(vec![quick("den", AreaKind::Interior)], home.restore())
        .await;
    let area = areas.area("den").unwrap();

    home.set(&sofa, "on");
    settle().await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    // The door sensor still reads off, so nothing reports presence
    home.set(&sofa, "unavailable");
    settle().await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    sleep(Duration::from_millis(2800)).await;
    assert_eq!(area.current_state(), AreaState::Occupied);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(area.current_state(), AreaState::Extended);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(area.current_state(), AreaState::Clear);

    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_off_after_unavailable_keeps_grace_window() {
    let home = Home::new();
    let porch = home.area("Porch");
    let pir = home.motion("binary_sensor.porch_pir", &porch);
    let areas = home
        .start(vec![quick("porch", AreaKind::Exterior)], home.restore())
        .await;
    let area = areas.area("porch").unwrap();

    home.set(&pir, "on");
    settle().await;
    home.set(&pir, "unavailable");
    sleep(Duration::from_secs(10)).await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    home.set(&pir, "off");
    settle().await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    sleep(Duration::from_millis(2800)).await;
    assert_eq!(area.current_state(), AreaState::Occupied);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(area.current_state(), AreaState::Extended);

    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_manual_mode_freezes_state() {
    let home = Home::new();
    let office = home.area("Office");
    let pir = home.motion("binary_sensor.office_pir", &office);
    let areas = home
        .start(vec![quick("office", AreaKind::Interior)], home.restore())
        .await;
    let area = areas.area("office").unwrap();

    home.set(&pir, "on");
    settle().await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    area.set_control_enabled(false);
    settle().await;
    assert!(!area.is_control_enabled());
    assert_eq!(area.current_state(), AreaState::Manual);

    home.set(&pir, "off");
    sleep(Duration::from_secs(10)).await;
    assert_eq!(area.current_state(), AreaState::Manual);

    area.set_control_enabled(true);
    settle().await;
    assert_eq!(area.current_state(), AreaState::Clear);

    area.set_control_enabled(false);
    settle().await;
    home.set(&pir, "on");
    area.set_control_enabled(true);
    settle().await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_secondary_state_overrides_occupied() {
    let home = Home::new();
    let bedroom = home.area("Bedroom");
    let pir = home.motion("binary_sensor.bedroom_pir", &bedroom);
    let sleep_mode = home.sensor("input_boolean.sleep_mode", "hallway", Attributes::new(), "off");

    let mut config = quick("bedroom", AreaKind::Interior);
    config.secondary_states.push(SecondaryState {
        state: AreaState::Sleep,
        entity: sleep_mode.clone(),
        on_value: "on".to_string(),
    });
    let areas = home.start(vec![config], home.restore()).await;
    let area = areas.area("bedroom").unwrap();

    home.set(&pir, "on");
    settle().await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    home.set(&sleep_mode, "on");
    settle().await;
    assert_eq!(area.current_state(), AreaState::Sleep);

    home.set(&sleep_mode, "off");
    settle().await;
    assert_eq!(area.current_state(), AreaState::Occupied);

    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_meta_areas_aggregate_children() {
    let home = Home::new();
    let kitchen = home.area("Kitchen");
    let garden = home.area("Garden");
    home.motion("binary_sensor.kitchen_pir", &kitchen);
    let garden_pir = home.motion("binary_sensor.garden_pir", &garden);

    let areas = home
        .start(
            vec![
                quick("global", AreaKind::Meta),
                quick("interior", AreaKind::Meta),
                quick("kitchen", AreaKind::Interior),
                quick("garden", AreaKind::Exterior),
            ],
            home.restore(),
        )
        .await;
    let global = areas.area("global").unwrap();
    let interior = areas.area("interior").unwrap();

    home.set(&garden_pir, "on");
    settle().await;
    assert_eq!(areas.area("garden").unwrap().current_state(), AreaState::Occupied);
    assert_eq!(global.current_state(), AreaState::Occupied);
    assert_eq!(global.get_active_children(), vec!["garden".to_string()]);
    assert_eq!(interior.current_state(), AreaState::Clear);

    let published = home.states.get(global.state_entity()).unwrap();
    assert_eq!(
        published.attribute::<Vec<String>>("areas"),
        Some(vec!["garden".to_string(), "kitchen".to_string()])
    );

    // The child clears after 5s; the meta area then runs its own timeouts
    home.set(&garden_pir, "off");
    sleep(Duration::from_millis(5200)).await;
    assert_eq!(areas.area("garden").unwrap().current_state(), AreaState::Clear);
    assert!(global.current_state().is_occupied_class());
    assert!(global.get_active_children().is_empty());

    sleep(Duration::from_secs(6)).await;
    assert_eq!(global.current_state(), AreaState::Clear);

    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_humidity_trend_counts_as_presence() {
    let home = Home::new();
    let bathroom = home.area("Bathroom");
    let humidity = home.sensor(
        "sensor.bathroom_humidity",
        &bathroom,
        Attributes::from([
            ("device_class".to_string(), json!("humidity")),
            ("unit_of_measurement".to_string(), json!("%")),
        ]),
        "10",
    );

    let areas = home
        .start(vec![quick("bathroom", AreaKind::Interior)], home.restore())
        .await;
    let area = areas.area("bathroom").unwrap();
    let signals = area.humidity_signals().cloned().unwrap();
    assert_eq!(area.current_state(), AreaState::Clear);

    for value in ["20", "30"] {
        sleep(Duration::from_secs(5)).await;
        home.set(&humidity, value);
    }
    settle().await;

    assert_eq!(home.states.get_state(&signals.rising).as_deref(), Some("on"));
    assert_eq!(home.states.get_state(&signals.falling).as_deref(), Some("off"));
    assert_eq!(area.current_state(), AreaState::Occupied);

    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_state_change_callbacks_and_ready_events() {
    let home = Home::new();
    let hall = home.area("Hall");
    let pir = home.motion("binary_sensor.hall_pir", &hall);

    let mut area_ready = home.states.event_bus().subscribe_typed::<AreaReadyData>();
    let mut all_ready = home.states.event_bus().subscribe_typed::<MagicAreasReadyData>();

    let areas = home
        .start(vec![quick("hall", AreaKind::Interior)], home.restore())
        .await;
    assert_eq!(area_ready.try_recv().unwrap().data.id, "hall");
    assert!(all_ready.try_recv().is_ok());

    let area = areas.area("hall").unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = area.on_state_change(move |old, new| {
        let _ = tx.send((old, new));
    });

    home.set(&pir, "on");
    settle().await;
    assert_eq!(rx.try_recv().unwrap(), (AreaState::Clear, AreaState::Occupied));

    subscription.dispose();
    home.set(&pir, "off");
    sleep(Duration::from_secs(4)).await;
    assert_eq!(area.current_state(), AreaState::Extended);
    assert!(rx.try_recv().is_err());

    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_fan_binding_runs_in_extended() {
    let home = Home::new();
    let laundry = home.area("Laundry");
    let pir = home.motion("binary_sensor.laundry_pir", &laundry);
    let fan: EntityId = "fan.laundry".parse().unwrap();

    let mut config = quick("laundry", AreaKind::Interior);
    config.fan_control = true;
    let areas = home.start(vec![config], home.restore()).await;
    let area = areas.area("laundry").unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let _binding = bind(&area, FanBinding::new(fan.clone(), area.config()), tx);

    home.set(&pir, "on");
    settle().await;
    home.set(&pir, "off");
    sleep(Duration::from_millis(3100)).await;
    assert_eq!(area.current_state(), AreaState::Extended);

    let command = rx.try_recv().unwrap();
    assert_eq!(command.entity_id, fan);
    assert_eq!(command.action, ActuatorAction::TurnOn);

    // Apply it the way the host would
    home.states.set(
        fan.clone(),
        "on",
        Attributes::new(),
        command.context.child(),
    );
    sleep(Duration::from_secs(2)).await;
    assert_eq!(area.current_state(), AreaState::Clear);
    assert_eq!(rx.try_recv().unwrap().action, ActuatorAction::TurnOff);

    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_light_binding_dims_for_sleep() {
    let home = Home::new();
    let bedroom = home.area("Bedroom");
    let pir = home.motion("binary_sensor.bedroom_pir", &bedroom);
    let sleep_mode = home.sensor("input_boolean.sleep_mode", "hallway", Attributes::new(), "off");
    let light: EntityId = "light.bedroom".parse().unwrap();

    let mut config = quick("bedroom", AreaKind::Interior);
    config.secondary_states.push(SecondaryState {
        state: AreaState::Sleep,
        entity: sleep_mode.clone(),
        on_value: "on".to_string(),
    });
    let areas = home.start(vec![config], home.restore()).await;
    let area = areas.area("bedroom").unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let _binding = bind(&area, LightBinding::new(light.clone(), area.config()), tx);

    home.set(&pir, "on");
    settle().await;
    let command = rx.try_recv().unwrap();
    assert_eq!(command.entity_id, light);
    assert_eq!(command.action, ActuatorAction::TurnOn);
    assert_eq!(command.brightness_pct, Some(100));

    home.set(&sleep_mode, "on");
    settle().await;
    assert_eq!(area.current_state(), AreaState::Sleep);
    assert_eq!(rx.try_recv().unwrap().brightness_pct, Some(30));

    home.set(&pir, "off");
    home.set(&sleep_mode, "off");
    sleep(Duration::from_millis(3100)).await;
    assert_eq!(area.current_state(), AreaState::Extended);
    assert_eq!(rx.try_recv().unwrap().action, ActuatorAction::TurnOff);

    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_control_switch_is_restored() {
    let home = Home::new();
    let study = home.area("Study");
    home.motion("binary_sensor.study_pir", &study);

    let areas = home
        .start(vec![quick("study", AreaKind::Interior)], home.restore())
        .await;
    areas.area("study").unwrap().set_control_enabled(false);
    settle().await;
    assert_ok!(areas.shutdown().await);

    let next = home.restart();
    let restore = next.restore();
    assert_ok!(restore.load().await);
    assert_eq!(restore.len(), 2);

    let areas = next
        .start(vec![quick("study", AreaKind::Interior)], restore)
        .await;
    let area = areas.area("study").unwrap();
    assert!(!area.is_control_enabled());
    assert_eq!(area.current_state(), AreaState::Manual);
    assert_ok!(areas.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_extended_area_finishes_after_restart() {
    let home = Home::new();
    let lounge = home.area("Lounge");
    let pir = home.motion("binary_sensor.lounge_pir", &lounge);

    let areas = home
        .start(vec![quick("lounge", AreaKind::Interior)], home.restore())
        .await;
    home.set(&pir, "on");
    settle().await;
    home.set(&pir, "off");
    sleep(Duration::from_millis(3100)).await;
    assert_eq!(areas.area("lounge").unwrap().current_state(), AreaState::Extended);
    assert_ok!(areas.shutdown().await);

    let next = home.restart();
    let restore = next.restore();
    assert_ok!(restore.load().await);
    let state_entity: EntityId = "sensor.magic_areas_state_lounge".parse().unwrap();
    let mut persisted = restore.get(&state_entity).unwrap();
    assert_eq!(persisted.state, "extended");
    assert!(persisted.last_off_time.is_some());

    // Pretend the restart took a while: one second of the extended window remains
    persisted.last_off_time = Some(Utc::now() - chrono::Duration::seconds(4));
    restore.record(persisted);

    next.motion("binary_sensor.lounge_pir", &lounge);
    let areas = next
        .start(vec![quick("lounge", AreaKind::Interior)], restore)
        .await;
    let area = areas.area("lounge").unwrap();
    assert_eq!(area.current_state(), AreaState::Extended);
    assert!(area.snapshot().last_off_time.is_some());

    sleep(Duration::from_millis(800)).await;
    assert_eq!(area.current_state(), AreaState::Extended);
    sleep(Duration::from_millis(400)).await;
    assert_eq!(area.current_state(), AreaState::Clear);

    assert_ok!(areas.shutdown().await);
}

#[tokio::test]
async fn test_unknown_area_is_skipped() {
    let home = Home::new();
    home.area("Kitchen");
    let areas = home
        .start(
            vec![
                AreaConfig::new("attic", AreaKind::Interior),
                AreaConfig::new("kitchen", AreaKind::Interior),
            ],
            home.restore(),
        )
        .await;
    assert!(areas.area("attic").is_none());
    assert_eq!(
        areas.area("kitchen").unwrap().current_state(),
        AreaState::Clear
    );
    assert!(areas.directory().areas_loaded());
    assert_ok!(areas.shutdown().await);
}
