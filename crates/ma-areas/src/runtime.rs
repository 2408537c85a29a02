//! The task that drives one area's state machine
//!
//! Each area runs in its own task and is the only writer of its machine and
//! its timers. Input changes, timer deadlines and the periodic safety-net
//! recompute are multiplexed with `select!`; other areas only see the
//! published state entity.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ma_config::AreaConfig;
use ma_core::events::StateChangedData;
use ma_core::{domains, AreaState, Context, EntityId, EntityIdError};
use ma_event_bus::StateChangeReceiver;
use ma_state_store::{Attributes, StateStore};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::directory::AreaInfo;
use crate::entity::{names, MagicEntity, Restorable, StateObserving};
use crate::machine::{OccupancyStateMachine, Transition};
use crate::presence::{AreaSources, Evidence, PresenceSources};
use crate::restore::PersistedState;

const TRANSITION_CAPACITY: usize = 64;

/// The latest published view of an area
#[derive(Debug, Clone, PartialEq)]
pub struct AreaSnapshot {
    pub state: AreaState,
    pub active_sensors: Vec<EntityId>,
    pub active_children: Vec<String>,
    pub last_off_time: Option<DateTime<Utc>>,
}

impl AreaSnapshot {
    fn initial(state: AreaState) -> Self {
        Self {
            state,
            active_sensors: Vec::new(),
            active_children: Vec::new(),
            last_off_time: None,
        }
    }
}

/// `sensor.magic_areas_state_<slug>`
#[derive(Debug, Clone)]
pub struct AreaStateSensor {
    entity: MagicEntity,
    restored: Option<(AreaState, Option<DateTime<Utc>>)>,
}

impl AreaStateSensor {
    pub fn new(area_id: &str, slug: &str) -> Result<Self, EntityIdError> {
        Ok(Self {
            entity: MagicEntity::new(domains::SENSOR, names::STATE, area_id, slug)?,
            restored: None,
        })
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity.entity_id
    }
}

impl Restorable for AreaStateSensor {
    fn entity(&self) -> &MagicEntity {
        &self.entity
    }

    fn restore(&mut self, persisted: &PersistedState) {
        match persisted.state.parse::<AreaState>() {
            Ok(state) => self.restored = Some((state, persisted.last_off_time)),
            Err(err) => {
                warn!(entity_id = %self.entity.entity_id, error = %err, "Ignoring restored area state")
            }
        }
    }
}

pub(crate) struct AreaTask {
    info: Arc<AreaInfo>,
    sources: AreaSources,
    machine: OccupancyStateMachine,
    store: Arc<StateStore>,
    state_entity: EntityId,
    update_interval: Duration,
    changes: StateChangeReceiver,
    snapshot: watch::Sender<AreaSnapshot>,
    transitions: broadcast::Sender<Transition>,
    last_active: Vec<String>,
    humidity_was_active: bool,
}

impl AreaTask {
    pub(crate) fn new(
        info: Arc<AreaInfo>,
        config: &AreaConfig,
        sources: AreaSources,
        sensor: &AreaStateSensor,
        store: Arc<StateStore>,
    ) -> Self {
        let mut machine = OccupancyStateMachine::new(config.clear_timeout, config.extended_timeout);
        if let Some((state, last_off_time)) = sensor.restored {
            debug!(area = %info.slug, state = %state, "Seeding restored area state");
            machine.seed(state, last_off_time, Instant::now(), Utc::now());
        }

        // Subscribe before the task is spawned so no change is missed
        let changes = StateChangeReceiver::new(store.event_bus(), sources.observed_entities());
        let (snapshot, _) = watch::channel(AreaSnapshot::initial(machine.state()));
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);

        Self {
            info,
            sources,
            machine,
            store,
            state_entity: sensor.entity_id().clone(),
            update_interval: config.update_interval,
            changes,
            snapshot,
            transitions,
            last_active: Vec::new(),
            humidity_was_active: false,
        }
    }

    pub(crate) fn subscribe_snapshot(&self) -> watch::Receiver<AreaSnapshot> {
        self.snapshot.subscribe()
    }

    pub(crate) fn transitions(&self) -> broadcast::Sender<Transition> {
        self.transitions.clone()
    }

    pub(crate) async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut safety = interval_at(Instant::now() + self.update_interval, self.update_interval);
        safety.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.changes.is_empty() {
            info!(area = %self.info.slug, "Area has no tracked entities");
        }
        self.humidity_was_active = self.evidence().humidity_active() == Some(true);
        self.refresh(Instant::now());
        info!(area = %self.info.slug, kind = %self.info.kind, state = %self.machine.state(), "Area state machine started");

        loop {
            let deadline = self.machine.next_deadline();
            tokio::select! {
                _ = shutdown.recv() => break,
                change = self.changes.recv() => match change {
                    Ok(change) => self.handle_change(change),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(area = %self.info.slug, skipped, "Area lagged behind state changes, resynchronising");
                        self.refresh(Instant::now());
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let now = Instant::now();
                    let transition = self.machine.fire_due(&Evidence::new(&self.sources, &self.store), now);
                    self.commit(transition);
                }
                _ = safety.tick() => {
                    trace!(area = %self.info.slug, "Periodic recompute");
                    self.refresh(Instant::now());
                }
            }
        }

        self.machine.cancel_timers();
        info!(area = %self.info.slug, "Area state machine stopped");
    }

    fn evidence(&self) -> Evidence<'_> {
        Evidence::new(&self.sources, &self.store)
    }

    fn handle_change(&mut self, change: StateChangedData) {
        let now = Instant::now();

        if self.sources.is_presence(&change.entity_id)
            && self
                .sources
                .lost_evidence(change.old_state.as_ref(), change.new_state.as_ref())
        {
            debug!(area = %self.info.slug, entity_id = %change.entity_id, "Presence evidence lost");
            self.machine.note_evidence_lost(now, Utc::now());
        }

        if self.sources.is_humidity_signal(&change.entity_id) {
            let humidity = self.evidence().humidity_active();
            match humidity {
                Some(active) => {
                    if self.humidity_was_active && !active {
                        debug!(area = %self.info.slug, "Humidity evidence lost");
                        self.machine.note_evidence_lost(now, Utc::now());
                    }
                    self.humidity_was_active = active;
                }
                None => trace!(area = %self.info.slug, "Humidity trend unreadable"),
            }
        }

        self.refresh(now);
    }

    fn refresh(&mut self, now: Instant) {
        let transition = self
            .machine
            .recompute(&Evidence::new(&self.sources, &self.store), now);
        self.commit(transition);
    }

    fn commit(&mut self, transition: Option<Transition>) {
        self.publish();
        if let Some(transition) = transition {
            info!(
                area = %self.info.slug,
                from = %transition.from,
                to = %transition.to,
                "Area state changed"
            );
            // No receivers is fine
            let _ = self.transitions.send(transition);
        }
    }

    fn publish(&mut self) {
        let evidence = Evidence::new(&self.sources, &self.store);
        let active_sensors = evidence.active_sensors();
        let active_children = evidence.active_children();
        let state = self.machine.state();

        if !active_sensors.is_empty() {
            self.last_active = active_sensors.iter().map(ToString::to_string).collect();
        }

        let presence: Vec<String> = self
            .sources
            .presence_entities()
            .iter()
            .map(ToString::to_string)
            .collect();
        let active: Vec<String> = active_sensors.iter().map(ToString::to_string).collect();

        let mut attributes = Attributes::from([
            ("state".to_string(), json!(state.as_str())),
            ("type".to_string(), json!(self.info.kind.as_str())),
            ("clear_timeout".to_string(), json!(self.machine.clear_timeout().as_secs())),
            ("extended_timeout".to_string(), json!(self.machine.extended_timeout().as_secs())),
            ("presence_sensors".to_string(), json!(presence)),
            ("active_sensors".to_string(), json!(active)),
            ("last_active_sensors".to_string(), json!(self.last_active)),
            ("clear".to_string(), json!(self.machine.clear_pending())),
            ("extended".to_string(), json!(self.machine.extended_pending())),
            (
                "last_off_time".to_string(),
                json!(self.machine.last_off_time().map(|t| t.to_rfc3339())),
            ),
        ]);
        if let PresenceSources::Children(children) = &self.sources.presence {
            let areas: Vec<&str> = children.iter().map(|c| c.area_id.as_str()).collect();
            attributes.insert("areas".to_string(), json!(areas));
            attributes.insert("active_areas".to_string(), json!(active_children));
        }

        let unchanged = self.store.get(&self.state_entity).is_some_and(|current| {
            current.state == state.as_str() && current.attributes == attributes
        });
        if !unchanged {
            self.store
                .set(self.state_entity.clone(), state.as_str(), attributes, Context::new());
        }

        self.snapshot.send_replace(AreaSnapshot {
            state,
            active_sensors,
            active_children,
            last_off_time: self.machine.last_off_time(),
        });
    }
}
