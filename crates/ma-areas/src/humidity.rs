//! Humidity trend sensors of an area
//!
//! A [`HumidityMonitor`] feeds one humidity sensor into a rising and a falling
//! [`HumidityTrendTracker`] and publishes each verdict as a binary sensor. The
//! area state machine only ever sees those binary sensors.

use std::sync::Arc;
use std::time::Duration;

use ma_config::HumidityFeature;
use ma_core::{domains, Context, EntityId, EntityIdError, EntityState, STATE_OFF, STATE_ON};
use ma_event_bus::StateChangeReceiver;
use ma_state_store::{Attributes, StateStore};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::entity::{names, MagicEntity, Restorable, StateObserving};
use crate::presence::HumiditySignals;
use crate::restore::PersistedState;
use crate::trend::{least_squares_slope, HumidityTrendTracker, TrendSettings};

/// Re-evaluation period between readings, so aged samples are evicted
pub const EVALUATION_INTERVAL: Duration = Duration::from_secs(60);

const DEVICE_CLASS_MOISTURE: &str = "moisture";

/// A published trend binary sensor and the tracker behind it
#[derive(Debug, Clone)]
pub struct TrendSensor {
    entity: MagicEntity,
    tracker: HumidityTrendTracker,
}

impl TrendSensor {
    fn new(
        name: &'static str,
        settings: TrendSettings,
        area_id: &str,
        slug: &str,
    ) -> Result<Self, EntityIdError> {
        Ok(Self {
            entity: MagicEntity::new(domains::BINARY_SENSOR, name, area_id, slug)?,
            tracker: HumidityTrendTracker::new(settings),
        })
    }

    pub fn tracker(&self) -> &HumidityTrendTracker {
        &self.tracker
    }
}

impl Restorable for TrendSensor {
    fn entity(&self) -> &MagicEntity {
        &self.entity
    }

    fn restore(&mut self, persisted: &PersistedState) {
        match persisted.state.as_str() {
            STATE_ON => self.tracker.restore_active(true),
            STATE_OFF => self.tracker.restore_active(false),
            other => {
                debug!(entity_id = %self.entity.entity_id, state = other, "Ignoring restored trend state")
            }
        }
    }
}

pub struct HumidityMonitor {
    slug: String,
    source: EntityId,
    rising: TrendSensor,
    falling: TrendSensor,
    store: Arc<StateStore>,
}

impl HumidityMonitor {
    pub fn new(
        area_id: &str,
        slug: &str,
        source: EntityId,
        feature: &HumidityFeature,
        store: Arc<StateStore>,
    ) -> Result<Self, EntityIdError> {
        Ok(Self {
            slug: slug.to_string(),
            source,
            rising: TrendSensor::new(
                names::HUMIDITY_OCCUPIED,
                TrendSettings::rising(feature.humidity_up),
                area_id,
                slug,
            )?,
            falling: TrendSensor::new(
                names::HUMIDITY_EMPTY,
                TrendSettings::falling(feature.humidity_down),
                area_id,
                slug,
            )?,
            store,
        })
    }

    pub fn signals(&self) -> HumiditySignals {
        HumiditySignals {
            rising: self.rising.entity.entity_id.clone(),
            falling: self.falling.entity.entity_id.clone(),
        }
    }

    pub fn sensors(&self) -> [&TrendSensor; 2] {
        [&self.rising, &self.falling]
    }

    pub fn sensors_mut(&mut self) -> [&mut TrendSensor; 2] {
        [&mut self.rising, &mut self.falling]
    }

    pub fn source(&self) -> &EntityId {
        &self.source
    }

    fn ingest(&mut self, state: &EntityState, at: Instant) -> bool {
        let Some(value) = state.as_f64() else {
            debug!(area = %self.slug, entity_id = %state.entity_id, state = %state.state, "Ignoring non-numeric humidity reading");
            return false;
        };
        self.rising.tracker.ingest(at, value);
        self.falling.tracker.ingest(at, value);
        true
    }

    async fn evaluate(&mut self, now: Instant) {
        evaluate_tracker(&mut self.rising.tracker, now).await;
        evaluate_tracker(&mut self.falling.tracker, now).await;
        self.publish();
    }

    /// Write both binary sensors when their state or attributes moved
    pub fn publish(&self) {
        for TrendSensor { entity, tracker } in [&self.rising, &self.falling] {
            let state = if tracker.is_active() { STATE_ON } else { STATE_OFF };
            let attributes = Attributes::from([
                ("device_class".to_string(), json!(DEVICE_CLASS_MOISTURE)),
                ("gradient".to_string(), json!(tracker.gradient())),
                ("min_gradient".to_string(), json!(tracker.settings().threshold)),
                ("entity_to_monitor".to_string(), json!(self.source.to_string())),
            ]);
            let unchanged = self
                .store
                .get(&entity.entity_id)
                .is_some_and(|current| current.state == state && current.attributes == attributes);
            if !unchanged {
                self.store
                    .set(entity.entity_id.clone(), state, attributes, Context::new());
            }
        }
    }

    /// Follow the source sensor until `shutdown` fires
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut changes = StateChangeReceiver::new(self.store.event_bus(), [self.source.clone()]);
        let mut tick = interval_at(Instant::now() + EVALUATION_INTERVAL, EVALUATION_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Some(current) = self.store.get(&self.source) {
            self.ingest(&current, Instant::now());
        }
        self.evaluate(Instant::now()).await;
        debug!(area = %self.slug, source = %self.source, "Humidity monitor started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                change = changes.recv() => match change {
                    Ok(change) => {
                        let now = Instant::now();
                        if let Some(state) = change.new_state {
                            if self.ingest(&state, now) {
                                self.evaluate(now).await;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(area = %self.slug, skipped, "Humidity monitor lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = tick.tick() => self.evaluate(Instant::now()).await,
            }
        }
        debug!(area = %self.slug, "Humidity monitor stopped");
    }
}

impl StateObserving for HumidityMonitor {
    fn observed_entities(&self) -> Vec<EntityId> {
        vec![self.source.clone()]
    }
}

/// Run the regression off the async workers and apply it here
async fn evaluate_tracker(tracker: &mut HumidityTrendTracker, now: Instant) {
    let Some(points) = tracker.prepare(now) else {
        return;
    };
    match tokio::task::spawn_blocking(move || least_squares_slope(&points)).await {
        Ok(gradient) => {
            tracker.apply(gradient);
        }
        Err(err) => warn!(error = %err, "Trend regression failed"),
    }
}
