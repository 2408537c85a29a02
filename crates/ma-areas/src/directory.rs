//! Cross-area lookup
//!
//! The [`AreaDirectory`] is the only way one area learns about another. It
//! hands out [`AreaHandle`]s, which expose the published state of an area and
//! never its machine or timers.

use std::sync::{Arc, Mutex};

use dashmap::{DashMap, DashSet};
use ma_config::{AreaConfig, META_EXTERIOR, META_INTERIOR};
use ma_core::{AreaKind, AreaState, Context, EntityId};
use ma_event_bus::Subscription;
use ma_state_store::StateStore;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::machine::Transition;
use crate::presence::HumiditySignals;
use crate::runtime::AreaSnapshot;
use crate::switch::SystemControlSwitch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaInfo {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub kind: AreaKind,
}

/// Read side of a running area
pub struct AreaHandle {
    info: Arc<AreaInfo>,
    config: Arc<AreaConfig>,
    state_entity: EntityId,
    control_switch: EntityId,
    humidity: Option<HumiditySignals>,
    store: Arc<StateStore>,
    snapshot: watch::Receiver<AreaSnapshot>,
    transitions: broadcast::Sender<Transition>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct AreaHandleParts {
    pub info: Arc<AreaInfo>,
    pub config: Arc<AreaConfig>,
    pub state_entity: EntityId,
    pub control_switch: EntityId,
    pub humidity: Option<HumiditySignals>,
    pub store: Arc<StateStore>,
    pub snapshot: watch::Receiver<AreaSnapshot>,
    pub transitions: broadcast::Sender<Transition>,
}

impl AreaHandle {
    pub(crate) fn new(parts: AreaHandleParts) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            info: parts.info,
            config: parts.config,
            state_entity: parts.state_entity,
            control_switch: parts.control_switch,
            humidity: parts.humidity,
            store: parts.store,
            snapshot: parts.snapshot,
            transitions: parts.transitions,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn slug(&self) -> &str {
        &self.info.slug
    }

    pub fn kind(&self) -> AreaKind {
        self.info.kind
    }

    pub fn config(&self) -> &AreaConfig {
        &self.config
    }

    pub fn state_entity(&self) -> &EntityId {
        &self.state_entity
    }

    pub fn control_switch(&self) -> &EntityId {
        &self.control_switch
    }

    pub fn humidity_signals(&self) -> Option<&HumiditySignals> {
        self.humidity.as_ref()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn current_state(&self) -> AreaState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> AreaSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that observes every published snapshot
    pub fn watch(&self) -> watch::Receiver<AreaSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// Call `callback(old, new)` on every transition until the returned
    /// subscription is dropped
    pub fn on_state_change<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(AreaState, AreaState) + Send + 'static,
    {
        let id = self.store.event_bus().next_listener_id();
        let mut rx = self.transitions.subscribe();
        let area = self.info.slug.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(transition) => callback(transition.from, transition.to),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(area = %area, skipped, "State change callback lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Subscription::from_task(id, handle)
    }

    pub fn is_control_enabled(&self) -> bool {
        SystemControlSwitch::is_enabled(&self.store, &self.control_switch)
    }

    /// Flip the system control switch; the area recomputes on the change
    pub fn set_control_enabled(&self, enabled: bool) {
        SystemControlSwitch::write(&self.store, &self.control_switch, enabled, Context::new());
    }

    /// Currently occupied children; always empty for non-meta areas
    pub fn get_active_children(&self) -> Vec<String> {
        self.snapshot.borrow().active_children.clone()
    }

    pub(crate) fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub(crate) fn attach(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Signal every task of the area and wait for them to finish
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        for task in self.take_tasks() {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!(area = %self.info.slug, error = %err, "Area task panicked");
                }
            }
        }
        debug!(area = %self.info.slug, "Area stopped");
    }

    pub(crate) fn abort(&self) {
        for task in self.take_tasks() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.iter().any(|t| !t.is_finished()))
            .unwrap_or(false)
    }
}

/// Every area set up by the integration
#[derive(Default)]
pub struct AreaDirectory {
    areas: DashMap<String, Arc<AreaHandle>>,
    expected: DashSet<String>,
}

impl AreaDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a non-meta area that is about to be set up
    pub fn expect(&self, area_id: &str) {
        self.expected.insert(area_id.to_string());
    }

    /// Stop waiting for an area whose setup failed
    pub fn forget(&self, area_id: &str) {
        self.expected.remove(area_id);
    }

    pub fn register(&self, handle: Arc<AreaHandle>) {
        debug!(area = %handle.id(), "Registered area");
        self.areas.insert(handle.id().to_string(), handle);
    }

    pub fn get(&self, area_id: &str) -> Option<Arc<AreaHandle>> {
        self.areas.get(area_id).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, area_id: &str) -> bool {
        self.areas.contains_key(area_id)
    }

    pub fn remove(&self, area_id: &str) -> Option<Arc<AreaHandle>> {
        self.expected.remove(area_id);
        self.areas.remove(area_id).map(|(_, handle)| handle)
    }

    /// True once every expected non-meta area is registered
    pub fn areas_loaded(&self) -> bool {
        self.expected.iter().all(|id| self.areas.contains_key(id.key()))
    }

    /// All handles ordered by id
    pub fn handles(&self) -> Vec<Arc<AreaHandle>> {
        let mut handles: Vec<_> = self.areas.iter().map(|h| Arc::clone(h.value())).collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    /// The children a meta area aggregates: every non-meta area for
    /// `global`, only matching kinds for `interior` and `exterior`
    pub fn children_of(&self, meta_id: &str) -> Vec<Arc<AreaHandle>> {
        let wanted = match meta_id {
            META_INTERIOR => Some(AreaKind::Interior),
            META_EXTERIOR => Some(AreaKind::Exterior),
            _ => None,
        };
        self.handles()
            .into_iter()
            .filter(|h| h.kind() != AreaKind::Meta)
            .filter(|h| wanted.map_or(true, |kind| h.kind() == kind))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }
}
