//! Entity-filtered state change tracking

use std::collections::HashSet;

use ma_core::events::StateChangedData;
use ma_core::EntityId;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{EventBus, ListenerId, TypedEventReceiver};

/// Receives state changes for a fixed set of entities only
pub struct StateChangeReceiver {
    rx: TypedEventReceiver<StateChangedData>,
    entity_ids: HashSet<EntityId>,
}

impl StateChangeReceiver {
    pub fn new(bus: &EventBus, entity_ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            rx: bus.subscribe_typed::<StateChangedData>(),
            entity_ids: entity_ids.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
    }

    /// Wait for the next change of a tracked entity.
    ///
    /// `Lagged` is passed through so the caller can resynchronise from the
    /// state store.
    pub async fn recv(&mut self) -> Result<StateChangedData, RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if self.entity_ids.contains(&event.data.entity_id) {
                return Ok(event.data);
            }
        }
    }
}

/// Disposer for a listener task.
///
/// Dropping the subscription stops the callback; `dispose` does the same
/// explicitly. Either way the callback never runs afterwards.
#[must_use = "the callback is unregistered when the subscription is dropped"]
pub struct Subscription {
    id: ListenerId,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a listener task so that it is aborted on dispose
    pub fn from_task(id: ListenerId, handle: JoinHandle<()>) -> Self {
        Self {
            id,
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn dispose(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(listener = ?self.id, "Disposing state change listener");
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ma_core::{Context, EntityState};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    fn change(id: &str, state: &str) -> StateChangedData {
        let entity_id: EntityId = id.parse().unwrap();
        StateChangedData {
            entity_id: entity_id.clone(),
            old_state: None,
            new_state: Some(EntityState::new(
                entity_id,
                state,
                HashMap::new(),
                Context::new(),
            )),
        }
    }

    #[tokio::test]
    async fn test_receiver_filters_entities() {
        let bus = EventBus::new();
        let mut rx = StateChangeReceiver::new(&bus, ["binary_sensor.a".parse().unwrap()]);

        bus.fire_typed(change("binary_sensor.b", "on"), Context::new());
        bus.fire_typed(change("binary_sensor.a", "off"), Context::new());

        let got = rx.recv().await.unwrap();
        assert_eq!(got.entity_id.to_string(), "binary_sensor.a");
        assert_eq!(got.new_state.unwrap().state, "off");
    }

    #[tokio::test]
    async fn test_dispose_stops_listener() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut rx = StateChangeReceiver::new(&bus, ["switch.fan".parse().unwrap()]);
        let sink = seen.clone();
        let handle = tokio::spawn(async move {
            while let Ok(change) = rx.recv().await {
                let state = change.new_state.map(|s| s.state).unwrap_or_default();
                sink.lock().unwrap().push(format!("{}={state}", change.entity_id));
            }
        });
        let sub = Subscription::from_task(bus.next_listener_id(), handle);
        assert!(sub.is_active());

        bus.fire_typed(change("switch.fan", "unavailable"), Context::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["switch.fan=unavailable"]);

        sub.dispose();
        bus.fire_typed(change("switch.fan", "on"), Context::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
