//! Event bus with typed pub/sub
//!
//! The EventBus is the only channel through which areas learn about entity
//! state changes and announce readiness. On top of the raw bus this crate
//! offers entity-filtered state-change receivers and a [`Subscription`]
//! disposer for listener tasks.

mod tracker;

pub use tracker::{StateChangeReceiver, Subscription};

use dashmap::DashMap;
use ma_core::{Context, Event, EventData, EventType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A unique identifier for an event listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The event bus for publishing and subscribing to events
pub struct EventBus {
    /// Map of event types to their broadcast senders
    listeners: DashMap<EventType, broadcast::Sender<Event<serde_json::Value>>>,
    next_listener_id: AtomicU64,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe(
        &self,
        event_type: impl Into<EventType>,
    ) -> broadcast::Receiver<Event<serde_json::Value>> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing to event type");

        self.listeners
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to a typed event; payloads that fail to parse are skipped
    pub fn subscribe_typed<T: EventData + serde::de::DeserializeOwned>(
        &self,
    ) -> TypedEventReceiver<T> {
        TypedEventReceiver::new(self.subscribe(T::event_type()))
    }

    /// Fire an event to every subscriber of its type
    pub fn fire(&self, event: Event<serde_json::Value>) {
        debug!(event_type = %event.event_type, "Firing event");

        if let Some(sender) = self.listeners.get(&event.event_type) {
            // A send error only means there is no active receiver
            let _ = sender.send(event);
        }
    }

    /// Fire a typed event
    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        match serde_json::to_value(&data) {
            Ok(json) => self.fire(Event::new(T::event_type(), json, context)),
            Err(err) => warn!(event_type = T::event_type(), error = %err, "Dropping unserializable event"),
        }
    }

    pub fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver for typed events
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<Event<serde_json::Value>>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedEventReceiver<T> {
    fn new(rx: broadcast::Receiver<Event<serde_json::Value>>) -> Self {
        Self {
            rx,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Receive the next event whose payload parses as `T`
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(event.map(|_| data));
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Result<Event<T>, broadcast::error::TryRecvError> {
        loop {
            let event = self.rx.try_recv()?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(event.map(|_| data));
            }
        }
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use ma_core::events::{AreaReadyData, StateChangedData};
    use ma_core::{EntityId, EntityState};
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_subscribe_and_fire() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("magic_areas_area_ready");

        bus.fire(Event::new(
            "magic_areas_area_ready",
            json!({"id": "kitchen"}),
            Context::new(),
        ));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type.as_str(), "magic_areas_area_ready");
        assert_eq!(received.data["id"], "kitchen");
    }

    #[tokio::test]
    async fn test_typed_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_typed::<StateChangedData>();

        let entity_id = EntityId::new("binary_sensor", "hall_motion").unwrap();
        let new_state =
            EntityState::new(entity_id.clone(), "on", HashMap::new(), Context::new());

        bus.fire_typed(
            StateChangedData {
                entity_id,
                old_state: None,
                new_state: Some(new_state),
            },
            Context::new(),
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.data.entity_id.to_string(), "binary_sensor.hall_motion");
        assert_eq!(received.data.new_state.unwrap().state, "on");
    }

    #[tokio::test]
    async fn test_no_cross_event_pollution() {
        let bus = EventBus::new();
        let mut ready = bus.subscribe_typed::<AreaReadyData>();
        let mut other = bus.subscribe("magic_areas_ready");

        bus.fire_typed(AreaReadyData { id: "den".into() }, Context::new());

        assert_eq!(ready.recv().await.unwrap().data.id, "den");
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_listener_id_uniqueness() {
        let bus = EventBus::new();
        let id1 = bus.next_listener_id();
        let id2 = bus.next_listener_id();
        assert_ne!(id1, id2);
    }
}
