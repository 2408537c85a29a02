//! Area occupancy for Magic Areas
//!
//! Every configured area gets a state machine that classifies it as `clear`,
//! `occupied`, `extended`, one of the secondary overrides, or `manual`, from
//! its presence sensors, its humidity trend and its control switch. Meta areas
//! aggregate the published state of their child areas.
//!
//! ```ignore
//! let host = Host::new(registries, states);
//! let restore = Arc::new(RestoreStore::new(host.registries.storage.clone()));
//! restore.load().await?;
//!
//! let areas = MagicAreas::setup(host, MagicAreasConfig::load(config_dir)?, restore).await;
//! let kitchen = areas.area("kitchen").expect("configured");
//! let _sub = kitchen.on_state_change(|old, new| println!("{old} -> {new}"));
//! ```

pub mod binding;
pub mod catalog;
pub mod directory;
pub mod entity;
mod error;
pub mod humidity;
mod integration;
pub mod machine;
pub mod presence;
pub mod restore;
mod runtime;
pub mod switch;
pub mod trend;

pub use binding::{
    bind, ActuatorAction, ActuatorBinding, ActuatorCommand, BindingContext, FanBinding, LightBinding,
    ManualOverride,
};
pub use catalog::{EntityCatalog, EntityDescriptor, HostSnapshot, RegistrySnapshot};
pub use directory::{AreaDirectory, AreaHandle, AreaInfo};
pub use entity::{MagicEntity, Restorable, StateObserving};
pub use error::{AreaError, AreaResult};
pub use humidity::{HumidityMonitor, TrendSensor};
pub use integration::{Host, MagicAreas};
pub use machine::{OccupancyInputs, OccupancyStateMachine, Transition};
pub use restore::{PersistedState, RestoreStore};
pub use runtime::{AreaSnapshot, AreaStateSensor};
pub use switch::SystemControlSwitch;
pub use trend::{HumidityTrendTracker, TrendSettings};
