//! Setup and teardown of every configured area

use std::sync::Arc;

use futures::future::join_all;
use ma_config::{AreaConfig, MagicAreasConfig};
use ma_core::events::{AreaReadyData, MagicAreasReadyData};
use ma_core::{slugify, AreaKind, Context, EntityIdError};
use ma_registries::Registries;
use ma_state_store::StateStore;
use tracing::{debug, error, info, warn};

use crate::catalog::{EntityCatalog, HostSnapshot};
use crate::directory::{AreaDirectory, AreaHandle, AreaHandleParts, AreaInfo};
use crate::entity::Restorable;
use crate::error::{AreaError, AreaResult};
use crate::humidity::HumidityMonitor;
use crate::presence::{AreaSources, ChildArea, PresenceSources};
use crate::restore::RestoreStore;
use crate::runtime::{AreaStateSensor, AreaTask};
use crate::switch::SystemControlSwitch;

/// The host services areas read from and publish to
#[derive(Clone)]
pub struct Host {
    pub registries: Arc<Registries>,
    pub states: Arc<StateStore>,
}

impl Host {
    pub fn new(registries: Arc<Registries>, states: Arc<StateStore>) -> Self {
        Self { registries, states }
    }
}

/// Owns every running area. Dropping it without [`MagicAreas::shutdown`]
/// aborts all area tasks.
pub struct MagicAreas {
    host: Host,
    directory: Arc<AreaDirectory>,
    restore: Arc<RestoreStore>,
    restorables: Vec<Box<dyn Restorable + Send + Sync>>,
    stopped: bool,
}

impl MagicAreas {
    /// Set up non-meta areas, announce readiness, then set up meta areas.
    ///
    /// An area whose configuration or setup fails is logged and skipped.
    pub async fn setup(host: Host, config: MagicAreasConfig, restore: Arc<RestoreStore>) -> Self {
        let mut this = Self {
            host,
            directory: Arc::new(AreaDirectory::new()),
            restore,
            restorables: Vec::new(),
            stopped: false,
        };

        let mut leaves = Vec::new();
        let mut metas = Vec::new();
        for (index, area) in config.areas.into_iter().enumerate() {
            match area {
                Ok(area) if area.is_meta() => metas.push(area),
                Ok(area) => leaves.push(area),
                Err(err) => {
                    let err = AreaError::from(err);
                    error!(index, error = %err, "Invalid area configuration, skipping");
                }
            }
        }

        let mut resolved = Vec::new();
        for area in leaves {
            match this.resolve_info(&area, &resolved) {
                Ok(info) => {
                    this.directory.expect(&info.id);
                    resolved.push((info, area));
                }
                Err(err) => error!(area = %area.area, error = %err, "Unable to set up area"),
            }
        }

        for (info, area) in resolved {
            let id = info.id.clone();
            if let Err(err) = this.setup_area(info, area) {
                error!(area = %id, error = %err, "Unable to set up area");
                this.directory.forget(&id);
            }
        }

        this.host
            .states
            .event_bus()
            .fire_typed(MagicAreasReadyData {}, Context::new());
        info!(areas = this.directory.len(), "All areas ready");

        if !this.directory.areas_loaded() {
            warn!("Not every area finished loading, meta areas may miss children");
        }
        for area in metas {
            let result = this
                .resolve_info(&area, &[])
                .and_then(|info| this.setup_area(info, area.clone()));
            if let Err(err) = result {
                error!(area = %area.area, error = %err, "Unable to set up meta area");
            }
        }

        this
    }

    fn resolve_info(&self, config: &AreaConfig, pending: &[(AreaInfo, AreaConfig)]) -> AreaResult<AreaInfo> {
        let info = if config.is_meta() {
            AreaInfo {
                id: config.area.clone(),
                name: title_case(&config.area),
                slug: slugify(&config.area),
                kind: AreaKind::Meta,
            }
        } else {
            let areas = &self.host.registries.areas;
            let entry = areas
                .get(&config.area)
                .or_else(|| areas.get_by_name(&config.area))
                .ok_or_else(|| AreaError::UnknownArea(config.area.clone()))?;
            AreaInfo {
                id: entry.id.clone(),
                name: entry.name.clone(),
                slug: slugify(&entry.name),
                kind: config.kind,
            }
        };

        if self.directory.contains(&info.id) || pending.iter().any(|(p, _)| p.id == info.id) {
            return Err(AreaError::Duplicate(info.id));
        }
        Ok(info)
    }

    fn setup_area(&mut self, info: AreaInfo, config: AreaConfig) -> AreaResult<Arc<AreaHandle>> {
        let registries = &self.host.registries;
        let states = &self.host.states;
        let entity_error = |source: EntityIdError| AreaError::EntityId {
            area: info.id.clone(),
            source,
        };

        let mut switch = SystemControlSwitch::new(&info.id, &info.slug).map_err(entity_error)?;
        let mut sensor = AreaStateSensor::new(&info.id, &info.slug).map_err(entity_error)?;
        self.restore_into(&mut switch);
        self.restore_into(&mut sensor);
        switch.entity().register(&registries.entities);
        sensor.entity().register(&registries.entities);

        let catalog = EntityCatalog::resolve(&config, &info.id, &HostSnapshot::new(registries, states));

        let mut monitor = None;
        if !config.is_meta() {
            let source = config
                .features
                .humidity
                .as_ref()
                .and_then(|h| h.entity.clone())
                .or_else(|| catalog.humidity_sensor());
            if let Some(source) = source {
                let feature = config.features.humidity.clone().unwrap_or_default();
                let mut humidity =
                    HumidityMonitor::new(&info.id, &info.slug, source, &feature, Arc::clone(states))
                        .map_err(entity_error)?;
                for sensor in humidity.sensors_mut() {
                    self.restore_into(sensor);
                    sensor.entity().register(&registries.entities);
                }
                humidity.publish();
                monitor = Some(humidity);
            }
        }

        let presence = if config.is_meta() {
            let children: Vec<ChildArea> = self
                .directory
                .children_of(&info.id)
                .iter()
                .map(|child| ChildArea {
                    area_id: child.id().to_string(),
                    state_entity: child.state_entity().clone(),
                })
                .collect();
            debug!(area = %info.slug, children = children.len(), "Meta area children");
            PresenceSources::Children(children)
        } else {
            let options = config.features.presence();
            PresenceSources::Sensors {
                entities: catalog.presence_sensors(&options),
                on_states: options.on_states.clone(),
            }
        };

        let sources = AreaSources {
            presence,
            humidity: monitor.as_ref().map(HumidityMonitor::signals),
            secondary: config.secondary_states.clone(),
            control_switch: switch.entity_id().clone(),
        };
        if sources.presence_entities().is_empty() && sources.humidity.is_none() {
            info!(area = %info.slug, "No presence sensors found, area will stay clear");
        }

        switch.publish(states);

        let info = Arc::new(info);
        let config = Arc::new(config);
        let task = AreaTask::new(Arc::clone(&info), &config, sources.clone(), &sensor, Arc::clone(states));
        let handle = Arc::new(AreaHandle::new(AreaHandleParts {
            info: Arc::clone(&info),
            config,
            state_entity: sensor.entity_id().clone(),
            control_switch: switch.entity_id().clone(),
            humidity: sources.humidity.clone(),
            store: Arc::clone(states),
            snapshot: task.subscribe_snapshot(),
            transitions: task.transitions(),
        }));

        if let Some(monitor) = monitor {
            for sensor in monitor.sensors() {
                self.restorables.push(Box::new(sensor.clone()));
            }
            handle.attach(tokio::spawn(monitor.run(handle.shutdown_receiver())));
        }
        handle.attach(tokio::spawn(task.run(handle.shutdown_receiver())));

        self.restorables.push(Box::new(switch));
        self.restorables.push(Box::new(sensor));
        self.directory.register(Arc::clone(&handle));

        states
            .event_bus()
            .fire_typed(AreaReadyData { id: info.id.clone() }, Context::new());
        info!(
            area = %info.slug,
            kind = %info.kind,
            presence = sources.presence_entities().len(),
            entities = catalog.len(),
            "Area ready"
        );
        Ok(handle)
    }

    fn restore_into(&self, entity: &mut impl Restorable) {
        if let Some(persisted) = self.restore.get(&entity.entity().entity_id) {
            debug!(entity_id = %persisted.entity_id, state = %persisted.state, "Restoring entity state");
            entity.restore(&persisted);
        }
    }

    pub fn directory(&self) -> &Arc<AreaDirectory> {
        &self.directory
    }

    pub fn area(&self, area_id: &str) -> Option<Arc<AreaHandle>> {
        self.directory.get(area_id)
    }

    /// Stop meta areas, then the rest, and persist restore data
    pub async fn shutdown(mut self) -> AreaResult<()> {
        let (metas, leaves): (Vec<_>, Vec<_>) = self
            .directory
            .handles()
            .into_iter()
            .partition(|h| h.kind() == AreaKind::Meta);

        join_all(metas.iter().map(|h| h.stop())).await;
        join_all(leaves.iter().map(|h| h.stop())).await;
        self.stopped = true;

        for entity in &self.restorables {
            if let Some(persisted) = entity.persist(&self.host.states) {
                self.restore.record(persisted);
            }
        }
        self.restore.save().await?;
        info!(areas = metas.len() + leaves.len(), "Magic areas stopped");
        Ok(())
    }
}

impl Drop for MagicAreas {
    fn drop(&mut self) {
        if !self.stopped {
            for handle in self.directory.handles() {
                handle.abort();
            }
        }
    }
}

fn title_case(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
