//! Magic Areas server
//!
//! Loads the registries and `magic_areas.yaml` from the config directory,
//! starts one occupancy task per area and runs until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use ma_areas::{Host, MagicAreas, RestoreStore};
use ma_config::MagicAreasConfig;
use ma_event_bus::EventBus;
use ma_registries::Registries;
use ma_state_store::StateStore;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable naming the config directory
const CONFIG_DIR_ENV: &str = "MAGIC_AREAS_CONFIG";

/// The host side of the integration: registries, states and restore data
pub struct Instance {
    pub config_dir: PathBuf,
    pub registries: Arc<Registries>,
    pub states: Arc<StateStore>,
    pub restore: Arc<RestoreStore>,
}

impl Instance {
    pub fn new(config_dir: PathBuf) -> Self {
        let bus = Arc::new(EventBus::new());
        let states = Arc::new(StateStore::new(bus));
        let registries = Arc::new(Registries::new(&config_dir));
        let restore = Arc::new(RestoreStore::new(Arc::clone(&registries.storage)));
        Self {
            config_dir,
            registries,
            states,
            restore,
        }
    }

    /// Load everything persisted under `.storage/`
    pub async fn load(&self) -> Result<()> {
        self.registries
            .load_all()
            .await
            .context("loading registries")?;
        self.restore.load().await.context("loading restore state")?;
        Ok(())
    }

    pub async fn start(&self) -> Result<MagicAreas> {
        let config = MagicAreasConfig::load(&self.config_dir).context("loading magic_areas.yaml")?;
        let host = Host::new(Arc::clone(&self.registries), Arc::clone(&self.states));
        Ok(MagicAreas::setup(host, config, Arc::clone(&self.restore)).await)
    }
}

fn config_dir() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_DIR_ENV))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_dir = config_dir();
    info!(config_dir = %config_dir.display(), "Starting Magic Areas");

    let instance = Instance::new(config_dir);
    instance.load().await?;
    let areas = instance.start().await?;

    info!(areas = areas.directory().len(), "Magic Areas is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    areas.shutdown().await.context("saving restore state")?;
    instance
        .registries
        .save_all()
        .await
        .context("saving registries")?;

    info!("Magic Areas stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ma_core::AreaState;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_instance_starts_configured_areas() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("magic_areas.yaml"),
            "areas:\n  - area: Kitchen\n  - area: global\n    type: meta\n",
        )
        .unwrap();

        let instance = Instance::new(dir.path().to_path_buf());
        instance.load().await.unwrap();
        instance.registries.areas.create("Kitchen");

        let areas = instance.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(areas.directory().len(), 2);
        assert_eq!(areas.area("kitchen").unwrap().current_state(), AreaState::Clear);
        assert_eq!(areas.area("global").unwrap().current_state(), AreaState::Clear);

        areas.shutdown().await.unwrap();
        instance.registries.save_all().await.unwrap();
        assert!(dir.path().join(".storage").exists());
    }

    #[tokio::test]
    async fn test_missing_config_starts_nothing() {
        let dir = TempDir::new().unwrap();
        let instance = Instance::new(dir.path().to_path_buf());
        instance.load().await.unwrap();

        let areas = instance.start().await.unwrap();
        assert!(areas.directory().is_empty());
        areas.shutdown().await.unwrap();
    }
}
