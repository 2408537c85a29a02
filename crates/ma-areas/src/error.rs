//! Error types for area setup

use ma_config::ConfigError;
use ma_core::EntityIdError;
use ma_registries::StorageError;
use thiserror::Error;

pub type AreaResult<T> = Result<T, AreaError>;

/// Failures that abort setup of a single area.
///
/// Nothing that happens after an area is running is reported through this
/// type; sensor and timer problems are recovered inside the area task.
#[derive(Debug, Error)]
pub enum AreaError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("area '{0}' is not in the area registry")]
    UnknownArea(String),

    #[error("area '{0}' is configured more than once")]
    Duplicate(String),

    #[error("cannot derive entity id for area '{area}': {source}")]
    EntityId {
        area: String,
        #[source]
        source: EntityIdError,
    },

    #[error("restore storage failed: {0}")]
    Storage(#[from] StorageError),
}
