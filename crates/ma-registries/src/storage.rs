//! JSON persistence in the `.storage/` directory
//!
//! Every file is wrapped in a versioned envelope so that readers can refuse
//! or migrate data written by a different major version.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage file not found: {key}")]
    NotFound { key: String },

    #[error("Migration required for {key}: from {from} to {to}")]
    MigrationRequired { key: String, from: u32, to: u32 },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Versioned envelope around stored data
///
/// ```json
/// {
///   "version": 1,
///   "minor_version": 1,
///   "key": "magic_areas.restore_state",
///   "data": { ... }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    pub minor_version: u32,
    pub key: String,
    pub data: T,
}

impl<T> StorageFile<T> {
    pub fn new(key: impl Into<String>, data: T, version: u32, minor_version: u32) -> Self {
        Self {
            version,
            minor_version,
            key: key.into(),
            data,
        }
    }
}

/// Handle on the `.storage/` directory below a config directory
#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: config_dir.as_ref().join(".storage"),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    pub async fn exists(&self, key: &str) -> bool {
        fs::try_exists(self.file_path(key)).await.unwrap_or(false)
    }

    /// Load a storage file, or None if it doesn't exist
    pub async fn load<T>(&self, key: &str) -> StorageResult<Option<StorageFile<T>>>
    where
        T: DeserializeOwned,
    {
        let path = self.file_path(key);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(key, "Storage file not found");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let storage_file: StorageFile<T> = serde_json::from_str(&content)?;
        debug!(
            key,
            version = storage_file.version,
            minor_version = storage_file.minor_version,
            "Loaded storage file"
        );

        Ok(Some(storage_file))
    }

    pub async fn load_required<T>(&self, key: &str) -> StorageResult<StorageFile<T>>
    where
        T: DeserializeOwned,
    {
        self.load(key).await?.ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })
    }

    /// Write a storage file through a temp file and rename
    pub async fn save<T>(&self, storage_file: &StorageFile<T>) -> StorageResult<()>
    where
        T: Serialize,
    {
        fs::create_dir_all(&self.storage_dir).await?;

        let path = self.file_path(&storage_file.key);
        let temp_path = self.file_path(&format!("{}.tmp", storage_file.key));

        let content = serde_json::to_string_pretty(storage_file)?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(key = %storage_file.key, "Saved storage file");
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => {
                debug!(key, "Deleted storage file");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Data that lives under a fixed storage key
pub trait Storable: Serialize + DeserializeOwned {
    const KEY: &'static str;
    const VERSION: u32;
    const MINOR_VERSION: u32;

    fn to_storage_file(&self) -> StorageFile<&Self> {
        StorageFile::new(Self::KEY, self, Self::VERSION, Self::MINOR_VERSION)
    }
}

/// Load a [`Storable`], refusing data from another major version
pub async fn load_storable<T>(storage: &Storage) -> StorageResult<Option<T>>
where
    T: Storable,
{
    let Some(raw) = storage.load::<serde_json::Value>(T::KEY).await? else {
        return Ok(None);
    };

    if raw.version != T::VERSION {
        return Err(StorageError::MigrationRequired {
            key: T::KEY.to_string(),
            from: raw.version,
            to: T::VERSION,
        });
    }

    if raw.minor_version < T::MINOR_VERSION {
        warn!(
            key = T::KEY,
            found = raw.minor_version,
            current = T::MINOR_VERSION,
            "Storage has older minor version"
        );
    }

    Ok(Some(serde_json::from_value(raw.data)?))
}
