//! JSON file store with version tracking and atomic writes

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage file for '{key}' has version {found}, expected {expected}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// On-disk wrapper: a payload plus its schema version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    /// Schema version; a mismatch on load is an error, not a silent parse
    pub version: u32,
    /// Storage key (also the file name)
    pub key: String,
    /// The actual payload
    pub data: T,
}

/// Types that live in the store declare their key and version.
pub trait Storable: Serialize + DeserializeOwned {
    const KEY: &'static str;
    const VERSION: u32;
}

/// Record store rooted at a `.storage/` directory.
#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    /// Create a store under `<data_dir>/.storage`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: data_dir.as_ref().join(".storage"),
        }
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    /// Load a record, or `None` when it was never written.
    pub async fn load<T: Storable>(&self) -> StorageResult<Option<T>> {
        let path = self.file_path(T::KEY);
        if !path.exists() {
            debug!(key = T::KEY, "storage file not found");
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let file: StorageFile<T> = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                // A corrupt record is dropped rather than wedging startup.
                warn!(key = T::KEY, error = %e, "discarding unreadable storage file");
                return Ok(None);
            }
        };

        if file.version != T::VERSION {
            return Err(StorageError::VersionMismatch {
                key: T::KEY.to_string(),
                expected: T::VERSION,
                found: file.version,
            });
        }

        debug!(key = T::KEY, version = file.version, "loaded storage file");
        Ok(Some(file.data))
    }

    /// Save a record, atomically (temp file then rename).
    pub async fn save<T: Storable + Clone>(&self, data: &T) -> StorageResult<()> {
        if !self.storage_dir.exists() {
            fs::create_dir_all(&self.storage_dir).await?;
        }

        let file = StorageFile {
            version: T::VERSION,
            key: T::KEY.to_string(),
            data: data.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let path = self.file_path(T::KEY);
        let tmp_path = self.file_path(&format!("{}.tmp", T::KEY));
        fs::write(&tmp_path, &content).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!(key = T::KEY, "saved storage file");
        Ok(())
    }

    /// Delete a record if present.
    pub async fn delete<T: Storable>(&self) -> StorageResult<()> {
        let path = self.file_path(T::KEY);
        if path.exists() {
            fs::remove_file(&path).await?;
            debug!(key = T::KEY, "deleted storage file");
        }
        Ok(())
    }
}
