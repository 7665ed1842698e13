//! File-backed key-value store.
//!
//! Each key is stored as `<base>/<hex(key)>.json`, holding a small envelope
//! with the value and its optional expiry. Hex file names keep arbitrary keys
//! (including `:` and `/`) safe on every filesystem, and let `keys` recover
//! the original key from the directory listing alone.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::{KeyPattern, KeyValueStore};
use crate::error::StoreError;

const EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Envelope {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Stores one JSON file per key under a base directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `base_path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the directory cannot be created.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    /// Returns the base directory.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{}", hex::encode(key.as_bytes()), EXTENSION))
    }

    fn key_for(path: &Path) -> Option<String> {
        if path.extension()?.to_str()? != EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        String::from_utf8(hex::decode(stem).ok()?).ok()
    }

    async fn read_envelope(&self, path: &Path) -> Result<Option<Envelope>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_file(path: &Path) -> Result<bool, StoreError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key);
        match self.read_envelope(&path).await? {
            Some(envelope) if envelope.is_live(Utc::now()) => Ok(Some(envelope.value)),
            Some(_) => {
                Self::remove_file(&path).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| StoreError::InvalidKey(format!("{}: {}", key, e)))?,
            ),
            None => None,
        };
        let envelope = Envelope {
            key: key.to_string(),
            value,
            expires_at,
        };
        let data = serde_json::to_vec(&envelope)?;

        // Write then rename so readers never observe a partial file.
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Self::remove_file(&self.path_for(key)).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let pattern = KeyPattern::new(pattern)?;
        let now = Utc::now();
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(key) = Self::key_for(&path) else {
                continue;
            };
            if !pattern.matches(&key) {
                continue;
            }
            match self.read_envelope(&path).await {
                Ok(Some(envelope)) if envelope.is_live(now) => keys.push(key),
                Ok(_) => {}
                Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable store entry"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
