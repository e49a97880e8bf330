//! Latest-firmware lookup.
//!
//! Firmware images live in an object store; the newest object (by
//! last-modified time) is the current release, and its semantic version is
//! read from the object key, e.g. `firmware/lamp-2.4.1.bin` → `2.4.1`.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").expect("valid regex"));

/// Errors from a firmware lookup.
#[derive(Debug, Error)]
pub enum FirmwareError {
    /// The store holds no matching objects.
    #[error("no firmware found")]
    NotFound,
    /// Listing the store failed.
    #[error("firmware store error: {0}")]
    Store(#[from] std::io::Error),
    /// The listing task panicked or was cancelled.
    #[error("firmware listing task failed: {0}")]
    Task(String),
}

impl FirmwareError {
    /// HTTP status reported for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Store(_) | Self::Task(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// One entry of a store listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// Object key, relative to the store root.
    pub key: String,
    /// Last modification time.
    pub last_modified: DateTime<Utc>,
}

/// Object listing backend.
#[async_trait]
pub trait FirmwareStore: Send + Sync {
    /// List objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, FirmwareError>;
}

/// Store backed by the regular files of one directory.
#[derive(Clone, Debug)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Serve objects from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FirmwareStore for DirectoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, FirmwareError> {
        let root = self.root.clone();
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || -> Result<Vec<StoredObject>, FirmwareError> {
            let mut objects = Vec::new();
            for entry in std::fs::read_dir(&root)? {
                let entry = entry?;
                let metadata = entry.metadata()?;
                if !metadata.is_file() {
                    continue;
                }
                let Ok(key) = entry.file_name().into_string() else {
                    continue;
                };
                if !key.starts_with(&prefix) {
                    continue;
                }
                objects.push(StoredObject {
                    key,
                    last_modified: DateTime::<Utc>::from(metadata.modified()?),
                });
            }
            Ok(objects)
        })
        .await
        .map_err(|e| FirmwareError::Task(e.to_string()))?
    }
}

/// The current firmware release.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FirmwareRelease {
    /// Public download URL.
    pub url: String,
    /// `MAJOR.MINOR.PATCH` from the key, if it has one.
    pub version: Option<String>,
    /// Object key.
    pub key: String,
}

/// Resolves the newest object in a [`FirmwareStore`] to a public release.
pub struct FirmwareLocator {
    store: Arc<dyn FirmwareStore>,
    public_base_url: String,
    prefix: String,
}

impl FirmwareLocator {
    /// Create a locator publishing keys under `public_base_url`.
    pub fn new(
        store: Arc<dyn FirmwareStore>,
        public_base_url: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            public_base_url: public_base_url.into(),
            prefix: prefix.into(),
        }
    }

    /// Find the most recently modified object.
    pub async fn latest(&self) -> Result<FirmwareRelease, FirmwareError> {
        let objects = self.store.list(&self.prefix).await?;
        let newest = select_newest(objects).ok_or(FirmwareError::NotFound)?;
        debug!(key = %newest.key, "latest firmware resolved");
        Ok(FirmwareRelease {
            url: format!(
                "{}/{}",
                self.public_base_url.trim_end_matches('/'),
                newest.key
            ),
            version: parse_version(&newest.key),
            key: newest.key,
        })
    }
}

/// Newest object by modification time; ties go to the greater key.
fn select_newest(objects: Vec<StoredObject>) -> Option<StoredObject> {
    objects
        .into_iter()
        .max_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        })
}

/// First `MAJOR.MINOR.PATCH` run in `key`.
pub fn parse_version(key: &str) -> Option<String> {
    VERSION_RE.find(key).map(|m| m.as_str().to_owned())
}
