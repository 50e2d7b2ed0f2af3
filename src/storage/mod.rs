//! Storage Gateway
//!
//! The remote blob store the service works against, addressed by path
//! strings (`/PhotoSelection/Source/IMG_0001.jpg`). Durable state lives
//! entirely behind this trait:
//! - `dropbox` - the production client for the Dropbox HTTP API v2
//! - `memory` - an in-process store for local development and tests

pub mod dropbox;
pub mod memory;

pub use dropbox::DropboxClient;
pub use memory::MemoryGateway;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{StorageConfig, StorageProvider};

/// Errors returned by a storage gateway
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("storage API error ({status}): {summary}")]
    Api { status: u16, summary: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl StorageError {
    /// Not-found is a signal, not a failure: it drives the optimizer's
    /// existence check and the zip endpoint's 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

/// One entry of a folder listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub kind: EntryKind,
    pub name: String,
    pub path_lower: String,
    pub path_display: String,
    pub server_modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

impl StorageEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Conflict behaviour for uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail when the path already holds a file
    Add,
    Overwrite,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Add => "add",
            WriteMode::Overwrite => "overwrite",
        }
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Short provider name for health and debug output
    fn provider_name(&self) -> &'static str;

    /// Direct children of a folder (files and folders, not recursive)
    async fn list_folder(&self, path: &str) -> Result<Vec<StorageEntry>, StorageError>;

    async fn get_metadata(&self, path: &str) -> Result<StorageEntry, StorageError>;

    async fn download(&self, path: &str) -> Result<Bytes, StorageError>;

    async fn upload(
        &self,
        path: &str,
        contents: Bytes,
        mode: WriteMode,
    ) -> Result<StorageEntry, StorageError>;

    /// Short-lived direct-read URL for one file
    async fn temporary_link(&self, path: &str) -> Result<String, StorageError>;

    async fn move_entry(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    async fn create_folder(&self, path: &str) -> Result<(), StorageError>;

    /// Whole folder bundled by the provider, streamed back as it arrives
    async fn download_zip(&self, path: &str) -> Result<ByteStream, StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match self.get_metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create the folder if it is missing. Returns true when it was created.
    async fn ensure_folder(&self, path: &str) -> Result<bool, StorageError> {
        if self.exists(path).await? {
            return Ok(false);
        }
        self.create_folder(path).await?;
        Ok(true)
    }
}

/// Join a folder path and an entry name with exactly one separator
pub fn join_path(folder: &str, name: &str) -> String {
    format!("{}/{}", folder.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Keep only file entries from a listing
pub fn files_only(entries: Vec<StorageEntry>) -> Vec<StorageEntry> {
    entries.into_iter().filter(StorageEntry::is_file).collect()
}

/// Build the gateway selected by configuration
pub fn connect(config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageGateway>> {
    match config.provider {
        StorageProvider::Dropbox => {
            let credentials = config.credentials.clone().ok_or_else(|| {
                anyhow::anyhow!("Dropbox provider selected but no credentials configured")
            })?;
            info!(mode = credentials.mode(), "Using Dropbox storage");
            Ok(Arc::new(DropboxClient::new(credentials)))
        }
        StorageProvider::Memory => {
            warn!("Using in-memory storage; nothing survives a restart");
            Ok(Arc::new(MemoryGateway::new()))
        }
    }
}
