use anyhow::{bail, Result};
use std::env;
use std::fmt;
use std::str::FromStr;

use crate::imaging::ResizeSpec;
use crate::utils::DEFAULT_STATUS_LOG_CAPACITY;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub folders: FolderLayout,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProvider {
    Dropbox,
    Memory,
}

impl FromStr for StorageProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "dropbox" => Ok(StorageProvider::Dropbox),
            "memory" => Ok(StorageProvider::Memory),
            other => bail!("Unknown STORAGE_PROVIDER '{}': expected dropbox or memory", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    pub credentials: Option<DropboxCredentials>,
}

/// Dropbox credential material. A refresh token with its app key/secret is
/// preferred; a static access token is accepted for quick setups.
#[derive(Clone, PartialEq, Eq)]
pub enum DropboxCredentials {
    Refresh {
        refresh_token: String,
        client_id: String,
        client_secret: String,
    },
    Static {
        access_token: String,
    },
}

impl DropboxCredentials {
    fn from_lookup<F>(lookup: &F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            non_empty("DBX_REFRESH_TOKEN"),
            non_empty("DBX_CLIENT_ID"),
            non_empty("DBX_CLIENT_SECRET"),
        ) {
            return Some(DropboxCredentials::Refresh {
                refresh_token,
                client_id,
                client_secret,
            });
        }

        non_empty("DBX_ACCESS_TOKEN").map(|access_token| DropboxCredentials::Static { access_token })
    }

    pub fn mode(&self) -> &'static str {
        match self {
            DropboxCredentials::Refresh { .. } => "refresh",
            DropboxCredentials::Static { .. } => "static",
        }
    }
}

// Secrets never reach the logs
impl fmt::Debug for DropboxCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropboxCredentials::Refresh { client_id, .. } => f
                .debug_struct("Refresh")
                .field("client_id", client_id)
                .field("refresh_token", &"<redacted>")
                .field("client_secret", &"<redacted>")
                .finish(),
            DropboxCredentials::Static { .. } => f
                .debug_struct("Static")
                .field("access_token", &"<redacted>")
                .finish(),
        }
    }
}

/// Logical folder roles. Each maps to exactly one storage path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagedFolder {
    Source,
    Web,
    Archive,
    Final,
    FinalWeb,
    Selections,
}

impl ManagedFolder {
    pub const ALL: [ManagedFolder; 6] = [
        ManagedFolder::Source,
        ManagedFolder::Web,
        ManagedFolder::Archive,
        ManagedFolder::Final,
        ManagedFolder::FinalWeb,
        ManagedFolder::Selections,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderLayout {
    /// Originals uploaded by the photographer
    pub source: String,
    /// Generated gallery previews
    pub web: String,
    /// Expired originals
    pub archive: String,
    /// Final delivery files
    pub finals: String,
    /// Generated previews of the final delivery
    pub finals_web: String,
    /// Submitted selection records
    pub selections: String,
}

impl FolderLayout {
    pub fn under(root: &str) -> Self {
        let root = root.trim_end_matches('/');
        Self {
            source: format!("{}/Source", root),
            web: format!("{}/Web", root),
            archive: format!("{}/Archive", root),
            finals: format!("{}/Final", root),
            finals_web: format!("{}/Final_Web", root),
            selections: format!("{}/Selections", root),
        }
    }

    pub fn path(&self, folder: ManagedFolder) -> &str {
        match folder {
            ManagedFolder::Source => &self.source,
            ManagedFolder::Web => &self.web,
            ManagedFolder::Archive => &self.archive,
            ManagedFolder::Final => &self.finals,
            ManagedFolder::FinalWeb => &self.finals_web,
            ManagedFolder::Selections => &self.selections,
        }
    }
}

impl Default for FolderLayout {
    fn default() -> Self {
        Self::under("/PhotoSelection")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub cache_ttl_secs: i64,
    pub link_batch_size: usize,
    pub retention_days: i64,
    /// Cron expression with a seconds field (`cron` crate syntax), UTC
    pub sweep_schedule: String,
    pub gallery_resize: ResizeSpec,
    pub final_resize: ResizeSpec,
    pub status_log_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3 * 60 * 60,
            link_batch_size: 10,
            retention_days: 30,
            sweep_schedule: "0 0 0 * * *".to_string(),
            gallery_resize: ResizeSpec::GALLERY,
            final_resize: ResizeSpec::FINAL,
            status_log_capacity: DEFAULT_STATUS_LOG_CAPACITY,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup (the environment in
    /// production, a map in tests). Folder layout and pipeline tuning are
    /// code defaults, not environment settings.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider: StorageProvider = lookup("STORAGE_PROVIDER")
            .unwrap_or_else(|| "dropbox".to_string())
            .parse()?;
        let credentials = DropboxCredentials::from_lookup(&lookup);

        if provider == StorageProvider::Dropbox && credentials.is_none() {
            bail!(
                "Dropbox credentials missing: set DBX_REFRESH_TOKEN, DBX_CLIENT_ID and \
                 DBX_CLIENT_SECRET, or DBX_ACCESS_TOKEN"
            );
        }

        Ok(Self {
            server: ServerConfig {
                port: lookup("PORT")
                    .unwrap_or_else(|| "5000".to_string())
                    .parse()?,
                host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            },
            storage: StorageConfig {
                provider,
                credentials,
            },
            folders: FolderLayout::default(),
            pipeline: PipelineConfig::default(),
        })
    }
}
