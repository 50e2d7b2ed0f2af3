use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::link_cache::LinkCache;
use crate::queue::JobDispatcher;
use crate::selections::SelectionService;
use crate::storage::StorageGateway;
use crate::utils::{Clock, StatusLog};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub gateway: Arc<dyn StorageGateway>,
    pub link_cache: Arc<LinkCache>,
    pub selections: Arc<SelectionService>,
    pub jobs: Arc<dyn JobDispatcher>,
    pub status_log: StatusLog,
}

impl AppState {
    pub fn new(
        config: Config,
        gateway: Arc<dyn StorageGateway>,
        clock: Arc<dyn Clock>,
        jobs: Arc<dyn JobDispatcher>,
        status_log: StatusLog,
    ) -> Self {
        let link_cache = Arc::new(LinkCache::new(
            gateway.clone(),
            clock.clone(),
            config.folders.clone(),
            &config.pipeline,
            status_log.clone(),
        ));
        let selections = Arc::new(SelectionService::new(
            gateway.clone(),
            clock,
            config.folders.selections.clone(),
        ));

        Self {
            config,
            gateway,
            link_cache,
            selections,
            jobs,
            status_log,
        }
    }
}

/// One gallery preview with a temporary link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

/// One delivered file with links to the original and the phone-sized copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalImageRecord {
    pub name: String,
    pub original_url: String,
    /// Preview copy when one exists, otherwise the original
    pub mobile_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

/// Fields are optional so that a missing one yields our own 400 message
/// rather than a deserialization rejection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRequest {
    pub user_name: Option<String>,
    pub selected_images: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionResponse {
    pub message: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZipVariant {
    #[default]
    Original,
    Mobile,
}

impl ZipVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZipVariant::Original => "original",
            ZipVariant::Mobile => "mobile",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ZipQuery {
    #[serde(rename = "type", default)]
    pub variant: ZipVariant,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DebugResponse {
    pub status: String,
    pub source_count: usize,
    pub web_count: usize,
    pub logs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub storage: String,
}
