// Selection submissions, one immutable JSON file per submission

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::storage::{join_path, StorageGateway, WriteMode};
use crate::types::{AppError, AppResult};
use crate::utils::Clock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRecord {
    pub user_name: String,
    pub selection_date: String,
    pub count: usize,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionReceipt {
    pub file_name: String,
    pub path: String,
}

/// `{user}_{timestamp}.json` with the timestamp made path-safe
pub fn selection_file_name(user_name: &str, at: DateTime<Utc>) -> String {
    let user: String = user_name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let timestamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{}_{}.json", user, timestamp)
}

pub struct SelectionService {
    gateway: Arc<dyn StorageGateway>,
    clock: Arc<dyn Clock>,
    folder: String,
}

impl SelectionService {
    pub fn new(gateway: Arc<dyn StorageGateway>, clock: Arc<dyn Clock>, folder: String) -> Self {
        Self {
            gateway,
            clock,
            folder,
        }
    }

    pub async fn submit(&self, user_name: &str, images: Vec<String>) -> AppResult<SelectionReceipt> {
        if user_name.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "User name and selections are required".to_string(),
            ));
        }

        let now = self.clock.now();
        let file_name = selection_file_name(user_name, now);
        let path = join_path(&self.folder, &file_name);
        let record = SelectionRecord {
            user_name: user_name.to_string(),
            selection_date: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            count: images.len(),
            images,
        };

        let body = serde_json::to_vec_pretty(&record)
            .map_err(|e| AppError::Internal(format!("Failed to encode selection: {}", e)))?;

        // Add mode: an existing record is never replaced
        self.gateway
            .upload(&path, body.into(), WriteMode::Add)
            .await?;

        info!(user = %record.user_name, count = record.count, path = %path, "Selection saved");
        Ok(SelectionReceipt { file_name, path })
    }
}
