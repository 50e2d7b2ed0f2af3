//! Retention sweep
//!
//! Files older than the retention threshold are moved out of the source
//! folder into the archive, and deleted outright from the derived and final
//! folders. Age is measured from the provider's `server_modified`; an entry
//! without one is treated as brand new.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::{FolderLayout, ManagedFolder};
use crate::storage::{files_only, join_path, StorageEntry, StorageError, StorageGateway};
use crate::utils::{Clock, StatusLog};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionAction {
    /// Move into this folder, keeping the file name
    Archive { to: String },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionRule {
    pub folder: String,
    pub action: RetentionAction,
}

impl RetentionRule {
    /// Source is archived; finals, final previews and gallery previews are
    /// deleted. Applied in this order.
    pub fn defaults(folders: &FolderLayout) -> Vec<RetentionRule> {
        let delete = |folder: ManagedFolder| RetentionRule {
            folder: folders.path(folder).to_string(),
            action: RetentionAction::Delete,
        };

        vec![
            RetentionRule {
                folder: folders.source.clone(),
                action: RetentionAction::Archive {
                    to: folders.archive.clone(),
                },
            },
            delete(ManagedFolder::Final),
            delete(ManagedFolder::FinalWeb),
            delete(ManagedFolder::Web),
        ]
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub archived: usize,
    pub deleted: usize,
    pub failed: usize,
    pub folders_failed: usize,
}

pub struct RetentionSweeper {
    gateway: Arc<dyn StorageGateway>,
    clock: Arc<dyn Clock>,
    rules: Vec<RetentionRule>,
    max_age: Duration,
    log: StatusLog,
}

impl RetentionSweeper {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        clock: Arc<dyn Clock>,
        rules: Vec<RetentionRule>,
        retention_days: i64,
        log: StatusLog,
    ) -> Self {
        Self {
            gateway,
            clock,
            rules,
            max_age: Duration::days(retention_days),
            log,
        }
    }

    /// Strictly older than the threshold
    pub fn is_expired(&self, entry: &StorageEntry, now: DateTime<Utc>) -> bool {
        let modified = entry.server_modified.unwrap_or(now);
        now - modified > self.max_age
    }

    pub async fn sweep(&self) -> SweepReport {
        self.log.info("Running cleanup check...");
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for rule in &self.rules {
            if let Err(e) = self.sweep_folder(rule, now, &mut report).await {
                report.folders_failed += 1;
                self.log
                    .warn(format!("Cleanup error in {}: {}", rule.folder, e));
            }
        }

        self.log.info(format!(
            "Cleanup finished: {} archived, {} deleted, {} failed.",
            report.archived, report.deleted, report.failed
        ));
        report
    }

    async fn sweep_folder(
        &self,
        rule: &RetentionRule,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), StorageError> {
        let files = files_only(self.gateway.list_folder(&rule.folder).await?);
        debug!(folder = %rule.folder, files = files.len(), "Checking retention");

        for file in files.iter().filter(|f| self.is_expired(f, now)) {
            let outcome = match &rule.action {
                RetentionAction::Archive { to } => self
                    .gateway
                    .move_entry(&file.path_lower, &join_path(to, &file.name))
                    .await
                    .map(|()| {
                        report.archived += 1;
                        format!("Archived expired file: {}", file.name)
                    }),
                RetentionAction::Delete => {
                    self.gateway.delete(&file.path_lower).await.map(|()| {
                        report.deleted += 1;
                        format!("Deleted expired file: {}", file.name)
                    })
                }
            };

            match outcome {
                Ok(message) => self.log.info(message),
                Err(e) => {
                    report.failed += 1;
                    self.log
                        .warn(format!("Cleanup failed for {}: {}", file.path_display, e));
                }
            }
        }

        Ok(())
    }
}
