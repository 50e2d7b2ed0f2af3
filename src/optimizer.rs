//! Preview Optimizer
//!
//! Mirrors a source folder into a derived folder of resized JPEG copies.
//! Existence of `derived/name` is the only gate: a file that already has a
//! counterpart is never reprocessed, whatever happened to the source since.
//! Files are handled one at a time to bound memory and stay clear of
//! provider rate limits.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::{FolderLayout, PipelineConfig};
use crate::imaging::{resize_to_jpeg_blocking, ResizeSpec};
use crate::storage::{files_only, join_path, StorageEntry, StorageError, StorageGateway, WriteMode};
use crate::types::AppResult;
use crate::utils::StatusLog;

/// A source folder and the folder its previews go to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizePair {
    pub label: &'static str,
    pub source: String,
    pub derived: String,
    pub resize: ResizeSpec,
    /// Skip quietly when the source folder does not exist yet
    pub require_source: bool,
}

impl OptimizePair {
    pub fn gallery(folders: &FolderLayout, pipeline: &PipelineConfig) -> Self {
        Self {
            label: "gallery",
            source: folders.source.clone(),
            derived: folders.web.clone(),
            resize: pipeline.gallery_resize,
            require_source: false,
        }
    }

    pub fn finals(folders: &FolderLayout, pipeline: &PipelineConfig) -> Self {
        Self {
            label: "final",
            source: folders.finals.clone(),
            derived: folders.finals_web.clone(),
            resize: pipeline.final_resize,
            require_source: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeReport {
    pub scanned: usize,
    pub skipped: usize,
    pub optimized: usize,
    pub failed: usize,
}

pub struct Optimizer {
    gateway: Arc<dyn StorageGateway>,
    log: StatusLog,
    running: Mutex<HashSet<&'static str>>,
}

/// Holds a pair's label in the running set for the duration of one pass
struct PassGuard<'a> {
    running: &'a Mutex<HashSet<&'static str>>,
    label: &'static str,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(self.label);
    }
}

impl Optimizer {
    pub fn new(gateway: Arc<dyn StorageGateway>, log: StatusLog) -> Self {
        Self {
            gateway,
            log,
            running: Mutex::new(HashSet::new()),
        }
    }

    fn try_begin(&self, label: &'static str) -> Option<PassGuard<'_>> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(label) {
            return None;
        }
        Some(PassGuard {
            running: &self.running,
            label,
        })
    }

    /// Run one pass over a pair. Only listing-level failures are returned;
    /// per-file failures are counted and logged.
    pub async fn optimize(&self, pair: &OptimizePair) -> Result<OptimizeReport, StorageError> {
        let Some(_guard) = self.try_begin(pair.label) else {
            debug!(label = pair.label, "Optimization already running, skipping");
            return Ok(OptimizeReport::default());
        };

        self.log.info(format!("Starting {} optimization...", pair.label));

        if pair.require_source && !self.gateway.exists(&pair.source).await? {
            self.log.info(format!(
                "{} not found, skipping {} optimization.",
                pair.source, pair.label
            ));
            return Ok(OptimizeReport::default());
        }

        if self.gateway.ensure_folder(&pair.derived).await? {
            self.log.info(format!("Created folder: {}", pair.derived));
        }

        let files = files_only(self.gateway.list_folder(&pair.source).await?);
        self.log
            .info(format!("Found {} images in {}.", files.len(), pair.source));

        let mut report = OptimizeReport::default();
        for file in &files {
            report.scanned += 1;
            let derived_path = join_path(&pair.derived, &file.name);

            match self.gateway.get_metadata(&derived_path).await {
                Ok(_) => report.skipped += 1,
                Err(e) if e.is_not_found() => {
                    self.log.info(format!("Optimizing: {}", file.name));
                    match self.optimize_file(file, &derived_path, pair.resize).await {
                        Ok(()) => {
                            report.optimized += 1;
                            self.log.info(format!("Success: {}", file.name));
                        }
                        Err(e) => {
                            report.failed += 1;
                            self.log.warn(format!("Failed {}: {}", file.name, e));
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    self.log
                        .warn(format!("Failed to check {}: {}", derived_path, e));
                }
            }
        }

        self.log.info(format!(
            "{} optimization finished: {} optimized, {} skipped, {} failed.",
            pair.label, report.optimized, report.skipped, report.failed
        ));
        Ok(report)
    }

    async fn optimize_file(
        &self,
        file: &StorageEntry,
        derived_path: &str,
        spec: ResizeSpec,
    ) -> AppResult<()> {
        let original = self.gateway.download(&file.path_lower).await?;
        let preview = resize_to_jpeg_blocking(original, spec).await?;
        self.gateway
            .upload(derived_path, preview.into(), WriteMode::Overwrite)
            .await?;
        Ok(())
    }
}
