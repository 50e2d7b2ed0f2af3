// Job worker

use std::sync::Arc;

use tracing::{error, info};

use crate::config::{FolderLayout, ManagedFolder, PipelineConfig};
use crate::optimizer::{OptimizePair, Optimizer};
use crate::queue::jobs::{Job, OptimizeTarget};
use crate::retention::{RetentionRule, RetentionSweeper};
use crate::storage::StorageGateway;
use crate::utils::{Clock, StatusLog};

pub struct Worker {
    gateway: Arc<dyn StorageGateway>,
    folders: FolderLayout,
    optimizer: Optimizer,
    sweeper: RetentionSweeper,
    gallery: OptimizePair,
    finals: OptimizePair,
    log: StatusLog,
}

impl Worker {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        clock: Arc<dyn Clock>,
        folders: FolderLayout,
        pipeline: &PipelineConfig,
        log: StatusLog,
    ) -> Self {
        let sweeper = RetentionSweeper::new(
            gateway.clone(),
            clock,
            RetentionRule::defaults(&folders),
            pipeline.retention_days,
            log.clone(),
        );

        Self {
            optimizer: Optimizer::new(gateway.clone(), log.clone()),
            gallery: OptimizePair::gallery(&folders, pipeline),
            finals: OptimizePair::finals(&folders, pipeline),
            gateway,
            folders,
            sweeper,
            log,
        }
    }

    pub async fn process_job(&self, job: Job) -> anyhow::Result<()> {
        info!("Processing job: {}", job.name());

        match job {
            Job::Startup => self.process_startup().await?,
            Job::Optimize(target) => self.process_optimize(target).await?,
            Job::Sweep => {
                self.sweeper.sweep().await;
            }
        }

        Ok(())
    }

    /// A folder that cannot be prepared is logged; the remaining folders and
    /// both optimization passes still run.
    async fn process_startup(&self) -> anyhow::Result<()> {
        for folder in ManagedFolder::ALL {
            let path = self.folders.path(folder);
            match self.gateway.ensure_folder(path).await {
                Ok(true) => self.log.info(format!("Created folder: {}", path)),
                Ok(false) => {}
                Err(e) => self
                    .log
                    .warn(format!("Could not create folder {}: {}", path, e)),
            }
        }

        let (gallery, finals) = tokio::join!(
            self.optimizer.optimize(&self.gallery),
            self.optimizer.optimize(&self.finals),
        );
        for (label, result) in [("gallery", gallery), ("final", finals)] {
            if let Err(e) = result {
                error!("{} optimization failed: {}", label, e);
                self.log.warn(format!("{} optimization failed: {}", label, e));
            }
        }
        Ok(())
    }

    async fn process_optimize(&self, target: OptimizeTarget) -> anyhow::Result<()> {
        let pair = match target {
            OptimizeTarget::Gallery => &self.gallery,
            OptimizeTarget::Final => &self.finals,
        };
        self.optimizer.optimize(pair).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryGateway, Operation};
    use crate::utils::ManualClock;
    use chrono::{Duration, TimeZone, Utc};
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    fn jpeg() -> Vec<u8> {
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(64, 32))
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
            .unwrap();
        out
    }

    fn worker(gateway: Arc<MemoryGateway>) -> Worker {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
        ));
        Worker::new(
            gateway,
            clock,
            FolderLayout::default(),
            &PipelineConfig::default(),
            StatusLog::default(),
        )
    }

    #[tokio::test]
    async fn test_startup_creates_every_managed_folder() {
        let gateway = Arc::new(MemoryGateway::new());

        worker(gateway.clone()).process_job(Job::Startup).await.unwrap();

        let folders = gateway.folder_paths();
        for folder in ManagedFolder::ALL {
            let path = FolderLayout::default().path(folder).to_lowercase();
            assert!(folders.contains(&path), "missing {}", path);
        }
        assert_eq!(gateway.calls(Operation::CreateFolder), 6);

        // Second startup creates nothing new
        worker(gateway.clone()).process_job(Job::Startup).await.unwrap();
        assert_eq!(gateway.calls(Operation::CreateFolder), 6);
    }

    #[tokio::test]
    async fn test_startup_optimizes_both_pairs() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.put_file("/PhotoSelection/Source/a.jpg", jpeg(), Utc::now());
        gateway.put_file("/PhotoSelection/Final/b.jpg", jpeg(), Utc::now());

        worker(gateway.clone()).process_job(Job::Startup).await.unwrap();

        assert!(gateway.contains("/PhotoSelection/Web/a.jpg"));
        assert!(gateway.contains("/PhotoSelection/Final_Web/b.jpg"));
    }

    #[tokio::test]
    async fn test_folder_failure_does_not_block_startup() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.put_file("/PhotoSelection/Source/a.jpg", jpeg(), Utc::now());
        gateway.fail(Operation::CreateFolder, "/PhotoSelection/Archive");

        let result = worker(gateway.clone()).process_job(Job::Startup).await;

        assert!(result.is_ok());
        assert!(!gateway.contains("/PhotoSelection/Archive"));
        // Folders after the failing one are still created
        assert!(gateway.contains("/PhotoSelection/Selections"));
        assert!(gateway.contains("/PhotoSelection/Web/a.jpg"));
    }

    #[tokio::test]
    async fn test_final_optimize_without_final_folder_is_quiet() {
        let gateway = Arc::new(MemoryGateway::new());

        worker(gateway.clone())
            .process_job(Job::Optimize(OptimizeTarget::Final))
            .await
            .unwrap();

        assert!(!gateway.contains("/PhotoSelection/Final_Web"));
    }

    #[tokio::test]
    async fn test_sweep_job_runs_retention() {
        let gateway = Arc::new(MemoryGateway::new());
        let old = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap() - Duration::days(45);
        gateway.put_file("/PhotoSelection/Web/old.jpg", "x", old);

        worker(gateway.clone()).process_job(Job::Sweep).await.unwrap();

        assert!(!gateway.contains("/PhotoSelection/Web/old.jpg"));
    }
}
