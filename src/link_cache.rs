//! Temporary Link Cache
//!
//! Temporary links are issued per file by the provider and live for a few
//! hours, so a full listing is expensive to build and cheap to reuse. Each
//! listing type has a single slot holding the last payload and its expiry.
//!
//! On a miss the backing folder is listed and links are requested in
//! fixed-size batches: requests within a batch run concurrently, batches run
//! one after another. A failed link drops that one file; it is logged and
//! not retried.
//!
//! The slot is locked only to read or replace it, never across a refresh.
//! Concurrent misses may each refresh; the last writer wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tokio::sync::RwLock;

use crate::config::{FolderLayout, PipelineConfig};
use crate::models::{FinalImageRecord, ImageRecord};
use crate::storage::{files_only, StorageEntry, StorageError, StorageGateway};
use crate::utils::{Clock, StatusLog};

struct CacheEntry<T> {
    payload: Arc<Vec<T>>,
    expires_at: DateTime<Utc>,
}

type Slot<T> = RwLock<Option<CacheEntry<T>>>;

/// Records that survived a batched fetch, and how many batches it took
pub struct BatchOutcome<T> {
    pub records: Vec<T>,
    pub batches: usize,
}

pub struct LinkCache {
    gateway: Arc<dyn StorageGateway>,
    clock: Arc<dyn Clock>,
    folders: FolderLayout,
    ttl: Duration,
    batch_size: usize,
    log: StatusLog,
    gallery: Slot<ImageRecord>,
    finals: Slot<FinalImageRecord>,
}

impl LinkCache {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        clock: Arc<dyn Clock>,
        folders: FolderLayout,
        pipeline: &PipelineConfig,
        log: StatusLog,
    ) -> Self {
        Self {
            gateway,
            clock,
            folders,
            ttl: Duration::seconds(pipeline.cache_ttl_secs),
            batch_size: pipeline.link_batch_size.max(1),
            log,
            gallery: RwLock::new(None),
            finals: RwLock::new(None),
        }
    }

    /// Gallery previews from the web folder
    pub async fn gallery(&self) -> Result<Arc<Vec<ImageRecord>>, StorageError> {
        let now = self.clock.now();
        if let Some(payload) = self.cached(&self.gallery, now).await {
            self.log.info("Returning images from cache");
            return Ok(payload);
        }

        self.log.info("Fetching fresh image links...");
        let files = files_only(self.gateway.list_folder(&self.folders.web).await?);

        let gateway = &self.gateway;
        let outcome = self
            .in_batches(&files, |file| async move {
                let url = gateway.temporary_link(&file.path_lower).await?;
                Ok(ImageRecord {
                    name: file.name.clone(),
                    url,
                    date: file.server_modified,
                })
            })
            .await;

        Ok(self.store(&self.gallery, outcome.records, now).await)
    }

    /// Final delivery files, each with its original link and, when a
    /// preview counterpart exists, a separate mobile link
    pub async fn finals(&self) -> Result<Arc<Vec<FinalImageRecord>>, StorageError> {
        let now = self.clock.now();
        if let Some(payload) = self.cached(&self.finals, now).await {
            self.log.info("Returning final images from cache");
            return Ok(payload);
        }

        self.log.info("Fetching final image links...");
        let (final_list, web_list) = tokio::join!(
            self.gateway.list_folder(&self.folders.finals),
            self.gateway.list_folder(&self.folders.finals_web),
        );
        let final_files = files_only(self.or_empty(&self.folders.finals, final_list));
        let previews: HashMap<String, StorageEntry> =
            files_only(self.or_empty(&self.folders.finals_web, web_list))
                .into_iter()
                .map(|entry| (entry.name.clone(), entry))
                .collect();

        let gateway = &self.gateway;
        let previews = &previews;
        let outcome = self
            .in_batches(&final_files, |file| async move {
                let original_url = gateway.temporary_link(&file.path_lower).await?;
                let mobile_url = match previews.get(&file.name) {
                    Some(preview) => gateway.temporary_link(&preview.path_lower).await?,
                    None => original_url.clone(),
                };
                Ok(FinalImageRecord {
                    name: file.name.clone(),
                    original_url,
                    mobile_url,
                    date: file.server_modified,
                })
            })
            .await;

        Ok(self.store(&self.finals, outcome.records, now).await)
    }

    fn or_empty(
        &self,
        folder: &str,
        listing: Result<Vec<StorageEntry>, StorageError>,
    ) -> Vec<StorageEntry> {
        listing.unwrap_or_else(|e| {
            self.log.warn(format!("Could not list {}: {}", folder, e));
            Vec::new()
        })
    }

    /// Resolve one record per file, `batch_size` at a time
    pub async fn in_batches<'a, T, F, Fut>(
        &self,
        files: &'a [StorageEntry],
        fetch: F,
    ) -> BatchOutcome<T>
    where
        F: Fn(&'a StorageEntry) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let total = files.len().div_ceil(self.batch_size);
        let mut records = Vec::with_capacity(files.len());
        let mut batches = 0;

        for chunk in files.chunks(self.batch_size) {
            batches += 1;
            let results = join_all(chunk.iter().map(|file| {
                let pending = fetch(file);
                async move { (file, pending.await) }
            }))
            .await;

            for (file, result) in results {
                match result {
                    Ok(record) => records.push(record),
                    Err(e) => self
                        .log
                        .warn(format!("Error fetching link for {}: {}", file.name, e)),
                }
            }
            self.log.info(format!("Fetched batch {}/{}", batches, total));
        }

        BatchOutcome { records, batches }
    }

    async fn cached<T>(&self, slot: &Slot<T>, now: DateTime<Utc>) -> Option<Arc<Vec<T>>> {
        slot.read()
            .await
            .as_ref()
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.payload.clone())
    }

    /// Expiry counts from when the miss was detected, not when the refresh ended
    async fn store<T>(
        &self,
        slot: &Slot<T>,
        records: Vec<T>,
        fetched_at: DateTime<Utc>,
    ) -> Arc<Vec<T>> {
        let payload = Arc::new(records);
        *slot.write().await = Some(CacheEntry {
            payload: payload.clone(),
            expires_at: fetched_at + self.ttl,
        });
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryGateway, Operation};
    use crate::utils::ManualClock;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn setup(files: usize) -> (Arc<MemoryGateway>, Arc<ManualClock>, LinkCache) {
        let gateway = Arc::new(MemoryGateway::new());
        let folders = FolderLayout::default();
        gateway.add_folder(&folders.web);
        for i in 0..files {
            gateway.put_file(&format!("{}/{:03}.jpg", folders.web, i), "x", start());
        }
        let clock = Arc::new(ManualClock::new(start()));
        let cache = LinkCache::new(
            gateway.clone(),
            clock.clone(),
            folders,
            &PipelineConfig::default(),
            StatusLog::default(),
        );
        (gateway, clock, cache)
    }

    #[tokio::test]
    async fn test_hit_within_ttl_makes_no_gateway_call() {
        let (gateway, clock, cache) = setup(3);

        let first = cache.gallery().await.unwrap();
        let lists = gateway.calls(Operation::List);
        let links = gateway.calls(Operation::Link);

        clock.advance(Duration::hours(3) - Duration::seconds(1));
        let second = cache.gallery().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            serde_json::to_vec(first.as_ref()).unwrap(),
            serde_json::to_vec(second.as_ref()).unwrap()
        );
        assert_eq!(gateway.calls(Operation::List), lists);
        assert_eq!(gateway.calls(Operation::Link), links);
    }

    #[tokio::test]
    async fn test_expiry_triggers_one_refresh() {
        let (gateway, clock, cache) = setup(3);
        cache.gallery().await.unwrap();

        clock.advance(Duration::hours(3));
        cache.gallery().await.unwrap();
        cache.gallery().await.unwrap();

        assert_eq!(gateway.calls(Operation::List), 2);
        assert_eq!(gateway.calls(Operation::Link), 6);
    }

    /// Moves forward an hour every time it is read
    struct TickingClock {
        now: std::sync::Mutex<DateTime<Utc>>,
    }

    impl Clock for TickingClock {
        fn now(&self) -> DateTime<Utc> {
            let mut now = self.now.lock().unwrap();
            let current = *now;
            *now += Duration::hours(1);
            current
        }
    }

    #[tokio::test]
    async fn test_expiry_counts_from_request_time() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.put_file("/PhotoSelection/Web/a.jpg", "a", start());
        let cache = LinkCache::new(
            gateway.clone(),
            Arc::new(TickingClock {
                now: std::sync::Mutex::new(start()),
            }),
            FolderLayout::default(),
            &PipelineConfig::default(),
            StatusLog::default(),
        );

        // Miss at +0h, hits at +1h and +2h, the entry is stale at +3h
        cache.gallery().await.unwrap();
        cache.gallery().await.unwrap();
        cache.gallery().await.unwrap();
        assert_eq!(gateway.calls(Operation::List), 1);
        cache.gallery().await.unwrap();
        assert_eq!(gateway.calls(Operation::List), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_refresh_at_most_once_each() {
        let (gateway, _clock, cache) = setup(5);

        let (a, b, c) = tokio::join!(cache.gallery(), cache.gallery(), cache.gallery());
        assert_eq!(a.unwrap().len(), 5);
        assert_eq!(b.unwrap().len(), 5);
        assert_eq!(c.unwrap().len(), 5);
        assert!(gateway.calls(Operation::List) <= 3);

        let lists = gateway.calls(Operation::List);
        cache.gallery().await.unwrap();
        assert_eq!(gateway.calls(Operation::List), lists);
    }

    #[tokio::test]
    async fn test_batches_bound_concurrency() {
        let (gateway, _clock, cache) = setup(25);
        let files = files_only(gateway.list_folder("/PhotoSelection/Web").await.unwrap());

        let gw = &gateway;
        let outcome = cache
            .in_batches(&files, |file| async move { gw.temporary_link(&file.path_lower).await })
            .await;

        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.records.len(), 25);
        assert_eq!(gateway.peak_concurrent_links(), 10);
    }

    #[tokio::test]
    async fn test_failed_link_keeps_siblings() {
        let (gateway, _clock, cache) = setup(10);
        gateway.fail(Operation::Link, "/PhotoSelection/Web/004.jpg");

        let images = cache.gallery().await.unwrap();

        assert_eq!(images.len(), 9);
        assert!(images.iter().all(|image| image.name != "004.jpg"));
        assert!(images[0].url.ends_with("/photoselection/web/000.jpg"));
        assert_eq!(images[0].date, Some(start()));
    }

    #[tokio::test]
    async fn test_listing_failure_is_not_cached() {
        let (gateway, _clock, cache) = setup(0);
        gateway.fail(Operation::List, "/PhotoSelection/Web");

        assert!(cache.gallery().await.is_err());
        assert!(cache.gallery().await.is_err());
        assert_eq!(gateway.calls(Operation::List), 2);
    }

    #[tokio::test]
    async fn test_finals_prefer_preview_for_mobile() {
        let (gateway, _clock, cache) = setup(0);
        gateway.put_file("/PhotoSelection/Final/a.jpg", "a", start());
        gateway.put_file("/PhotoSelection/Final/b.jpg", "b", start());
        gateway.put_file("/PhotoSelection/Final_Web/a.jpg", "a-small", start());

        let finals = cache.finals().await.unwrap();

        assert_eq!(finals.len(), 2);
        let a = finals.iter().find(|f| f.name == "a.jpg").unwrap();
        assert!(a.original_url.ends_with("/final/a.jpg"));
        assert!(a.mobile_url.ends_with("/final_web/a.jpg"));
        let b = finals.iter().find(|f| f.name == "b.jpg").unwrap();
        assert_eq!(b.mobile_url, b.original_url);
    }

    #[tokio::test]
    async fn test_finals_tolerate_missing_folders() {
        let (_gateway, _clock, cache) = setup(0);
        assert!(cache.finals().await.unwrap().is_empty());
    }
}
