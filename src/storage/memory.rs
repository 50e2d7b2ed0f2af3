//! In-memory storage gateway
//!
//! Backs `STORAGE_PROVIDER=memory` for running the service without a Dropbox
//! account, and doubles as the gateway in tests: it counts calls per
//! operation, tracks how many temporary-link requests are in flight, and can
//! be told to fail a specific operation on a specific path.
//!
//! Paths are case-insensitive like Dropbox: lookups use the lower-cased path
//! while entries keep their display casing.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;

use super::{ByteStream, EntryKind, StorageEntry, StorageError, StorageGateway, WriteMode};

const LINK_BASE: &str = "https://memory.invalid/links";

/// Gateway operations, used for call counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Metadata,
    Download,
    Upload,
    Link,
    Move,
    Delete,
    CreateFolder,
    Zip,
}

#[derive(Debug, Clone)]
struct MemoryFile {
    path_display: String,
    contents: Bytes,
    modified: DateTime<Utc>,
}

#[derive(Default)]
struct Tree {
    // lower-cased path -> display path
    folders: BTreeMap<String, String>,
    files: BTreeMap<String, MemoryFile>,
}

#[derive(Default)]
pub struct MemoryGateway {
    tree: Mutex<Tree>,
    calls: Mutex<HashMap<Operation, usize>>,
    failures: Mutex<HashSet<(Operation, String)>>,
    uploads: Mutex<Vec<String>>,
    links_in_flight: AtomicUsize,
    peak_links_in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn normalize(path: &str) -> String {
    path.trim_end_matches('/').to_lowercase()
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

impl Tree {
    fn add_folder_with_ancestors(&mut self, display: &str) {
        let mut current = display.trim_end_matches('/');
        while !current.is_empty() {
            self.folders
                .entry(current.to_lowercase())
                .or_insert_with(|| current.to_string());
            current = parent_of(current);
        }
    }

    fn file_entry(&self, key: &str) -> Option<StorageEntry> {
        self.files.get(key).map(|file| StorageEntry {
            kind: EntryKind::File,
            name: name_of(&file.path_display).to_string(),
            path_lower: key.to_string(),
            path_display: file.path_display.clone(),
            server_modified: Some(file.modified),
            size: Some(file.contents.len() as u64),
        })
    }

    fn folder_entry(&self, key: &str) -> Option<StorageEntry> {
        self.folders.get(key).map(|display| StorageEntry {
            kind: EntryKind::Folder,
            name: name_of(display).to_string(),
            path_lower: key.to_string(),
            path_display: display.clone(),
            server_modified: None,
            size: None,
        })
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a folder (and its ancestors)
    pub fn add_folder(&self, path: &str) {
        lock(&self.tree).add_folder_with_ancestors(path);
    }

    /// Place a file directly, bypassing call counting
    pub fn put_file(&self, path: &str, contents: impl Into<Bytes>, modified: DateTime<Utc>) {
        let mut tree = lock(&self.tree);
        tree.add_folder_with_ancestors(parent_of(path));
        tree.files.insert(
            normalize(path),
            MemoryFile {
                path_display: path.to_string(),
                contents: contents.into(),
                modified,
            },
        );
    }

    pub fn file_contents(&self, path: &str) -> Option<Bytes> {
        lock(&self.tree)
            .files
            .get(&normalize(path))
            .map(|file| file.contents.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        let key = normalize(path);
        let tree = lock(&self.tree);
        tree.files.contains_key(&key) || tree.folders.contains_key(&key)
    }

    /// Make every later `operation` on `path` fail with an API error
    pub fn fail(&self, operation: Operation, path: &str) {
        lock(&self.failures).insert((operation, normalize(path)));
    }

    pub fn calls(&self, operation: Operation) -> usize {
        lock(&self.calls).get(&operation).copied().unwrap_or(0)
    }

    /// Folder paths currently present, lower-cased
    pub fn folder_paths(&self) -> BTreeSet<String> {
        lock(&self.tree).folders.keys().cloned().collect()
    }

    /// Paths written through `upload`, in call order
    pub fn uploaded_paths(&self) -> Vec<String> {
        lock(&self.uploads).clone()
    }

    /// Highest number of temporary-link requests seen in flight at once
    pub fn peak_concurrent_links(&self) -> usize {
        self.peak_links_in_flight.load(Ordering::SeqCst)
    }

    fn begin(&self, operation: Operation, path: &str) -> Result<String, StorageError> {
        *lock(&self.calls).entry(operation).or_insert(0) += 1;
        let key = normalize(path);
        if lock(&self.failures).contains(&(operation, key.clone())) {
            return Err(StorageError::Api {
                status: 500,
                summary: format!("injected {:?} failure", operation),
            });
        }
        Ok(key)
    }
}

fn conflict(path: &str) -> StorageError {
    StorageError::Api {
        status: 409,
        summary: format!("path/conflict/ {}", path),
    }
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    fn provider_name(&self) -> &'static str {
        "memory"
    }

    async fn list_folder(&self, path: &str) -> Result<Vec<StorageEntry>, StorageError> {
        let key = self.begin(Operation::List, path)?;
        let tree = lock(&self.tree);
        if !tree.folders.contains_key(&key) {
            return Err(StorageError::NotFound(path.to_string()));
        }

        let folders = tree
            .folders
            .keys()
            .filter(|child| parent_of(child) == key)
            .filter_map(|child| tree.folder_entry(child));
        let files = tree
            .files
            .keys()
            .filter(|child| parent_of(child) == key)
            .filter_map(|child| tree.file_entry(child));

        Ok(folders.chain(files).collect())
    }

    async fn get_metadata(&self, path: &str) -> Result<StorageEntry, StorageError> {
        let key = self.begin(Operation::Metadata, path)?;
        let tree = lock(&self.tree);
        tree.file_entry(&key)
            .or_else(|| tree.folder_entry(&key))
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn download(&self, path: &str) -> Result<Bytes, StorageError> {
        let key = self.begin(Operation::Download, path)?;
        lock(&self.tree)
            .files
            .get(&key)
            .map(|file| file.contents.clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn upload(
        &self,
        path: &str,
        contents: Bytes,
        mode: WriteMode,
    ) -> Result<StorageEntry, StorageError> {
        let key = self.begin(Operation::Upload, path)?;
        let mut tree = lock(&self.tree);
        if mode == WriteMode::Add && tree.files.contains_key(&key) {
            return Err(conflict(path));
        }

        tree.add_folder_with_ancestors(parent_of(path));
        tree.files.insert(
            key.clone(),
            MemoryFile {
                path_display: path.to_string(),
                contents,
                modified: Utc::now(),
            },
        );
        lock(&self.uploads).push(path.to_string());

        tree.file_entry(&key)
            .ok_or_else(|| StorageError::Decode(format!("upload of {} vanished", path)))
    }

    async fn temporary_link(&self, path: &str) -> Result<String, StorageError> {
        let in_flight = self.links_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_links_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        // Give sibling requests a chance to start so concurrency is observable
        tokio::task::yield_now().await;

        let result = self.begin(Operation::Link, path).and_then(|key| {
            if lock(&self.tree).files.contains_key(&key) {
                Ok(format!("{}{}", LINK_BASE, key))
            } else {
                Err(StorageError::NotFound(path.to_string()))
            }
        });

        self.links_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let from_key = self.begin(Operation::Move, from)?;
        let to_key = normalize(to);
        let mut tree = lock(&self.tree);
        if tree.files.contains_key(&to_key) {
            return Err(conflict(to));
        }

        let mut file = tree
            .files
            .remove(&from_key)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        file.path_display = to.to_string();
        tree.add_folder_with_ancestors(parent_of(to));
        tree.files.insert(to_key, file);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let key = self.begin(Operation::Delete, path)?;
        let mut tree = lock(&self.tree);
        if tree.files.remove(&key).is_some() {
            return Ok(());
        }
        if tree.folders.remove(&key).is_none() {
            return Err(StorageError::NotFound(path.to_string()));
        }

        let prefix = format!("{}/", key);
        tree.folders.retain(|child, _| !child.starts_with(&prefix));
        tree.files.retain(|child, _| !child.starts_with(&prefix));
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<(), StorageError> {
        let key = self.begin(Operation::CreateFolder, path)?;
        let mut tree = lock(&self.tree);
        if tree.folders.contains_key(&key) || tree.files.contains_key(&key) {
            return Err(conflict(path));
        }
        tree.add_folder_with_ancestors(path);
        Ok(())
    }

    /// The bundle is the folder's file contents back to back, one chunk per
    /// file in name order. It is not a real zip archive; it exercises the
    /// streaming path only.
    async fn download_zip(&self, path: &str) -> Result<ByteStream, StorageError> {
        let key = self.begin(Operation::Zip, path)?;
        let tree = lock(&self.tree);
        if !tree.folders.contains_key(&key) {
            return Err(StorageError::NotFound(path.to_string()));
        }

        let prefix = format!("{}/", key);
        let chunks: Vec<Result<Bytes, StorageError>> = tree
            .files
            .iter()
            .filter(|(child, _)| child.starts_with(&prefix))
            .map(|(_, file)| Ok(file.contents.clone()))
            .collect();

        Ok(futures::stream::iter(chunks).boxed())
    }
}
