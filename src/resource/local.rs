//! Local file-based resource store.
//!
//! Each resource is kept as one JSON document at
//! `<base_dir>/<namespace>/<name>.json`. Writes go to a temporary file that
//! is renamed into place.
//!
//! Writes made by other processes sharing the directory are picked up with
//! [`LocalResourceStore::watch`].

use async_trait::async_trait;
use chrono::Utc;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OperatorError, Result, StoreError};

use super::store::ResourceStore;
use super::types::{ResourceLocator, StackResource};

/// Document file extension.
const DOCUMENT_EXT: &str = "json";

/// Capacity of the change notification channel.
const EVENT_CAPACITY: usize = 256;

/// Local file-based resource store.
#[derive(Debug)]
pub struct LocalResourceStore {
    /// Base directory for resource documents.
    base_dir: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
    /// Change notifications.
    events: broadcast::Sender<ResourceLocator>,
}

impl LocalResourceStore {
    /// Creates a store rooted at the given directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// Gets the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the document for a locator.
    fn document_path(&self, locator: &ResourceLocator) -> PathBuf {
        self.base_dir
            .join(&locator.namespace)
            .join(format!("{}.{DOCUMENT_EXT}", locator.name))
    }

    /// Reads a document, mapping a missing file to `NotFound`.
    async fn read_document(&self, locator: &ResourceLocator) -> Result<StackResource> {
        let path = self.document_path(locator);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::not_found(locator).into());
            }
            Err(e) => {
                return Err(StoreError::io(format!(
                    "Failed to read {}: {e}",
                    path.display()
                ))
                .into());
            }
        };

        serde_json::from_str(&content).map_err(|e| {
            OperatorError::Store(StoreError::Corrupted {
                message: format!("Failed to parse {}: {e}", path.display()),
            })
        })
    }

    /// Writes a document atomically.
    async fn write_document(&self, resource: &StackResource) -> Result<()> {
        let path = self.document_path(&resource.locator());
        let dir = path
            .parent()
            .map_or_else(|| self.base_dir.clone(), Path::to_path_buf);

        fs::create_dir_all(&dir).await.map_err(|e| {
            StoreError::io(format!("Failed to create directory {}: {e}", dir.display()))
        })?;

        let content = serde_json::to_string_pretty(resource).map_err(|e| {
            OperatorError::Store(StoreError::SerializationError {
                message: format!("Failed to serialize resource: {e}"),
            })
        })?;

        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StoreError::io(format!("Failed to create {}: {e}", temp_path.display()))
        })?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StoreError::io(format!("Failed to write resource: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StoreError::io(format!("Failed to sync resource: {e}")))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StoreError::io(format!("Failed to rename resource file: {e}")))?;

        Ok(())
    }

    /// Removes a document.
    async fn remove_document(&self, locator: &ResourceLocator) -> Result<()> {
        let path = self.document_path(locator);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(format!("Failed to remove {}: {e}", path.display())).into()),
        }
    }

    /// Publishes a change. Having no subscribers is fine.
    fn notify(&self, locator: ResourceLocator) {
        let _ = self.events.send(locator);
    }

    /// Watches the base directory for documents written by other processes.
    ///
    /// Every document created, modified or removed under the base directory is
    /// published to subscribers, including writes made through this instance,
    /// which then arrive twice. Watching stops when the returned guard drops.
    pub async fn watch(&self) -> Result<StoreWatcher> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            StoreError::io(format!(
                "Failed to create directory {}: {e}",
                self.base_dir.display()
            ))
        })?;

        let events = self.events.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove()) {
                        return;
                    }
                    for locator in event.paths.iter().filter_map(|path| document_locator(path)) {
                        let _ = events.send(locator);
                    }
                }
                Err(e) => warn!("Store watch error: {e}"),
            },
            NotifyConfig::default(),
        )
        .map_err(|e| StoreError::io(format!("Failed to create store watcher: {e}")))?;

        watcher
            .watch(&self.base_dir, RecursiveMode::Recursive)
            .map_err(|e| {
                StoreError::io(format!(
                    "Failed to watch {}: {e}",
                    self.base_dir.display()
                ))
            })?;

        info!("Watching {} for resource changes", self.base_dir.display());
        Ok(StoreWatcher { _watcher: watcher })
    }
}

/// Keeps a [`LocalResourceStore::watch`] alive.
pub struct StoreWatcher {
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for StoreWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWatcher").finish_non_exhaustive()
    }
}

/// Locator of a document path, `<namespace>/<name>.json`.
fn document_locator(path: &Path) -> Option<ResourceLocator> {
    if path.extension().and_then(|e| e.to_str()) != Some(DOCUMENT_EXT) {
        return None;
    }
    let name = path.file_stem()?.to_str()?;
    let namespace = path.parent()?.file_name()?.to_str()?;
    Some(ResourceLocator::new(namespace, name))
}

#[async_trait]
impl ResourceStore for LocalResourceStore {
    async fn get(&self, locator: &ResourceLocator) -> Result<StackResource> {
        self.read_document(locator).await
    }

    async fn list(&self) -> Result<Vec<ResourceLocator>> {
        let mut locators = Vec::new();

        let mut namespaces = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(locators),
            Err(e) => return Err(StoreError::io(format!("Failed to list store: {e}")).into()),
        };

        while let Some(namespace) = namespaces
            .next_entry()
            .await
            .map_err(|e| StoreError::io(format!("Failed to list store: {e}")))?
        {
            if !namespace.path().is_dir() {
                continue;
            }
            let namespace_name = namespace.file_name().to_string_lossy().to_string();

            let mut documents = fs::read_dir(namespace.path())
                .await
                .map_err(|e| StoreError::io(format!("Failed to list {namespace_name}: {e}")))?;

            while let Some(document) = documents
                .next_entry()
                .await
                .map_err(|e| StoreError::io(format!("Failed to list {namespace_name}: {e}")))?
            {
                let path = document.path();
                if path.extension().and_then(|e| e.to_str()) != Some(DOCUMENT_EXT) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    locators.push(ResourceLocator::new(&namespace_name, stem));
                }
            }
        }

        locators.sort();
        Ok(locators)
    }

    async fn create(&self, mut resource: StackResource) -> Result<StackResource> {
        let _guard = self.write_lock.lock().await;
        let locator = resource.locator();

        match self.read_document(&locator).await {
            Ok(_) => {
                return Err(StoreError::AlreadyExists {
                    locator: locator.to_string(),
                }
                .into());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        resource.metadata.uid = Uuid::new_v4().to_string();
        resource.metadata.generation = 1;
        resource.metadata.creation_timestamp = Some(Utc::now());
        resource.metadata.deletion_timestamp = None;

        self.write_document(&resource).await?;
        info!("Created stack resource {locator}");
        self.notify(locator);

        Ok(resource)
    }

    async fn update(&self, resource: &StackResource) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let locator = resource.locator();
        let mut stored = self.read_document(&locator).await?;

        if stored.metadata.uid != resource.metadata.uid {
            // Deleted and recreated under the same name since it was read.
            return Err(StoreError::not_found(&locator).into());
        }

        if stored.spec != resource.spec {
            stored.metadata.generation = stored.metadata.generation.saturating_add(1);
            stored.spec = resource.spec.clone();
        }
        stored.metadata.finalizers.clone_from(&resource.metadata.finalizers);
        if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = resource.metadata.deletion_timestamp;
        }

        if stored.is_marked_for_deletion() && stored.metadata.finalizers.is_empty() {
            self.remove_document(&locator).await?;
            info!("Removed stack resource {locator}");
        } else {
            self.write_document(&stored).await?;
            debug!("Updated stack resource {locator}");
        }

        self.notify(locator);
        Ok(())
    }

    async fn update_status(&self, resource: &StackResource) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let locator = resource.locator();
        let mut stored = self.read_document(&locator).await?;

        if stored.metadata.uid != resource.metadata.uid {
            return Err(StoreError::not_found(&locator).into());
        }

        stored.status = resource.status.clone();
        self.write_document(&stored).await?;
        debug!("Updated status of stack resource {locator}");

        self.notify(locator);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceLocator> {
        self.events.subscribe()
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
