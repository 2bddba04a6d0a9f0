//! Filesystem-backed metadata index.
//!
//! Parses Markdown files in the background and exposes the same "look up, then
//! wait for a signal" contract a host editor offers: nothing is known about
//! a file until it has been indexed, `changed` fires per file and `resolved`
//! fires once a full pass completes.

use futures::stream::{self, StreamExt};
use navigator_core::events::{EventBus, Subscription};
use navigator_core::host::{CachedMetadata, MetadataIndex, VaultHost};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Files parsed concurrently during a full pass.
const INDEX_CONCURRENCY: usize = 16;

pub struct NativeMetadataIndex {
    host: Arc<dyn VaultHost>,
    entries: RwLock<HashMap<String, CachedMetadata>>,
    resolved: Arc<EventBus<()>>,
    changed: Arc<EventBus<String>>,
}

impl NativeMetadataIndex {
    pub fn new(host: Arc<dyn VaultHost>) -> Self {
        Self {
            host,
            entries: RwLock::new(HashMap::new()),
            resolved: Arc::new(EventBus::new()),
            changed: Arc::new(EventBus::new()),
        }
    }

    /// Parse every Markdown file the host lists, then fire `resolved`.
    ///
    /// Entries for files that no longer exist are dropped.
    pub async fn index_all(&self) -> usize {
        let files: Vec<String> = self
            .host
            .indexable_files()
            .into_iter()
            .filter(|f| f.is_markdown())
            .map(|f| f.path)
            .collect();

        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.retain(|path, _| files.contains(path));
        }

        let indexed = stream::iter(files)
            .map(|path| async move { self.reindex(&path).await })
            .buffer_unordered(INDEX_CONCURRENCY)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;

        debug!("Metadata index resolved {} file(s)", indexed);
        self.resolved.emit(&());
        indexed
    }

    /// Re-parse one file and fire `changed` for it. Returns false if the
    /// file could not be read.
    pub async fn reindex(&self, path: &str) -> bool {
        match self.host.read(path).await {
            Ok(content) => {
                let data = CachedMetadata::from_markdown(&content);
                self.entries
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(path.to_string(), data);
                self.changed.emit(&path.to_string());
                true
            }
            Err(e) => {
                warn!("Failed to index {}: {}", path, e);
                self.remove(path);
                false
            }
        }
    }

    pub fn remove(&self, path: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataIndex for NativeMetadataIndex {
    fn cached_data_for(&self, path: &str) -> Option<CachedMetadata> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    fn has_data(&self, path: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }

    fn on_resolved(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.resolved.subscribe(move |_| callback())
    }

    fn on_changed(&self, callback: Box<dyn Fn(&str) + Send + Sync>) -> Subscription {
        self.changed.subscribe(move |path: &String| callback(path))
    }
}
