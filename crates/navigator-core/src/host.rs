//! Host abstractions: the live vault and the host's asynchronous metadata index.
//!
//! Implementations:
//! - `InMemoryVault` / `InMemoryMetadataIndex` - For testing
//! - `NativeVault` / `NativeMetadataIndex` (in navigator-daemon) - Local directory
//!
//! The engine never polls the index. It calls `has_data` only when one of
//! the index's signals fires.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::events::{EventBus, Subscription};
use crate::markdown::{self, Frontmatter};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, HostError>;

/// A file currently tracked by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VaultFile {
    /// Path relative to vault root
    pub path: String,
    /// Modification time in milliseconds since epoch
    pub mtime: u64,
}

impl VaultFile {
    pub fn new(path: impl Into<String>, mtime: u64) -> Self {
        Self {
            path: path.into(),
            mtime,
        }
    }

    /// Lowercased extension without the dot, empty if none.
    pub fn extension(&self) -> String {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
            _ => String::new(),
        }
    }

    pub fn is_markdown(&self) -> bool {
        self.extension() == "md"
    }
}

/// The live file collection.
#[async_trait]
pub trait VaultHost: Send + Sync {
    /// Every file the host tracks, regardless of visibility settings.
    fn indexable_files(&self) -> Vec<VaultFile>;

    /// Current state of one file.
    fn file(&self, path: &str) -> Option<VaultFile>;

    /// Read file contents as text.
    async fn read(&self, path: &str) -> Result<String>;
}

/// What the host's metadata index knows about a parsed file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedMetadata {
    pub frontmatter: Option<Frontmatter>,
    /// Inline tags without the leading `#`
    pub tags: Vec<String>,
    /// Embed targets in document order
    pub embeds: Vec<String>,
}

impl CachedMetadata {
    /// Build the metadata the index would report for `content`.
    pub fn from_markdown(content: &str) -> Self {
        let parsed = markdown::parse(content);
        Self {
            tags: markdown::extract_inline_tags(parsed.body),
            embeds: markdown::extract_embeds(parsed.body),
            frontmatter: parsed.frontmatter,
        }
    }
}

/// The host's asynchronously populated metadata index.
pub trait MetadataIndex: Send + Sync {
    /// Synchronous lookup. `None` until the index has parsed the file.
    fn cached_data_for(&self, path: &str) -> Option<CachedMetadata>;

    /// Whether the index has parsed `path`, without cloning its data.
    fn has_data(&self, path: &str) -> bool {
        self.cached_data_for(path).is_some()
    }

    /// Fires when the index has finished resolving every pending file.
    fn on_resolved(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription;

    /// Fires with a path each time the index updates that file.
    fn on_changed(&self, callback: Box<dyn Fn(&str) + Send + Sync>) -> Subscription;
}

/// In-memory vault for testing
#[derive(Default)]
pub struct InMemoryVault {
    files: RwLock<HashMap<String, (VaultFile, String)>>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file.
    pub fn put(&self, path: &str, mtime: u64, content: &str) -> VaultFile {
        let file = VaultFile::new(path, mtime);
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), (file.clone(), content.to_string()));
        file
    }

    pub fn remove(&self, path: &str) -> Option<VaultFile> {
        self.files.write().unwrap_or_else(|e| e.into_inner()).remove(path).map(|(f, _)| f)
    }

    /// Move a file, keeping content and mtime.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Option<VaultFile> {
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        let (file, content) = files.remove(old_path)?;
        let moved = VaultFile::new(new_path, file.mtime);
        files.insert(new_path.to_string(), (moved.clone(), content));
        Some(moved)
    }
}

#[async_trait]
impl VaultHost for InMemoryVault {
    fn indexable_files(&self) -> Vec<VaultFile> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<VaultFile> = files.values().map(|(f, _)| f.clone()).collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        list
    }

    fn file(&self, path: &str) -> Option<VaultFile> {
        self.files.read().unwrap_or_else(|e| e.into_inner()).get(path).map(|(f, _)| f.clone())
    }

    async fn read(&self, path: &str) -> Result<String> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| HostError::NotFound(path.to_string()))
    }
}

/// In-memory metadata index for testing.
///
/// Nothing is "parsed" until a test calls `publish` (per-file signal) or
/// `resolve` (global signal).
#[derive(Default)]
pub struct InMemoryMetadataIndex {
    entries: RwLock<HashMap<String, CachedMetadata>>,
    resolved: Arc<EventBus<()>>,
    changed: Arc<EventBus<String>>,
    lookups: AtomicUsize,
}

impl InMemoryMetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store metadata without firing any signal.
    pub fn insert(&self, path: &str, data: CachedMetadata) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).insert(path.to_string(), data);
    }

    /// Store metadata and fire the per-file signal.
    pub fn publish(&self, path: &str, data: CachedMetadata) {
        self.insert(path, data);
        self.changed.emit(&path.to_string());
    }

    /// Fire the global "resolved" signal.
    pub fn resolve(&self) {
        self.resolved.emit(&());
    }

    pub fn remove(&self, path: &str) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).remove(path);
    }

    pub fn listener_count(&self) -> usize {
        self.resolved.subscriber_count() + self.changed.subscriber_count()
    }

    /// Number of `has_data` calls so far.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl MetadataIndex for InMemoryMetadataIndex {
    fn cached_data_for(&self, path: &str) -> Option<CachedMetadata> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).get(path).cloned()
    }

    fn has_data(&self, path: &str) -> bool {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.entries.read().unwrap_or_else(|e| e.into_inner()).contains_key(path)
    }

    fn on_resolved(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.resolved.subscribe(move |_| callback())
    }

    fn on_changed(&self, callback: Box<dyn Fn(&str) + Send + Sync>) -> Subscription {
        self.changed.subscribe(move |path: &String| callback(path))
    }
}
