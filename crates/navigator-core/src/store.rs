//! Persisted record store contract and the in-memory implementation.
//!
//! The store is the single source of truth for derived content. Every
//! subsystem reads from it; providers write generated content back into it.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::events::{EventBus, Subscription};
use crate::host::VaultFile;
use crate::record::{ContentType, ContentUpdate, FileRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage IO error: {0}")]
    Io(String),

    #[error("Storage serialization error: {0}")]
    Serialization(String),

    #[error("Store closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Notification emitted when derived content changes for a path.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentChange {
    pub path: String,
    pub kinds: Vec<ContentType>,
    /// Whether the set of tags for this path changed (including removal)
    pub tags_changed: bool,
}

/// Durable key/value store of `FileRecord`s keyed by path.
#[async_trait]
pub trait PersistedStore: Send + Sync {
    async fn get_file(&self, path: &str) -> Result<Option<FileRecord>>;

    /// Records for the given paths. Missing paths are simply absent.
    async fn get_files(&self, paths: &[String]) -> Result<HashMap<String, FileRecord>>;

    /// Snapshot of every record.
    async fn all_files(&self) -> Result<HashMap<String, FileRecord>>;

    /// Upsert records for added/updated files.
    ///
    /// `previous` holds the records as they were when the diff was computed;
    /// `rename_carryover` maps new paths to the record captured under the old
    /// path before a rename.
    async fn record_changes(
        &self,
        files: &[VaultFile],
        previous: &HashMap<String, FileRecord>,
        rename_carryover: &HashMap<String, FileRecord>,
    ) -> Result<()>;

    /// Write generated content. Updates whose mtime no longer matches the
    /// record are dropped.
    async fn update_content(&self, updates: Vec<ContentUpdate>) -> Result<usize>;

    /// Reset one kind of derived content on every record.
    async fn clear_content(&self, kind: ContentType) -> Result<()>;

    async fn remove_files(&self, paths: &[String]) -> Result<()>;

    async fn clear_database(&self) -> Result<()>;

    fn on_content_change(
        &self,
        callback: Box<dyn Fn(&ContentChange) + Send + Sync>,
    ) -> Subscription;

    /// Paths whose field for `kind` is still uncomputed.
    async fn files_needing_content(&self, kind: ContentType) -> Result<HashSet<String>>;
}

/// Build the record that `record_changes` should store for `file`.
pub fn next_record(
    file: &VaultFile,
    previous: Option<&FileRecord>,
    carryover: Option<&FileRecord>,
) -> FileRecord {
    match (previous, carryover) {
        (Some(existing), _) => {
            let mut record = existing.clone();
            if record.mtime != file.mtime {
                record.mtime = file.mtime;
                record.clear_all();
            }
            record
        }
        (None, Some(old)) => {
            let mut record = old.clone();
            record.path = file.path.clone();
            if record.mtime != file.mtime {
                // Content changed alongside the move; icon/color/name survive.
                let metadata = record.metadata.take();
                record.mtime = file.mtime;
                record.clear_all();
                record.metadata = metadata;
            }
            record
        }
        (None, None) => FileRecord::new(file.path.clone(), file.mtime),
    }
}

/// Raw record map plus the change bus, shared by in-process store
/// implementations.
#[derive(Default)]
pub struct RecordMap {
    records: RwLock<HashMap<String, FileRecord>>,
    changes: Arc<EventBus<ContentChange>>,
}

impl RecordMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: HashMap<String, FileRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            changes: Arc::new(EventBus::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, FileRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, FileRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> HashMap<String, FileRecord> {
        self.read().clone()
    }

    pub fn get(&self, path: &str) -> Option<FileRecord> {
        self.read().get(path).cloned()
    }

    pub fn get_many(&self, paths: &[String]) -> HashMap<String, FileRecord> {
        let records = self.read();
        paths
            .iter()
            .filter_map(|p| records.get(p).map(|r| (p.clone(), r.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn record_changes(
        &self,
        files: &[VaultFile],
        previous: &HashMap<String, FileRecord>,
        rename_carryover: &HashMap<String, FileRecord>,
    ) {
        let mut changes = Vec::new();
        {
            let mut records = self.write();
            for file in files {
                let before = previous.get(&file.path).or_else(|| records.get(&file.path));
                let record = next_record(file, before, rename_carryover.get(&file.path));
                if record.has_tags() && before.is_none() {
                    // Carried-over tags appear under a new path
                    changes.push(ContentChange {
                        path: file.path.clone(),
                        kinds: vec![ContentType::Tags],
                        tags_changed: true,
                    });
                } else if before.is_some_and(|b| b.has_tags() && !record.has_tags()) {
                    changes.push(ContentChange {
                        path: file.path.clone(),
                        kinds: vec![ContentType::Tags],
                        tags_changed: true,
                    });
                }
                records.insert(file.path.clone(), record);
            }
        }
        debug!("Recorded {} file change(s)", files.len());
        self.emit_all(&changes);
    }

    pub fn update_content(&self, updates: Vec<ContentUpdate>) -> usize {
        let mut changes: Vec<ContentChange> = Vec::new();
        {
            let mut records = self.write();
            for update in updates {
                let Some(record) = records.get_mut(&update.path) else {
                    continue;
                };
                if record.mtime != update.mtime {
                    debug!("Dropping stale {} for {}", update.value.kind(), update.path);
                    continue;
                }
                let kind = update.value.kind();
                let tags_before = record.tags.clone();
                update.value.apply(record);
                let tags_changed = kind == ContentType::Tags && tags_before != record.tags;
                changes.push(ContentChange {
                    path: update.path,
                    kinds: vec![kind],
                    tags_changed,
                });
            }
        }
        self.emit_all(&changes);
        changes.len()
    }

    pub fn clear_content(&self, kind: ContentType) {
        let mut changes = Vec::new();
        {
            let mut records = self.write();
            for record in records.values_mut() {
                if record.needs(kind) {
                    continue;
                }
                let had_tags = record.has_tags();
                record.clear(kind);
                changes.push(ContentChange {
                    path: record.path.clone(),
                    kinds: vec![kind],
                    tags_changed: kind == ContentType::Tags && had_tags,
                });
            }
        }
        self.emit_all(&changes);
    }

    pub fn remove_files(&self, paths: &[String]) {
        let mut changes = Vec::new();
        {
            let mut records = self.write();
            for path in paths {
                if let Some(record) = records.remove(path) {
                    if record.has_tags() {
                        changes.push(ContentChange {
                            path: path.clone(),
                            kinds: vec![ContentType::Tags],
                            tags_changed: true,
                        });
                    }
                }
            }
        }
        self.emit_all(&changes);
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Put back a snapshot taken earlier. No change events are emitted.
    pub fn restore(&self, records: HashMap<String, FileRecord>) {
        *self.write() = records;
    }

    pub fn needing(&self, kind: ContentType) -> HashSet<String> {
        self.read()
            .values()
            .filter(|r| r.needs(kind))
            .map(|r| r.path.clone())
            .collect()
    }

    pub fn subscribe(
        &self,
        callback: Box<dyn Fn(&ContentChange) + Send + Sync>,
    ) -> Subscription {
        self.changes.subscribe(move |change| callback(change))
    }

    fn emit_all(&self, changes: &[ContentChange]) {
        // Emitted after the write lock is released so listeners may read back.
        for change in changes {
            self.changes.emit(change);
        }
    }
}

/// In-memory store for testing and for hosts that persist elsewhere.
#[derive(Default)]
pub struct InMemoryStore {
    map: RecordMap,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl PersistedStore for InMemoryStore {
    async fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        Ok(self.map.get(path))
    }

    async fn get_files(&self, paths: &[String]) -> Result<HashMap<String, FileRecord>> {
        Ok(self.map.get_many(paths))
    }

    async fn all_files(&self) -> Result<HashMap<String, FileRecord>> {
        Ok(self.map.snapshot())
    }

    async fn record_changes(
        &self,
        files: &[VaultFile],
        previous: &HashMap<String, FileRecord>,
        rename_carryover: &HashMap<String, FileRecord>,
    ) -> Result<()> {
        self.map.record_changes(files, previous, rename_carryover);
        Ok(())
    }

    async fn update_content(&self, updates: Vec<ContentUpdate>) -> Result<usize> {
        Ok(self.map.update_content(updates))
    }

    async fn clear_content(&self, kind: ContentType) -> Result<()> {
        self.map.clear_content(kind);
        Ok(())
    }

    async fn remove_files(&self, paths: &[String]) -> Result<()> {
        self.map.remove_files(paths);
        Ok(())
    }

    async fn clear_database(&self) -> Result<()> {
        self.map.clear();
        Ok(())
    }

    fn on_content_change(
        &self,
        callback: Box<dyn Fn(&ContentChange) + Send + Sync>,
    ) -> Subscription {
        self.map.subscribe(callback)
    }

    async fn files_needing_content(&self, kind: ContentType) -> Result<HashSet<String>> {
        Ok(self.map.needing(kind))
    }
}
