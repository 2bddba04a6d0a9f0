//! Persistence for the record cache.
//!
//! Records live in memory in a `RecordMap` and are written to
//! `.navigator/cache.json` within the vault after every mutation. Writes go
//! to a temporary file first and are renamed into place, so a crash never
//! leaves a truncated cache behind.
//!
//! Bulk operations (`clear_content`, `remove_files`, `clear_database`) roll
//! the in-memory records back when the write fails. Per-file updates do not:
//! memory stays ahead of disk until the next successful save.

use async_trait::async_trait;
use navigator_core::events::Subscription;
use navigator_core::host::VaultFile;
use navigator_core::record::{ContentType, ContentUpdate, FileRecord};
use navigator_core::store::{ContentChange, PersistedStore, RecordMap, Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Bumped whenever the record layout changes. Caches with another version
/// are discarded and rebuilt.
pub const CACHE_VERSION: u32 = 1;

/// On-disk layout of the cache file.
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    records: Vec<FileRecord>,
}

pub struct JsonStore {
    path: PathBuf,
    map: RecordMap,
    /// Serializes writers so an older snapshot never overwrites a newer one
    save_lock: Mutex<()>,
}

fn io_error(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

fn serialization_error(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

impl JsonStore {
    /// Cache file location for a vault.
    pub fn cache_path(vault_path: &Path) -> PathBuf {
        vault_path.join(".navigator").join("cache.json")
    }

    /// Open the cache at `path`, loading whatever is there.
    ///
    /// A missing, unreadable or outdated cache starts empty. The engine will
    /// treat every file as new and regenerate content.
    pub async fn open(path: PathBuf) -> Self {
        let records = match Self::load(&path).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Ignoring cache at {:?}: {}", path, e);
                HashMap::new()
            }
        };
        debug!("Loaded {} cached record(s) from {:?}", records.len(), path);

        Self {
            path,
            map: RecordMap::from_records(records),
            save_lock: Mutex::new(()),
        }
    }

    async fn load(path: &Path) -> Result<HashMap<String, FileRecord>> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(io_error(e)),
        };

        let cache: CacheFile = serde_json::from_str(&contents).map_err(serialization_error)?;
        if cache.version != CACHE_VERSION {
            return Err(StoreError::Serialization(format!(
                "cache version {} (expected {})",
                cache.version, CACHE_VERSION
            )));
        }

        Ok(cache
            .records
            .into_iter()
            .map(|record| (record.path.clone(), record))
            .collect())
    }

    /// Write the current records to disk.
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;

        let mut records: Vec<FileRecord> = self.map.snapshot().into_values().collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        let cache = CacheFile {
            version: CACHE_VERSION,
            records,
        };
        let contents = serde_json::to_vec(&cache).map_err(serialization_error)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).await.map_err(io_error)?;
        fs::rename(&tmp, &self.path).await.map_err(io_error)?;
        Ok(())
    }

    /// Save, or put `before` back into memory if the write fails.
    async fn save_or_restore(&self, before: HashMap<String, FileRecord>) -> Result<()> {
        match self.save().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Cache write failed, restoring previous records: {}", e);
                self.map.restore(before);
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl PersistedStore for JsonStore {
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
        if files.is_empty() {
            return Ok(());
        }
        self.map.record_changes(files, previous, rename_carryover);
        self.save().await
    }

    async fn update_content(&self, updates: Vec<ContentUpdate>) -> Result<usize> {
        let written = self.map.update_content(updates);
        if written > 0 {
            self.save().await?;
        }
        Ok(written)
    }

    async fn clear_content(&self, kind: ContentType) -> Result<()> {
        let before = self.map.snapshot();
        self.map.clear_content(kind);
        self.save_or_restore(before).await
    }

    async fn remove_files(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let before = self.map.snapshot();
        self.map.remove_files(paths);
        self.save_or_restore(before).await
    }

    async fn clear_database(&self) -> Result<()> {
        let before = self.map.snapshot();
        self.map.clear();
        self.save_or_restore(before).await
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
