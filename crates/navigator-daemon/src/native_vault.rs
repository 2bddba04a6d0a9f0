//! Local-directory vault backed by tokio::fs.
//!
//! Keeps an in-memory snapshot of every visible file and its mtime so that
//! `indexable_files` stays synchronous. The snapshot is refreshed by `scan`
//! and by applying watcher batches.

use async_trait::async_trait;
use navigator_core::host::{HostError, Result, VaultFile, VaultHost};
use navigator_core::vault_sync::VaultEvent;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::UNIX_EPOCH;
use tokio::fs;
use tracing::debug;

use crate::watcher::{FileEvent, FileEventKind};

pub struct NativeVault {
    base_path: PathBuf,
    files: RwLock<HashMap<String, VaultFile>>,
}

fn io_error(e: std::io::Error) -> HostError {
    HostError::Io(e.to_string())
}

fn mtime_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl NativeVault {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    /// Walk the vault directory and replace the snapshot.
    ///
    /// Hidden files and directories are skipped. Returns the number of files.
    pub async fn scan(&self) -> Result<usize> {
        let mut found = HashMap::new();
        let mut pending = vec![String::new()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(self.full_path(&dir)).await.map_err(io_error)?;
            while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let relative = if dir.is_empty() {
                    name
                } else {
                    format!("{}/{}", dir, name)
                };
                let metadata = entry.metadata().await.map_err(io_error)?;
                if metadata.is_dir() {
                    pending.push(relative);
                } else {
                    let file = VaultFile::new(relative.clone(), mtime_millis(&metadata));
                    found.insert(relative, file);
                }
            }
        }

        let count = found.len();
        *self.files.write().unwrap_or_else(|e| e.into_inner()) = found;
        debug!("Scanned {} file(s) in {:?}", count, self.base_path);
        Ok(count)
    }

    /// Stat one path and update the snapshot. `None` if the file is gone.
    pub async fn refresh(&self, path: &str) -> Option<VaultFile> {
        let file = match fs::metadata(self.full_path(path)).await {
            Ok(metadata) if metadata.is_file() => Some(VaultFile::new(path, mtime_millis(&metadata))),
            _ => None,
        };
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        match &file {
            Some(file) => {
                files.insert(path.to_string(), file.clone());
            }
            None => {
                files.remove(path);
            }
        }
        file
    }

    /// Turn one watcher batch into vault events, updating the snapshot.
    ///
    /// A removal and a new file with the same mtime and file name in the same
    /// batch are reported as a rename, so the old record can be carried over.
    pub async fn apply_fs_events(&self, batch: &[FileEvent]) -> Vec<VaultEvent> {
        let mut removed: Vec<VaultFile> = Vec::new();
        let mut created: Vec<VaultFile> = Vec::new();
        let mut events = Vec::new();

        for event in batch {
            let known = self.file(&event.path);
            match event.kind {
                FileEventKind::Removed => {
                    self.files
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&event.path);
                    if let Some(old) = known {
                        removed.push(old);
                    }
                }
                FileEventKind::Changed => {
                    let Some(file) = self.refresh(&event.path).await else {
                        if let Some(old) = known {
                            removed.push(old);
                        }
                        continue;
                    };
                    match known {
                        None => created.push(file),
                        Some(old) if old.mtime != file.mtime => events.push(VaultEvent::Modify(file)),
                        Some(_) => {}
                    }
                }
            }
        }

        for file in created {
            let pair = removed
                .iter()
                .position(|old| old.mtime == file.mtime && file_name(&old.path) == file_name(&file.path));
            match pair {
                Some(i) => {
                    let old = removed.swap_remove(i);
                    events.push(VaultEvent::Rename {
                        old_path: old.path,
                        file,
                    });
                }
                None => events.push(VaultEvent::Create(file)),
            }
        }
        events.extend(removed.into_iter().map(|old| VaultEvent::Delete(old.path)));
        events
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[async_trait]
impl VaultHost for NativeVault {
    fn indexable_files(&self) -> Vec<VaultFile> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<VaultFile> = files.values().cloned().collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        list
    }

    fn file(&self, path: &str) -> Option<VaultFile> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    async fn read(&self, path: &str) -> Result<String> {
        fs::read_to_string(self.full_path(path))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => HostError::NotFound(path.to_string()),
                _ => io_error(e),
            })
    }
}
