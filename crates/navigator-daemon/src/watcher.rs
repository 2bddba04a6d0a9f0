//! File watcher with debouncing for vault changes.
//!
//! Uses notify-debouncer-mini for efficient file change detection. The
//! debouncer only reports "something happened at this path"; whether that
//! was a create, modify or delete is decided later against the vault
//! snapshot.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Default debounce period for raw filesystem events.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// File event from the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path relative to vault root, `/`-separated
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File exists after the event (created or modified)
    Changed,
    /// File is gone
    Removed,
}

/// Watches the vault directory and delivers batches of `FileEvent`s.
pub struct FileWatcher {
    vault_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<Vec<FileEvent>>,
}

/// Last seen mtime per relative path, to drop events that changed nothing
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// Vault-relative path for `path`, or `None` if it should be ignored.
///
/// Hidden files and directories (including the `.navigator` cache
/// directory) are ignored.
pub fn vault_relative(path: &Path, vault_path: &Path) -> Option<String> {
    let relative = path.strip_prefix(vault_path).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component.as_os_str().to_str()?;
        if part.starts_with('.') {
            return None;
        }
        parts.push(part);
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

impl FileWatcher {
    pub fn new(vault_path: PathBuf, debounce: Duration) -> Result<Self> {
        // FSEvents on macOS needs the real path (/var -> /private/var)
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let vault_path_clone = vault_path.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            debounce,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let batch: Vec<FileEvent> = events
                        .iter()
                        .filter_map(|event| {
                            Self::process_event(event, &vault_path_clone, &mtime_cache)
                        })
                        .collect();
                    if !batch.is_empty() {
                        // Receiver dropped means the daemon is shutting down
                        let _ = event_tx.send(batch);
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            vault_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    fn process_event(
        event: &DebouncedEvent,
        vault_path: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<FileEvent> {
        let path = &event.path;
        let relative = vault_relative(path, vault_path)?;
        let key = PathBuf::from(&relative);

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        let kind = match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => return None,
            Ok(metadata) => {
                if let Ok(mtime) = metadata.modified() {
                    if cache.get(&key) == Some(&mtime) {
                        // Spurious event, nothing changed
                        return None;
                    }
                    cache.insert(key, mtime);
                }
                FileEventKind::Changed
            }
            Err(_) => {
                cache.remove(&key);
                FileEventKind::Removed
            }
        };

        debug!("File event: {:?} - {}", kind, relative);
        Some(FileEvent {
            path: relative,
            kind,
        })
    }

    /// Receiver for debounced event batches.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<Vec<FileEvent>> {
        &mut self.event_rx
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}
