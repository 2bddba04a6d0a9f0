//! Vault-event synchronizer.
//!
//! Turns host file events into store mutations and content work. Structural
//! events (create, delete, rename, non-Markdown modify) are coalesced into one
//! debounced diff pass. A Markdown modify takes its own immediate path so
//! edits show up without waiting for the debounce window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::context::{ContextShared, Result};
use crate::diff::calculate_file_diff;
use crate::host::VaultFile;
use crate::providers::ProviderFilter;
use crate::record::{ContentType, FileRecord};
use crate::scheduler::CollapsingScheduler;

/// File-system notification from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum VaultEvent {
    Create(VaultFile),
    Delete(String),
    Rename { old_path: String, file: VaultFile },
    Modify(VaultFile),
}

impl VaultEvent {
    pub fn path(&self) -> &str {
        match self {
            VaultEvent::Create(file) | VaultEvent::Modify(file) => &file.path,
            VaultEvent::Rename { file, .. } => &file.path,
            VaultEvent::Delete(path) => path,
        }
    }
}

struct SyncInner {
    shared: Arc<ContextShared>,
    scheduler: CollapsingScheduler,
    /// Old records captured at rename time, keyed by the new path
    pending_renames: Mutex<HashMap<String, FileRecord>>,
}

/// Cheap to clone; clones share the same debounce slot and rename buffer.
#[derive(Clone)]
pub struct VaultSynchronizer {
    inner: Arc<SyncInner>,
}

fn metadata_types() -> Vec<ContentType> {
    ContentType::ALL
        .into_iter()
        .filter(|kind| kind.is_metadata_dependent())
        .collect()
}

impl VaultSynchronizer {
    pub fn new(shared: Arc<ContextShared>) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                shared,
                scheduler: CollapsingScheduler::new(),
                pending_renames: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Cold-boot load: diff, apply, publish the tag tree, mark storage ready,
    /// then queue content. Metadata-dependent content is requested last, after
    /// storage is already usable.
    pub async fn initial_load(&self) -> Result<()> {
        let shared = &self.inner.shared;
        if shared.is_stopped() {
            return Ok(());
        }

        let live = shared.host.indexable_files();
        let cached = shared.store.all_files().await?;
        let diff = calculate_file_diff(&live, cached);
        if shared.is_stopped() {
            return Ok(());
        }

        info!(
            "Initial load: {} to add, {} to update, {} to remove",
            diff.to_add.len(),
            diff.to_update.len(),
            diff.to_remove.len()
        );

        if !diff.to_remove.is_empty() {
            shared.store.remove_files(&diff.to_remove).await?;
        }
        let changed = diff.changed_files();
        if !changed.is_empty() {
            shared
                .store
                .record_changes(&changed, &diff.cached_files, &HashMap::new())
                .await?;
        }
        if shared.is_stopped() {
            return Ok(());
        }

        shared.rebuild_tag_tree().await?;
        shared.set_ready(true);
        if shared.is_stopped() {
            return Ok(());
        }

        let settings = shared.current_settings();
        shared.registry.queue_files_for_all_providers(
            &live,
            &settings,
            &ProviderFilter::excluding(&metadata_types()),
        );
        shared
            .metadata_queue
            .queue_metadata_content_when_ready(&live, None, None)
            .await?;
        Ok(())
    }

    /// Route one host event. Never blocks; the work runs on spawned tasks.
    pub fn handle_event(&self, event: VaultEvent) {
        if self.inner.shared.is_stopped() {
            return;
        }
        debug!("Vault event: {:?}", event);

        match event {
            VaultEvent::Modify(file) if file.is_markdown() => {
                let sync = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = sync.refresh_modified(file).await {
                        error!("Failed to refresh modified file: {}", e);
                    }
                });
            }
            VaultEvent::Rename { old_path, file } => {
                let sync = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = sync.capture_rename(&old_path, &file).await {
                        error!("Failed to capture rename of {}: {}", old_path, e);
                    }
                    sync.schedule_sync();
                });
            }
            VaultEvent::Delete(path) => {
                self.inner.shared.metadata_queue.forget_path(&path);
                self.schedule_sync();
            }
            VaultEvent::Create(_) | VaultEvent::Modify(_) => self.schedule_sync(),
        }
    }

    /// Coalesce into one diff pass after the vault debounce window.
    pub fn schedule_sync(&self) {
        if self.inner.shared.is_stopped() {
            return;
        }
        let sync = self.clone();
        self.inner
            .scheduler
            .schedule(self.inner.shared.timings.vault_debounce, async move {
                if let Err(e) = sync.sync_with_vault().await {
                    error!("Vault sync pass failed: {}", e);
                }
            });
    }

    /// Drop a not-yet-fired diff pass and any buffered rename records.
    pub fn cancel_pending(&self) {
        self.inner.scheduler.cancel();
        self.inner
            .pending_renames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn has_scheduled_sync(&self) -> bool {
        self.inner.scheduler.is_scheduled()
    }

    async fn capture_rename(&self, old_path: &str, file: &VaultFile) -> Result<()> {
        let shared = &self.inner.shared;
        shared.metadata_queue.forget_path(old_path);
        if shared.is_stopped() {
            return Ok(());
        }

        if let Some(record) = shared.store.get_file(old_path).await? {
            debug!("Carrying {} forward to {}", old_path, file.path);
            self.inner
                .pending_renames
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(file.path.clone(), record);
        }
        Ok(())
    }

    /// One debounced pass: diff against the live vault and apply it.
    pub async fn sync_with_vault(&self) -> Result<()> {
        let shared = &self.inner.shared;
        if shared.is_stopped() {
            return Ok(());
        }

        let live = shared.host.indexable_files();
        let cached = shared.store.all_files().await?;
        let diff = calculate_file_diff(&live, cached);
        let carryover: HashMap<String, FileRecord> = std::mem::take(
            &mut *self
                .inner
                .pending_renames
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        if diff.is_empty() || shared.is_stopped() {
            return Ok(());
        }

        debug!(
            "Sync pass: {} added, {} updated, {} removed",
            diff.to_add.len(),
            diff.to_update.len(),
            diff.to_remove.len()
        );

        if !diff.to_remove.is_empty() {
            for path in &diff.to_remove {
                shared.metadata_queue.forget_path(path);
            }
            shared.store.remove_files(&diff.to_remove).await?;
        }
        let changed = diff.changed_files();
        if !changed.is_empty() {
            shared
                .store
                .record_changes(&changed, &diff.cached_files, &carryover)
                .await?;
        }
        if shared.is_stopped() {
            return Ok(());
        }

        shared.rebuild_tag_tree().await?;
        self.queue_content(&changed).await
    }

    /// Immediate path for an edited Markdown note.
    async fn refresh_modified(&self, file: VaultFile) -> Result<()> {
        let shared = &self.inner.shared;
        if shared.is_stopped() {
            return Ok(());
        }

        let previous = shared.store.get_files(std::slice::from_ref(&file.path)).await?;
        if previous.get(&file.path).is_some_and(|r| r.mtime == file.mtime) {
            return Ok(());
        }
        if shared.is_stopped() {
            return Ok(());
        }

        let files = [file];
        shared
            .store
            .record_changes(&files, &previous, &HashMap::new())
            .await?;
        if shared.is_stopped() {
            return Ok(());
        }
        self.queue_content(&files).await
    }

    async fn queue_content(&self, files: &[VaultFile]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let shared = &self.inner.shared;
        let settings = shared.current_settings();
        shared.registry.queue_files_for_all_providers(
            files,
            &settings,
            &ProviderFilter::excluding(&metadata_types()),
        );
        shared
            .metadata_queue
            .queue_metadata_content_when_ready(files, None, None)
            .await?;
        Ok(())
    }
}
