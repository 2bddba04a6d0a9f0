//! Daemon state: wires the native vault, metadata index and JSON store into
//! a `StorageContext` and feeds it filesystem batches.

use anyhow::Result;
use navigator_core::host::VaultHost;
use navigator_core::store::PersistedStore;
use navigator_core::{MetadataIndex, StorageContext, TagTree, VaultEvent};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::json_store::JsonStore;
use crate::metadata_index::NativeMetadataIndex;
use crate::native_vault::NativeVault;
use crate::watcher::FileEvent;

/// Poll interval while waiting for background work to drain.
const SETTLE_POLL: Duration = Duration::from_millis(25);

pub struct Daemon {
    config: DaemonConfig,
    vault: Arc<NativeVault>,
    index: Arc<NativeMetadataIndex>,
    context: StorageContext,
    settings_mtime: Option<SystemTime>,
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl Daemon {
    /// Scan the vault and open the cache. Nothing is generated until `start`.
    pub async fn open(config: DaemonConfig) -> Result<Self> {
        let vault = Arc::new(NativeVault::new(config.vault_path.clone()));
        let count = vault.scan().await?;
        info!("Found {} file(s) in {}", count, config.vault_name);

        let store = Arc::new(JsonStore::open(JsonStore::cache_path(&config.vault_path)).await);
        let index = Arc::new(NativeMetadataIndex::new(
            Arc::clone(&vault) as Arc<dyn VaultHost>
        ));

        let context = StorageContext::new(
            store as Arc<dyn PersistedStore>,
            Arc::clone(&vault) as Arc<dyn VaultHost>,
            Arc::clone(&index) as Arc<dyn MetadataIndex>,
            config.settings.clone(),
            config.timings.clone(),
        );

        let settings_mtime = config.settings_path.as_deref().and_then(file_mtime);
        Ok(Self {
            config,
            vault,
            index,
            context,
            settings_mtime,
        })
    }

    /// Run the initial load (or a full rebuild), then index metadata so that
    /// waiting content can be generated.
    pub async fn start(&self, rebuild: bool) -> Result<()> {
        self.context.start().await?;
        if rebuild {
            self.context.rebuild_cache().await?;
        }
        info!("Storage ready");

        let indexed = self.index.index_all().await;
        info!("Indexed metadata for {} note(s)", indexed);
        Ok(())
    }

    /// Resolve once no content is queued or waiting and the tag tree
    /// reflects the store.
    pub async fn settle(&self) -> Result<Arc<TagTree>> {
        loop {
            self.context.wait_until_idle().await;
            if self.context.metadata_queue().pending_count() == 0
                && !self.context.synchronizer().has_scheduled_sync()
                && self.context.registry().is_idle()
            {
                break;
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
        Ok(self.context.rebuild_tag_tree().await?)
    }

    /// Apply one watcher batch: update the snapshot and the metadata index,
    /// then hand the resulting events to the engine.
    pub async fn apply_fs_batch(&self, batch: &[FileEvent]) -> Vec<VaultEvent> {
        let events = self.vault.apply_fs_events(batch).await;
        for event in &events {
            match event {
                VaultEvent::Create(file) | VaultEvent::Modify(file) => {
                    if file.is_markdown() {
                        self.index.reindex(&file.path).await;
                    }
                }
                VaultEvent::Rename { old_path, file } => {
                    self.index.remove(old_path);
                    if file.is_markdown() {
                        self.index.reindex(&file.path).await;
                    }
                }
                VaultEvent::Delete(path) => self.index.remove(path),
            }
            debug!("Vault event: {:?}", event);
            self.context.handle_vault_event(event.clone());
        }
        events
    }

    /// Re-read the settings file if it changed on disk. Returns true when
    /// new settings were handed to the engine.
    pub fn reload_settings_if_changed(&mut self) -> bool {
        let Some(path) = self.config.settings_path.clone() else {
            return false;
        };
        let mtime = file_mtime(&path);
        if mtime == self.settings_mtime {
            return false;
        }
        self.settings_mtime = mtime;

        match self.config.reload_settings() {
            Some(Ok(settings)) => {
                if settings == self.context.settings() {
                    return false;
                }
                info!("Settings changed on disk, applying");
                self.context.update_settings(settings);
                true
            }
            Some(Err(e)) => {
                warn!("Keeping previous settings: {}", e);
                false
            }
            None => false,
        }
    }

    pub fn context(&self) -> &StorageContext {
        &self.context
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn shutdown(&self) {
        self.context.shutdown();
    }
}
