//! Storage context: the single owner of the engine's shared state.
//!
//! `StorageContext` wires the store, host, registry, metadata queue,
//! settings reactor and vault synchronizer together and exposes the
//! operations a host calls: start, events, settings, tag tree, rebuild,
//! shutdown.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::Subscription;
use crate::host::{HostError, MetadataIndex, VaultHost};
use crate::metadata_queue::MetadataContentQueue;
use crate::providers::{
    ContentProviderRegistry, FeatureImageProvider, MetadataProvider, PreviewProvider,
    ProviderFilter, TagProvider,
};
use crate::record::{ContentType, FileRecord};
use crate::scheduler::CollapsingScheduler;
use crate::settings::{EngineTimings, NavigatorSettings};
use crate::settings_reactor::{SettingsHandler, SettingsReactor};
use crate::store::{PersistedStore, StoreError};
use crate::tag_tree::{TagTree, build_tag_tree};
use crate::vault_sync::{VaultEvent, VaultSynchronizer};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),
}

pub type Result<T> = std::result::Result<T, ContextError>;

/// State shared by every handler. Handlers hold an `Arc` to it and re-check
/// `is_stopped` after every await.
pub struct ContextShared {
    pub(crate) store: Arc<dyn PersistedStore>,
    pub(crate) host: Arc<dyn VaultHost>,
    pub(crate) registry: Arc<ContentProviderRegistry>,
    pub(crate) metadata_queue: MetadataContentQueue,
    pub(crate) timings: EngineTimings,
    settings: Arc<RwLock<NavigatorSettings>>,
    tag_tree: watch::Sender<Arc<TagTree>>,
    ready: watch::Sender<bool>,
    stopped: AtomicBool,
    shut_down: AtomicBool,
    tag_tree_scheduler: CollapsingScheduler,
    content_subscription: Mutex<Option<Subscription>>,
}

impl ContextShared {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn current_settings(&self) -> NavigatorSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    /// Rebuild from a fresh store snapshot and publish it.
    pub(crate) async fn rebuild_tag_tree(&self) -> Result<Arc<TagTree>> {
        let records = self.store.all_files().await?;
        let tree = Arc::new(build_tag_tree(&records, &self.current_settings()));
        debug!(
            "Tag tree rebuilt: {} root(s), {} tagged, {} untagged",
            tree.roots.len(),
            tree.tagged_count,
            tree.untagged_count
        );
        self.tag_tree.send_replace(Arc::clone(&tree));
        Ok(tree)
    }

    fn schedule_tag_tree_rebuild(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        let shared = Arc::downgrade(self);
        self.tag_tree_scheduler
            .schedule(self.timings.tag_tree_debounce, async move {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if shared.is_stopped() {
                    return;
                }
                if let Err(e) = shared.rebuild_tag_tree().await {
                    warn!("Failed to rebuild tag tree: {}", e);
                }
            });
    }

    /// Cancel everything that is queued, scheduled or waiting.
    fn halt_background_work(&self) {
        self.registry.stop_all_processing();
        self.tag_tree_scheduler.cancel();
        self.metadata_queue.dispose_all();
    }
}

#[async_trait]
impl SettingsHandler for ContextShared {
    async fn handle_settings_change(&self, old: &NavigatorSettings, new: &NavigatorSettings) {
        if self.is_stopped() {
            return;
        }

        let affected = self.registry.handle_settings_change(old, new);

        let disabled: Vec<ContentType> = ContentType::ALL
            .into_iter()
            .filter(|kind| kind.is_metadata_dependent() && old.is_enabled(*kind) && !new.is_enabled(*kind))
            .collect();
        if !disabled.is_empty() {
            self.metadata_queue.cancel_types(&disabled);
        }

        // Cached metadata carries the hidden flag, so it must not outlive
        // the provider that keeps it current.
        if disabled.contains(&ContentType::Metadata) {
            if let Err(e) = self.store.clear_content(ContentType::Metadata).await {
                warn!("Failed to clear stale metadata: {}", e);
            }
            if self.is_stopped() {
                return;
            }
        }

        if !affected.is_empty() {
            info!("Regenerating content for {:?}", affected);
            for kind in &affected {
                if let Err(e) = self.store.clear_content(*kind).await {
                    warn!("Failed to clear {} content: {}", kind, e);
                }
                if self.is_stopped() {
                    return;
                }
            }

            let live = self.host.indexable_files();
            let (dependent, direct): (Vec<ContentType>, Vec<ContentType>) = affected
                .iter()
                .copied()
                .partition(|kind| kind.is_metadata_dependent());

            if !direct.is_empty() {
                self.registry
                    .queue_files_for_all_providers(&live, new, &ProviderFilter::only(&direct));
            }
            if !dependent.is_empty() {
                if let Err(e) = self
                    .metadata_queue
                    .queue_metadata_content_when_ready(&live, Some(&dependent), Some(new.clone()))
                    .await
                {
                    warn!("Failed to queue metadata content: {}", e);
                }
            }
        }

        if self.is_stopped() {
            return;
        }
        if new.tag_visibility_changed(old) {
            if let Err(e) = self.rebuild_tag_tree().await {
                warn!("Failed to rebuild tag tree after settings change: {}", e);
            }
        }
    }
}

/// Entry point for hosts.
pub struct StorageContext {
    shared: Arc<ContextShared>,
    sync: VaultSynchronizer,
    reactor: SettingsReactor,
}

impl StorageContext {
    /// Build a context with the built-in providers registered.
    pub fn new(
        store: Arc<dyn PersistedStore>,
        host: Arc<dyn VaultHost>,
        index: Arc<dyn MetadataIndex>,
        settings: NavigatorSettings,
        timings: EngineTimings,
    ) -> Self {
        let registry = Arc::new(ContentProviderRegistry::new(
            Arc::clone(&store),
            timings.batch_size,
        ));
        registry.register_provider(Arc::new(PreviewProvider::new(Arc::clone(&host))));
        registry.register_provider(Arc::new(TagProvider::new(Arc::clone(&index))));
        registry.register_provider(Arc::new(MetadataProvider::new(Arc::clone(&index))));
        registry.register_provider(Arc::new(FeatureImageProvider::new(Arc::clone(&index))));

        let shared_settings = Arc::new(RwLock::new(settings.clone()));
        let metadata_queue = MetadataContentQueue::new(
            Arc::clone(&store),
            index,
            Arc::clone(&registry),
            Arc::clone(&shared_settings),
            timings.metadata_diagnostic_delay,
        );

        let shared = Arc::new(ContextShared {
            store,
            host,
            registry,
            metadata_queue,
            settings: shared_settings,
            tag_tree: watch::Sender::new(Arc::new(TagTree::empty())),
            ready: watch::Sender::new(false),
            stopped: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            tag_tree_scheduler: CollapsingScheduler::new(),
            content_subscription: Mutex::new(None),
            timings: timings.clone(),
        });

        let reactor = SettingsReactor::new(
            settings,
            timings.settings_debounce,
            Arc::clone(&shared) as Arc<dyn SettingsHandler>,
        );
        let sync = VaultSynchronizer::new(Arc::clone(&shared));

        Self {
            shared,
            sync,
            reactor,
        }
    }

    /// Subscribe to store changes and run the initial load.
    pub async fn start(&self) -> Result<()> {
        let weak: Weak<ContextShared> = Arc::downgrade(&self.shared);
        let subscription = self.shared.store.on_content_change(Box::new(move |change| {
            if change.tags_changed || change.kinds.contains(&ContentType::Metadata) {
                if let Some(shared) = weak.upgrade() {
                    shared.schedule_tag_tree_rebuild();
                }
            }
        }));
        *self
            .shared
            .content_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(subscription);

        self.sync.initial_load().await
    }

    pub fn handle_vault_event(&self, event: VaultEvent) {
        self.sync.handle_event(event);
    }

    /// Accept a new settings snapshot. It becomes current immediately; the
    /// content reaction is debounced.
    ///
    /// Only `shutdown` discards snapshots. One that arrives during
    /// `rebuild_cache` is kept and reacted to once the rebuild is over.
    pub fn update_settings(&self, settings: NavigatorSettings) {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return;
        }
        *self
            .shared
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner()) = settings.clone();
        self.reactor.on_settings_changed(settings);
    }

    pub async fn rebuild_tag_tree(&self) -> Result<Arc<TagTree>> {
        self.shared.rebuild_tag_tree().await
    }

    /// Throw the cache away and load it again from the vault.
    ///
    /// The stopped flag is restored to its value before the call whether or
    /// not the rebuild succeeds; errors are returned to the caller.
    pub async fn rebuild_cache(&self) -> Result<()> {
        let was_stopped = self.shared.stopped.swap(true, Ordering::SeqCst);
        info!("Rebuilding navigator cache");

        self.shared.halt_background_work();
        self.sync.cancel_pending();
        self.reactor.reset();
        self.reactor.set_baseline(self.shared.current_settings());

        let cleared = self.shared.store.clear_database().await;
        self.shared.tag_tree.send_replace(Arc::new(TagTree::empty()));
        self.shared.set_ready(false);
        self.restore_stopped(was_stopped);

        if let Err(e) = cleared {
            warn!("Cache rebuild failed while clearing the store: {}", e);
            return Err(e.into());
        }

        let result = self.sync.initial_load().await;
        self.restore_stopped(was_stopped);
        match &result {
            Ok(()) => info!("Navigator cache rebuilt"),
            Err(e) => warn!("Cache rebuild failed: {}", e),
        }
        result
    }

    /// A shutdown that landed mid-rebuild wins over the saved flag.
    fn restore_stopped(&self, was_stopped: bool) {
        let stopped = was_stopped || self.shared.shut_down.load(Ordering::SeqCst);
        self.shared.stopped.store(stopped, Ordering::SeqCst);
    }

    /// Stop all handlers and release every subscription. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stopped.store(true, Ordering::SeqCst);
        info!("Shutting down storage context");
        self.shared.halt_background_work();
        self.sync.cancel_pending();
        self.reactor.reset();
        if let Some(mut subscription) = self
            .shared
            .content_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            subscription.dispose();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    pub fn tag_tree(&self) -> Arc<TagTree> {
        Arc::clone(&self.shared.tag_tree.borrow())
    }

    pub fn subscribe_tag_tree(&self) -> watch::Receiver<Arc<TagTree>> {
        self.shared.tag_tree.subscribe()
    }

    pub fn is_storage_ready(&self) -> bool {
        *self.shared.ready.borrow()
    }

    pub async fn wait_until_ready(&self) {
        let mut ready = self.shared.ready.subscribe();
        // The sender lives as long as `self`, so this cannot close early
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Resolve once no provider has queued work left.
    pub async fn wait_until_idle(&self) {
        self.shared.registry.wait_until_idle().await;
    }

    pub fn settings(&self) -> NavigatorSettings {
        self.shared.current_settings()
    }

    pub fn store(&self) -> &Arc<dyn PersistedStore> {
        &self.shared.store
    }

    pub fn registry(&self) -> &Arc<ContentProviderRegistry> {
        &self.shared.registry
    }

    pub fn metadata_queue(&self) -> &MetadataContentQueue {
        &self.shared.metadata_queue
    }

    pub fn synchronizer(&self) -> &VaultSynchronizer {
        &self.sync
    }

    pub async fn record(&self, path: &str) -> Result<Option<FileRecord>> {
        Ok(self.shared.store.get_file(path).await?)
    }
}

impl Drop for StorageContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CachedMetadata, InMemoryMetadataIndex, InMemoryVault, VaultFile};
    use crate::providers::testing::CountingProvider;
    use crate::record::{ContentUpdate, ContentValue, FileMetadata};
    use crate::store::{ContentChange, InMemoryStore};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Harness {
        vault: Arc<InMemoryVault>,
        index: Arc<InMemoryMetadataIndex>,
        ctx: StorageContext,
    }

    fn harness_with(store: Arc<dyn PersistedStore>, settings: NavigatorSettings) -> Harness {
        let vault = Arc::new(InMemoryVault::new());
        let index = Arc::new(InMemoryMetadataIndex::new());
        let ctx = StorageContext::new(
            store,
            vault.clone(),
            index.clone(),
            settings,
            EngineTimings::default(),
        );
        Harness { vault, index, ctx }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(InMemoryStore::new()), NavigatorSettings::default())
    }

    impl Harness {
        /// Write a note and let the index parse it.
        fn note(&self, path: &str, mtime: u64, content: &str) -> VaultFile {
            self.index.insert(path, CachedMetadata::from_markdown(content));
            self.vault.put(path, mtime, content)
        }

        async fn settle(&self) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.ctx.wait_until_idle().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        async fn record(&self, path: &str) -> Option<FileRecord> {
            self.ctx.record(path).await.unwrap()
        }
    }

    /// Store double whose `clear_database` can be made slow or failing.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryStore,
        fail_clear: AtomicBool,
        clear_delay: Duration,
        clears: AtomicUsize,
    }

    #[async_trait]
    impl PersistedStore for FlakyStore {
        async fn get_file(&self, path: &str) -> crate::store::Result<Option<FileRecord>> {
            self.inner.get_file(path).await
        }

        async fn get_files(&self, paths: &[String]) -> crate::store::Result<HashMap<String, FileRecord>> {
            self.inner.get_files(paths).await
        }

        async fn all_files(&self) -> crate::store::Result<HashMap<String, FileRecord>> {
            self.inner.all_files().await
        }

        async fn record_changes(
            &self,
            files: &[VaultFile],
            previous: &HashMap<String, FileRecord>,
            rename_carryover: &HashMap<String, FileRecord>,
        ) -> crate::store::Result<()> {
            self.inner.record_changes(files, previous, rename_carryover).await
        }

        async fn update_content(&self, updates: Vec<ContentUpdate>) -> crate::store::Result<usize> {
            self.inner.update_content(updates).await
        }

        async fn clear_content(&self, kind: ContentType) -> crate::store::Result<()> {
            self.inner.clear_content(kind).await
        }

        async fn remove_files(&self, paths: &[String]) -> crate::store::Result<()> {
            self.inner.remove_files(paths).await
        }

        async fn clear_database(&self) -> crate::store::Result<()> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            if !self.clear_delay.is_zero() {
                tokio::time::sleep(self.clear_delay).await;
            }
            if self.fail_clear.load(Ordering::SeqCst) {
                return Err(StoreError::Io("disk full".into()));
            }
            self.inner.clear_database().await
        }

        fn on_content_change(&self, callback: Box<dyn Fn(&ContentChange) + Send + Sync>) -> Subscription {
            self.inner.on_content_change(callback)
        }

        async fn files_needing_content(&self, kind: ContentType) -> crate::store::Result<HashSet<String>> {
            self.inner.files_needing_content(kind).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_load_records_and_generates() {
        let h = harness();
        h.vault.put("a.md", 1, "#alpha first note");
        h.vault.put("b.md", 2, "plain");

        h.ctx.start().await.unwrap();
        assert!(h.ctx.is_storage_ready());
        let a = h.record("a.md").await.unwrap();
        assert_eq!(a.mtime, 1);
        assert!(h.record("b.md").await.is_some());

        // Tags wait for the index
        h.settle().await;
        assert!(h.ctx.metadata_queue().is_pending("a.md"));
        assert!(h.ctx.tag_tree().find("alpha").is_none());
        assert_eq!(
            h.record("a.md").await.unwrap().preview.as_deref(),
            Some("#alpha first note")
        );

        h.index.insert("a.md", CachedMetadata::from_markdown("#alpha first note"));
        h.index.insert("b.md", CachedMetadata::from_markdown("plain"));
        h.index.resolve();
        h.settle().await;

        assert!(!h.ctx.metadata_queue().is_pending("a.md"));
        assert_eq!(h.record("a.md").await.unwrap().tags, Some(vec!["alpha".to_string()]));
        let tree = h.ctx.tag_tree();
        assert_eq!(tree.find("alpha").unwrap().note_count, 1);
        assert_eq!(tree.untagged_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_is_observable_before_metadata_resolves() {
        let h = harness();
        h.vault.put("a.md", 1, "#x");
        let mut tree_rx = h.ctx.subscribe_tag_tree();

        h.ctx.start().await.unwrap();
        h.ctx.wait_until_ready().await;

        assert!(h.ctx.metadata_queue().is_pending("a.md"));
        assert!(tree_rx.has_changed().unwrap());
        assert!(tree_rx.borrow_and_update().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_mtime_change_is_picked_up_by_sync_pass() {
        let h = harness();
        h.note("a.md", 1, "one");
        h.ctx.start().await.unwrap();
        h.settle().await;

        h.note("a.md", 5, "two #new");
        h.ctx.synchronizer().sync_with_vault().await.unwrap();
        h.settle().await;

        let a = h.record("a.md").await.unwrap();
        assert_eq!(a.mtime, 5);
        assert_eq!(a.tags, Some(vec!["new".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_structural_events_are_debounced() {
        let h = harness();
        h.ctx.start().await.unwrap();

        for name in ["a.md", "b.md", "c.md"] {
            let file = h.note(name, 1, "x");
            h.ctx.handle_vault_event(VaultEvent::Create(file));
        }
        assert!(h.ctx.synchronizer().has_scheduled_sync());
        assert!(h.record("a.md").await.is_none());

        h.settle().await;
        for name in ["a.md", "b.md", "c.md"] {
            assert!(h.record(name).await.is_some());
        }

        h.vault.remove("b.md");
        h.ctx.handle_vault_event(VaultEvent::Delete("b.md".into()));
        h.settle().await;
        assert!(h.record("b.md").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_markdown_modify_skips_debounce() {
        let h = harness();
        h.note("a.md", 1, "#old");
        h.ctx.start().await.unwrap();
        h.settle().await;

        let file = h.note("a.md", 2, "#new");
        h.ctx.handle_vault_event(VaultEvent::Modify(file));
        assert!(!h.ctx.synchronizer().has_scheduled_sync());

        tokio::time::sleep(Duration::from_millis(10)).await;
        h.ctx.wait_until_idle().await;
        let a = h.record("a.md").await.unwrap();
        assert_eq!(a.mtime, 2);
        assert_eq!(a.tags, Some(vec!["new".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_carries_metadata_forward() {
        let h = harness();
        h.note("a.md", 1, "#keep body");
        h.ctx.start().await.unwrap();
        h.settle().await;

        h.ctx
            .store()
            .update_content(vec![ContentUpdate {
                path: "a.md".into(),
                mtime: 1,
                value: ContentValue::Metadata {
                    metadata: FileMetadata {
                        icon: Some("star".into()),
                        ..Default::default()
                    },
                    custom_property: None,
                },
            }])
            .await
            .unwrap();

        let moved = h.vault.rename("a.md", "b.md").unwrap();
        h.ctx.handle_vault_event(VaultEvent::Rename {
            old_path: "a.md".into(),
            file: moved,
        });
        h.settle().await;

        assert!(h.record("a.md").await.is_none());
        let b = h.record("b.md").await.unwrap();
        assert_eq!(b.metadata.and_then(|m| m.icon).as_deref(), Some("star"));
        assert_eq!(b.tags, Some(vec!["keep".to_string()]));
        assert!(h.ctx.tag_tree().find("keep").unwrap().notes.contains("b.md"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_while_waiting_leaves_no_orphan() {
        let h = harness();
        h.vault.put("a.md", 1, "#late");
        h.ctx.start().await.unwrap();
        h.settle().await;
        assert!(h.ctx.metadata_queue().is_pending("a.md"));

        let moved = h.vault.rename("a.md", "b.md").unwrap();
        h.ctx.handle_vault_event(VaultEvent::Rename {
            old_path: "a.md".into(),
            file: moved,
        });
        h.settle().await;

        assert!(!h.ctx.metadata_queue().is_pending("a.md"));
        assert!(h.ctx.metadata_queue().is_pending("b.md"));

        h.index.publish("b.md", CachedMetadata::from_markdown("#late"));
        h.settle().await;
        assert_eq!(h.ctx.metadata_queue().pending_count(), 0);
        assert_eq!(h.record("b.md").await.unwrap().tags, Some(vec!["late".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_show_tags_toggle_regenerates_only_tags() {
        let settings = NavigatorSettings {
            show_tags: false,
            ..Default::default()
        };
        let h = harness_with(Arc::new(InMemoryStore::new()), settings.clone());
        let preview = Arc::new(CountingProvider::new(ContentType::Preview));
        let tags = Arc::new(CountingProvider::new(ContentType::Tags));
        h.ctx.registry().register_provider(preview.clone());
        h.ctx.registry().register_provider(tags.clone());

        h.note("a.md", 1, "#t");
        h.ctx.start().await.unwrap();
        h.settle().await;
        assert_eq!(preview.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tags.calls.load(Ordering::SeqCst), 0);

        let on = NavigatorSettings {
            show_tags: true,
            ..settings.clone()
        };
        h.ctx.update_settings(on.clone());
        h.ctx.update_settings(settings.clone());
        h.ctx.update_settings(on);
        h.settle().await;

        assert_eq!(tags.calls.load(Ordering::SeqCst), 1);
        assert_eq!(preview.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_change_rebuilds_tree() {
        let h = harness();
        h.note("a.md", 1, "#work/secret #home");
        h.ctx.start().await.unwrap();
        h.settle().await;
        assert!(h.ctx.tag_tree().find("work/secret").is_some());

        h.ctx.update_settings(NavigatorSettings {
            hidden_tags: vec!["work".into()],
            ..Default::default()
        });
        h.settle().await;

        let tree = h.ctx.tag_tree();
        assert!(tree.find("work").is_none());
        assert!(tree.find("home").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_excluded_properties_unhides_notes() {
        let settings = NavigatorSettings {
            excluded_file_properties: vec!["private".into()],
            ..Default::default()
        };
        let h = harness_with(Arc::new(InMemoryStore::new()), settings);
        h.note("a.md", 1, "---\nprivate: true\n---\n#secret");
        h.ctx.start().await.unwrap();
        h.settle().await;
        assert!(h.record("a.md").await.unwrap().is_hidden());
        assert!(h.ctx.tag_tree().find("secret").is_none());

        // Metadata generation switches off entirely with these defaults
        h.ctx.update_settings(NavigatorSettings::default());
        h.settle().await;

        let a = h.record("a.md").await.unwrap();
        assert!(!a.is_hidden());
        assert_eq!(a.tags, Some(vec!["secret".to_string()]));
        assert_eq!(h.ctx.tag_tree().find("secret").unwrap().note_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_cache_reloads_everything() {
        let h = harness();
        h.note("a.md", 1, "#x");
        h.ctx.start().await.unwrap();
        h.settle().await;

        h.ctx
            .store()
            .remove_files(&["a.md".to_string()])
            .await
            .unwrap();
        h.ctx.rebuild_cache().await.unwrap();
        assert!(h.ctx.is_storage_ready());
        assert!(!h.ctx.is_stopped());

        h.settle().await;
        assert_eq!(h.record("a.md").await.unwrap().tags, Some(vec!["x".to_string()]));
        assert!(h.ctx.tag_tree().find("x").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_failure_restores_stopped_flag() {
        let store = Arc::new(FlakyStore::default());
        let h = harness_with(store.clone(), NavigatorSettings::default());
        h.note("a.md", 1, "#x");
        h.ctx.start().await.unwrap();

        store.fail_clear.store(true, Ordering::SeqCst);
        let result = h.ctx.rebuild_cache().await;
        assert!(matches!(result, Err(ContextError::Store(StoreError::Io(_)))));
        assert!(!h.ctx.is_stopped());
        assert_eq!(store.clears.load(Ordering::SeqCst), 1);

        h.ctx.shutdown();
        let result = h.ctx.rebuild_cache().await;
        assert!(result.is_err());
        assert!(h.ctx.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_edit_during_rebuild_is_kept() {
        let store = Arc::new(FlakyStore {
            clear_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let h = harness_with(store.clone(), NavigatorSettings::default());
        h.note("a.md", 1, "#x #y");
        h.ctx.start().await.unwrap();
        h.settle().await;

        let edited = NavigatorSettings {
            hidden_tags: vec!["x".into()],
            ..Default::default()
        };
        let (rebuilt, ()) = tokio::join!(h.ctx.rebuild_cache(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.ctx.update_settings(edited.clone());
        });
        rebuilt.unwrap();
        h.settle().await;

        assert_eq!(h.ctx.settings(), edited);
        let tree = h.ctx.tag_tree();
        assert!(tree.find("x").is_none());
        assert!(tree.find("y").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_rebuild_stays_stopped() {
        let store = Arc::new(FlakyStore {
            clear_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let h = harness_with(store.clone(), NavigatorSettings::default());
        h.note("a.md", 1, "#x");
        h.ctx.start().await.unwrap();

        let (rebuilt, ()) = tokio::join!(h.ctx.rebuild_cache(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.ctx.shutdown();
        });
        let _ = rebuilt;
        assert!(h.ctx.is_stopped());

        h.ctx.update_settings(NavigatorSettings {
            show_tags: false,
            ..Default::default()
        });
        assert!(h.ctx.settings().show_tags);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent_and_gates_handlers() {
        let h = harness();
        h.note("a.md", 1, "x");
        h.ctx.start().await.unwrap();
        h.settle().await;

        let file = h.note("b.md", 1, "x");
        h.ctx.handle_vault_event(VaultEvent::Create(file));
        h.ctx.shutdown();
        h.ctx.shutdown();

        let file = h.note("c.md", 1, "x");
        h.ctx.handle_vault_event(VaultEvent::Modify(file));
        h.settle().await;

        assert!(h.record("b.md").await.is_none());
        assert!(h.record("c.md").await.is_none());
        assert!(h.ctx.registry().is_idle());
    }
}
