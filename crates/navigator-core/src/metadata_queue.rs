//! Metadata-cache queue: defers metadata-dependent content until the host's
//! index has parsed a file.
//!
//! Per path the flow is:
//!
//! ```text
//! request ──check──> ready ───────────────────────────> registry
//!            │
//!            └─────> waiting ──resolved/changed──> ready ──> registry
//!                       │
//!                       └──(diagnostic delay)──> warn!, keep waiting
//! ```
//!
//! A path is pending in at most one wait. Waits own their index
//! subscriptions and diagnostic timer; dropping a wait releases both.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::Subscription;
use crate::host::{MetadataIndex, VaultFile};
use crate::providers::{ContentProviderRegistry, ProviderFilter};
use crate::record::ContentType;
use crate::settings::NavigatorSettings;
use crate::store::{self, PersistedStore};

/// Most unresolved paths listed in one diagnostic.
const DIAGNOSTIC_PATH_LIMIT: usize = 20;

struct PendingEntry {
    file: VaultFile,
    types: BTreeSet<ContentType>,
    settings: NavigatorSettings,
    wait_id: u64,
}

struct Wait {
    paths: HashSet<String>,
    _subscriptions: Vec<Subscription>,
    timer: Option<JoinHandle<()>>,
}

impl Drop for Wait {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<String, PendingEntry>,
    waits: HashMap<u64, Wait>,
    next_wait_id: u64,
}

struct QueueInner {
    store: Arc<dyn PersistedStore>,
    index: Arc<dyn MetadataIndex>,
    registry: Arc<ContentProviderRegistry>,
    settings: Arc<RwLock<NavigatorSettings>>,
    diagnostic_delay: Duration,
    state: Mutex<QueueState>,
}

/// Bridges "file changed" to "file is safe to parse".
pub struct MetadataContentQueue {
    inner: Arc<QueueInner>,
}

impl MetadataContentQueue {
    pub fn new(
        store: Arc<dyn PersistedStore>,
        index: Arc<dyn MetadataIndex>,
        registry: Arc<ContentProviderRegistry>,
        settings: Arc<RwLock<NavigatorSettings>>,
        diagnostic_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                index,
                registry,
                settings,
                diagnostic_delay,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Queue metadata-dependent content for `files` once the index has them.
    ///
    /// `types` defaults to every enabled metadata-dependent kind;
    /// `settings_override` replaces the current settings for this request.
    pub async fn queue_metadata_content_when_ready(
        &self,
        files: &[VaultFile],
        types: Option<&[ContentType]>,
        settings_override: Option<NavigatorSettings>,
    ) -> store::Result<()> {
        let settings = match settings_override {
            Some(settings) => settings,
            None => self
                .inner
                .settings
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        };

        let requested: BTreeSet<ContentType> = match types {
            Some(types) => types.iter().copied().collect(),
            None => settings.metadata_dependent_types().into_iter().collect(),
        };
        let requested: BTreeSet<ContentType> = requested
            .into_iter()
            .filter(|kind| kind.is_metadata_dependent() && settings.is_enabled(*kind))
            .collect();
        if requested.is_empty() || files.is_empty() {
            return Ok(());
        }

        // Dedupe by path, last occurrence wins
        let mut unique: HashMap<&str, &VaultFile> = HashMap::new();
        for file in files.iter().filter(|f| f.is_markdown()) {
            unique.insert(file.path.as_str(), file);
        }
        if unique.is_empty() {
            return Ok(());
        }

        let paths: Vec<String> = unique.keys().map(|p| p.to_string()).collect();
        let records = self.inner.store.get_files(&paths).await?;

        let mut candidates: Vec<(VaultFile, BTreeSet<ContentType>)> = Vec::new();
        for path in &paths {
            let file = unique[path.as_str()];
            let Some(record) = records.get(path) else {
                continue;
            };
            if record.mtime != file.mtime {
                continue;
            }
            let needed: BTreeSet<ContentType> = requested
                .iter()
                .copied()
                .filter(|kind| record.needs(*kind))
                .collect();
            if !needed.is_empty() {
                candidates.push((file.clone(), needed));
            }
        }
        candidates.sort_by(|a, b| a.0.path.cmp(&b.0.path));

        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        for (file, needed) in candidates {
            if self.inner.index.has_data(&file.path) {
                ready.push((file, needed, settings.clone()));
            } else {
                waiting.push((file, needed));
            }
        }

        if !ready.is_empty() {
            debug!("{} file(s) ready for metadata content", ready.len());
            self.inner.dispatch(ready);
        }
        if !waiting.is_empty() {
            self.inner.start_wait(waiting, settings);
        }
        Ok(())
    }

    /// Drop every outstanding wait. Idempotent.
    pub fn dispose_all(&self) {
        let waits = {
            let mut state = self.inner.lock();
            state.pending.clear();
            std::mem::take(&mut state.waits)
        };
        if !waits.is_empty() {
            debug!("Disposed {} metadata wait(s)", waits.len());
        }
        drop(waits);
    }

    /// Stop waiting for the given kinds, e.g. after the feature was disabled.
    pub fn cancel_types(&self, types: &[ContentType]) {
        let finished = {
            let mut state = self.inner.lock();
            let QueueState { pending, waits, .. } = &mut *state;
            let mut emptied = Vec::new();
            for (path, entry) in pending.iter_mut() {
                entry.types.retain(|kind| !types.contains(kind));
                if entry.types.is_empty() {
                    emptied.push((path.clone(), entry.wait_id));
                }
            }
            let mut finished = Vec::new();
            for (path, wait_id) in emptied {
                pending.remove(&path);
                finished.extend(detach_path(waits, wait_id, &path));
            }
            finished
        };
        drop(finished);
    }

    /// Forget a pending path, e.g. because it was renamed or deleted.
    pub fn forget_path(&self, path: &str) {
        let finished = {
            let mut state = self.inner.lock();
            let QueueState { pending, waits, .. } = &mut *state;
            pending
                .remove(path)
                .and_then(|entry| detach_path(waits, entry.wait_id, path))
        };
        drop(finished);
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.inner.lock().pending.contains_key(path)
    }

    /// Kinds still awaited for `path`.
    pub fn pending_types(&self, path: &str) -> Vec<ContentType> {
        self.inner
            .lock()
            .pending
            .get(path)
            .map(|entry| entry.types.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn wait_count(&self) -> usize {
        self.inner.lock().waits.len()
    }
}

/// Remove `path` from its wait, returning the wait if that emptied it.
fn detach_path(waits: &mut HashMap<u64, Wait>, wait_id: u64, path: &str) -> Option<Wait> {
    let wait = waits.get_mut(&wait_id)?;
    wait.paths.remove(path);
    if wait.paths.is_empty() {
        waits.remove(&wait_id)
    } else {
        None
    }
}

impl QueueInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_wait(self: &Arc<Self>, files: Vec<(VaultFile, BTreeSet<ContentType>)>, settings: NavigatorSettings) {
        let wait_id = {
            let mut state = self.lock();
            state.next_wait_id += 1;
            let wait_id = state.next_wait_id;

            let mut paths = HashSet::new();
            for (file, types) in files {
                match state.pending.get_mut(&file.path) {
                    Some(existing) if existing.types.is_superset(&types) => {
                        existing.file = file;
                    }
                    Some(existing) => {
                        existing.types.extend(types);
                        existing.file = file;
                        existing.settings = settings.clone();
                    }
                    None => {
                        paths.insert(file.path.clone());
                        state.pending.insert(
                            file.path.clone(),
                            PendingEntry {
                                file,
                                types,
                                settings: settings.clone(),
                                wait_id,
                            },
                        );
                    }
                }
            }

            if paths.is_empty() {
                return;
            }
            debug!("Waiting on metadata index for {} file(s)", paths.len());
            state.waits.insert(
                wait_id,
                Wait {
                    paths,
                    _subscriptions: Vec::new(),
                    timer: None,
                },
            );
            wait_id
        };

        // Subscribe outside the state lock; the re-check below covers any
        // signal that fired before the wait was wired up.
        let weak = Arc::downgrade(self);
        let on_resolved = {
            let weak = Weak::clone(&weak);
            self.index.on_resolved(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.check_wait(wait_id, None);
                }
            }))
        };
        let on_changed = {
            let weak = Weak::clone(&weak);
            self.index.on_changed(Box::new(move |path| {
                if let Some(inner) = weak.upgrade() {
                    inner.check_wait(wait_id, Some(path));
                }
            }))
        };
        let timer = {
            let delay = self.diagnostic_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.report_unresolved(wait_id);
                }
            })
        };

        let mut subscriptions = vec![on_resolved, on_changed];
        {
            let mut state = self.lock();
            match state.waits.get_mut(&wait_id) {
                Some(wait) => {
                    wait._subscriptions.append(&mut subscriptions);
                    wait.timer = Some(timer);
                }
                // Cancelled while subscribing
                None => timer.abort(),
            }
        }
        drop(subscriptions);

        self.check_wait(wait_id, None);
    }

    /// Re-check the paths still pending in `wait_id` and queue the ready ones.
    /// With `only`, just that path is checked.
    fn check_wait(&self, wait_id: u64, only: Option<&str>) {
        let (ready, finished) = {
            let mut state = self.lock();
            let QueueState { pending, waits, .. } = &mut *state;
            let Some(wait) = waits.get_mut(&wait_id) else {
                return;
            };

            let now_ready: Vec<String> = match only {
                Some(path) if wait.paths.contains(path) && self.index.has_data(path) => {
                    vec![path.to_string()]
                }
                Some(_) => return,
                None => wait
                    .paths
                    .iter()
                    .filter(|path| self.index.has_data(path))
                    .cloned()
                    .collect(),
            };

            let mut ready = Vec::with_capacity(now_ready.len());
            for path in now_ready {
                wait.paths.remove(&path);
                if let Some(entry) = pending.remove(&path) {
                    ready.push((entry.file, entry.types, entry.settings));
                }
            }

            let finished = if wait.paths.is_empty() {
                waits.remove(&wait_id)
            } else {
                None
            };
            (ready, finished)
        };

        // Drop the wait (and its subscriptions) outside the lock
        drop(finished);
        if !ready.is_empty() {
            debug!("{} waiting file(s) became ready", ready.len());
            self.dispatch(ready);
        }
    }

    fn report_unresolved(&self, wait_id: u64) {
        let state = self.lock();
        let Some(wait) = state.waits.get(&wait_id) else {
            return;
        };
        let mut paths: Vec<&str> = wait.paths.iter().map(String::as_str).collect();
        paths.sort_unstable();
        let total = paths.len();
        paths.truncate(DIAGNOSTIC_PATH_LIMIT);
        warn!(
            "Metadata index still has not parsed {} file(s) after {:?}; still waiting: {}",
            total,
            self.diagnostic_delay,
            paths.join(", ")
        );
    }

    /// Queue ready files on the registry, one call per distinct request.
    fn dispatch(&self, ready: Vec<(VaultFile, BTreeSet<ContentType>, NavigatorSettings)>) {
        let mut groups: Vec<(BTreeSet<ContentType>, NavigatorSettings, Vec<VaultFile>)> = Vec::new();
        for (file, types, settings) in ready {
            match groups
                .iter_mut()
                .find(|(t, s, _)| *t == types && *s == settings)
            {
                Some((_, _, files)) => files.push(file),
                None => groups.push((types, settings, vec![file])),
            }
        }

        for (types, settings, files) in groups {
            let types: Vec<ContentType> = types.into_iter().collect();
            self.registry
                .queue_files_for_all_providers(&files, &settings, &ProviderFilter::only(&types));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CachedMetadata, InMemoryMetadataIndex};
    use crate::providers::testing::CountingProvider;
    use crate::store::InMemoryStore;

    struct Fixture {
        store: Arc<InMemoryStore>,
        index: Arc<InMemoryMetadataIndex>,
        registry: Arc<ContentProviderRegistry>,
        tags: Arc<CountingProvider>,
        queue: MetadataContentQueue,
    }

    async fn fixture(files: &[VaultFile]) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        store.record_changes(files, &HashMap::new(), &HashMap::new()).await.unwrap();
        let index = Arc::new(InMemoryMetadataIndex::new());
        let registry = Arc::new(ContentProviderRegistry::new(store.clone(), 10));
        let tags = Arc::new(CountingProvider::new(ContentType::Tags));
        registry.register_provider(tags.clone());
        registry.register_provider(Arc::new(CountingProvider::new(ContentType::Metadata)));
        let queue = MetadataContentQueue::new(
            store.clone(),
            index.clone(),
            registry.clone(),
            Arc::new(RwLock::new(NavigatorSettings::default())),
            Duration::from_secs(10),
        );
        Fixture {
            store,
            index,
            registry,
            tags,
            queue,
        }
    }

    const TAGS: &[ContentType] = &[ContentType::Tags];

    #[tokio::test]
    async fn test_ready_file_is_queued_immediately() {
        let file = VaultFile::new("a.md", 1);
        let f = fixture(&[file.clone()]).await;
        f.index.insert("a.md", CachedMetadata::from_markdown("#x"));

        f.queue
            .queue_metadata_content_when_ready(&[file], Some(TAGS), None)
            .await
            .unwrap();
        f.registry.wait_until_idle().await;

        assert_eq!(f.tags.generated(), vec!["a.md"]);
        assert_eq!(f.queue.wait_count(), 0);
    }

    #[tokio::test]
    async fn test_waiting_file_queued_once_after_resolve() {
        let file = VaultFile::new("a.md", 1);
        let f = fixture(&[file.clone()]).await;

        f.queue
            .queue_metadata_content_when_ready(&[file.clone(), file.clone()], Some(TAGS), None)
            .await
            .unwrap();
        assert!(f.queue.is_pending("a.md"));
        assert_eq!(f.index.listener_count(), 2);

        f.index.insert("a.md", CachedMetadata::from_markdown("#x"));
        f.index.resolve();
        f.index.resolve();
        f.index.publish("a.md", CachedMetadata::from_markdown("#x"));
        f.registry.wait_until_idle().await;

        assert_eq!(f.tags.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!f.queue.is_pending("a.md"));
        assert_eq!(f.index.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_per_file_signal_releases_only_ready_paths() {
        let files = vec![VaultFile::new("a.md", 1), VaultFile::new("b.md", 1)];
        let f = fixture(&files).await;

        f.queue
            .queue_metadata_content_when_ready(&files, Some(TAGS), None)
            .await
            .unwrap();
        f.index.publish("a.md", CachedMetadata::default());
        f.registry.wait_until_idle().await;

        assert_eq!(f.tags.generated(), vec!["a.md"]);
        assert!(f.queue.is_pending("b.md"));
        assert_eq!(f.queue.wait_count(), 1);
    }

    #[tokio::test]
    async fn test_per_file_signals_check_only_the_signalled_path() {
        let files: Vec<VaultFile> = (0..50).map(|i| VaultFile::new(format!("n{i}.md"), 1)).collect();
        let f = fixture(&files).await;

        f.queue
            .queue_metadata_content_when_ready(&files, Some(TAGS), None)
            .await
            .unwrap();
        // One lookup per file before waiting and one for the initial re-check
        assert_eq!(f.index.lookup_count(), 100);

        for file in &files {
            f.index.publish(&file.path, CachedMetadata::default());
        }
        f.registry.wait_until_idle().await;

        assert_eq!(f.index.lookup_count(), 150);
        assert_eq!(f.tags.generated().len(), 50);
        assert_eq!(f.queue.wait_count(), 0);
    }

    #[tokio::test]
    async fn test_superset_request_is_noop_and_subset_merges() {
        let file = VaultFile::new("a.md", 1);
        let f = fixture(&[file.clone()]).await;

        f.queue
            .queue_metadata_content_when_ready(&[file.clone()], None, None)
            .await
            .unwrap();
        assert_eq!(f.queue.wait_count(), 1);

        f.queue
            .queue_metadata_content_when_ready(&[file.clone()], Some(TAGS), None)
            .await
            .unwrap();
        assert_eq!(f.queue.wait_count(), 1);

        let f2 = fixture(&[file.clone()]).await;
        f2.queue
            .queue_metadata_content_when_ready(&[file.clone()], Some(TAGS), None)
            .await
            .unwrap();
        f2.queue
            .queue_metadata_content_when_ready(&[file], Some(&[ContentType::FeatureImage]), None)
            .await
            .unwrap();
        assert_eq!(f2.queue.wait_count(), 1);
        assert_eq!(
            f2.queue.pending_types("a.md"),
            vec![ContentType::FeatureImage, ContentType::Tags]
        );
    }

    #[tokio::test]
    async fn test_fresh_and_non_markdown_files_are_dropped() {
        let files = vec![VaultFile::new("a.md", 1), VaultFile::new("pic.png", 1)];
        let f = fixture(&files).await;
        f.store
            .update_content(vec![crate::record::ContentUpdate {
                path: "a.md".into(),
                mtime: 1,
                value: crate::record::ContentValue::Tags(vec![]),
            }])
            .await
            .unwrap();

        f.queue
            .queue_metadata_content_when_ready(&files, Some(TAGS), None)
            .await
            .unwrap();

        assert_eq!(f.queue.pending_count(), 0);
        assert_eq!(f.queue.wait_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_types_are_ignored() {
        let file = VaultFile::new("a.md", 1);
        let f = fixture(&[file.clone()]).await;
        let settings = NavigatorSettings {
            show_tags: false,
            ..Default::default()
        };

        f.queue
            .queue_metadata_content_when_ready(&[file], Some(TAGS), Some(settings))
            .await
            .unwrap();

        assert_eq!(f.queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_is_idempotent() {
        let files = vec![VaultFile::new("a.md", 1), VaultFile::new("b.md", 1)];
        let f = fixture(&files).await;
        f.queue
            .queue_metadata_content_when_ready(&files, Some(TAGS), None)
            .await
            .unwrap();

        f.queue.forget_path("a.md");
        f.queue.forget_path("a.md");
        assert_eq!(f.queue.pending_count(), 1);

        f.queue.cancel_types(TAGS);
        assert_eq!(f.queue.pending_count(), 0);
        assert_eq!(f.queue.wait_count(), 0);
        assert_eq!(f.index.listener_count(), 0);

        f.queue.dispose_all();
        f.queue.dispose_all();

        f.index.insert("b.md", CachedMetadata::default());
        f.index.resolve();
        f.registry.wait_until_idle().await;
        assert!(f.tags.generated().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostic_timer_does_not_abandon_wait() {
        let file = VaultFile::new("slow.md", 1);
        let f = fixture(&[file.clone()]).await;
        f.queue
            .queue_metadata_content_when_ready(&[file], Some(TAGS), None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(f.queue.is_pending("slow.md"));

        f.index.publish("slow.md", CachedMetadata::default());
        f.registry.wait_until_idle().await;
        assert_eq!(f.tags.generated(), vec!["slow.md"]);
    }
}
