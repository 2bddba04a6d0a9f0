//! Content providers and the registry that routes files to them.
//!
//! Each provider owns one `ContentType`. The registry keeps one worker per
//! provider; a worker drains its own queue on a Tokio task, skips files whose
//! cached field is already fresh, and writes results back to the store.
//!
//! ```text
//! queue_files_for_all_providers(files, settings, filter)
//!        │
//!        ├──> ProviderWorker(preview)       ──generate──> store.update_content
//!        ├──> ProviderWorker(tags)          ──generate──> store.update_content
//!        └──> ...
//! ```

mod feature_image;
mod metadata;
mod preview;
mod tags;

pub use feature_image::FeatureImageProvider;
pub use metadata::MetadataProvider;
pub use preview::PreviewProvider;
pub use tags::TagProvider;

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::host::{HostError, VaultFile};
use crate::record::{ContentType, ContentUpdate, ContentValue};
use crate::settings::NavigatorSettings;
use crate::store::PersistedStore;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Metadata not ready for {0}")]
    MetadataNotReady(String),

    #[error("Generation failed: {0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// A pluggable generator for one kind of derived content.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    fn content_type(&self) -> ContentType;

    fn is_enabled(&self, settings: &NavigatorSettings) -> bool {
        settings.is_enabled(self.content_type())
    }

    /// Whether this provider can produce content for `file` at all.
    fn supports(&self, file: &VaultFile) -> bool {
        file.is_markdown()
    }

    /// Whether the provider's own options differ materially between snapshots.
    fn options_changed(&self, old: &NavigatorSettings, new: &NavigatorSettings) -> bool;

    async fn generate(&self, file: &VaultFile, settings: &NavigatorSettings) -> Result<ContentValue>;
}

/// Which providers a queue call targets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderFilter {
    pub include: Option<Vec<ContentType>>,
    pub exclude: Vec<ContentType>,
}

impl ProviderFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(types: &[ContentType]) -> Self {
        Self {
            include: Some(types.to_vec()),
            exclude: Vec::new(),
        }
    }

    pub fn excluding(types: &[ContentType]) -> Self {
        Self {
            include: None,
            exclude: types.to_vec(),
        }
    }

    pub fn allows(&self, kind: ContentType) -> bool {
        self.include.as_ref().is_none_or(|inc| inc.contains(&kind)) && !self.exclude.contains(&kind)
    }
}

struct WorkerState {
    order: VecDeque<String>,
    files: HashMap<String, VaultFile>,
    settings: NavigatorSettings,
    running: bool,
}

/// Per-provider processing queue.
struct ProviderWorker {
    provider: Arc<dyn ContentProvider>,
    store: Arc<dyn PersistedStore>,
    batch_size: usize,
    state: Mutex<WorkerState>,
    /// Bumped by `stop`; a task only keeps going while it holds the current value
    generation: AtomicU64,
}

impl ProviderWorker {
    fn new(
        provider: Arc<dyn ContentProvider>,
        store: Arc<dyn PersistedStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            provider,
            store,
            batch_size: batch_size.max(1),
            state: Mutex::new(WorkerState {
                order: VecDeque::new(),
                files: HashMap::new(),
                settings: NavigatorSettings::default(),
                running: false,
            }),
            generation: AtomicU64::new(0),
        }
    }

    fn kind(&self) -> ContentType {
        self.provider.content_type()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(self: &Arc<Self>, files: Vec<VaultFile>, settings: &NavigatorSettings) {
        let mut state = self.lock();
        state.settings = settings.clone();
        for file in files {
            // Keep the newest view of a path already waiting in the queue
            if state.files.insert(file.path.clone(), file.clone()).is_none() {
                state.order.push_back(file.path);
            }
        }

        if !state.running && !state.order.is_empty() {
            state.running = true;
            let generation = self.generation.load(Ordering::SeqCst);
            let worker = Arc::clone(self);
            tokio::spawn(async move { worker.run(generation).await });
        }
    }

    fn set_settings(&self, settings: &NavigatorSettings) {
        self.lock().settings = settings.clone();
    }

    fn stop(&self) {
        let mut state = self.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        state.order.clear();
        state.files.clear();
        state.running = false;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn is_idle(&self) -> bool {
        let state = self.lock();
        !state.running && state.order.is_empty()
    }

    async fn run(self: Arc<Self>, generation: u64) {
        loop {
            let (batch, settings) = {
                let mut state = self.lock();
                if !self.is_current(generation) {
                    return;
                }
                if state.order.is_empty() {
                    state.running = false;
                    return;
                }
                let take = self.batch_size.min(state.order.len());
                let mut batch = Vec::with_capacity(take);
                for path in state.order.drain(..take).collect::<Vec<_>>() {
                    if let Some(file) = state.files.remove(&path) {
                        batch.push(file);
                    }
                }
                (batch, state.settings.clone())
            };

            self.process_batch(batch, &settings, generation).await;
        }
    }

    async fn process_batch(&self, batch: Vec<VaultFile>, settings: &NavigatorSettings, generation: u64) {
        let kind = self.kind();
        let paths: Vec<String> = batch.iter().map(|f| f.path.clone()).collect();
        let records = match self.store.get_files(&paths).await {
            Ok(records) => records,
            Err(e) => {
                warn!("{} provider could not read {} record(s): {}", kind, paths.len(), e);
                return;
            }
        };

        let mut updates = Vec::new();
        let mut attempted = 0usize;
        let mut failed = 0usize;

        for file in &batch {
            if !self.is_current(generation) {
                return;
            }
            let Some(record) = records.get(&file.path) else {
                continue;
            };
            if record.mtime != file.mtime || !record.needs(kind) {
                continue;
            }

            attempted += 1;
            match self.provider.generate(file, settings).await {
                Ok(value) => updates.push(ContentUpdate {
                    path: file.path.clone(),
                    mtime: record.mtime,
                    value,
                }),
                Err(e) => {
                    failed += 1;
                    warn!("{} generation failed for {}: {}", kind, file.path, e);
                }
            }
        }

        if attempted > 0 && failed == attempted {
            error!("{} generation failed for every file in a batch of {}", kind, attempted);
        }

        if updates.is_empty() || !self.is_current(generation) {
            return;
        }

        match self.store.update_content(updates).await {
            Ok(applied) => debug!("{} provider wrote {} update(s)", kind, applied),
            Err(e) => warn!("{} provider failed to write content: {}", kind, e),
        }
    }
}

/// Holds the registered providers and routes file batches to them.
pub struct ContentProviderRegistry {
    store: Arc<dyn PersistedStore>,
    batch_size: usize,
    workers: RwLock<Vec<Arc<ProviderWorker>>>,
}

impl ContentProviderRegistry {
    pub fn new(store: Arc<dyn PersistedStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size,
            workers: RwLock::new(Vec::new()),
        }
    }

    fn workers(&self) -> Vec<Arc<ProviderWorker>> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Register a provider. A provider for an already registered kind
    /// replaces the old one.
    pub fn register_provider(&self, provider: Arc<dyn ContentProvider>) {
        let worker = Arc::new(ProviderWorker::new(
            provider,
            Arc::clone(&self.store),
            self.batch_size,
        ));
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = workers.iter_mut().find(|w| w.kind() == worker.kind()) {
            existing.stop();
            *existing = worker;
        } else {
            workers.push(worker);
        }
    }

    pub fn registered_types(&self) -> Vec<ContentType> {
        self.workers().iter().map(|w| w.kind()).collect()
    }

    /// Enqueue `files` on every enabled provider that passes `filter`.
    pub fn queue_files_for_all_providers(
        &self,
        files: &[VaultFile],
        settings: &NavigatorSettings,
        filter: &ProviderFilter,
    ) {
        if files.is_empty() {
            return;
        }
        for worker in self.workers() {
            let kind = worker.kind();
            if !filter.allows(kind) || !worker.provider.is_enabled(settings) {
                continue;
            }
            let supported: Vec<VaultFile> = files
                .iter()
                .filter(|f| worker.provider.supports(f))
                .cloned()
                .collect();
            if supported.is_empty() {
                continue;
            }
            debug!("Queueing {} file(s) for {}", supported.len(), kind);
            worker.enqueue(supported, settings);
        }
    }

    /// Compare two settings snapshots provider by provider.
    ///
    /// Returns the kinds that must be regenerated: providers that were just
    /// enabled, or whose options changed while enabled. Providers that were
    /// disabled drop their queued work.
    pub fn handle_settings_change(
        &self,
        old: &NavigatorSettings,
        new: &NavigatorSettings,
    ) -> Vec<ContentType> {
        let mut affected = Vec::new();
        for worker in self.workers() {
            let provider = &worker.provider;
            let was_enabled = provider.is_enabled(old);
            let is_enabled = provider.is_enabled(new);

            if was_enabled && !is_enabled {
                worker.stop();
            }
            worker.set_settings(new);

            let flipped_on = !was_enabled && is_enabled;
            if flipped_on || (is_enabled && provider.options_changed(old, new)) {
                affected.push(worker.kind());
            }
        }
        affected
    }

    /// Halt all queued and in-flight generation. Idempotent.
    pub fn stop_all_processing(&self) {
        for worker in self.workers() {
            worker.stop();
        }
    }

    pub fn is_idle(&self) -> bool {
        self.workers().iter().all(|w| w.is_idle())
    }

    /// Resolve once every worker has drained its queue.
    pub async fn wait_until_idle(&self) {
        while !self.is_idle() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Provider that counts generations and fails on demand.
    pub struct CountingProvider {
        pub kind: ContentType,
        pub generated: Arc<Mutex<Vec<String>>>,
        pub fail_paths: Vec<String>,
        pub delay: Duration,
        pub calls: AtomicUsize,
    }

    impl CountingProvider {
        pub fn new(kind: ContentType) -> Self {
            Self {
                kind,
                generated: Arc::new(Mutex::new(Vec::new())),
                fail_paths: Vec::new(),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn generated(&self) -> Vec<String> {
            self.generated.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContentProvider for CountingProvider {
        fn content_type(&self) -> ContentType {
            self.kind
        }

        fn options_changed(&self, old: &NavigatorSettings, new: &NavigatorSettings) -> bool {
            self.kind == ContentType::Preview && old.preview_properties != new.preview_properties
        }

        async fn generate(&self, file: &VaultFile, _settings: &NavigatorSettings) -> Result<ContentValue> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_paths.contains(&file.path) {
                return Err(ProviderError::Failed(format!("bad file {}", file.path)));
            }
            self.generated.lock().unwrap().push(file.path.clone());
            Ok(match self.kind {
                ContentType::Preview => ContentValue::Preview {
                    text: format!("preview of {}", file.path),
                    word_count: 3,
                },
                ContentType::Tags => ContentValue::Tags(vec!["generated".into()]),
                ContentType::Metadata => ContentValue::Metadata {
                    metadata: Default::default(),
                    custom_property: None,
                },
                ContentType::FeatureImage => ContentValue::FeatureImage { image: None },
            })
        }
    }
}
