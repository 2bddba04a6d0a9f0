//! Settings-change reactor.
//!
//! Collapses bursts of settings edits into a single reaction. A change
//! (re)starts the debounce window; when it elapses, a drain loop feeds
//! `baseline -> latest` to the handler and repeats while new snapshots keep
//! arriving. Only one drain runs at a time, and reactions are applied in
//! order.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::scheduler::CollapsingScheduler;
use crate::settings::{self, NavigatorSettings};

/// Receives settled settings transitions.
#[async_trait]
pub trait SettingsHandler: Send + Sync {
    async fn handle_settings_change(&self, old: &NavigatorSettings, new: &NavigatorSettings);
}

struct ReactorState {
    baseline: NavigatorSettings,
    pending: Option<NavigatorSettings>,
    draining: bool,
}

struct ReactorInner {
    handler: Arc<dyn SettingsHandler>,
    debounce: Duration,
    scheduler: CollapsingScheduler,
    state: Mutex<ReactorState>,
}

pub struct SettingsReactor {
    inner: Arc<ReactorInner>,
}

impl SettingsReactor {
    pub fn new(
        baseline: NavigatorSettings,
        debounce: Duration,
        handler: Arc<dyn SettingsHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(ReactorInner {
                handler,
                debounce,
                scheduler: CollapsingScheduler::new(),
                state: Mutex::new(ReactorState {
                    baseline,
                    pending: None,
                    draining: false,
                }),
            }),
        }
    }

    /// Record a new snapshot. Last write wins.
    pub fn on_settings_changed(&self, settings: NavigatorSettings) {
        {
            let mut state = self.inner.lock();
            state.pending = Some(settings);
            if state.draining {
                // The running drain picks it up on its next iteration
                return;
            }
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .scheduler
            .schedule(self.inner.debounce, async move { inner.drain().await });
    }

    /// Drop the pending snapshot and any drain that has not started yet.
    /// A running drain is left to finish.
    pub fn reset(&self) {
        self.inner.lock().pending = None;
        self.inner.scheduler.cancel();
    }

    /// Replace the baseline, e.g. after the cache was rebuilt from `settings`.
    pub fn set_baseline(&self, settings: NavigatorSettings) {
        self.inner.lock().baseline = settings;
    }

    /// The last snapshot that was fully handled.
    pub fn baseline(&self) -> NavigatorSettings {
        self.inner.lock().baseline.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    pub fn has_pending(&self) -> bool {
        self.inner.lock().pending.is_some() || self.inner.scheduler.is_scheduled()
    }
}

impl ReactorInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, ReactorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn drain(self: Arc<Self>) {
        {
            let mut state = self.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let (old, new) = {
                let mut state = self.lock();
                match state.pending.take() {
                    Some(new) => (state.baseline.clone(), new),
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };

            debug!(
                "Applying settings change: {:?}",
                settings::changed_fields(&old, &new)
            );
            self.handler.handle_settings_change(&old, &new).await;
            self.lock().baseline = new;
        }
    }
}
