//! Collapsing scheduler: debounced one-shot jobs on the Tokio runtime.
//!
//! `schedule` replaces any job that has not fired yet. A job that has fired
//! detaches itself from the slot first, so `cancel` can never interrupt work
//! that already started.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Slot {
    next_id: u64,
    pending: Option<(u64, JoinHandle<()>)>,
}

#[derive(Clone, Default)]
pub struct CollapsingScheduler {
    slot: Arc<Mutex<Slot>>,
}

impl CollapsingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` after `delay`, cancelling any job still waiting to fire.
    pub fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Hold the lock across spawn so the task cannot look at the slot
        // before its own entry is stored.
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, previous)) = slot.pending.take() {
            previous.abort();
        }

        slot.next_id += 1;
        let id = slot.next_id;
        let shared = Arc::clone(&self.slot);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = shared.lock().unwrap_or_else(|e| e.into_inner());
                match slot.pending.as_ref() {
                    Some((current, _)) if *current == id => {
                        slot.pending = None;
                    }
                    // Cancelled or replaced between wake-up and lock
                    _ => return,
                }
            }
            job.await;
        });
        slot.pending = Some((id, handle));
    }

    /// Cancel the job that has not fired yet. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.pending.take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .is_some()
    }
}
