//! Progress broadcaster for migration observers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

/// Normalized progress snapshot. Counts that are not known yet are `-1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    pub current_batch_number: u32,
    pub total_batches: i64,
    pub processed_count: u64,
    pub remaining_count: i64,
    pub estimated_total: i64,
    pub progress_percentage: f64,
    pub session_id: String,
}

impl MigrationProgress {
    /// Build a snapshot. Totals are only known once the scan is complete.
    pub fn new(session_id: &str, batch_number: u32, processed: u64, is_complete: bool) -> Self {
        if is_complete {
            MigrationProgress {
                current_batch_number: batch_number,
                total_batches: i64::from(batch_number),
                processed_count: processed,
                remaining_count: 0,
                estimated_total: processed as i64,
                progress_percentage: 100.0,
                session_id: session_id.to_string(),
            }
        } else {
            MigrationProgress {
                current_batch_number: batch_number,
                total_batches: -1,
                processed_count: processed,
                remaining_count: -1,
                estimated_total: -1,
                progress_percentage: 0.0,
                session_id: session_id.to_string(),
            }
        }
    }
}

type Callback = Box<dyn Fn(&MigrationProgress) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    callbacks: BTreeMap<u64, Arc<Callback>>,
    latest: Option<MigrationProgress>,
}

/// Broadcasts progress snapshots to any number of observers.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    inner: Arc<Mutex<Observers>>,
}

/// Handle returned by [`ProgressReporter::subscribe`]. The observer is
/// removed when the handle is dropped or `unsubscribe` is called.
pub struct Subscription {
    id: u64,
    reporter: Weak<Mutex<Observers>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.reporter.upgrade() {
            if let Ok(mut observers) = inner.lock() {
                observers.callbacks.remove(&self.id);
            }
        }
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MigrationProgress) + Send + Sync + 'static,
    {
        let mut observers = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let id = observers.next_id;
        observers.next_id += 1;
        observers.callbacks.insert(id, Arc::new(Box::new(callback)));
        Subscription {
            id,
            reporter: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver a snapshot to every observer. Callbacks run outside the lock,
    /// so an observer may subscribe or unsubscribe from inside its callback.
    pub fn emit(&self, progress: MigrationProgress) {
        let callbacks: Vec<Arc<Callback>> = {
            let mut observers = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            observers.latest = Some(progress.clone());
            observers.callbacks.values().cloned().collect()
        };
        for cb in callbacks {
            cb(&progress);
        }
    }

    pub fn latest(&self) -> Option<MigrationProgress> {
        let observers = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        observers.latest.clone()
    }

    pub fn clear(&self) {
        let mut observers = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        observers.latest = None;
    }

    /// Drop every observer. Outstanding `Subscription` handles become inert.
    pub fn unsubscribe_all(&self) {
        let mut observers = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        observers.callbacks.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let observers = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        observers.callbacks.len()
    }
}
