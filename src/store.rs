//! Bounded in-memory retention of completed document results.
//!
//! Completed results are kept in a [`ResultStore`] with an injected capacity
//! (default 10). When the store grows past its capacity, the oldest results
//! (by completion timestamp) are discarded. Eviction runs after every
//! insertion and again on a periodic background sweep, and both converge to
//! the same invariant: the store never holds more than `capacity` entries
//! after an eviction completes. Retrieval never evicts.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::watch;

use crate::{async_utils::JoinWorker, document::DocumentResult, prelude::*};

/// Default number of retained results.
pub const DEFAULT_CAPACITY: usize = 10;

/// How often the background sweeper re-checks the capacity bound.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// A bounded store of completed document results, keyed by file ID.
pub struct ResultStore {
    capacity: usize,
    entries: Mutex<HashMap<String, DocumentResult>>,
}

impl ResultStore {
    /// Create a store retaining at most `capacity` results.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of results currently retained.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    /// Is the store empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or overwrite the result for `id`, then enforce the capacity
    /// bound.
    pub fn record(&self, id: impl Into<String>, result: DocumentResult) {
        self.entries
            .lock()
            .expect("lock poisoned")
            .insert(id.into(), result);
        self.evict_if_over_capacity();
    }

    /// Look up a result. Never evicts.
    pub fn get(&self, id: &str) -> Option<DocumentResult> {
        self.entries.lock().expect("lock poisoned").get(id).cloned()
    }

    /// If the store holds more than `capacity` results, retain only the
    /// `capacity` most recently completed ones.
    ///
    /// The retained set is rebuilt and swapped in under the lock, so a sweep
    /// racing a concurrent insertion still leaves the store within bounds.
    pub fn evict_if_over_capacity(&self) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        if entries.len() <= self.capacity {
            return;
        }

        let mut all: Vec<(String, DocumentResult)> = entries.drain().collect();
        all.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));
        let evicted = all.len() - self.capacity;
        all.truncate(self.capacity);
        *entries = all.into_iter().collect();
        debug!(evicted, "evicted oldest stored results");
    }
}

/// The periodic eviction sweeper.
///
/// Owned by the process lifecycle: spawn it next to the store, and call
/// [`Sweeper::shutdown`] before exit so the task ends cleanly.
pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    worker: JoinWorker,
}

impl Sweeper {
    /// Spawn a sweeper over `store`, re-checking the bound every `period`.
    pub fn spawn(store: Arc<ResultStore>, period: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.evict_if_over_capacity();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            Ok(())
        });
        Self {
            shutdown,
            worker: JoinWorker::from_handle(handle),
        }
    }

    /// Stop the sweeper and wait for it to finish.
    pub async fn shutdown(self) -> Result<()> {
        // Ignore send failures: the task may already have exited.
        let _ = self.shutdown.send(true);
        self.worker.join().await
    }
}
