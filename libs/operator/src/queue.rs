//! A rate-limited, deduplicating work queue mirroring client-go's
//! `workqueue.RateLimitingInterface`: callers `add` a key, a single worker
//! loop `get`s the next distinct key, and `done`/`forget`/`add_rate_limited`
//! track retry state so a misbehaving reconcile backs off instead of
//! spinning.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

/// Requeues are capped here; past this the item is dropped and logged rather
/// than retried forever.
pub const MAX_RETRIES: u32 = 5;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    requeues: std::collections::HashMap<K, u32>,
    shutting_down: bool,
}

/// A FIFO of distinct keys with exponential-backoff requeueing, modeled on
/// `k8s.io/client-go/util/workqueue`.
pub struct WorkQueue<K>
where
    K: Eq + std::hash::Hash + Clone + Send + 'static,
{
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Eq + std::hash::Hash + Clone + Send + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                requeues: std::collections::HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Adds `key` to the queue immediately. A key already queued or being
    /// processed is not duplicated.
    pub async fn add(&self, key: K) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if inner.processing.contains(&key) {
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Re-adds `key` after an exponential backoff delay, tracking how many
    /// times it has been requeued. Past [`MAX_RETRIES`], the caller should
    /// call [`WorkQueue::forget`] instead of calling this again.
    pub async fn add_rate_limited(self: &Arc<Self>, key: K) {
        let retries = {
            let mut inner = self.inner.lock().await;
            let count = inner.requeues.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = backoff_delay(retries);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Blocks until a distinct key is available, or `None` once the queue has
    /// been shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks `key` as finished processing. If it was re-`add`ed while being
    /// processed, it becomes eligible for another `get` immediately.
    pub async fn done(&self, key: &K) {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Clears the retry counter for `key`, as client-go's `Forget` does on success.
    pub async fn forget(&self, key: &K) {
        self.inner.lock().await.requeues.remove(key);
    }

    /// Number of times `key` has been requeued via `add_rate_limited` since
    /// the last `forget`.
    pub async fn num_requeues(&self, key: &K) -> u32 {
        *self.inner.lock().await.requeues.get(key).unwrap_or(&0)
    }

    /// Stops accepting new work and wakes any blocked `get` callers.
    pub async fn shutdown(&self) {
        self.inner.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }
}

fn backoff_delay(retries: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1u32.checked_shl(retries).unwrap_or(u32::MAX));
    std::cmp::min(exp, MAX_DELAY)
}

/// Implements client-go's `handleError`: forget on success, rate-limited
/// retry under [`MAX_RETRIES`], otherwise drop and forget.
pub async fn handle_result<K>(queue: &Arc<WorkQueue<K>>, key: K, result: Result<(), impl std::fmt::Display>)
where
    K: Eq + std::hash::Hash + Clone + Send + 'static,
{
    match result {
        Ok(()) => queue.forget(&key).await,
        Err(err) => {
            if queue.num_requeues(&key).await < MAX_RETRIES {
                tracing::warn!(%err, "requeuing after error");
                queue.add_rate_limited(key).await;
            } else {
                tracing::error!(%err, "dropping after max retries");
                queue.forget(&key).await;
            }
        }
    }
}
