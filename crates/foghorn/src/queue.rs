//! Rate-limited, key-deduplicating work queue.
//!
//! The queue owns three disciplines at once: per-key FIFO with deduplication,
//! key-level mutual exclusion (a key being processed is parked as dirty and
//! re-queued when processing finishes), and admission rate limiting composed
//! from a per-key exponential failure backoff and a global token bucket.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(120);
const BUCKET_RATE_PER_SECOND: u32 = 1000;
const BUCKET_BURST: u32 = 50000;

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: DefaultDirectRateLimiter,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

impl Default for WorkQueue {
    fn default() -> Self { WorkQueue::new() }
}

impl WorkQueue {
    pub fn new() -> WorkQueue {
        let quota = Quota::per_second(NonZeroU32::new(BUCKET_RATE_PER_SECOND).expect("nonzero"))
            .allow_burst(NonZeroU32::new(BUCKET_BURST).expect("nonzero"));
        WorkQueue {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            limiter: RateLimiter::direct(quota),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `key` immediately. Duplicate adds collapse; adds for a key
    /// being processed are parked and re-queued after [`WorkQueue::done`].
    pub fn add(&self, key: &str) {
        {
            let mut state = self.lock();
            if state.shut_down {
                return;
            }
            if state.processing.contains(key) {
                state.dirty.insert(key.to_string());
                return;
            }
            if !state.queued.insert(key.to_string()) {
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.notify.notify_one();
    }

    /// Enqueue `key` after its failure backoff and a token-bucket slot.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let failures = *self.lock().failures.get(key).unwrap_or(&0);
        let delay = backoff_delay(failures);
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.limiter.until_ready().await;
            queue.add(&key);
        });
    }

    /// Record a failed reconcile and schedule a retry.
    pub fn requeue_failed(self: &Arc<Self>, key: &str) {
        *self.lock().failures.entry(key.to_string()).or_insert(0) += 1;
        self.add_rate_limited(key);
    }

    /// Clear the failure history after a successful reconcile.
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Next key to process, marking it in flight. `None` once the queue is
    /// shut down and drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Finish processing `key`; a dirty key goes straight back in line.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.remove(key) && !state.shut_down && state.queued.insert(key.to_string())
            {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop admitting work and wake idle workers so they can exit.
    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize { self.lock().queue.len() }
}

fn backoff_delay(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exp = failures.saturating_sub(1).min(32);
    BASE_DELAY.saturating_mul(2u32.saturating_pow(exp)).min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_millis(5));
        assert_eq!(backoff_delay(2), Duration::from_millis(10));
        assert_eq!(backoff_delay(5), Duration::from_millis(80));
        // Saturates at the cap.
        assert_eq!(backoff_delay(40), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_dedup_and_order() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.add("a");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await.as_deref(), Some("a"));
        assert_eq!(queue.next().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_key_mutual_exclusion() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.next().await.unwrap();
        // While `a` is being processed, a new add parks it instead of
        // handing it to a second worker.
        queue.add("a");
        assert_eq!(queue.len(), 0);
        queue.done(&key);
        assert_eq!(queue.next().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_rate_limited_requeue() {
        let queue = Arc::new(WorkQueue::new());
        queue.add("a");
        let key = queue.next().await.unwrap();
        queue.done(&key);
        queue.requeue_failed(&key);
        let key = tokio::time::timeout(Duration::from_secs(2), queue.next())
            .await
            .expect("requeue must arrive")
            .unwrap();
        assert_eq!(key, "a");
        queue.forget(&key);
        assert!(queue.lock().failures.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let queue = Arc::new(WorkQueue::new());
        queue.add("a");
        queue.shut_down();
        // Ignored after shutdown.
        queue.add("b");
        assert_eq!(queue.next().await.as_deref(), Some("a"));
        assert_eq!(queue.next().await, None);
    }
}
