//! Rate-limited work queue
//!
//! Keys are deduplicated while they wait, and a key handed to a worker is
//! not handed out again until that worker calls [`WorkQueue::done`]. Events
//! arriving in between mark the key dirty, so it is processed exactly once
//! more afterwards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// First retry delay after a failure
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on the retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5 * 60);

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: HashMap<T, Instant>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> State<T>
where
    T: Clone + Eq + Hash,
{
    fn enqueue(&mut self, key: T) -> bool {
        if !self.dirty.insert(key.clone()) {
            return false;
        }
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Move due delayed keys to the queue; returns the next deadline
    fn promote_due(&mut self, now: Instant) -> (bool, Option<Instant>) {
        let due: Vec<T> = self
            .waiting
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut added = false;
        for key in due {
            self.waiting.remove(&key);
            added |= self.enqueue(key);
        }
        (added, self.waiting.values().min().copied())
    }
}

/// Deduplicating delay queue with per-key exponential backoff
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send,
{
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send,
{
    /// Queue whose backoff starts at `base_delay` and doubles up to `max_delay`
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Queue `key` for processing now
    pub fn add(&self, key: T) {
        let added = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.waiting.remove(&key);
            state.enqueue(key)
        };
        if added {
            self.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has passed
    ///
    /// A key already waiting keeps the earlier of the two deadlines.
    pub fn add_after(&self, key: T, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let at = Instant::now() + delay;
        {
            let mut state = self.state.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            let deadline = state.waiting.entry(key).or_insert(at);
            if at < *deadline {
                *deadline = at;
            }
        }
        // Wake a worker so it recomputes its sleep deadline.
        self.notify.notify_one();
    }

    /// Queue `key` after its backoff delay and count one more failure
    pub fn add_rate_limited(&self, key: T) {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            self.backoff(*failures)
        };
        self.add_after(key, delay);
    }

    /// Delay before retry number `failures` (1-based)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Clear the failure count of `key`
    pub fn forget(&self, key: &T) {
        self.state.lock().failures.remove(key);
    }

    /// Failures recorded for `key` since its last success
    pub fn num_requeues(&self, key: &T) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                let (promoted, deadline) = state.promote_due(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Idle workers parked without a deadline take the rest.
                    if promoted && !state.queue.is_empty() {
                        self.notify.notify_waiters();
                    }
                    return Some(key);
                }
                deadline
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Finish processing `key`; requeues it if it changed in the meantime
    pub fn done(&self, key: &T) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys; blocked and future `get` calls return `None`
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys ready to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no key is ready
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> WorkQueue<String> {
        WorkQueue::default()
    }

    #[tokio::test]
    async fn duplicate_adds_are_coalesced() {
        let q = queue();
        q.add("default/web".to_string());
        q.add("default/web".to_string());
        q.add("default/api".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("default/web"));
        assert_eq!(q.get().await.as_deref(), Some("default/api"));
    }

    // =========================================================================
    // Story: events for a key that is being synced
    // =========================================================================

    #[tokio::test]
    async fn events_during_sync_cause_exactly_one_more_pass() {
        let q = queue();
        let key = "default/web".to_string();

        // Chapter 1: a worker takes the key
        q.add(key.clone());
        let taken = q.get().await.expect("key should be available");

        // Chapter 2: two watch events arrive mid-sync; neither is handed out
        q.add(key.clone());
        q.add(key.clone());
        assert!(q.is_empty());

        // Chapter 3: finishing the pass requeues the key once
        q.done(&taken);
        assert_eq!(q.len(), 1);
        let again = q.get().await.expect("key should be requeued");
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_waits_for_the_delay() {
        let q = Arc::new(queue());
        q.add_after("default/web".to_string(), Duration::from_secs(30));
        assert!(q.is_empty());

        let start = Instant::now();
        let key = q.get().await.expect("key should arrive");
        assert_eq!(key, "default/web");
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_deadline_wins() {
        let q = queue();
        q.add_after("k".to_string(), Duration::from_secs(60));
        q.add_after("k".to_string(), Duration::from_secs(10));

        let start = Instant::now();
        q.get().await.expect("key should arrive");
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_falling_due_together_wake_every_idle_worker() {
        let q = Arc::new(queue());
        let spawn_worker = |q: Arc<WorkQueue<String>>| tokio::spawn(async move { q.get().await });

        // Chapter 1: a worker parks while nothing is waiting
        let parked = spawn_worker(q.clone());
        tokio::task::yield_now().await;

        // Chapter 2: two keys fall due at the same instant and only a second
        // worker sleeps on that deadline
        {
            let mut state = q.state.lock();
            let at = Instant::now() + Duration::from_secs(30);
            state.waiting.insert("default/a".to_string(), at);
            state.waiting.insert("default/b".to_string(), at);
        }
        let sleeper = spawn_worker(q.clone());

        // Chapter 3: both workers get a key once the deadline passes
        let first = tokio::time::timeout(Duration::from_secs(60), sleeper)
            .await
            .expect("sleeping worker should wake")
            .expect("worker should not panic")
            .expect("sleeping worker should get a key");
        let second = tokio::time::timeout(Duration::from_secs(60), parked)
            .await
            .expect("parked worker should be woken")
            .expect("worker should not panic")
            .expect("parked worker should get a key");
        let mut keys = vec![first, second];
        keys.sort();
        assert_eq!(keys, vec!["default/a".to_string(), "default/b".to_string()]);
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let q = queue();
        assert_eq!(q.backoff(1), Duration::from_secs(5));
        assert_eq!(q.backoff(2), Duration::from_secs(10));
        assert_eq!(q.backoff(3), Duration::from_secs(20));
        assert_eq!(q.backoff(7), Duration::from_secs(300));
        assert_eq!(q.backoff(40), DEFAULT_MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_count_grows_until_forgotten() {
        let q = queue();
        let key = "default/web".to_string();

        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 2);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_workers() {
        let q = Arc::new(queue());
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shutdown();
        let got = worker.await.expect("worker should not panic");
        assert!(got.is_none());

        q.add("late".to_string());
        assert!(q.is_empty());
    }
}
