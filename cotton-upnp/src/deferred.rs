//! One-shot timers, at most one per key
//!
//! [`Schedule`] is the bookkeeping: it knows nothing of clocks, and
//! is told the time by its caller, the same way [`crate::Engine`] is.
//! [`DeferredCallbackSet`] drives a `Schedule` from a Tokio task and
//! calls a handler for each key as its timer expires.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

/// Shortest delay ever scheduled
///
/// A zero delay still goes via the timer, so callbacks never run
/// inside the call that scheduled them.
pub const MIN_DELAY: Duration = Duration::from_millis(1);

/// Timers due this soon after "now" are treated as due already
///
/// Saves a separate wakeup for each of several timers due at almost
/// the same moment.
pub const SLACK: Duration = Duration::from_millis(15);

struct Entry<V> {
    due: Instant,
    sequence: u64,
    value: V,
}

/// Pending one-shot timers, keyed
///
/// Scheduling a key that is already pending replaces the earlier
/// timer. Timers fall due in order of due time, and among equal due
/// times in the order they were scheduled.
pub struct Schedule<K, V> {
    entries: HashMap<K, Entry<V>>,
    order: BTreeMap<(Instant, u64), K>,
    sequence: u64,
}

impl<K: Eq + Hash + Clone, V> Default for Schedule<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V> Schedule<K, V> {
    /// An empty schedule
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            sequence: 0,
        }
    }

    /// Arrange for `key` to fall due `delay` after `now`
    ///
    /// Returns true if an earlier timer for `key` was replaced.
    pub fn schedule(
        &mut self,
        key: K,
        value: V,
        delay: Duration,
        now: Instant,
    ) -> bool {
        let replaced = self.remove(&key).is_some();
        let due = now + delay.max(MIN_DELAY);
        let sequence = self.sequence;
        self.sequence += 1;
        self.order.insert((due, sequence), key.clone());
        self.entries.insert(
            key,
            Entry {
                due,
                sequence,
                value,
            },
        );
        replaced
    }

    /// Remove the timer for `key`, returning its value if there was one
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&(entry.due, entry.sequence));
        Some(entry.value)
    }

    /// Cancel the timer for `key`; returns whether there was one
    pub fn cancel(&mut self, key: &K) -> bool {
        self.remove(key).is_some()
    }

    /// Whether a timer for `key` is pending
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// When `key` falls due, if it is pending
    pub fn due(&self, key: &K) -> Option<Instant> {
        self.entries.get(key).map(|e| e.due)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timers are pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The earliest due time of any pending timer
    pub fn next_due(&self) -> Option<Instant> {
        self.order.keys().next().map(|(due, _)| *due)
    }

    /// How long until the earliest timer, if there is one
    pub fn next_wakeup(&self, now: Instant) -> Option<Duration> {
        self.next_due().map(|due| due.saturating_duration_since(now))
    }

    /// Remove and return every timer due by `now` (plus [`SLACK`])
    pub fn take_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let horizon = now + SLACK;
        let mut due = Vec::new();
        while let Some(entry) = self.order.first_entry() {
            if entry.key().0 > horizon {
                break;
            }
            let key = entry.remove();
            if let Some(e) = self.entries.remove(&key) {
                due.push((key, e.value));
            }
        }
        due
    }
}

type Handler<K> = Box<dyn Fn(K) + Send + Sync>;

struct Shared<K> {
    schedule: Mutex<Schedule<K, ()>>,
    changed: Notify,
    handler: Handler<K>,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Keyed one-shot timers on Tokio, calling one handler for all
///
/// The handler runs on the set's own task, never while any lock is
/// held, so it may freely schedule or cancel further timers.
/// Dropping the set cancels everything still pending.
pub struct DeferredCallbackSet<K> {
    shared: Arc<Shared<K>>,
    task: JoinHandle<()>,
}

impl<K> DeferredCallbackSet<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Create a set which calls `handler` with each key that falls due
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(K) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            schedule: Mutex::new(Schedule::new()),
            changed: Notify::new(),
            handler: Box::new(handler),
        });
        let task = tokio::spawn(Self::run(shared.clone()));
        Self { shared, task }
    }

    async fn run(shared: Arc<Shared<K>>) {
        loop {
            let next = shared.schedule.lock().next_due();
            match next {
                Some(due) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(due.into()) => {
                            let due = shared.schedule.lock().take_due(now());
                            trace!("{} deferred callbacks due", due.len());
                            for (key, ()) in due {
                                (shared.handler)(key);
                            }
                        }
                        () = shared.changed.notified() => {}
                    }
                }
                None => shared.changed.notified().await,
            }
        }
    }

    /// Call the handler with `key` after `delay`
    ///
    /// Replaces any timer already pending for `key`.
    pub fn schedule(&self, key: K, delay: Duration) {
        self.shared.schedule.lock().schedule(key, (), delay, now());
        self.shared.changed.notify_one();
    }

    /// Cancel the timer for `key`; returns whether there was one
    pub fn cancel(&self, key: &K) -> bool {
        self.shared.schedule.lock().cancel(key)
    }

    /// Whether a timer for `key` is pending
    pub fn is_pending(&self, key: &K) -> bool {
        self.shared.schedule.lock().contains(key)
    }

    /// Number of timers still to fire
    pub fn pending(&self) -> usize {
        self.shared.schedule.lock().len()
    }
}

impl<K> Drop for DeferredCallbackSet<K> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
