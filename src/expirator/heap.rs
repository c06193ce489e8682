//! Heap-based expirator using a binary min-heap keyed by deadline.
//!
//! Provides:
//! - O(log n) insertion and removal
//! - O(1) access to the earliest deadline
//! - Exact timing with no periodic wakeups: the timer is armed at the root
//!   deadline and rearmed whenever the root changes
//!
//! Best for: general-purpose expiration with balanced performance.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{fire_batch, ExpiryHandler, Expirator};

struct HeapNode<K> {
    deadline: Instant,
    key: K,
}

struct EntryData<V> {
    deadline: Instant,
    value: V,
    heap_index: usize,
}

/// Min-heap of `(deadline, key)` paired with a key-indexed map recording
/// each entry's heap position.
struct HeapCore<K, V> {
    heap: Vec<HeapNode<K>>,
    entries: HashMap<K, EntryData<V>>,
}

impl<K, V> HeapCore<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self {
            heap: Vec::with_capacity(1024),
            entries: HashMap::with_capacity(1024),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.first().map(|node| node.deadline)
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert a new entry. Returns whether it became the earliest deadline.
    fn insert(&mut self, key: K, deadline: Instant, value: V) -> bool {
        let index = self.heap.len();
        self.heap.push(HeapNode {
            deadline,
            key: key.clone(),
        });
        self.entries.insert(
            key,
            EntryData {
                deadline,
                value,
                heap_index: index,
            },
        );
        let settled = self.sift_up(index);
        settled == 0
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.remove_at(entry.heap_index);
        Some(entry.value)
    }

    /// Move an entry to a new absolute deadline, sifting in the direction
    /// the change dictates. Returns whether the root deadline changed.
    fn reschedule(&mut self, key: &K, new_deadline: Instant) -> bool {
        let (index, old_deadline) = match self.entries.get_mut(key) {
            Some(entry) => {
                let old = entry.deadline;
                entry.deadline = new_deadline;
                (entry.heap_index, old)
            }
            None => return false,
        };

        let root_before = self.heap[0].deadline;
        self.heap[index].deadline = new_deadline;
        if new_deadline < old_deadline {
            self.sift_up(index);
        } else {
            self.sift_down(index);
        }
        self.heap[0].deadline != root_before
    }

    /// Remove every entry with `deadline <= now`, returning the fired set.
    fn pop_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut due = Vec::new();
        while let Some(root) = self.heap.first() {
            if root.deadline > now {
                break;
            }
            let key = root.key.clone();
            self.remove_at(0);
            if let Some(entry) = self.entries.remove(&key) {
                due.push((key, entry.value));
            }
        }
        due
    }

    fn drain_all(&mut self) -> Vec<(K, V)> {
        self.heap.clear();
        self.entries
            .drain()
            .map(|(key, entry)| (key, entry.value))
            .collect()
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn remove_at(&mut self, index: usize) {
        let last = self.heap.len() - 1;
        self.heap.swap(index, last);
        self.heap.pop();

        if index < self.heap.len() {
            let key = self.heap[index].key.clone();
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.heap_index = index;
            }
            let settled = self.sift_up(index);
            if settled == index {
                self.sift_down(index);
            }
        }
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].deadline >= self.heap[parent].deadline {
                break;
            }
            self.swap_nodes(index, parent);
            index = parent;
        }
        index
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut smallest = index;

            if left < len && self.heap[left].deadline < self.heap[smallest].deadline {
                smallest = left;
            }
            if right < len && self.heap[right].deadline < self.heap[smallest].deadline {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap_nodes(index, smallest);
            index = smallest;
        }
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        for index in [a, b] {
            let key = self.heap[index].key.clone();
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.heap_index = index;
            }
        }
    }
}

struct Shared<K, V> {
    core: Mutex<HeapCore<K, V>>,
    handler: Mutex<ExpiryHandler<K, V>>,
    wake: Notify,
    running: AtomicBool,
    shutdown: AtomicBool,
}

/// Heap-backed deadline store firing a callback when entries expire.
///
/// The timer task is spawned at construction and parks while the expirator
/// is disarmed or empty. `add` auto-arms, and the expirator disarms itself
/// once the last entry fires.
pub struct HeapExpirator<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> HeapExpirator<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a heap expirator with the given expiry callback.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime: the driver task is
    /// spawned here.
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(K, V) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            core: Mutex::new(HeapCore::new()),
            handler: Mutex::new(Box::new(handler) as ExpiryHandler<K, V>),
            wake: Notify::new(),
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        tokio::spawn(drive(shared.clone()));

        Self { shared }
    }

    fn arm(&self) {
        self.shared.running.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    fn disarm(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

async fn drive<K, V>(shared: Arc<Shared<K, V>>)
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        if !shared.running.load(Ordering::Acquire) {
            shared.wake.notified().await;
            continue;
        }

        let next = shared.core.lock().next_deadline();
        let deadline = match next {
            Some(deadline) => deadline,
            None => {
                // Nothing stored: the expirator disarms itself and a later
                // add re-arms it.
                shared.running.store(false, Ordering::Release);
                continue;
            }
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                if !shared.running.load(Ordering::Acquire) {
                    continue;
                }
                let due = shared.core.lock().pop_due(Instant::now());
                if !due.is_empty() {
                    let mut handler = shared.handler.lock();
                    fire_batch(&mut handler, due);
                }
            }
            _ = shared.wake.notified() => {}
        }
    }
}

impl<K, V> Expirator<K, V> for HeapExpirator<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn start(&self) {
        if self.shared.core.lock().len() == 0 {
            return;
        }
        self.arm();
    }

    fn stop(&self) {
        self.disarm();
    }

    fn add(&self, key: K, ttl: Duration, value: V) -> bool {
        let deadline = Instant::now() + ttl;
        {
            let mut core = self.shared.core.lock();
            if core.contains(&key) {
                return false;
            }
            core.insert(key, deadline, value);
        }
        self.arm();
        true
    }

    fn remove(&self, key: &K) -> bool {
        self.shared.core.lock().remove(key).is_some()
    }

    fn update_expiry(&self, key: &K, ttl: Duration) -> bool {
        let new_deadline = Instant::now() + ttl;
        let rescheduled = {
            let mut core = self.shared.core.lock();
            if !core.contains(key) {
                return false;
            }
            core.reschedule(key, new_deadline)
        };
        if rescheduled {
            self.shared.wake.notify_one();
        }
        true
    }

    fn refresh(&self, key: &K, delta: Duration) -> bool {
        let rescheduled = {
            let mut core = self.shared.core.lock();
            let current = match core.entries.get(key) {
                Some(entry) => entry.deadline,
                None => return false,
            };
            core.reschedule(key, current + delta)
        };
        if rescheduled {
            self.shared.wake.notify_one();
        }
        true
    }

    fn get_info(&self, key: &K) -> Option<V> {
        self.shared
            .core
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.value.clone())
    }

    fn get_remaining_time(&self, key: &K) -> Option<Duration> {
        let deadline = self.shared.core.lock().entries.get(key)?.deadline;
        Some(deadline.duration_since(Instant::now()))
    }

    fn contains(&self, key: &K) -> bool {
        self.shared.core.lock().contains(key)
    }

    fn len(&self) -> usize {
        self.shared.core.lock().len()
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.shared.core.lock().clear();
        self.disarm();
    }

    fn expire_all(&self) {
        let drained = self.shared.core.lock().drain_all();
        self.disarm();
        if !drained.is_empty() {
            let mut handler = self.shared.handler.lock();
            fire_batch(&mut handler, drained);
        }
    }
}

impl<K, V> Drop for HeapExpirator<K, V> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }
}
