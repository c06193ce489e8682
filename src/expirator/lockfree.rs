//! Lock-free expirator: multi-producer operation ring, single consumer.
//!
//! Producers on any thread publish operation records into a bounded
//! lock-free ring and never touch the deadline structures; a single
//! consumer task drains the ring, applies the records to an ordered-map
//! state and schedules the timer the way the heap variant does. A full
//! ring is a producer-side reject: the operation returns `false`.
//!
//! Best for: many threads inserting and cancelling entries at high rates.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{fire_batch, ExpiryHandler, Expirator};

/// Ring capacity per configured shard.
pub const SLOTS_PER_SHARD: usize = 1024;

/// Default ring capacity (4 shards).
pub const DEFAULT_RING_CAPACITY: usize = 4 * SLOTS_PER_SHARD;

enum Op<K, V> {
    Add {
        key: K,
        deadline: Instant,
        value: V,
    },
    Remove {
        key: K,
    },
    UpdateExpiry {
        key: K,
        deadline: Instant,
    },
    Refresh {
        key: K,
        delta: Duration,
    },
    Stop,
}

struct EntryState<V> {
    deadline: Instant,
    value: V,
    /// Tie-breaker distinguishing equal deadlines in the ordered queue.
    seq: u64,
}

/// Consumer-owned deadline state: key map plus a deadline-ordered queue.
struct OrderedCore<K, V> {
    entries: HashMap<K, EntryState<V>>,
    queue: BTreeMap<(Instant, u64), K>,
    next_seq: u64,
}

impl<K, V> OrderedCore<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            queue: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, key: K, deadline: Instant, value: V) {
        if self.entries.contains_key(&key) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((deadline, seq), key.clone());
        self.entries.insert(
            key,
            EntryState {
                deadline,
                value,
                seq,
            },
        );
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.queue.remove(&(entry.deadline, entry.seq));
        Some(entry.value)
    }

    fn relocate(&mut self, key: &K, deadline: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            self.queue.remove(&(entry.deadline, entry.seq));
            let seq = self.next_seq;
            self.next_seq += 1;
            entry.deadline = deadline;
            entry.seq = seq;
            self.queue.insert((deadline, seq), key.clone());
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    fn pop_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut due = Vec::new();
        while let Some((&(deadline, seq), _)) = self.queue.first_key_value() {
            if deadline > now {
                break;
            }
            if let Some(key) = self.queue.remove(&(deadline, seq)) {
                if let Some(entry) = self.entries.remove(&key) {
                    due.push((key, entry.value));
                }
            }
        }
        due
    }

    fn drain_all(&mut self) -> Vec<(K, V)> {
        self.queue.clear();
        self.entries
            .drain()
            .map(|(key, entry)| (key, entry.value))
            .collect()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.queue.clear();
    }
}

struct Shared<K, V> {
    ops: ArrayQueue<Op<K, V>>,
    core: Mutex<OrderedCore<K, V>>,
    handler: Mutex<ExpiryHandler<K, V>>,
    wake: Notify,
    running: AtomicBool,
    shutdown: AtomicBool,
}

impl<K, V> Shared<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Drain the operation ring into the ordered state. Runs only on the
    /// consumer task and on the inline `expire_all`/`clear` paths.
    fn apply_pending(&self) {
        let mut core = self.core.lock();
        while let Some(op) = self.ops.pop() {
            match op {
                Op::Add {
                    key,
                    deadline,
                    value,
                } => core.insert(key, deadline, value),
                Op::Remove { key } => {
                    core.remove(&key);
                }
                Op::UpdateExpiry { key, deadline } => core.relocate(&key, deadline),
                Op::Refresh { key, delta } => {
                    if let Some(entry) = core.entries.get(&key) {
                        let deadline = entry.deadline + delta;
                        core.relocate(&key, deadline);
                    }
                }
                Op::Stop => self.running.store(false, Ordering::Release),
            }
        }
    }
}

/// MPSC-queued deadline store firing a callback when entries expire.
///
/// Mutating operations are queued: they return `true` once the record is
/// accepted by the ring, and the consumer applies them in publication
/// order. Queries observe the consumer's state and may lag operations
/// still sitting in the ring.
pub struct LockFreeExpirator<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> LockFreeExpirator<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a lock-free expirator with the default ring capacity.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime: the consumer task is
    /// spawned here.
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(K, V) + Send + 'static,
    {
        Self::with_shards(crate::config::DEFAULT_NUM_SHARDS, handler)
    }

    /// Create a lock-free expirator whose ring holds
    /// `num_shards * SLOTS_PER_SHARD` operation records.
    pub fn with_shards<F>(num_shards: usize, handler: F) -> Self
    where
        F: FnMut(K, V) + Send + 'static,
    {
        let capacity = num_shards.max(1) * SLOTS_PER_SHARD;
        let shared = Arc::new(Shared {
            ops: ArrayQueue::new(capacity),
            core: Mutex::new(OrderedCore::new()),
            handler: Mutex::new(Box::new(handler) as ExpiryHandler<K, V>),
            wake: Notify::new(),
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        tokio::spawn(consume(shared.clone()));

        Self { shared }
    }

    fn publish(&self, op: Op<K, V>) -> bool {
        if self.shared.ops.push(op).is_err() {
            return false;
        }
        self.shared.wake.notify_one();
        true
    }
}

async fn consume<K, V>(shared: Arc<Shared<K, V>>)
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        shared.apply_pending();

        if !shared.running.load(Ordering::Acquire) {
            shared.wake.notified().await;
            continue;
        }

        let next = shared.core.lock().next_deadline();
        let deadline = match next {
            Some(deadline) => deadline,
            None => {
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

impl<K, V> Expirator<K, V> for LockFreeExpirator<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn start(&self) {
        self.shared.running.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    fn stop(&self) {
        // The flag stops callbacks immediately; the queued record keeps the
        // consumer's view of the op stream complete.
        self.shared.running.store(false, Ordering::Release);
        let _ = self.shared.ops.push(Op::Stop);
        self.shared.wake.notify_one();
    }

    fn add(&self, key: K, ttl: Duration, value: V) -> bool {
        let deadline = Instant::now() + ttl;
        if !self.publish(Op::Add {
            key,
            deadline,
            value,
        }) {
            return false;
        }
        self.shared.running.store(true, Ordering::Release);
        true
    }

    fn remove(&self, key: &K) -> bool {
        self.publish(Op::Remove { key: key.clone() })
    }

    fn update_expiry(&self, key: &K, ttl: Duration) -> bool {
        let deadline = Instant::now() + ttl;
        self.publish(Op::UpdateExpiry {
            key: key.clone(),
            deadline,
        })
    }

    fn refresh(&self, key: &K, delta: Duration) -> bool {
        self.publish(Op::Refresh {
            key: key.clone(),
            delta,
        })
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
        self.shared.core.lock().entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.shared.core.lock().entries.len()
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.shared.apply_pending();
        self.shared.core.lock().clear();
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }

    fn expire_all(&self) {
        self.shared.apply_pending();
        let drained = self.shared.core.lock().drain_all();
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_one();
        if !drained.is_empty() {
            let mut handler = self.shared.handler.lock();
            fire_batch(&mut handler, drained);
        }
    }
}

impl<K, V> Drop for LockFreeExpirator<K, V> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }
}
