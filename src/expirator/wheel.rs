//! Hierarchical timing-wheel expirator.
//!
//! Four cascading wheels with slot counts `{256, 64, 64, 64}` over a 1 ms
//! base tick give a useful horizon of roughly 18 hours. Entries land in
//! the coarsest wheel that can represent their distance; when a finer
//! wheel wraps, the next slot of the coarser wheel *cascades* - its
//! entries are re-inserted and relocate into a finer wheel now that they
//! are closer.
//!
//! Best for: high insertion rates where firing jitter of up to one tick is
//! acceptable.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{fire_batch, ExpiryHandler, Expirator};

/// Base tick duration. Compiled in; a coarser production tick is a
/// build-time change.
const TICK: Duration = Duration::from_millis(1);

const WHEEL_0_SLOTS: u64 = 256;
const WHEEL_1_SLOTS: u64 = 64;
const WHEEL_2_SLOTS: u64 = 64;
const WHEEL_3_SLOTS: u64 = 64;

const WHEEL_1_SPAN: u64 = WHEEL_0_SLOTS;
const WHEEL_2_SPAN: u64 = WHEEL_0_SLOTS * WHEEL_1_SLOTS;
const WHEEL_3_SPAN: u64 = WHEEL_0_SLOTS * WHEEL_1_SLOTS * WHEEL_2_SLOTS;

struct Entry<V> {
    deadline: Instant,
    value: V,
}

struct WheelCore<K, V> {
    wheels: [Vec<HashMap<K, Entry<V>>>; 4],
    /// Key to `(wheel level, slot index)` so removal never scans.
    locations: HashMap<K, (usize, usize)>,
    start_time: Instant,
    current_tick: u64,
}

impl<K, V> WheelCore<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Self {
        let make = |slots: u64| (0..slots).map(|_| HashMap::new()).collect::<Vec<_>>();
        Self {
            wheels: [
                make(WHEEL_0_SLOTS),
                make(WHEEL_1_SLOTS),
                make(WHEEL_2_SLOTS),
                make(WHEEL_3_SLOTS),
            ],
            locations: HashMap::new(),
            start_time: Instant::now(),
            current_tick: 0,
        }
    }

    fn reset_origin(&mut self, now: Instant) {
        self.start_time = now;
        self.current_tick = 0;
    }

    fn len(&self) -> usize {
        self.locations.len()
    }

    fn contains(&self, key: &K) -> bool {
        self.locations.contains_key(key)
    }

    fn get(&self, key: &K) -> Option<&Entry<V>> {
        let (level, slot) = *self.locations.get(key)?;
        self.wheels[level][slot].get(key)
    }

    fn insert(&mut self, key: K, deadline: Instant, value: V) {
        // Distance is measured against the wheel's own tick clock so that
        // cascaded re-insertions land exactly where the tick counter will
        // visit them.
        let logical_now = self.start_time + TICK * self.current_tick as u32;
        let ticks_from_now = deadline.saturating_duration_since(logical_now).as_millis() as u64;
        let target_tick = self.current_tick + ticks_from_now;

        let (level, slot) = if ticks_from_now < WHEEL_1_SPAN {
            (0, (target_tick % WHEEL_0_SLOTS) as usize)
        } else if ticks_from_now < WHEEL_2_SPAN {
            (1, ((target_tick / WHEEL_1_SPAN) % WHEEL_1_SLOTS) as usize)
        } else if ticks_from_now < WHEEL_3_SPAN {
            (2, ((target_tick / WHEEL_2_SPAN) % WHEEL_2_SLOTS) as usize)
        } else {
            (3, ((target_tick / WHEEL_3_SPAN) % WHEEL_3_SLOTS) as usize)
        };

        self.wheels[level][slot].insert(key.clone(), Entry { deadline, value });
        self.locations.insert(key, (level, slot));
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let (level, slot) = self.locations.remove(key)?;
        self.wheels[level][slot].remove(key).map(|entry| entry.value)
    }

    fn clear(&mut self) {
        for wheel in &mut self.wheels {
            for slot in wheel.iter_mut() {
                slot.clear();
            }
        }
        self.locations.clear();
    }

    fn drain_all(&mut self) -> Vec<(K, V)> {
        let mut drained = Vec::with_capacity(self.locations.len());
        for wheel in &mut self.wheels {
            for slot in wheel.iter_mut() {
                drained.extend(slot.drain().map(|(key, entry)| (key, entry.value)));
            }
        }
        self.locations.clear();
        drained
    }

    /// Advance one tick: drain the due entries of the current wheel-0 slot
    /// and cascade coarser wheels on wrap.
    fn advance(&mut self, now: Instant) -> Vec<(K, V)> {
        self.current_tick += 1;

        let mut due = Vec::new();
        let slot_0 = (self.current_tick % WHEEL_0_SLOTS) as usize;
        self.drain_due(0, slot_0, now, &mut due);

        if self.current_tick % WHEEL_1_SPAN == 0 {
            let slot_1 = ((self.current_tick / WHEEL_1_SPAN) % WHEEL_1_SLOTS) as usize;
            self.cascade(1, slot_1);

            if self.current_tick % WHEEL_2_SPAN == 0 {
                let slot_2 = ((self.current_tick / WHEEL_2_SPAN) % WHEEL_2_SLOTS) as usize;
                self.cascade(2, slot_2);

                if self.current_tick % WHEEL_3_SPAN == 0 {
                    let slot_3 = ((self.current_tick / WHEEL_3_SPAN) % WHEEL_3_SLOTS) as usize;
                    self.cascade(3, slot_3);
                }
            }
        }

        due
    }

    fn drain_due(&mut self, level: usize, slot: usize, now: Instant, due: &mut Vec<(K, V)>) {
        let slot_map = &mut self.wheels[level][slot];
        let fired: Vec<K> = slot_map
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in fired {
            if let Some(entry) = slot_map.remove(&key) {
                self.locations.remove(&key);
                due.push((key, entry.value));
            }
        }
    }

    fn cascade(&mut self, level: usize, slot: usize) {
        let entries: Vec<(K, Entry<V>)> = self.wheels[level][slot].drain().collect();
        for (key, entry) in entries {
            self.locations.remove(&key);
            self.insert(key, entry.deadline, entry.value);
        }
    }

    fn next_tick_at(&self) -> Instant {
        self.start_time + TICK * (self.current_tick as u32 + 1)
    }
}

struct Shared<K, V> {
    core: Mutex<WheelCore<K, V>>,
    handler: Mutex<ExpiryHandler<K, V>>,
    wake: Notify,
    running: AtomicBool,
    shutdown: AtomicBool,
}

/// Timing-wheel deadline store firing a callback when entries expire.
///
/// Unlike the heap variant, the wheel keeps ticking while armed even when
/// empty; only `stop` and `clear` disarm it.
pub struct TimingWheelExpirator<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> TimingWheelExpirator<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a timing-wheel expirator with the given expiry callback.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime: the tick task is
    /// spawned here.
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(K, V) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            core: Mutex::new(WheelCore::new()),
            handler: Mutex::new(Box::new(handler) as ExpiryHandler<K, V>),
            wake: Notify::new(),
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        tokio::spawn(tick_loop(shared.clone()));

        Self { shared }
    }

    fn arm(&self) {
        if !self.shared.running.swap(true, Ordering::AcqRel) {
            self.shared.core.lock().reset_origin(Instant::now());
            self.shared.wake.notify_one();
        }
    }

    fn disarm(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

async fn tick_loop<K, V>(shared: Arc<Shared<K, V>>)
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

        let next_tick = shared.core.lock().next_tick_at();
        tokio::select! {
            _ = tokio::time::sleep_until(next_tick) => {
                if !shared.running.load(Ordering::Acquire) {
                    continue;
                }
                let due = shared.core.lock().advance(Instant::now());
                if !due.is_empty() {
                    let mut handler = shared.handler.lock();
                    fire_batch(&mut handler, due);
                }
            }
            _ = shared.wake.notified() => {}
        }
    }
}

impl<K, V> Expirator<K, V> for TimingWheelExpirator<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn start(&self) {
        self.arm();
    }

    fn stop(&self) {
        self.disarm();
    }

    fn add(&self, key: K, ttl: Duration, value: V) -> bool {
        self.arm();
        let deadline = Instant::now() + ttl;
        let mut core = self.shared.core.lock();
        if core.contains(&key) {
            return false;
        }
        core.insert(key, deadline, value);
        true
    }

    fn remove(&self, key: &K) -> bool {
        self.shared.core.lock().remove(key).is_some()
    }

    fn update_expiry(&self, key: &K, ttl: Duration) -> bool {
        let deadline = Instant::now() + ttl;
        let mut core = self.shared.core.lock();
        match core.remove(key) {
            Some(value) => {
                core.insert(key.clone(), deadline, value);
                true
            }
            None => false,
        }
    }

    fn refresh(&self, key: &K, delta: Duration) -> bool {
        let mut core = self.shared.core.lock();
        let deadline = match core.get(key) {
            Some(entry) => entry.deadline + delta,
            None => return false,
        };
        match core.remove(key) {
            Some(value) => {
                core.insert(key.clone(), deadline, value);
                true
            }
            None => false,
        }
    }

    fn get_info(&self, key: &K) -> Option<V> {
        self.shared
            .core
            .lock()
            .get(key)
            .map(|entry| entry.value.clone())
    }

    fn get_remaining_time(&self, key: &K) -> Option<Duration> {
        let deadline = self.shared.core.lock().get(key)?.deadline;
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

impl<K, V> Drop for TimingWheelExpirator<K, V> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }
}
