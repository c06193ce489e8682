//! Deadline-indexed key/value stores that fire a callback on expiry.
//!
//! Three interchangeable implementations share one contract:
//!
//! - [`HeapExpirator`] - binary min-heap, exact timing, O(log n) mutation.
//!   The default choice.
//! - [`TimingWheelExpirator`] - hierarchical timing wheels with a 1 ms
//!   tick. Best at high insertion rates when up to one tick of firing
//!   jitter is acceptable.
//! - [`LockFreeExpirator`] - multi-producer operation ring drained by a
//!   single consumer task. Producers on any thread never take a lock.
//!
//! Every implementation drives its own timer task on the Tokio runtime:
//! entries whose deadline has passed are removed from all internal indices
//! and their payload is moved into the expiry callback exactly once. A
//! panicking callback is caught and reported; subsequent fires proceed.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use framelink::expirator::{Expirator, HeapExpirator};
//!
//! let exp = HeapExpirator::new(|key: u32, value: String| {
//!     println!("expired: {key} => {value}");
//! });
//! exp.add(1, Duration::from_millis(100), "lease".into());
//! ```

mod heap;
mod lockfree;
mod wheel;

pub use heap::HeapExpirator;
pub use lockfree::LockFreeExpirator;
pub use wheel::TimingWheelExpirator;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

/// Callback invoked with the key and payload of each expired entry.
pub type ExpiryHandler<K, V> = Box<dyn FnMut(K, V) + Send>;

/// The capability set shared by all expirator implementations.
///
/// Consumers (the protocol facade among them) bind to this trait, never to
/// a concrete variant.
pub trait Expirator<K, V>: Send + Sync {
    /// Arm the timer. A no-op while already running or with nothing stored.
    fn start(&self);

    /// Disarm the timer. After this returns no further callbacks fire
    /// until the expirator is re-armed.
    fn stop(&self);

    /// Insert `key` with `deadline = now + ttl` if it is absent.
    ///
    /// Returns `false` when the key is already present (or, for the
    /// lock-free variant, when the operation ring is full). A zero `ttl`
    /// fires at the next scheduling iteration.
    fn add(&self, key: K, ttl: Duration, value: V) -> bool;

    /// Cancel a pending expiry. No callback fires for a removed entry.
    fn remove(&self, key: &K) -> bool;

    /// Move an entry's deadline to `now + ttl`.
    fn update_expiry(&self, key: &K, ttl: Duration) -> bool;

    /// Extend an entry's deadline by `delta` from its current deadline.
    fn refresh(&self, key: &K, delta: Duration) -> bool;

    /// Clone out the payload stored for `key`.
    fn get_info(&self, key: &K) -> Option<V>;

    /// Time left until `key` expires, zero if already due.
    fn get_remaining_time(&self, key: &K) -> Option<Duration>;

    /// Whether `key` is currently stored.
    fn contains(&self, key: &K) -> bool;

    /// Number of live entries.
    fn len(&self) -> usize;

    /// Whether no entries are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the timer is armed.
    fn is_running(&self) -> bool;

    /// Drop all entries silently: no callbacks fire.
    fn clear(&self);

    /// Invoke the callback for every stored entry, in unspecified order,
    /// then leave the expirator empty and disarmed.
    fn expire_all(&self);
}

/// Run the expiry handler over a batch of fired entries, containing panics
/// so one misbehaving callback cannot stop the rest of the batch.
pub(crate) fn fire_batch<K, V>(handler: &mut ExpiryHandler<K, V>, batch: Vec<(K, V)>) {
    for (key, value) in batch {
        let result = catch_unwind(AssertUnwindSafe(|| handler(key, value)));
        if result.is_err() {
            tracing::error!("expiry handler panicked; continuing with remaining entries");
        }
    }
}
