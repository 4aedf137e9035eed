//! Short-lived per-job locks.
//!
//! Taken before a claim attempt so that pollers in the same process do not
//! all pile onto the head of the queue. Locks expire on their own and are
//! never released explicitly.

use buildq_core::JobId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct TemporaryLocks {
    ttl: Duration,
    held: Mutex<HashMap<JobId, Instant>>,
}

impl TemporaryLocks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Take the lock for `id` unless an unexpired one is held.
    pub fn try_acquire(&self, id: JobId) -> bool {
        let now = Instant::now();
        let mut held = self.held.lock();
        held.retain(|_, expires| *expires > now);
        if held.contains_key(&id) {
            return false;
        }
        held.insert(id, now + self.ttl);
        true
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
