//! Monotonic timeline events shared between submitters and the
//! backends or devices that complete their work.

use parking_lot::{Condvar, Mutex};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A monotonically increasing value associated with a submission.
/// Zero means "no work" and is always signaled.
pub type Timeline = u64;

/// An event carrying the highest completed timeline value of one queue.
///
/// Signaling never lowers the stored value, so a late signal of an
/// older submission cannot make newer work look unfinished.
pub struct TimelineEvent {
    name: &'static str,
    completed: AtomicU64,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl TimelineEvent {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            completed: AtomicU64::new(0),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Highest value signaled so far.
    #[inline]
    pub fn completed(&self) -> Timeline {
        self.completed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_complete(&self, value: Timeline) -> bool {
        self.completed() >= value
    }

    /// Marks all work up to `value` as complete and wakes blocked waiters.
    pub fn signal(&self, value: Timeline) {
        let _guard = self.lock.lock();
        self.completed.fetch_max(value, Ordering::AcqRel);
        self.condvar.notify_all();
    }

    /// Blocks the calling thread until `value` is signaled.
    pub fn wait(&self, value: Timeline) {
        let mut guard = self.lock.lock();
        while !self.is_complete(value) {
            self.condvar.wait(&mut guard);
        }
    }

    /// Blocks the calling thread until `value` is signaled or the timeout
    /// elapses. Returns whether the value was reached.
    pub fn wait_timeout(&self, value: Timeline, timeout: Duration) -> bool {
        let mut guard = self.lock.lock();
        if !self.is_complete(value) {
            self.condvar.wait_for(&mut guard, timeout);
        }
        self.is_complete(value)
    }

    /// Wakes all waiters without changing the value, so they can
    /// re-check external conditions (used on abort).
    pub(crate) fn notify(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }
}

impl Debug for TimelineEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineEvent")
            .field("name", &self.name)
            .field("completed", &self.completed())
            .finish()
    }
}

/// A device-side wait: the consumer must not start before `event`
/// reaches `value`.
#[derive(Clone, Debug)]
pub struct FenceWait {
    pub event: Arc<TimelineEvent>,
    pub value: Timeline,
}

impl FenceWait {
    pub fn new(event: &Arc<TimelineEvent>, value: Timeline) -> Self {
        Self {
            event: event.clone(),
            value,
        }
    }

    #[inline]
    pub fn is_satisfied(&self) -> bool {
        self.event.is_complete(self.value)
    }
}
