//! Functionality for cross-thread notifying.
//!
//! Notification is similar to Java's `CountDownLatch` except
//! it can be counted-down only once. Other threads can block
//! on the notification (optionally with a timeout) or poll it.
//! All waiting threads are resumed when the notification is
//! signaled.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Latch {
    ready: Mutex<bool>,
    condvar: Condvar,
}

/// Sender part capable of signaling the notification.
pub struct Sender(Arc<Latch>);

/// Receiver part of notification capable of blocking the current thread
/// until the notification is signaled.
#[derive(Clone)]
pub struct Receiver(Arc<Latch>);

impl Sender {
    /// Signals the notification and resumes all threads that
    /// are blocked on a `wait()` call. Signaling more than once
    /// has no further effect.
    #[inline]
    pub fn signal(&self) {
        let mut ready = self.0.ready.lock();
        *ready = true;
        self.0.condvar.notify_all();
    }
}

impl Receiver {
    /// Returns whether the notification was already signaled
    /// without blocking.
    #[inline]
    pub fn is_signaled(&self) -> bool {
        *self.0.ready.lock()
    }

    /// Blocks current thread until this notification becomes
    /// signaled.
    #[inline]
    pub fn wait(&self) {
        let mut ready = self.0.ready.lock();
        while !*ready {
            self.0.condvar.wait(&mut ready);
        }
    }

    /// Blocks current thread until this notification becomes signaled
    /// or the `timeout` elapses. Returns `true` if the notification
    /// was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.0.ready.lock();
        while !*ready {
            if self.0.condvar.wait_until(&mut ready, deadline).timed_out() {
                break;
            }
        }
        *ready
    }
}

/// Creates a new notification. Returns a `Sender` and `Receiver`
/// structs. `Sender` can be used to signal the notification and
/// `Receiver` struct can be used to block the thread until the
/// notification becomes signaled.
pub fn notification() -> (Sender, Receiver) {
    let latch = Arc::new(Latch {
        ready: Mutex::new(false),
        condvar: Condvar::new(),
    });
    (Sender(latch.clone()), Receiver(latch))
}
