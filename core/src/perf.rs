use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Accumulates timings of one repeatedly executed phase (for example
/// "waiting for a frame slot"). Unlike a plain stopwatch it can be
/// recorded from one thread and read from any other thread, so worker
/// threads can publish their timings without locking.
#[derive(Debug)]
pub struct PhaseTimer {
    name: &'static str,
    runs: AtomicU64,
    total_time: AtomicU64,
    last_time: AtomicU64,
}

impl PhaseTimer {
    /// Creates a new timer with specified name.
    pub const fn new(name: &'static str) -> Self {
        PhaseTimer {
            name,
            runs: AtomicU64::new(0),
            total_time: AtomicU64::new(0),
            last_time: AtomicU64::new(0),
        }
    }

    /// Records one run of the phase that took `elapsed`.
    pub fn record(&self, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.last_time.store(micros, Ordering::Relaxed);
        self.total_time.fetch_add(micros, Ordering::Relaxed);
        self.runs.fetch_add(1, Ordering::Release);
    }

    /// Starts measuring one run. The run is recorded when the returned
    /// guard is dropped.
    pub fn start(&self) -> PhaseGuard<'_> {
        PhaseGuard {
            timer: self,
            started: Instant::now(),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    #[inline]
    pub fn total_time(&self) -> Duration {
        Duration::from_micros(self.total_time.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn last_time(&self) -> Duration {
        Duration::from_micros(self.last_time.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn avg_time(&self) -> Duration {
        let runs = self.runs();
        if runs == 0 {
            return Duration::new(0, 0);
        }
        Duration::from_micros(self.total_time.load(Ordering::Relaxed) / runs)
    }
}

/// Records the time elapsed since its creation into the `PhaseTimer`
/// it was started from when dropped.
#[must_use = "the run is recorded when the guard is dropped"]
pub struct PhaseGuard<'a> {
    timer: &'a PhaseTimer,
    started: Instant,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.timer.record(self.started.elapsed());
    }
}

/// This macro generates a struct containing `PhaseTimer` objects with
/// specified names. It also implements a `Default` trait for it so it
/// can be easily initialized.
///
/// You can prefix the name of generated struct with `pub` modifier to
/// generate a pub struct.
///
/// # Example
///
/// ```rust
/// use stream_core::impl_stats_struct;
///
/// impl_stats_struct!(pub Statistics; read, copy);
///
/// let stats = Statistics::default();
/// assert_eq!(stats.read.name(), "read");
/// ```
#[macro_export]
macro_rules! impl_stats_struct {
    (pub $name: ident; $($it: ident),+) => {
        #[derive(Debug)]
        pub struct $name {
            $(pub $it: $crate::perf::PhaseTimer,)+
        }

        impl Default for $name {
            fn default() -> Self {
                $name {
                    $($it: $crate::perf::PhaseTimer::new(stringify!($it)),)+
                }
            }
        }
    };
    ($name: ident; $($it: ident),+) => {
        #[derive(Debug)]
        struct $name {
            $($it: $crate::perf::PhaseTimer,)+
        }

        impl Default for $name {
            fn default() -> Self {
                $name {
                    $($it: $crate::perf::PhaseTimer::new(stringify!($it)),)+
                }
            }
        }
    };
}

/// Measures the rest of the current scope with the specified `PhaseTimer`.
#[macro_export]
macro_rules! time_scope {
    ($timer: expr) => {
        let _phase_guard = $timer.start();
    };
}
