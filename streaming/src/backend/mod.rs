//! Transfer backends: the layer that actually moves bytes.
//!
//! Two implementations with the same contract exist. `DirectBackend`
//! forwards requests to a DMA-offload `StorageQueue`. `FallbackBackend`
//! runs a worker thread doing blocking reads through a staging ring and
//! emitting device copies. One is selected when the context is created.

use crate::command::TransferRequest;
use crate::error::TransferError;
use crate::timeline::{FenceWait, Timeline, TimelineEvent};
use std::sync::Arc;
use std::time::Duration;

pub mod direct;
pub mod fallback;

pub use direct::{BlockingStorageQueue, DirectBackend, StorageQueue};
pub use fallback::FallbackBackend;

/// How long blocking waits sleep before they re-check for a backend fault.
pub(crate) const FAULT_POLL: Duration = Duration::from_millis(10);

/// Contract shared by all transfer backends.
///
/// Requests, waits and signals are recorded in order and become visible
/// to the backend's executor on `submit()`. Work of one backend
/// completes in the order it was submitted.
pub trait TransferBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Largest request the backend accepts.
    fn max_request_size(&self) -> u64;

    /// How many bytes of small requests may be batched into one
    /// submission.
    fn staging_budget(&self) -> u64;

    /// Records one copy request (file or memory source into host memory,
    /// a device buffer or a device texture region).
    fn enqueue_request(&self, request: TransferRequest) -> Result<(), TransferError>;

    /// Records a wait: later requests do not start before `wait` is
    /// satisfied.
    fn enqueue_wait(&self, wait: FenceWait) -> Result<(), TransferError>;

    /// Records a signal of `event` to `value` after all previous work.
    fn enqueue_signal(&self, event: &Arc<TimelineEvent>, value: Timeline) -> Result<(), TransferError>;

    /// Hands everything recorded so far to the executor.
    fn submit(&self) -> Result<(), TransferError>;

    fn is_event_complete(&self, event: &TimelineEvent, value: Timeline) -> bool;

    /// Blocks until `event` reaches `value` using the backend's native
    /// synchronization.
    fn sync_event(&self, event: &TimelineEvent, value: Timeline) -> Result<(), TransferError>;

    /// Fatal error the backend ran into, if any. A faulted backend never
    /// signals again.
    fn fault(&self) -> Option<TransferError>;

    /// Releases the queue. Already submitted work is finished first.
    fn free_queue(&self);
}

/// Blocks on `event` while periodically checking `backend` for a fault.
pub(crate) fn wait_or_fault(
    backend: &dyn TransferBackend,
    event: &TimelineEvent,
    value: Timeline,
) -> Result<(), TransferError> {
    while !event.wait_timeout(value, FAULT_POLL) {
        if let Some(fault) = backend.fault() {
            return Err(TransferError::Faulted(Box::new(fault)));
        }
    }
    Ok(())
}
