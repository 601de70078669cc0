//! Transfer submission service.
//!
//! Accepts ordered command lists, splits and batches their requests for
//! one backend and tracks their completion on a shared timeline event.
//! Owned files, callbacks and kept alive objects of a list are released
//! in submission order once its timeline is signaled.

use crate::backend::TransferBackend;
use crate::command::{CommandList, TransferRequest};
use crate::error::TransferError;
use crate::pending::{PendingQueue, PendingRecord};
use crate::split::split_request;
use crate::timeline::{FenceWait, Timeline, TimelineEvent};
use crossbeam::utils::Backoff;
use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct TransferService {
    name: &'static str,
    backend: Arc<dyn TransferBackend>,
    event: Arc<TimelineEvent>,
    fragment_size: u64,
    spin_limit: u32,
    // last issued timeline, held for the whole of `execute` so timelines
    // reach the backend in allocation order
    issued: Mutex<Timeline>,
    pending: PendingQueue,
}

impl TransferService {
    pub fn new(
        name: &'static str,
        backend: Arc<dyn TransferBackend>,
        fragment_size: u64,
        spin_limit: u32,
    ) -> Self {
        debug!(
            "Creating {} transfer service on {} backend (max request {}, staging {})",
            name,
            backend.name(),
            backend.max_request_size(),
            backend.staging_budget()
        );
        Self {
            name,
            backend,
            event: TimelineEvent::new(name),
            fragment_size,
            spin_limit,
            issued: Mutex::new(0),
            pending: PendingQueue::new(name),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The event every submission of this service signals.
    #[inline]
    pub fn event(&self) -> &Arc<TimelineEvent> {
        &self.event
    }

    #[inline]
    pub fn backend(&self) -> &dyn TransferBackend {
        &*self.backend
    }

    /// Most recently allocated timeline.
    #[inline]
    pub fn last_issued(&self) -> Timeline {
        *self.issued.lock()
    }

    /// Submits all requests of `list` and returns the timeline that is
    /// signaled once all of them completed.
    ///
    /// An empty list allocates nothing and returns the last issued
    /// timeline. If `wait_on` is given, none of the requests start before
    /// it is satisfied.
    pub fn execute(&self, list: CommandList, wait_on: Option<FenceWait>) -> Result<Timeline, TransferError> {
        let mut issued = self.issued.lock();
        let needs_record = list.needs_record();
        let CommandList {
            requests,
            files,
            callbacks,
            keep_alive,
        } = list;

        let timeline = if requests.is_empty() {
            *issued
        } else {
            let timeline = *issued + 1;

            if let Some(wait) = wait_on.filter(|w| !w.is_satisfied()) {
                trace!("{} timeline {} waits on {:?}", self.name, timeline, wait);
                self.backend.enqueue_wait(wait)?;
            }

            self.issue(requests)?;
            self.backend.enqueue_signal(&self.event, timeline)?;
            self.backend.submit()?;

            *issued = timeline;
            timeline
        };

        if needs_record {
            self.pending.push(PendingRecord {
                timeline,
                files,
                callbacks,
                keep_alive,
            });
        }

        Ok(timeline)
    }

    /// Issues requests to the backend. Fragments go first, smallest
    /// first, batched under the staging budget. Large requests are
    /// submitted one by one.
    fn issue(&self, requests: Vec<TransferRequest>) -> Result<(), TransferError> {
        let max_request_size = self.backend.max_request_size();
        let budget = self.backend.staging_budget();
        let threshold = self.fragment_size.min(budget);

        let (mut fragments, large): (Vec<_>, Vec<_>) = requests
            .into_iter()
            .flat_map(|r| split_request(r, max_request_size))
            .partition(|r| r.len() <= threshold);

        trace!(
            "{} issuing {} fragments and {} large requests",
            self.name,
            fragments.len(),
            large.len()
        );

        fragments.sort_by_key(TransferRequest::len);

        let mut batched = 0;
        for fragment in fragments {
            if batched > 0 && batched + fragment.len() > budget {
                self.backend.submit()?;
                batched = 0;
            }
            batched += fragment.len();
            self.backend.enqueue_request(fragment)?;
        }

        for request in large {
            if batched > 0 {
                self.backend.submit()?;
                batched = 0;
            }
            self.backend.enqueue_request(request)?;
            self.backend.submit()?;
        }

        Ok(())
    }

    #[inline]
    pub fn timeline_signaled(&self, timeline: Timeline) -> bool {
        self.backend.is_event_complete(&self.event, timeline)
    }

    /// Spins, then yields, until `timeline` is signaled.
    pub fn wait(&self, timeline: Timeline) -> Result<(), TransferError> {
        let backoff = Backoff::new();
        while !self.timeline_signaled(timeline) {
            if let Some(fault) = self.backend.fault() {
                return Err(TransferError::Faulted(Box::new(fault)));
            }
            backoff.snooze();
        }
        Ok(())
    }

    /// Blocks until `timeline` is signaled using the backend's native
    /// synchronization.
    pub fn synchronize(&self, timeline: Timeline) -> Result<(), TransferError> {
        if self.timeline_signaled(timeline) {
            return Ok(());
        }
        self.backend.sync_event(&self.event, timeline)
    }

    /// Yields for a bounded number of rounds and then blocks. Used for
    /// fences that are usually already signaled.
    pub fn settle(&self, timeline: Timeline) -> Result<(), TransferError> {
        for _ in 0..self.spin_limit {
            if self.timeline_signaled(timeline) {
                return Ok(());
            }
            std::thread::yield_now();
        }
        self.synchronize(timeline)
    }

    /// Releases every record whose timeline was signaled. Returns the
    /// number of released records.
    pub fn retire(&self) -> usize {
        self.pending.retire(|t| self.timeline_signaled(t))
    }

    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn free(&self) {
        debug!("Freeing {} transfer queue", self.name);
        self.backend.free_queue();
    }
}
