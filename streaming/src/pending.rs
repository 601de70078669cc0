//! FIFO of submitted work waiting for its timeline to be signaled.

use crate::command::{Callback, KeepAlive};
use crate::file::StreamFile;
use crate::timeline::Timeline;
use log::trace;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// What has to be released once `timeline` is signaled.
pub struct PendingRecord {
    pub timeline: Timeline,
    pub files: Vec<Arc<StreamFile>>,
    pub callbacks: Vec<Callback>,
    pub keep_alive: Vec<KeepAlive>,
}

impl PendingRecord {
    /// Closes owned files, invokes the callbacks in the order they were
    /// registered and drops the kept alive objects.
    fn release(self) {
        trace!(
            "Releasing record {} ({} files, {} callbacks)",
            self.timeline,
            self.files.len(),
            self.callbacks.len()
        );
        drop(self.files);
        for callback in self.callbacks {
            callback();
        }
        drop(self.keep_alive);
    }
}

/// Records of one queue, retired strictly in the order they were pushed.
///
/// Only the head is ever checked for completion. This is valid because
/// the underlying queue completes submissions in submission order.
pub struct PendingQueue {
    name: &'static str,
    records: Mutex<VecDeque<PendingRecord>>,
    // serializes retiring so callbacks of two retiring threads never
    // interleave out of order
    retiring: Mutex<()>,
}

impl PendingQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: Mutex::new(VecDeque::new()),
            retiring: Mutex::new(()),
        }
    }

    pub fn push(&self, record: PendingRecord) {
        let mut records = self.records.lock();
        if let Some(last) = records.back() {
            assert!(
                last.timeline <= record.timeline,
                "{} record {} pushed after {}",
                self.name,
                record.timeline,
                last.timeline
            );
        }
        records.push_back(record);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Timeline of the oldest unretired record.
    pub fn oldest(&self) -> Option<Timeline> {
        self.records.lock().front().map(|r| r.timeline)
    }

    /// Timeline of the most recently pushed record.
    pub fn newest(&self) -> Option<Timeline> {
        self.records.lock().back().map(|r| r.timeline)
    }

    /// Releases records from the head for as long as `is_signaled`
    /// reports their timeline complete. Returns the number of retired
    /// records.
    ///
    /// Callbacks run without the queue lock held, they may push new
    /// records but must not retire the same queue.
    pub fn retire(&self, is_signaled: impl Fn(Timeline) -> bool) -> usize {
        let _retiring = self.retiring.lock();
        let mut retired = 0;

        loop {
            let head = {
                let mut records = self.records.lock();
                match records.front() {
                    Some(head) if is_signaled(head.timeline) => records.pop_front(),
                    _ => None,
                }
            };

            match head {
                Some(record) => {
                    record.release();
                    retired += 1;
                }
                None => break,
            }
        }

        retired
    }
}
