//! Tracking of fully finished frames.

use crate::command::KeepAlive;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of frames whose work fully completed in all domains. Only ever
/// grows.
#[derive(Clone, Default)]
pub struct FinishedFrames(Arc<AtomicU64>);

impl FinishedFrames {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Marks `frame` (and implicitly everything before it) finished.
    pub fn publish(&self, frame: u64) {
        self.0.fetch_max(frame + 1, Ordering::AcqRel);
    }
}

/// Publishes its frame as finished when the last reference is dropped.
///
/// A reference is attached to the pending record of each domain the
/// frame submitted work to, so the frame counts as finished once every
/// one of them retired. The resources the frame's work items asked to
/// keep alive are released at the same moment.
pub struct FinishTracker {
    frame: u64,
    finished: FinishedFrames,
    resources: Vec<KeepAlive>,
}

impl FinishTracker {
    pub fn new(frame: u64, finished: FinishedFrames, resources: Vec<KeepAlive>) -> Arc<Self> {
        Arc::new(Self {
            frame,
            finished,
            resources,
        })
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

impl Drop for FinishTracker {
    fn drop(&mut self) {
        debug!(
            "Frame {} finished, releasing {} resources",
            self.frame,
            self.resources.len()
        );
        self.resources.clear();
        self.finished.publish(self.frame);
    }
}
