//! Loader thread: turns queued work items into per-frame command batches.
//!
//! Producers push work items and call `wake()`. Each successful wake
//! grants the loader one more frame to execute, as long as fewer than
//! `max_delay_frames` frames are in flight. For every granted frame the
//! loader reuses the next slot of the frame ring, runs the drained work
//! items against it and hands the resulting batches to the executive.

use crate::command::{CommandList, ComputeBatch, Domain, KeepAlive};
use crate::context::Shared;
use crate::device::FenceWaits;
use crate::error::StreamError;
use crate::executive::ExecutiveJob;
use crate::frame::{FrameRing, SlotFences};
use crate::pending::PendingRecord;
use crate::queue::{LoadQueue, LoadTaskArgs};
use crate::timeline::FenceWait;
use crate::tracker::{FinishTracker, FinishedFrames};
use crossbeam::channel::Sender;
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use stream_core::{impl_stats_struct, time_scope};

impl_stats_struct!(pub LoaderStats; slot_wait, build, submit);

/// Target value that tells the loader to exit.
const SHUTDOWN: u64 = u64::MAX;

struct LoaderState {
    /// Number of frames the loader is allowed to execute.
    target: u64,
    /// Number of frames the loader executed.
    executed: u64,
}

/// Frame credit shared between producers and the loader thread.
pub struct LoadScheduler {
    state: Mutex<LoaderState>,
    condvar: Condvar,
}

impl Default for LoadScheduler {
    fn default() -> Self {
        Self {
            state: Mutex::new(LoaderState { target: 0, executed: 0 }),
            condvar: Condvar::new(),
        }
    }
}

impl LoadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants the loader one more frame if there is queued work and fewer
    /// than `max_delay_frames` frames are unfinished. Returns whether the
    /// frame was granted.
    pub fn wake(&self, queue: &LoadQueue, finished: &FinishedFrames, max_delay_frames: u64) -> bool {
        let mut state = self.state.lock();
        if state.target == SHUTDOWN || queue.is_empty() {
            return false;
        }

        let in_flight = state.target.saturating_sub(finished.load());
        if in_flight >= max_delay_frames {
            warn!(
                "Load wake refused, {} frames in flight (max delay {})",
                in_flight, max_delay_frames
            );
            return false;
        }

        state.target += 1;
        trace!("Loader target frame is now {}", state.target);
        self.condvar.notify_one();
        true
    }

    /// Returns whether `wake()` would currently find room for another
    /// frame, without granting it.
    pub fn has_credit(&self, finished: &FinishedFrames, max_delay_frames: u64) -> bool {
        let state = self.state.lock();
        state.target != SHUTDOWN && state.target.saturating_sub(finished.load()) < max_delay_frames
    }

    #[inline]
    pub fn target(&self) -> u64 {
        self.state.lock().target
    }

    #[inline]
    pub fn executed(&self) -> u64 {
        self.state.lock().executed
    }

    /// Blocks until the loader may execute another frame. Returns its
    /// index, or `None` once shut down.
    fn next_frame(&self) -> Option<u64> {
        let mut state = self.state.lock();
        while state.executed >= state.target && state.target != SHUTDOWN {
            self.condvar.wait(&mut state);
        }
        match state.target {
            SHUTDOWN => None,
            _ => Some(state.executed),
        }
    }

    /// Returns the credit of a frame that found the queue empty.
    fn refund(&self) {
        let mut state = self.state.lock();
        if state.target != SHUTDOWN && state.target > state.executed {
            state.target -= 1;
        }
    }

    fn finish_frame(&self, frame: u64) {
        self.state.lock().executed = frame + 1;
    }

    /// Makes the loader exit after the frame it is currently building.
    pub fn shutdown(&self) {
        self.state.lock().target = SHUTDOWN;
        self.condvar.notify_all();
    }
}

pub(crate) fn spawn_loader(shared: Arc<Shared>, mut ring: FrameRing, executive: Sender<ExecutiveJob>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("Loader".into())
        .spawn(move || {
            info!("Loader thread started with {} frame slots", ring.depth());
            while let Some(frame) = shared.scheduler.next_frame() {
                if let Err(e) = run_frame(&shared, &mut ring, &executive, frame) {
                    debug!("Loader stopped in frame {}", frame);
                    shared.abort(e);
                    break;
                }
            }
            info!("Loader thread exited!");
        })
        .expect("cannot start loader thread")
}

fn run_frame(
    shared: &Arc<Shared>,
    ring: &mut FrameRing,
    executive: &Sender<ExecutiveJob>,
    frame: u64,
) -> Result<(), StreamError> {
    let slot = {
        time_scope!(shared.stats.slot_wait);
        ring.acquire(frame, |domain, timeline| shared.wait_fence(domain, timeline))?
    };

    let items = shared.queue.drain();
    if items.is_empty() {
        trace!("Frame {} found no work, returning its credit", frame);
        shared.scheduler.refund();
        return Ok(());
    }

    debug!("Building frame {} from {} work items", frame, items.len());
    let mut disk = CommandList::new();
    let mut memory = CommandList::new();
    let mut compute = ComputeBatch::new();
    {
        time_scope!(shared.stats.build);
        let mut args = LoadTaskArgs {
            arena: &mut slot.arena,
            disk: &mut disk,
            memory: &mut memory,
            compute: &mut compute,
            frame,
        };
        let built = panic::catch_unwind(AssertUnwindSafe(|| {
            for item in items {
                item(&mut args);
            }
        }));
        if let Err(payload) = built {
            return Err(StreamError::WorkItemPanicked {
                frame,
                message: panic_message(payload.as_ref()),
            });
        }
    }

    let mut resources = Vec::new();
    resources.append(&mut disk.keep_alive);
    resources.append(&mut memory.keep_alive);
    resources.append(&mut compute.keep_alive);
    let tracker: KeepAlive = FinishTracker::new(frame, shared.finished.clone(), resources);

    let compute_work = !compute.is_empty() || !compute.callbacks.is_empty();
    slot.fences.mark(Domain::Disk, !disk.is_empty());
    slot.fences.mark(Domain::Memory, !memory.is_empty());
    slot.fences.mark(Domain::Compute, compute_work);

    for list in [&mut disk, &mut memory].iter_mut() {
        if !list.is_empty() || list.needs_record() {
            list.keep_alive(tracker.clone());
        }
    }
    if compute_work {
        compute.keep_alive(tracker.clone());
    }

    let job_shared = shared.clone();
    let fences = slot.fences.clone();
    let job: ExecutiveJob = Box::new(move || {
        submit_frame(&job_shared, frame, &fences, disk, memory, compute)?;
        // released here if no domain holds on to it
        drop(tracker);
        Ok(())
    });

    shared.scheduler.finish_frame(frame);
    executive.send(job).map_err(|_| StreamError::Aborted)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Submits the batches of one frame: disk, then memory, then compute
/// behind device waits on the IO it consumes.
fn submit_frame(
    shared: &Shared,
    frame: u64,
    fences: &SlotFences,
    disk: CommandList,
    memory: CommandList,
    compute: ComputeBatch,
) -> Result<(), StreamError> {
    if shared.is_aborted() {
        return Err(StreamError::Aborted);
    }
    time_scope!(shared.stats.submit);

    let disk_work = !disk.is_empty();
    let disk_timeline = shared
        .disk
        .execute(disk, None)
        .map_err(|error| StreamError::Transfer {
            operation: "disk submission",
            error,
        })?;
    if disk_work {
        fences.record(Domain::Disk, disk_timeline);
    }

    let memory_work = !memory.is_empty();
    let memory_timeline = shared
        .memory
        .execute(memory, None)
        .map_err(|error| StreamError::Transfer {
            operation: "memory submission",
            error,
        })?;
    if memory_work {
        fences.record(Domain::Memory, memory_timeline);
    }

    if compute.is_empty() && compute.callbacks.is_empty() {
        trace!("Frame {} submitted without compute work", frame);
        return Ok(());
    }

    let mut waits = FenceWaits::new();
    if disk_work && compute.consumes(Domain::Disk) {
        waits.push(FenceWait::new(shared.disk.event(), disk_timeline));
    }
    if memory_work && compute.consumes(Domain::Memory) {
        waits.push(FenceWait::new(shared.memory.event(), memory_timeline));
    }

    let ComputeBatch {
        commands,
        callbacks,
        keep_alive,
        ..
    } = compute;
    let timeline = shared
        .device
        .submit_compute(commands, waits)
        .map_err(|error| StreamError::Device {
            operation: "compute submission",
            error,
        })?;
    fences.record(Domain::Compute, timeline);
    shared.compute.push(PendingRecord {
        timeline,
        files: Vec::new(),
        callbacks,
        keep_alive,
    });

    trace!(
        "Frame {} submitted (disk {}, memory {}, compute {})",
        frame,
        disk_timeline,
        memory_timeline,
        timeline
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::loader::LoadScheduler;
    use crate::queue::{LoadQueue, LoadTaskArgs};
    use crate::tracker::FinishedFrames;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn queue_with_item() -> LoadQueue {
        let queue = LoadQueue::new();
        queue.push(Box::new(|_: &mut LoadTaskArgs<'_>| {}));
        queue
    }

    #[test]
    fn wake_respects_max_delay() {
        let scheduler = LoadScheduler::new();
        let queue = queue_with_item();
        let finished = FinishedFrames::new();

        let granted = (0..3)
            .map(|_| scheduler.wake(&queue, &finished, 2))
            .collect::<Vec<_>>();

        assert_eq!(granted, vec![true, true, false]);
        assert_eq!(scheduler.target(), 2);

        finished.publish(0);
        assert!(scheduler.wake(&queue, &finished, 2));
        assert_eq!(scheduler.target(), 3);
    }

    #[test]
    fn credit_follows_finished_frames() {
        let scheduler = LoadScheduler::new();
        let queue = queue_with_item();
        let finished = FinishedFrames::new();

        assert!(scheduler.wake(&queue, &finished, 1));
        assert!(!scheduler.has_credit(&finished, 1));

        finished.publish(0);
        assert!(scheduler.has_credit(&finished, 1));
        assert_eq!(scheduler.target(), 1);

        scheduler.shutdown();
        assert!(!scheduler.has_credit(&finished, 1));
    }

    #[test]
    fn wake_ignores_empty_queue() {
        let scheduler = LoadScheduler::new();

        assert!(!scheduler.wake(&LoadQueue::new(), &FinishedFrames::new(), 2));
        assert_eq!(scheduler.target(), 0);
    }

    #[test]
    fn refund_returns_credit() {
        let scheduler = LoadScheduler::new();
        let queue = queue_with_item();
        let finished = FinishedFrames::new();
        scheduler.wake(&queue, &finished, 1);

        assert_eq!(scheduler.next_frame(), Some(0));
        scheduler.refund();

        assert_eq!(scheduler.target(), 0);
        assert!(scheduler.wake(&queue, &finished, 1));
    }

    #[test]
    fn next_frame_blocks_until_woken() {
        let scheduler = Arc::new(LoadScheduler::new());
        let queue = queue_with_item();

        let waiter = {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.next_frame())
        };
        thread::sleep(Duration::from_millis(20));
        scheduler.wake(&queue, &FinishedFrames::new(), 2);

        assert_eq!(waiter.join().unwrap(), Some(0));
    }

    #[test]
    fn shutdown_releases_loader() {
        let scheduler = Arc::new(LoadScheduler::new());

        let waiter = {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.next_frame())
        };
        thread::sleep(Duration::from_millis(20));
        scheduler.shutdown();

        assert_eq!(waiter.join().unwrap(), None);
        assert!(!scheduler.wake(&queue_with_item(), &FinishedFrames::new(), 2));
    }
}
