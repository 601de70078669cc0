//! Completion housekeeping: retires finished records of all three
//! domains and re-wakes the loader when queued work is waiting and
//! frame credit is available.

use crate::context::Shared;
use crate::error::StreamError;
use crossbeam::channel::{bounded, select, tick, Sender};
use log::{error, info, trace};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Retires every signaled record at the head of the disk, memory and
/// compute FIFOs and grants queued work a frame when there is room.
/// Returns the number of retired records. A faulted transfer backend
/// aborts the pipeline.
pub(crate) fn poll(shared: &Shared) -> usize {
    for service in [&shared.disk, &shared.memory].iter() {
        if let Some(error) = service.backend().fault() {
            shared.abort(StreamError::Transfer {
                operation: service.name(),
                error,
            });
        }
    }

    let device_fence = shared.device.compute_fence();
    let retired = shared.disk.retire()
        + shared.memory.retire()
        + shared.compute.retire(|t| device_fence.is_complete(t));

    if retired > 0 {
        trace!("Housekeeping retired {} records", retired);
    }

    // frames without records finish without retiring anything
    let max_delay = shared.config.max_delay_frames;
    if !shared.queue.is_empty() && shared.scheduler.has_credit(&shared.finished, max_delay) {
        shared.wake(max_delay);
    }

    retired
}

/// Low priority thread calling `poll()` on a fixed interval.
pub(crate) struct Housekeeping {
    finish_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Housekeeping {
    pub fn new(shared: Arc<Shared>, interval: Duration) -> Self {
        let (finish_tx, finish_rx) = bounded(1);
        let ticker = tick(interval);

        let thread = std::thread::Builder::new()
            .name("Housekeeping".into())
            .spawn(move || {
                info!("Housekeeping thread started ({:?} interval)", interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            poll(&shared);
                        },
                        recv(finish_rx) -> _ => break,
                    }
                }
                info!("Housekeeping thread exited!");
            })
            .expect("cannot start housekeeping thread");

        Self {
            finish_tx,
            thread: Some(thread),
        }
    }

    pub fn finish(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.finish_tx.send(()).ok();
            if thread.join().is_err() {
                error!("Housekeeping thread panicked");
            }
        }
    }
}

impl Drop for Housekeeping {
    fn drop(&mut self) {
        self.finish();
    }
}
