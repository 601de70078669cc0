//! Transfer backend for systems without a DMA-offload storage queue.

use crate::arena::StagingArena;
use crate::backend::{wait_or_fault, TransferBackend};
use crate::command::{Destination, Source, TransferRequest};
use crate::device::{CopyOp, CopyTarget, Device};
use crate::error::TransferError;
use crate::timeline::{FenceWait, Timeline, TimelineEvent};
use bytes::BytesMut;
use crossbeam::channel::{unbounded, Sender};
use log::{debug, error, info, trace};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Unit of work executed by the worker thread.
type Job = Box<dyn FnOnce(&mut Worker) -> Result<(), TransferError> + Send + 'static>;

static WORKER_COUNTER: AtomicU32 = AtomicU32::new(0);

/// State owned by the worker thread.
struct Worker {
    device: Arc<dyn Device>,
    staging: StagingArena,
    copies: Vec<CopyOp>,
    flushes: u64,
}

impl Worker {
    fn execute(&mut self, request: TransferRequest) -> Result<(), TransferError> {
        let len = request.len();
        trace!("Fallback transfer of {} bytes into {:?}", len, request.destination);

        let TransferRequest {
            source, destination, ..
        } = request;
        let target = match destination {
            Destination::Memory { buffer, offset } => {
                // host destinations need no staging
                return buffer.with_range(offset, len, |dst| fill(&source, dst));
            }
            Destination::Buffer { buffer, offset } => CopyTarget::Buffer { buffer, offset },
            Destination::Texture { texture, region } => CopyTarget::Texture { texture, region },
        };

        let mut chunk = self.stage(len as usize)?;
        fill(&source, &mut chunk)?;
        self.copies.push(CopyOp {
            src: chunk.freeze(),
            dst: target,
        });
        Ok(())
    }

    /// Takes `len` bytes from the staging ring, flushing first when the
    /// ring is full.
    fn stage(&mut self, len: usize) -> Result<BytesMut, TransferError> {
        assert!(
            len <= self.staging.capacity(),
            "request of {} bytes exceeds staging ring of {} bytes",
            len,
            self.staging.capacity()
        );

        if let Some(chunk) = self.staging.alloc(len) {
            return Ok(chunk);
        }

        debug!("Staging ring full, flushing {} copies early", self.copies.len());
        self.flush()?;
        Ok(self
            .staging
            .alloc(len)
            .expect("empty staging ring must fit a request not larger than itself"))
    }

    /// Commits accumulated copies to the device and recycles the staging
    /// ring once the device is done reading it.
    fn flush(&mut self) -> Result<(), TransferError> {
        if self.copies.is_empty() {
            return Ok(());
        }

        let copies = std::mem::take(&mut self.copies);
        let timeline = self.device.submit_copies(copies)?;
        self.device.copy_fence().wait(timeline);
        self.staging.reset();
        self.flushes += 1;
        Ok(())
    }

    fn signal(&mut self, event: &TimelineEvent, value: Timeline) -> Result<(), TransferError> {
        self.flush()?;
        event.signal(value);
        Ok(())
    }
}

/// Copies the source bytes of a request into `dst`.
fn fill(source: &Source, dst: &mut [u8]) -> Result<(), TransferError> {
    match source {
        Source::File { file, offset } => file.read_at(*offset, dst),
        Source::Memory(bytes) => {
            dst.copy_from_slice(bytes);
            Ok(())
        }
    }
}

/// Backend with a dedicated worker thread performing blocking reads into
/// a staging ring and emitting copy commands to the device.
///
/// Host memory used for staging is bounded by the ring size regardless of
/// how many requests are queued.
pub struct FallbackBackend {
    name: &'static str,
    max_request_size: u64,
    staging_size: u64,
    recorded: Mutex<Vec<Job>>,
    tx: Mutex<Option<Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    fault: Arc<OnceCell<TransferError>>,
}

impl FallbackBackend {
    /// Creates the backend and starts its worker thread.
    pub fn new(name: &'static str, device: Arc<dyn Device>, staging_size: u64, max_request_size: u64) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let fault = Arc::new(OnceCell::new());

        let thread = {
            let fault = fault.clone();
            let mut worker = Worker {
                device,
                staging: StagingArena::new(staging_size as usize),
                copies: Vec::new(),
                flushes: 0,
            };

            std::thread::Builder::new()
                .name(format!(
                    "TransferWorker-{}",
                    WORKER_COUNTER.fetch_add(1, Ordering::SeqCst)
                ))
                .spawn(move || {
                    for job in rx.iter() {
                        // a faulted worker drops everything, signals never arrive
                        if fault.get().is_some() {
                            continue;
                        }
                        if let Err(e) = job(&mut worker) {
                            error!("Transfer worker of {:?} faulted: {}", name, e);
                            fault.set(e).ok();
                        }
                    }
                    if fault.get().is_none() {
                        if let Err(e) = worker.flush() {
                            error!("Final flush of {:?} failed: {}", name, e);
                        }
                    }
                    info!("Transfer worker of {:?} exited after {} flushes", name, worker.flushes);
                })
                .expect("cannot start transfer worker thread")
        };

        info!(
            "Created fallback transfer backend {:?} with {} bytes of staging",
            name, staging_size
        );

        Self {
            name,
            max_request_size: max_request_size.min(staging_size),
            staging_size,
            recorded: Mutex::new(Vec::new()),
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
            fault,
        }
    }

    fn record(&self, job: Job) -> Result<(), TransferError> {
        if let Some(fault) = self.fault.get() {
            return Err(TransferError::Faulted(Box::new(fault.clone())));
        }
        if self.tx.lock().is_none() {
            return Err(TransferError::QueueClosed);
        }
        self.recorded.lock().push(job);
        Ok(())
    }
}

impl TransferBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn max_request_size(&self) -> u64 {
        self.max_request_size
    }

    fn staging_budget(&self) -> u64 {
        self.staging_size
    }

    fn enqueue_request(&self, request: TransferRequest) -> Result<(), TransferError> {
        assert!(
            request.len() <= self.max_request_size,
            "request of {} bytes exceeds maximum of {} bytes of {:?}",
            request.len(),
            self.max_request_size,
            self.name
        );
        self.record(Box::new(move |worker| worker.execute(request)))
    }

    fn enqueue_wait(&self, wait: FenceWait) -> Result<(), TransferError> {
        self.record(Box::new(move |_| {
            wait.event.wait(wait.value);
            Ok(())
        }))
    }

    fn enqueue_signal(&self, event: &Arc<TimelineEvent>, value: Timeline) -> Result<(), TransferError> {
        let event = event.clone();
        self.record(Box::new(move |worker| worker.signal(&event, value)))
    }

    fn submit(&self) -> Result<(), TransferError> {
        let jobs = std::mem::take(&mut *self.recorded.lock());
        if jobs.is_empty() {
            return Ok(());
        }

        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(TransferError::QueueClosed)?;
        for job in jobs {
            tx.send(job).map_err(|_| TransferError::QueueClosed)?;
        }
        Ok(())
    }

    fn is_event_complete(&self, event: &TimelineEvent, value: Timeline) -> bool {
        event.is_complete(value)
    }

    fn sync_event(&self, event: &TimelineEvent, value: Timeline) -> Result<(), TransferError> {
        wait_or_fault(self, event, value)
    }

    fn fault(&self) -> Option<TransferError> {
        self.fault.get().cloned()
    }

    fn free_queue(&self) {
        self.tx.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Transfer worker of {:?} panicked", self.name);
            }
        }
    }
}

impl Drop for FallbackBackend {
    fn drop(&mut self) {
        self.free_queue();
    }
}
