//! The streaming context: one explicitly created instance owning the
//! load queue, the transfer services and the pipeline threads.

use crate::backend::{
    BlockingStorageQueue, DirectBackend, FallbackBackend, StorageQueue, TransferBackend, FAULT_POLL,
};
use crate::command::Domain;
use crate::config::{BackendKind, StreamingConfig};
use crate::device::Device;
use crate::error::{ConfigError, StreamError};
use crate::executive::Executive;
use crate::frame::{FrameRing, SlotFences};
use crate::housekeeping::{poll, Housekeeping};
use crate::loader::{spawn_loader, LoadScheduler, LoaderStats};
use crate::pending::PendingQueue;
use crate::queue::{LoadQueue, LoadTaskArgs};
use crate::service::TransferService;
use crate::timeline::Timeline;
use crate::tracker::FinishedFrames;
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use stream_core::notification::{notification, Receiver};

/// State shared by the context and its threads.
pub(crate) struct Shared {
    pub(crate) config: StreamingConfig,
    pub(crate) queue: LoadQueue,
    pub(crate) scheduler: LoadScheduler,
    pub(crate) disk: TransferService,
    pub(crate) memory: TransferService,
    pub(crate) device: Arc<dyn Device>,
    pub(crate) compute: PendingQueue,
    pub(crate) finished: FinishedFrames,
    pub(crate) stats: LoaderStats,
    failure: OnceCell<StreamError>,
    closed: AtomicBool,
    slot_fences: Vec<Arc<SlotFences>>,
}

impl Shared {
    pub(crate) fn wake(&self, max_delay_frames: u64) -> bool {
        self.scheduler.wake(&self.queue, &self.finished, max_delay_frames)
    }

    #[inline]
    pub(crate) fn is_aborted(&self) -> bool {
        self.failure.get().is_some()
    }

    /// Records the first fatal error and stops the pipeline. Nothing is
    /// submitted after this returns and every blocked pipeline thread is
    /// woken.
    pub(crate) fn abort(&self, error: StreamError) {
        if self.failure.set(error.clone()).is_err() {
            return;
        }

        error!("Streaming pipeline aborted: {}", error);
        self.scheduler.shutdown();
        self.slot_fences.iter().for_each(|f| f.abort());
        self.disk.event().notify();
        self.memory.event().notify();
        self.device.copy_fence().notify();
        self.device.compute_fence().notify();
    }

    /// Blocks until `timeline` of `domain` is signaled.
    pub(crate) fn wait_fence(&self, domain: Domain, timeline: Timeline) -> Result<(), StreamError> {
        match domain {
            Domain::Disk => self.disk.settle(timeline).map_err(|error| StreamError::Transfer {
                operation: "disk fence wait",
                error,
            }),
            Domain::Memory => self.memory.settle(timeline).map_err(|error| StreamError::Transfer {
                operation: "memory fence wait",
                error,
            }),
            Domain::Compute => {
                let fence = self.device.compute_fence();
                while !fence.wait_timeout(timeline, FAULT_POLL) {
                    if self.is_aborted() {
                        return Err(StreamError::Aborted);
                    }
                }
                Ok(())
            }
        }
    }
}

/// Completion handle of a resource queued with `StreamingContext::load`.
pub struct LoadTicket {
    loaded: Receiver,
    shared: Arc<Shared>,
}

impl LoadTicket {
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_signaled()
    }

    /// Blocks until the resource was loaded. Fails if the pipeline was
    /// aborted or shut down before that happened.
    pub fn wait(&self) -> Result<(), StreamError> {
        loop {
            if self.loaded.wait_timeout(FAULT_POLL) {
                return Ok(());
            }
            if let Some(failure) = self.shared.failure.get() {
                return Err(failure.clone());
            }
            if self.shared.closed.load(Ordering::Acquire) && !self.loaded.is_signaled() {
                return Err(StreamError::Aborted);
            }
        }
    }
}

/// Asynchronous streaming of resource bytes into device memory.
///
/// Producers queue work items with `push()` (or `load()`) from any
/// thread and call `wake()` once per logical frame. The context must be
/// shut down explicitly with `shutdown()` or by dropping it.
pub struct StreamingContext {
    shared: Arc<Shared>,
    loader: Option<JoinHandle<()>>,
    executive: Executive,
    housekeeping: Option<Housekeeping>,
}

impl StreamingContext {
    /// Creates the context and starts its threads. The backend named in
    /// `config` is used for both the disk and the memory service. The
    /// direct backend is driven by a `BlockingStorageQueue`.
    pub fn new(config: StreamingConfig, device: Arc<dyn Device>) -> Result<Self, ConfigError> {
        config.validate()?;

        let (disk, memory): (Arc<dyn TransferBackend>, Arc<dyn TransferBackend>) = match config.backend {
            BackendKind::Direct => (
                Arc::new(DirectBackend::new(Box::new(BlockingStorageQueue::new(
                    config.max_request_size,
                )))),
                Arc::new(DirectBackend::new(Box::new(BlockingStorageQueue::new(
                    config.max_request_size,
                )))),
            ),
            BackendKind::Fallback => (
                Arc::new(FallbackBackend::new(
                    "disk",
                    device.clone(),
                    config.staging_size,
                    config.fallback_request_size(),
                )),
                Arc::new(FallbackBackend::new(
                    "memory",
                    device.clone(),
                    config.staging_size,
                    config.fallback_request_size(),
                )),
            ),
        };

        Ok(Self::with_backends(config, device, disk, memory))
    }

    /// Creates the context on the direct backend driven by the given
    /// storage queues, ignoring the backend named in `config`.
    pub fn with_storage_queues(
        config: StreamingConfig,
        device: Arc<dyn Device>,
        disk: Box<dyn StorageQueue>,
        memory: Box<dyn StorageQueue>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.backend != BackendKind::Direct {
            warn!("Storage queues were supplied, using the direct backend");
        }

        Ok(Self::with_backends(
            config,
            device,
            Arc::new(DirectBackend::new(disk)),
            Arc::new(DirectBackend::new(memory)),
        ))
    }

    fn with_backends(
        config: StreamingConfig,
        device: Arc<dyn Device>,
        disk: Arc<dyn TransferBackend>,
        memory: Arc<dyn TransferBackend>,
    ) -> Self {
        info!(
            "Creating streaming context ({} disk backend, {} memory backend, {} frame slots)",
            disk.name(),
            memory.name(),
            config.ring_depth
        );

        let ring = FrameRing::new(config.ring_depth, config.frame_arena_size as usize);
        let shared = Arc::new(Shared {
            queue: LoadQueue::new(),
            scheduler: LoadScheduler::new(),
            disk: TransferService::new("disk", disk, config.fragment_size, config.spin_limit),
            memory: TransferService::new("memory", memory, config.fragment_size, config.spin_limit),
            device,
            compute: PendingQueue::new("compute"),
            finished: FinishedFrames::new(),
            stats: LoaderStats::default(),
            failure: OnceCell::new(),
            closed: AtomicBool::new(false),
            slot_fences: ring.fences(),
            config,
        });

        let (executive, executive_tx) = {
            let shared = shared.clone();
            Executive::new(move |e| shared.abort(e))
        };
        let loader = spawn_loader(shared.clone(), ring, executive_tx);
        let housekeeping = shared
            .config
            .housekeeping_interval()
            .map(|interval| Housekeeping::new(shared.clone(), interval));

        Self {
            shared,
            loader: Some(loader),
            executive,
            housekeeping,
        }
    }

    #[inline]
    pub fn config(&self) -> &StreamingConfig {
        &self.shared.config
    }

    /// Queues a work item. It runs on the loader thread in a later frame.
    pub fn push(&self, item: impl FnOnce(&mut LoadTaskArgs<'_>) + Send + 'static) {
        self.shared.queue.push(Box::new(item));
    }

    /// Queues a work item and returns a ticket that completes once the
    /// IO of its frame and its compute work finished.
    pub fn load(&self, item: impl FnOnce(&mut LoadTaskArgs<'_>) + Send + 'static) -> LoadTicket {
        let (tx, rx) = notification();
        self.push(move |args: &mut LoadTaskArgs<'_>| {
            item(args);
            args.compute.consume(Domain::Disk);
            args.compute.consume(Domain::Memory);
            args.compute.on_complete(move || tx.signal());
        });
        LoadTicket {
            loaded: rx,
            shared: self.shared.clone(),
        }
    }

    /// Lets the loader execute one more frame, with the configured
    /// maximum delay. Returns whether the frame was granted.
    pub fn wake(&self) -> bool {
        self.wake_with(self.shared.config.max_delay_frames)
    }

    /// Lets the loader execute one more frame if there is queued work and
    /// fewer than `max_delay_frames` frames are unfinished.
    pub fn wake_with(&self, max_delay_frames: u64) -> bool {
        self.shared.wake(max_delay_frames)
    }

    /// Retires completed work. Needed only when the housekeeping thread
    /// is disabled.
    pub fn poll(&self) -> usize {
        poll(&self.shared)
    }

    /// Number of frames whose work fully completed.
    #[inline]
    pub fn finished_frame(&self) -> u64 {
        self.shared.finished.load()
    }

    /// Number of frames the loader was allowed to execute.
    #[inline]
    pub fn target_frame(&self) -> u64 {
        self.shared.scheduler.target()
    }

    #[inline]
    pub fn executed_frame(&self) -> u64 {
        self.shared.scheduler.executed()
    }

    #[inline]
    pub fn stats(&self) -> &LoaderStats {
        &self.shared.stats
    }

    #[inline]
    pub fn disk(&self) -> &TransferService {
        &self.shared.disk
    }

    #[inline]
    pub fn memory(&self) -> &TransferService {
        &self.shared.memory
    }

    /// The fatal error that aborted the pipeline, if any.
    pub fn failure(&self) -> Option<StreamError> {
        self.shared.failure.get().cloned()
    }

    /// Stops the pipeline threads, waits for submitted work, releases
    /// its records and frees the backend queues. Work items that are
    /// still queued are dropped.
    pub fn shutdown(&mut self) {
        let loader = match self.loader.take() {
            Some(loader) => loader,
            None => return,
        };

        info!("Shutting down streaming context");
        self.shared.scheduler.shutdown();
        if loader.join().is_err() {
            error!("Loader thread panicked");
        }
        self.executive.finish();
        if let Some(mut housekeeping) = self.housekeeping.take() {
            housekeeping.finish();
        }

        if !self.shared.is_aborted() {
            let outstanding = [
                (Domain::Disk, self.shared.disk.last_issued()),
                (Domain::Memory, self.shared.memory.last_issued()),
                (Domain::Compute, self.shared.compute.newest().unwrap_or(0)),
            ];
            for (domain, timeline) in outstanding.iter().copied() {
                if let Err(e) = self.shared.wait_fence(domain, timeline) {
                    error!("Cannot finish {:?} work during shutdown: {}", domain, e);
                }
            }
        }

        self.shared.closed.store(true, Ordering::Release);
        poll(&self.shared);
        self.shared.disk.free();
        self.shared.memory.free();
        info!("Streaming context shut down");
    }
}

impl Drop for StreamingContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::BlockingStorageQueue;
    use crate::command::{Domain, HostBuffer, TransferRequest};
    use crate::config::{BackendKind, StreamingConfig};
    use crate::context::StreamingContext;
    use crate::device::{
        CopyOp, Device, DeviceBuffer, DeviceCommand, DeviceTexture, FenceWaits, SoftDevice,
        TextureFormat,
    };
    use crate::error::{DeviceError, StreamError};
    use crate::file::StreamFile;
    use crate::queue::LoadTaskArgs;
    use crate::timeline::{Timeline, TimelineEvent};
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn config(backend: BackendKind) -> StreamingConfig {
        StreamingConfig {
            backend,
            frame_arena_size: 4096,
            max_request_size: 1024,
            staging_size: 2048,
            fragment_size: 256,
            housekeeping_interval_ms: 1,
            ..StreamingConfig::default()
        }
    }

    fn wait_until(what: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !what() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn temp_file(data: &[u8]) -> (tempfile::NamedTempFile, Arc<StreamFile>) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(data).unwrap();
        let file = StreamFile::open(tmp.path()).unwrap();
        (tmp, file)
    }

    fn streams_file(backend: BackendKind) {
        let data = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let (_tmp, file) = temp_file(&data);
        let ctx = StreamingContext::new(config(backend), SoftDevice::new()).unwrap();
        let buffer = DeviceBuffer::new("mesh", data.len());

        let ticket = {
            let buffer = buffer.clone();
            ctx.load(move |args| {
                args.disk
                    .push(TransferRequest::file_to_buffer(&file, 0, &buffer, 0, file.len()));
                args.disk.own_file(file);
            })
        };
        assert!(ctx.wake());
        ticket.wait().unwrap();

        assert_eq!(buffer.contents(), data);
        wait_until(|| ctx.finished_frame() == 1);
        assert!(ctx.stats().build.runs() >= 1);
    }

    #[test]
    fn streams_file_on_fallback_backend() {
        streams_file(BackendKind::Fallback);
    }

    #[test]
    fn streams_file_on_direct_backend() {
        streams_file(BackendKind::Direct);
    }

    #[test]
    fn staged_memory_into_texture_and_host() {
        let ctx = StreamingContext::new(config(BackendKind::Fallback), SoftDevice::new()).unwrap();
        let texture = DeviceTexture::new("albedo", TextureFormat::BC1, [8, 8, 1], 1);
        let host = HostBuffer::new("readback", 16);
        let pixels = (0..32u8).collect::<Vec<_>>();

        let ticket = {
            let texture = texture.clone();
            let host = host.clone();
            let pixels = pixels.clone();
            ctx.load(move |args| {
                let staged = args.stage(&pixels);
                let region = texture.mip_region(0);
                args.memory
                    .push(TransferRequest::memory_to_texture(staged, &texture, region));
                let header = args.stage(&[9; 16]);
                args.memory.push(TransferRequest::memory_to_memory(header, &host, 0));
            })
        };
        ctx.wake();
        ticket.wait().unwrap();

        assert_eq!(texture.read_region(&texture.mip_region(0)), pixels);
        assert_eq!(host.contents(), vec![9; 16]);
    }

    #[test]
    fn items_of_one_wake_run_in_order_in_one_frame() {
        let ctx = StreamingContext::new(config(BackendKind::Fallback), SoftDevice::new()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut tickets = Vec::new();
        for i in 0..10 {
            let log = log.clone();
            tickets.push(ctx.load(move |args: &mut LoadTaskArgs<'_>| log.lock().push((args.frame, i))));
        }
        ctx.wake();
        tickets.iter().for_each(|t| t.wait().unwrap());

        let frames = log.lock().iter().map(|(f, _)| *f).collect::<Vec<_>>();
        let order = log.lock().iter().map(|(_, i)| *i).collect::<Vec<_>>();
        assert!(frames.iter().all(|f| *f == 0));
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn compute_waits_for_consumed_io() {
        let data = vec![42u8; 3000];
        let (_tmp, file) = temp_file(&data);
        let ctx = StreamingContext::new(config(BackendKind::Fallback), SoftDevice::new()).unwrap();
        let buffer = DeviceBuffer::new("vertices", data.len());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let ticket = {
            let buffer = buffer.clone();
            let seen = seen.clone();
            ctx.load(move |args| {
                args.disk
                    .push(TransferRequest::file_to_buffer(&file, 0, &buffer, 0, file.len()));
                let reader = buffer.clone();
                args.compute.record(move || *seen.lock() = reader.contents());
                args.compute.consume(Domain::Disk);
            })
        };
        ctx.wake();
        ticket.wait().unwrap();

        assert_eq!(*seen.lock(), data);
    }

    #[test]
    fn backpressure_bound_holds() {
        let config = StreamingConfig {
            housekeeping_interval_ms: 0,
            ..config(BackendKind::Fallback)
        };
        let max_delay = config.max_delay_frames;
        let ctx = Arc::new(StreamingContext::new(config, SoftDevice::new()).unwrap());
        let host = HostBuffer::new("h", 8);

        let producers = (0..4)
            .map(|_| {
                let ctx = ctx.clone();
                let host = host.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let host = host.clone();
                        ctx.push(move |args| {
                            let bytes = args.stage(&[1; 8]);
                            args.memory.push(TransferRequest::memory_to_memory(bytes, &host, 0));
                        });
                        ctx.wake();
                        assert!(ctx.target_frame().saturating_sub(ctx.finished_frame()) <= max_delay);
                        ctx.poll();
                    }
                })
            })
            .collect::<Vec<_>>();
        producers.into_iter().for_each(|p| p.join().unwrap());

        assert!(ctx.target_frame().saturating_sub(ctx.finished_frame()) <= max_delay);
    }

    #[test]
    fn refused_work_is_picked_up_after_retire() {
        let ctx = StreamingContext::new(config(BackendKind::Fallback), SoftDevice::new()).unwrap();
        let host = HostBuffer::new("h", 4);

        let tickets = (0..4)
            .map(|_| {
                let host = host.clone();
                let ticket = ctx.load(move |args| {
                    let bytes = args.stage(&[3; 4]);
                    args.memory.push(TransferRequest::memory_to_memory(bytes, &host, 0));
                });
                ctx.wake_with(1);
                ticket
            })
            .collect::<Vec<_>>();

        // no further wake calls, housekeeping re-wakes the loader
        tickets.iter().for_each(|t| t.wait().unwrap());
    }

    #[test]
    fn refused_work_is_picked_up_after_frame_without_records() {
        let config = StreamingConfig {
            max_delay_frames: 1,
            ..config(BackendKind::Fallback)
        };
        let ctx = StreamingContext::new(config, SoftDevice::new()).unwrap();
        let host = HostBuffer::new("h", 4);

        ctx.push(|_| std::thread::sleep(Duration::from_millis(100)));
        assert!(ctx.wake());
        let ticket = {
            let host = host.clone();
            ctx.load(move |args| {
                let bytes = args.stage(&[7; 4]);
                args.memory.push(TransferRequest::memory_to_memory(bytes, &host, 0));
            })
        };
        assert!(!ctx.wake());

        ticket.wait().unwrap();
        assert_eq!(host.contents(), vec![7; 4]);
    }

    #[test]
    fn shutdown_runs_outstanding_callbacks() {
        let config = StreamingConfig {
            housekeeping_interval_ms: 0,
            ..config(BackendKind::Direct)
        };
        let mut ctx = StreamingContext::new(config, SoftDevice::new()).unwrap();
        let host = HostBuffer::new("h", 4);
        let done = Arc::new(Mutex::new(false));

        {
            let done = done.clone();
            let host = host.clone();
            ctx.push(move |args| {
                let bytes = args.stage(&[5; 4]);
                args.disk.push(TransferRequest::memory_to_memory(bytes, &host, 0));
                args.disk.on_complete(move || *done.lock() = true);
            });
        }
        ctx.wake();
        wait_until(|| ctx.executed_frame() == 1);
        ctx.shutdown();

        assert!(*done.lock());
        assert_eq!(host.contents(), vec![5; 4]);
        assert!(!ctx.wake());
    }

    /// Device whose compute queue rejects every submission.
    struct BrokenCompute(Arc<SoftDevice>);

    impl Device for BrokenCompute {
        fn submit_copies(&self, copies: Vec<CopyOp>) -> Result<Timeline, DeviceError> {
            self.0.submit_copies(copies)
        }

        fn submit_compute(&self, _: Vec<DeviceCommand>, _: FenceWaits) -> Result<Timeline, DeviceError> {
            Err(DeviceError::SubmissionFailed("compute queue is broken".into()))
        }

        fn copy_fence(&self) -> &Arc<TimelineEvent> {
            self.0.copy_fence()
        }

        fn compute_fence(&self) -> &Arc<TimelineEvent> {
            self.0.compute_fence()
        }
    }

    #[test]
    fn device_failure_aborts_pipeline() {
        let device = Arc::new(BrokenCompute(SoftDevice::new()));
        let ctx = StreamingContext::new(config(BackendKind::Fallback), device).unwrap();

        let ticket = ctx.load(|args| args.compute.record(|| {}));
        ctx.wake();

        assert!(matches!(ticket.wait(), Err(StreamError::Device { .. })));
        assert!(matches!(ctx.failure(), Some(StreamError::Device { .. })));
        ctx.push(|_| {});
        assert!(!ctx.wake());
    }

    #[test]
    fn panicking_work_item_aborts_pipeline() {
        let ctx = StreamingContext::new(config(BackendKind::Fallback), SoftDevice::new()).unwrap();
        let host = HostBuffer::new("small", 4);

        let ticket = ctx.load(move |args| {
            let bytes = args.stage(&[1; 8]);
            args.memory.push(TransferRequest::memory_to_memory(bytes, &host, 0));
        });
        ctx.wake();

        assert!(matches!(ticket.wait(), Err(StreamError::WorkItemPanicked { frame: 0, .. })));
        assert!(matches!(ctx.failure(), Some(StreamError::WorkItemPanicked { .. })));
        ctx.push(|_| {});
        assert!(!ctx.wake());
    }

    #[test]
    fn direct_backend_with_supplied_queues() {
        let ctx = StreamingContext::with_storage_queues(
            config(BackendKind::Fallback),
            SoftDevice::new(),
            Box::new(BlockingStorageQueue::new(64)),
            Box::new(BlockingStorageQueue::new(64)),
        )
        .unwrap();
        let buffer = DeviceBuffer::new("b", 200);

        let ticket = {
            let buffer = buffer.clone();
            ctx.load(move |args| {
                let bytes = args.stage(&[8; 200]);
                args.memory.push(TransferRequest::memory_to_buffer(bytes, &buffer, 0));
            })
        };
        ctx.wake();
        ticket.wait().unwrap();

        assert_eq!(ctx.memory().backend().name(), "direct");
        assert_eq!(buffer.contents(), vec![8; 200]);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = StreamingConfig {
            ring_depth: 0,
            ..StreamingConfig::default()
        };

        assert!(StreamingContext::new(config, SoftDevice::new()).is_err());
    }
}
