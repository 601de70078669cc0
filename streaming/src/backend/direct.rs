//! Transfer backend submitting straight to a DMA-offload storage queue.

use crate::backend::{wait_or_fault, TransferBackend};
use crate::command::{Destination, Source, TransferRequest};
use crate::error::TransferError;
use crate::timeline::{FenceWait, Timeline, TimelineEvent};
use log::{info, trace};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;

/// Interface of an OS storage queue that reads files directly into
/// device visible memory.
pub trait StorageQueue: Send + Sync {
    /// Largest request the queue accepts.
    fn max_request_size(&self) -> u64;

    fn enqueue_request(&self, request: TransferRequest) -> Result<(), TransferError>;

    fn enqueue_wait(&self, wait: FenceWait) -> Result<(), TransferError>;

    fn enqueue_signal(&self, event: Arc<TimelineEvent>, value: Timeline) -> Result<(), TransferError>;

    fn submit(&self) -> Result<(), TransferError>;

    /// First error the queue reported, if any.
    fn error(&self) -> Option<TransferError>;

    fn close(&self);
}

/// Thin backend that forwards everything to a `StorageQueue`.
pub struct DirectBackend {
    queue: Box<dyn StorageQueue>,
}

impl DirectBackend {
    pub fn new(queue: Box<dyn StorageQueue>) -> Self {
        info!(
            "Created direct transfer backend (max request {} bytes)",
            queue.max_request_size()
        );
        Self { queue }
    }
}

impl TransferBackend for DirectBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn max_request_size(&self) -> u64 {
        self.queue.max_request_size()
    }

    fn staging_budget(&self) -> u64 {
        // no staging, batch up to what one request could move
        self.queue.max_request_size()
    }

    fn enqueue_request(&self, request: TransferRequest) -> Result<(), TransferError> {
        self.queue.enqueue_request(request)
    }

    fn enqueue_wait(&self, wait: FenceWait) -> Result<(), TransferError> {
        self.queue.enqueue_wait(wait)
    }

    fn enqueue_signal(&self, event: &Arc<TimelineEvent>, value: Timeline) -> Result<(), TransferError> {
        self.queue.enqueue_signal(event.clone(), value)
    }

    fn submit(&self) -> Result<(), TransferError> {
        self.queue.submit()
    }

    fn is_event_complete(&self, event: &TimelineEvent, value: Timeline) -> bool {
        event.is_complete(value)
    }

    fn sync_event(&self, event: &TimelineEvent, value: Timeline) -> Result<(), TransferError> {
        wait_or_fault(self, event, value)
    }

    fn fault(&self) -> Option<TransferError> {
        self.queue.error()
    }

    fn free_queue(&self) {
        self.queue.close();
    }
}

enum QueuedOp {
    Request(TransferRequest),
    Wait(FenceWait),
    Signal(Arc<TimelineEvent>, Timeline),
}

/// A `StorageQueue` that executes its work at submit time on the
/// submitting thread, writing straight into destinations. It is meant for
/// devices whose resources live in host visible (unified) memory.
pub struct BlockingStorageQueue {
    max_request_size: u64,
    recorded: Mutex<Vec<QueuedOp>>,
    closed: Mutex<bool>,
    error: OnceCell<TransferError>,
}

impl BlockingStorageQueue {
    pub fn new(max_request_size: u64) -> Self {
        Self {
            max_request_size,
            recorded: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
            error: OnceCell::new(),
        }
    }

    fn record(&self, op: QueuedOp) -> Result<(), TransferError> {
        if *self.closed.lock() {
            return Err(TransferError::QueueClosed);
        }
        self.recorded.lock().push(op);
        Ok(())
    }

    fn execute(request: TransferRequest) -> Result<(), TransferError> {
        trace!("Direct transfer of {} bytes into {:?}", request.len(), request.destination);

        let read = |dst: &mut [u8]| match &request.source {
            Source::File { file, offset } => file.read_at(*offset, dst),
            Source::Memory(bytes) => {
                dst.copy_from_slice(bytes);
                Ok(())
            }
        };

        match &request.destination {
            Destination::Memory { buffer, offset } => buffer.with_range(*offset, request.len(), read),
            Destination::Buffer { buffer, offset } => {
                let mut data = vec![0; request.len() as usize];
                read(&mut data)?;
                buffer.write(*offset, &data);
                Ok(())
            }
            Destination::Texture { texture, region } => {
                let mut data = vec![0; request.len() as usize];
                read(&mut data)?;
                texture.write_region(region, &data);
                Ok(())
            }
        }
    }
}

impl StorageQueue for BlockingStorageQueue {
    fn max_request_size(&self) -> u64 {
        self.max_request_size
    }

    fn enqueue_request(&self, request: TransferRequest) -> Result<(), TransferError> {
        assert!(
            request.len() <= self.max_request_size,
            "request of {} bytes exceeds maximum of {} bytes",
            request.len(),
            self.max_request_size
        );
        self.record(QueuedOp::Request(request))
    }

    fn enqueue_wait(&self, wait: FenceWait) -> Result<(), TransferError> {
        self.record(QueuedOp::Wait(wait))
    }

    fn enqueue_signal(&self, event: Arc<TimelineEvent>, value: Timeline) -> Result<(), TransferError> {
        self.record(QueuedOp::Signal(event, value))
    }

    fn submit(&self) -> Result<(), TransferError> {
        if let Some(e) = self.error.get() {
            return Err(TransferError::Faulted(Box::new(e.clone())));
        }

        let ops = std::mem::take(&mut *self.recorded.lock());
        for op in ops {
            match op {
                QueuedOp::Request(request) => {
                    if let Err(e) = Self::execute(request) {
                        self.error.set(e.clone()).ok();
                        return Err(e);
                    }
                }
                QueuedOp::Wait(wait) => wait.event.wait(wait.value),
                QueuedOp::Signal(event, value) => event.signal(value),
            }
        }
        Ok(())
    }

    fn error(&self) -> Option<TransferError> {
        self.error.get().cloned()
    }

    fn close(&self) {
        *self.closed.lock() = true;
        self.recorded.lock().clear();
    }
}
