//! Transfer requests and the per-domain command batches built by work
//! items.

use crate::device::{DeviceBuffer, DeviceCommand, DeviceTexture, TextureRegion};
use crate::file::StreamFile;
use bytes::Bytes;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Invoked once after the work it was attached to completed.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Anything that must stay alive until the work it was attached to
/// completed.
pub type KeepAlive = Arc<dyn Any + Send + Sync>;

/// The three execution domains of the pipeline.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Domain {
    Disk,
    Memory,
    Compute,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Disk, Domain::Memory, Domain::Compute];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Domain::Disk => 0,
            Domain::Memory => 1,
            Domain::Compute => 2,
        }
    }
}

/// Host memory region that transfers can target.
#[derive(Clone)]
pub struct HostBuffer(Arc<(String, RwLock<Vec<u8>>)>);

impl HostBuffer {
    pub fn new(label: impl Into<String>, len: usize) -> Self {
        HostBuffer(Arc::new((label.into(), RwLock::new(vec![0; len]))))
    }

    #[inline]
    pub fn label(&self) -> &str {
        &(self.0).0
    }

    #[inline]
    pub fn len(&self) -> u64 {
        (self.0).1.read().len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contents(&self) -> Vec<u8> {
        (self.0).1.read().clone()
    }

    /// Runs `f` with mutable access to `len` bytes at `offset`.
    pub(crate) fn with_range<R>(&self, offset: u64, len: u64, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = (self.0).1.write();
        let start = offset as usize;
        f(&mut data[start..start + len as usize])
    }
}

impl Debug for HostBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HostBuffer").field(&self.label()).finish()
    }
}

/// Where the bytes of a request come from.
#[derive(Clone, Debug)]
pub enum Source {
    File { file: Arc<StreamFile>, offset: u64 },
    Memory(Bytes),
}

/// Where the bytes of a request go to.
#[derive(Clone, Debug)]
pub enum Destination {
    Memory { buffer: HostBuffer, offset: u64 },
    Buffer { buffer: DeviceBuffer, offset: u64 },
    Texture { texture: DeviceTexture, region: TextureRegion },
}

/// One byte range copy. Requests are validated on construction, a bad
/// request is a bug in the caller and panics right away.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub source: Source,
    pub destination: Destination,
    len: u64,
}

impl TransferRequest {
    pub fn new(source: Source, destination: Destination, len: u64) -> Self {
        assert!(len > 0, "zero-length transfer into {:?}", destination);

        match &source {
            Source::File { file, offset } => assert!(
                offset + len <= file.len(),
                "read of {} bytes at offset {} is past the end of {:?} ({} bytes)",
                len,
                offset,
                file.path(),
                file.len()
            ),
            Source::Memory(bytes) => assert_eq!(
                bytes.len() as u64,
                len,
                "memory source size does not match transfer size into {:?}",
                destination
            ),
        }

        match &destination {
            Destination::Memory { buffer, offset } => assert!(
                offset + len <= buffer.len(),
                "transfer of {} bytes at offset {} overflows {:?}",
                len,
                offset,
                buffer
            ),
            Destination::Buffer { buffer, offset } => assert!(
                offset + len <= buffer.len(),
                "transfer of {} bytes at offset {} overflows {:?}",
                len,
                offset,
                buffer
            ),
            Destination::Texture { texture, region } => assert_eq!(
                region.byte_size(texture.format()),
                len,
                "transfer size does not match region {:?} of {:?}",
                region,
                texture
            ),
        }

        Self {
            source,
            destination,
            len,
        }
    }

    pub fn file_to_memory(file: &Arc<StreamFile>, offset: u64, buffer: &HostBuffer, dst_offset: u64, len: u64) -> Self {
        Self::new(
            Source::File { file: file.clone(), offset },
            Destination::Memory { buffer: buffer.clone(), offset: dst_offset },
            len,
        )
    }

    pub fn file_to_buffer(file: &Arc<StreamFile>, offset: u64, buffer: &DeviceBuffer, dst_offset: u64, len: u64) -> Self {
        Self::new(
            Source::File { file: file.clone(), offset },
            Destination::Buffer { buffer: buffer.clone(), offset: dst_offset },
            len,
        )
    }

    pub fn file_to_texture(file: &Arc<StreamFile>, offset: u64, texture: &DeviceTexture, region: TextureRegion) -> Self {
        let len = region.byte_size(texture.format());
        Self::new(
            Source::File { file: file.clone(), offset },
            Destination::Texture { texture: texture.clone(), region },
            len,
        )
    }

    pub fn memory_to_memory(bytes: Bytes, buffer: &HostBuffer, dst_offset: u64) -> Self {
        let len = bytes.len() as u64;
        Self::new(
            Source::Memory(bytes),
            Destination::Memory { buffer: buffer.clone(), offset: dst_offset },
            len,
        )
    }

    pub fn memory_to_buffer(bytes: Bytes, buffer: &DeviceBuffer, dst_offset: u64) -> Self {
        let len = bytes.len() as u64;
        Self::new(
            Source::Memory(bytes),
            Destination::Buffer { buffer: buffer.clone(), offset: dst_offset },
            len,
        )
    }

    pub fn memory_to_texture(bytes: Bytes, texture: &DeviceTexture, region: TextureRegion) -> Self {
        let len = bytes.len() as u64;
        Self::new(
            Source::Memory(bytes),
            Destination::Texture { texture: texture.clone(), region },
            len,
        )
    }

    /// Number of bytes this request moves.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Ordered list of transfers for the submission service, together with
/// what should be released or invoked once all of them completed.
#[derive(Default)]
pub struct CommandList {
    pub(crate) requests: Vec<TransferRequest>,
    pub(crate) files: Vec<Arc<StreamFile>>,
    pub(crate) callbacks: Vec<Callback>,
    pub(crate) keep_alive: Vec<KeepAlive>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: TransferRequest) {
        self.requests.push(request);
    }

    /// Transfers ownership of `file` to the list. It is closed after the
    /// transfers completed.
    pub fn own_file(&mut self, file: Arc<StreamFile>) {
        self.files.push(file);
    }

    pub fn on_complete(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn keep_alive(&mut self, object: KeepAlive) {
        self.keep_alive.push(object);
    }

    /// Whether the list carries no transfers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn requests(&self) -> &[TransferRequest] {
        &self.requests
    }

    /// Total number of bytes moved by the list.
    pub fn byte_size(&self) -> u64 {
        self.requests.iter().map(TransferRequest::len).sum()
    }

    pub(crate) fn needs_record(&self) -> bool {
        !self.files.is_empty() || !self.callbacks.is_empty() || !self.keep_alive.is_empty()
    }
}

impl Debug for CommandList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("requests", &self.requests.len())
            .field("files", &self.files.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Device work recorded by work items for one frame.
#[derive(Default)]
pub struct ComputeBatch {
    pub(crate) commands: Vec<DeviceCommand>,
    pub(crate) consumes: [bool; 2],
    pub(crate) callbacks: Vec<Callback>,
    pub(crate) keep_alive: Vec<KeepAlive>,
}

impl ComputeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, command: impl FnOnce() + Send + 'static) {
        self.commands.push(Box::new(command));
    }

    /// Declares that the recorded commands read results of the IO
    /// `domain` of the same frame. The batch will wait on that domain's
    /// fence on the device queue.
    pub fn consume(&mut self, domain: Domain) {
        match domain {
            Domain::Disk | Domain::Memory => self.consumes[domain.index()] = true,
            Domain::Compute => panic!("compute batch cannot consume its own domain"),
        }
    }

    #[inline]
    pub fn consumes(&self, domain: Domain) -> bool {
        match domain {
            Domain::Disk | Domain::Memory => self.consumes[domain.index()],
            Domain::Compute => false,
        }
    }

    pub fn on_complete(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn keep_alive(&mut self, object: KeepAlive) {
        self.keep_alive.push(object);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

impl Debug for ComputeBatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeBatch")
            .field("commands", &self.commands.len())
            .field("consumes", &self.consumes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::command::{CommandList, ComputeBatch, Domain, HostBuffer, TransferRequest};
    use crate::device::{DeviceBuffer, DeviceTexture, TextureFormat};
    use crate::file::StreamFile;
    use bytes::Bytes;
    use std::io::Write;

    fn file_of(len: usize) -> (tempfile::NamedTempFile, std::sync::Arc<StreamFile>) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![1u8; len]).unwrap();
        let file = StreamFile::open(tmp.path()).unwrap();
        (tmp, file)
    }

    #[test]
    fn texture_request_takes_region_size() {
        let (_tmp, file) = file_of(256);
        let texture = DeviceTexture::new("t", TextureFormat::BC1, [8, 8, 1], 1);

        let request = TransferRequest::file_to_texture(&file, 0, &texture, texture.mip_region(0));

        assert_eq!(request.len(), 32);
    }

    #[test]
    #[should_panic]
    fn read_past_end_of_file_panics() {
        let (_tmp, file) = file_of(16);
        let buffer = DeviceBuffer::new("b", 64);

        TransferRequest::file_to_buffer(&file, 8, &buffer, 0, 16);
    }

    #[test]
    #[should_panic]
    fn zero_length_panics() {
        let host = HostBuffer::new("h", 4);
        TransferRequest::memory_to_memory(Bytes::new(), &host, 0);
    }

    #[test]
    #[should_panic]
    fn destination_overflow_panics() {
        let buffer = DeviceBuffer::new("b", 4);
        TransferRequest::memory_to_buffer(Bytes::from_static(&[0; 8]), &buffer, 0);
    }

    #[test]
    fn list_tracks_release_work() {
        let (_tmp, file) = file_of(16);
        let host = HostBuffer::new("h", 16);
        let mut list = CommandList::new();
        assert!(list.is_empty());
        assert!(!list.needs_record());

        list.push(TransferRequest::file_to_memory(&file, 0, &host, 0, 16));
        assert!(!list.needs_record());
        list.own_file(file);

        assert!(list.needs_record());
        assert_eq!(list.byte_size(), 16);
    }

    #[test]
    fn compute_batch_consumption() {
        let mut batch = ComputeBatch::new();
        batch.consume(Domain::Memory);

        assert!(batch.consumes(Domain::Memory));
        assert!(!batch.consumes(Domain::Disk));
    }
}
