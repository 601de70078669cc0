//! Interface of the device the pipeline submits copies and compute work
//! to, device resources, and `SoftDevice`, a host-memory device
//! implementation that executes work on its own queue threads.

use crate::error::DeviceError;
use crate::timeline::{FenceWait, Timeline, TimelineEvent};
use bytes::Bytes;
use crossbeam::channel::{unbounded, Sender};
use log::{error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Opaque unit of recorded device work.
pub type DeviceCommand = Box<dyn FnOnce() + Send + 'static>;

/// Waits inserted in front of a compute submission.
pub type FenceWaits = SmallVec<[FenceWait; 2]>;

/// The device. It has a copy queue and a compute queue, each completing
/// its work in submission order and publishing completion through its
/// own fence.
pub trait Device: Send + Sync {
    /// Executes copies from host staging memory to device resources on
    /// the copy queue.
    fn submit_copies(&self, copies: Vec<CopyOp>) -> Result<Timeline, DeviceError>;

    /// Executes `commands` on the compute queue after every wait in
    /// `waits` is satisfied.
    fn submit_compute(
        &self,
        commands: Vec<DeviceCommand>,
        waits: FenceWaits,
    ) -> Result<Timeline, DeviceError>;

    fn copy_fence(&self) -> &Arc<TimelineEvent>;

    fn compute_fence(&self) -> &Arc<TimelineEvent>;
}

/// Pixel format description needed to lay out texture copies.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TextureFormat {
    pub block_width: u32,
    pub block_height: u32,
    pub bytes_per_block: u32,
}

impl TextureFormat {
    pub const R8: TextureFormat = TextureFormat::uncompressed(1);
    pub const RGBA8: TextureFormat = TextureFormat::uncompressed(4);
    pub const BC1: TextureFormat = TextureFormat::compressed(8);

    const fn uncompressed(bytes_per_pixel: u32) -> Self {
        TextureFormat {
            block_width: 1,
            block_height: 1,
            bytes_per_block: bytes_per_pixel,
        }
    }

    const fn compressed(bytes_per_block: u32) -> Self {
        TextureFormat {
            block_width: 4,
            block_height: 4,
            bytes_per_block,
        }
    }

    /// Bytes of one row of blocks that is `width` texels wide.
    #[inline]
    pub fn row_pitch(&self, width: u32) -> u64 {
        ((width + self.block_width - 1) / self.block_width) as u64 * self.bytes_per_block as u64
    }

    /// Number of block rows covering `height` texels.
    #[inline]
    pub fn block_rows(&self, height: u32) -> u32 {
        (height + self.block_height - 1) / self.block_height
    }
}

/// A box of texels inside one mip level of a texture.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TextureRegion {
    pub mip: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl TextureRegion {
    /// The whole mip level `mip` of a texture with the given base size.
    pub fn whole_mip(mip: u32, width: u32, height: u32, depth: u32) -> Self {
        TextureRegion {
            mip,
            x: 0,
            y: 0,
            z: 0,
            width: (width >> mip).max(1),
            height: (height >> mip).max(1),
            depth: (depth >> mip).max(1),
        }
    }

    /// Bytes of one depth plane of this region.
    #[inline]
    pub fn plane_size(&self, format: TextureFormat) -> u64 {
        format.row_pitch(self.width) * format.block_rows(self.height) as u64
    }

    /// Size of tightly packed data covering this region.
    #[inline]
    pub fn byte_size(&self, format: TextureFormat) -> u64 {
        self.plane_size(format) * self.depth as u64
    }
}

struct BufferInner {
    label: String,
    data: RwLock<Vec<u8>>,
}

/// A device buffer. Cloning produces another handle to the same buffer.
#[derive(Clone)]
pub struct DeviceBuffer(Arc<BufferInner>);

impl DeviceBuffer {
    pub fn new(label: impl Into<String>, len: usize) -> Self {
        DeviceBuffer(Arc::new(BufferInner {
            label: label.into(),
            data: RwLock::new(vec![0; len]),
        }))
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.0.data.read().len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads back the current content of the buffer.
    pub fn contents(&self) -> Vec<u8> {
        self.0.data.read().clone()
    }

    pub(crate) fn write(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.0.data.write();
        let start = offset as usize;
        assert!(
            start + bytes.len() <= data.len(),
            "copy of {} bytes at offset {} overflows buffer {:?} ({} bytes)",
            bytes.len(),
            offset,
            self.0.label,
            data.len()
        );
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl Debug for DeviceBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceBuffer").field(&self.0.label).finish()
    }
}

struct TextureInner {
    label: String,
    format: TextureFormat,
    width: u32,
    height: u32,
    depth: u32,
    mip_offsets: Vec<u64>,
    data: RwLock<Vec<u8>>,
}

/// A device texture with a full or partial mip chain.
#[derive(Clone)]
pub struct DeviceTexture(Arc<TextureInner>);

impl DeviceTexture {
    pub fn new(
        label: impl Into<String>,
        format: TextureFormat,
        [width, height, depth]: [u32; 3],
        mip_levels: u32,
    ) -> Self {
        assert!(mip_levels > 0, "texture must have at least one mip level");

        let mut offset = 0;
        let mip_offsets = (0..mip_levels)
            .map(|mip| {
                let mip_offset = offset;
                offset += TextureRegion::whole_mip(mip, width, height, depth).byte_size(format);
                mip_offset
            })
            .collect::<Vec<_>>();

        DeviceTexture(Arc::new(TextureInner {
            label: label.into(),
            format,
            width,
            height,
            depth,
            mip_offsets,
            data: RwLock::new(vec![0; offset as usize]),
        }))
    }

    #[inline]
    pub fn format(&self) -> TextureFormat {
        self.0.format
    }

    #[inline]
    pub fn mip_levels(&self) -> u32 {
        self.0.mip_offsets.len() as u32
    }

    /// The region covering whole mip level `mip`.
    pub fn mip_region(&self, mip: u32) -> TextureRegion {
        TextureRegion::whole_mip(mip, self.0.width, self.0.height, self.0.depth)
    }

    /// Visits every packed row of `region` with its offset inside the
    /// texture storage and its offset inside tightly packed region data.
    fn for_each_row(&self, region: &TextureRegion, mut f: impl FnMut(usize, usize, usize)) {
        let format = self.0.format;
        let mip = self.mip_region(region.mip);
        assert!(
            region.x % format.block_width == 0 && region.y % format.block_height == 0,
            "region {:?} of texture {:?} is not block aligned",
            region,
            self.0.label
        );
        assert!(
            region.x + region.width <= mip.width
                && region.y + region.height <= mip.height
                && region.z + region.depth <= mip.depth,
            "region {:?} is outside of mip {} of texture {:?}",
            region,
            region.mip,
            self.0.label
        );

        let base = self.0.mip_offsets[region.mip as usize] as usize;
        let mip_pitch = format.row_pitch(mip.width) as usize;
        let mip_plane = mip.plane_size(format) as usize;
        let row_len = format.row_pitch(region.width) as usize;
        let first_row = (region.y / format.block_height) as usize;
        let first_col = (region.x / format.block_width) as usize * format.bytes_per_block as usize;

        let mut packed = 0;
        for z in 0..region.depth as usize {
            for row in 0..format.block_rows(region.height) as usize {
                let dst = base
                    + (region.z as usize + z) * mip_plane
                    + (first_row + row) * mip_pitch
                    + first_col;
                f(dst, packed, row_len);
                packed += row_len;
            }
        }
    }

    pub(crate) fn write_region(&self, region: &TextureRegion, bytes: &[u8]) {
        assert_eq!(
            region.byte_size(self.0.format),
            bytes.len() as u64,
            "source size does not match region {:?} of texture {:?}",
            region,
            self.0.label
        );

        let mut data = self.0.data.write();
        self.for_each_row(region, |dst, src, len| {
            data[dst..dst + len].copy_from_slice(&bytes[src..src + len])
        });
    }

    /// Reads back tightly packed data of `region`.
    pub fn read_region(&self, region: &TextureRegion) -> Vec<u8> {
        let mut out = vec![0; region.byte_size(self.0.format) as usize];
        let data = self.0.data.read();
        self.for_each_row(region, |src, dst, len| {
            out[dst..dst + len].copy_from_slice(&data[src..src + len])
        });
        out
    }
}

impl Debug for DeviceTexture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceTexture").field(&self.0.label).finish()
    }
}

/// Device side destination of a copy.
#[derive(Clone, Debug)]
pub enum CopyTarget {
    Buffer { buffer: DeviceBuffer, offset: u64 },
    Texture { texture: DeviceTexture, region: TextureRegion },
}

/// One copy from host staging memory into a device resource.
#[derive(Clone, Debug)]
pub struct CopyOp {
    pub src: Bytes,
    pub dst: CopyTarget,
}

impl CopyOp {
    /// Performs the copy. Only devices whose resources live in host
    /// visible memory may call this directly.
    pub(crate) fn execute(&self) {
        match &self.dst {
            CopyTarget::Buffer { buffer, offset } => buffer.write(*offset, &self.src),
            CopyTarget::Texture { texture, region } => texture.write_region(region, &self.src),
        }
    }
}

/// How often compute waits re-check whether the device is closing.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// One in-order queue of a `SoftDevice` with its own thread and fence.
struct SoftQueue<J: Send + 'static> {
    fence: Arc<TimelineEvent>,
    submission: Mutex<Submission<J>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct Submission<J> {
    next: Timeline,
    tx: Option<Sender<(J, Timeline)>>,
}

impl<J: Send + 'static> SoftQueue<J> {
    fn start(name: &'static str, execute: impl Fn(J) + Send + 'static) -> Self {
        let fence = TimelineEvent::new(name);
        let (tx, rx) = unbounded::<(J, Timeline)>();

        let thread = {
            let fence = fence.clone();
            std::thread::Builder::new()
                .name(format!("SoftDevice-{}", name))
                .spawn(move || {
                    for (job, timeline) in rx.iter() {
                        execute(job);
                        trace!("Device {} queue reached {}", fence.name(), timeline);
                        fence.signal(timeline);
                    }
                    info!("Device {} queue thread exited!", fence.name());
                })
                .expect("cannot start device queue thread")
        };

        Self {
            fence,
            submission: Mutex::new(Submission { next: 1, tx: Some(tx) }),
            thread: Mutex::new(Some(thread)),
        }
    }

    fn enqueue(&self, job: J) -> Result<Timeline, DeviceError> {
        let mut submission = self.submission.lock();
        let timeline = submission.next;
        let tx = submission.tx.as_ref().ok_or(DeviceError::Lost)?;
        tx.send((job, timeline)).map_err(|_| DeviceError::Lost)?;
        submission.next += 1;
        Ok(timeline)
    }

    fn shutdown(&self) {
        self.submission.lock().tx.take();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Device {} queue thread panicked", self.fence.name());
            }
        }
    }
}

/// A device that keeps its resources in host memory. Copies and compute
/// work run in order on two independent queue threads.
pub struct SoftDevice {
    copy: SoftQueue<Vec<CopyOp>>,
    compute: SoftQueue<(Vec<DeviceCommand>, FenceWaits)>,
    closing: Arc<AtomicBool>,
}

impl SoftDevice {
    pub fn new() -> Arc<Self> {
        let closing = Arc::new(AtomicBool::new(false));

        let copy = SoftQueue::start("copy", |copies: Vec<CopyOp>| {
            trace!("Device executes {} copies", copies.len());
            copies.iter().for_each(CopyOp::execute);
        });
        let compute = {
            let closing = closing.clone();
            SoftQueue::start("compute", move |(commands, waits): (Vec<DeviceCommand>, FenceWaits)| {
                for wait in waits.iter() {
                    while !wait.event.wait_timeout(wait.value, WAIT_POLL) {
                        if closing.load(Ordering::Acquire) {
                            warn!("Dropping compute work waiting on {:?}", wait.event);
                            return;
                        }
                    }
                }
                trace!("Device executes {} commands", commands.len());
                commands.into_iter().for_each(|c| c());
            })
        };

        Arc::new(SoftDevice {
            copy,
            compute,
            closing,
        })
    }

    /// Stops both queue threads after they finished all submitted work.
    /// Compute work still waiting on a fence that is never signaled is
    /// dropped.
    pub fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.copy.shutdown();
        self.compute.shutdown();
    }
}

impl Device for SoftDevice {
    fn submit_copies(&self, copies: Vec<CopyOp>) -> Result<Timeline, DeviceError> {
        self.copy.enqueue(copies)
    }

    fn submit_compute(
        &self,
        commands: Vec<DeviceCommand>,
        waits: FenceWaits,
    ) -> Result<Timeline, DeviceError> {
        self.compute.enqueue((commands, waits))
    }

    fn copy_fence(&self) -> &Arc<TimelineEvent> {
        &self.copy.fence
    }

    fn compute_fence(&self) -> &Arc<TimelineEvent> {
        &self.compute.fence
    }
}

impl Drop for SoftDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use crate::device::{
        CopyOp, CopyTarget, Device, DeviceBuffer, DeviceTexture, FenceWaits, SoftDevice,
        TextureFormat, TextureRegion,
    };
    use crate::timeline::{FenceWait, TimelineEvent};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn bc1_layout() {
        let format = TextureFormat::BC1;
        let region = TextureRegion::whole_mip(0, 10, 10, 1);

        assert_eq!(format.row_pitch(10), 24);
        assert_eq!(format.block_rows(10), 3);
        assert_eq!(region.byte_size(format), 72);
    }

    #[test]
    fn mip_chain_sizes() {
        let texture = DeviceTexture::new("t", TextureFormat::RGBA8, [8, 8, 1], 4);

        assert_eq!(texture.mip_levels(), 4);
        assert_eq!(texture.mip_region(3).width, 1);
        assert_eq!(texture.mip_region(3).byte_size(TextureFormat::RGBA8), 4);
    }

    #[test]
    fn writes_and_reads_texture_region() {
        let texture = DeviceTexture::new("t", TextureFormat::R8, [4, 4, 1], 1);
        let region = TextureRegion {
            mip: 0,
            x: 1,
            y: 2,
            z: 0,
            width: 2,
            height: 2,
            depth: 1,
        };

        texture.write_region(&region, &[1, 2, 3, 4]);

        assert_eq!(texture.read_region(&region), vec![1, 2, 3, 4]);
        assert_eq!(
            texture.read_region(&texture.mip_region(0)),
            vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0]
        );
    }

    #[test]
    #[should_panic]
    fn mismatched_region_size_panics() {
        let texture = DeviceTexture::new("t", TextureFormat::R8, [4, 4, 1], 1);
        texture.write_region(&texture.mip_region(0), &[0; 3]);
    }

    #[test]
    fn executes_copies_in_order() {
        let device = SoftDevice::new();
        let buffer = DeviceBuffer::new("b", 4);
        let copy = |value: u8| CopyOp {
            src: Bytes::from(vec![value; 4]),
            dst: CopyTarget::Buffer {
                buffer: buffer.clone(),
                offset: 0,
            },
        };

        device.submit_copies(vec![copy(1)]).unwrap();
        let last = device.submit_copies(vec![copy(2)]).unwrap();
        device.copy_fence().wait(last);

        assert_eq!(buffer.contents(), vec![2; 4]);
    }

    #[test]
    fn compute_waits_on_fences() {
        let device = SoftDevice::new();
        let io = TimelineEvent::new("io");
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut waits = FenceWaits::new();
        waits.push(FenceWait::new(&io, 1));
        let recorder = log.clone();
        let timeline = device
            .submit_compute(vec![Box::new(move || recorder.lock().push("compute"))], waits)
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!device.compute_fence().is_complete(timeline));
        log.lock().push("io");
        io.signal(1);
        device.compute_fence().wait(timeline);

        assert_eq!(*log.lock(), vec!["io", "compute"]);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let device = SoftDevice::new();
        device.shutdown();

        assert!(device.submit_copies(Vec::new()).is_err());
    }
}
