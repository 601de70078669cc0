//! Asynchronous streaming of resource bytes from disk or host memory into
//! device buffers and textures.
//!
//! Producers queue work items into a [`StreamingContext`]. Once per
//! logical frame the loader thread runs the queued items, which record
//! disk reads, memory copies and device compute work. The executive
//! thread submits the recorded batches through the transfer services and
//! housekeeping releases their resources and invokes their callbacks once
//! the work completed. How many frames of work may be in flight is
//! bounded by `max_delay_frames`.

pub mod arena;
pub mod backend;
pub mod command;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
mod executive;
pub mod file;
pub mod frame;
mod housekeeping;
pub mod loader;
pub mod pending;
pub mod queue;
pub mod service;
pub mod split;
pub mod timeline;
pub mod tracker;

pub use crate::command::{CommandList, ComputeBatch, Domain, HostBuffer, TransferRequest};
pub use crate::config::{BackendKind, StreamingConfig};
pub use crate::context::{LoadTicket, StreamingContext};
pub use crate::device::{Device, DeviceBuffer, DeviceTexture, SoftDevice, TextureFormat, TextureRegion};
pub use crate::error::{ConfigError, DeviceError, StreamError, TransferError};
pub use crate::file::StreamFile;
pub use crate::loader::LoaderStats;
pub use crate::queue::LoadTaskArgs;
pub use crate::timeline::{Timeline, TimelineEvent};
