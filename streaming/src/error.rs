//! Error types of the streaming pipeline.
//!
//! Programmer errors (reading past the end of a file, mismatched sizes, ...)
//! are not represented here. They are fatal assertions raised eagerly where
//! the bad request is constructed.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Error reported by a `Device` implementation.
#[derive(Debug, Clone)]
pub enum DeviceError {
    /// The device queue was shut down and accepts no more work.
    Lost,
    /// A copy or compute submission was rejected by the device.
    SubmissionFailed(String),
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::Lost => write!(f, "device queue is lost"),
            DeviceError::SubmissionFailed(reason) => write!(f, "device submission failed: {}", reason),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Error that can happen while a transfer backend or the submission
/// service executes a transfer.
#[derive(Debug, Clone)]
pub enum TransferError {
    /// Blocking read of the source file failed.
    Io { path: PathBuf, kind: std::io::ErrorKind, message: String },
    /// Device refused the copy commands emitted by the backend.
    Device(DeviceError),
    /// The backend queue was already freed.
    QueueClosed,
    /// The backend hit an earlier fatal error and stopped processing.
    Faulted(Box<TransferError>),
}

impl TransferError {
    pub(crate) fn io(path: PathBuf, error: std::io::Error) -> Self {
        TransferError::Io {
            path,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl Display for TransferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Io { path, message, .. } => {
                write!(f, "cannot read {:?}: {}", path, message)
            }
            TransferError::Device(e) => write!(f, "{}", e),
            TransferError::QueueClosed => write!(f, "transfer queue was already freed"),
            TransferError::Faulted(cause) => write!(f, "backend faulted earlier: {}", cause),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<DeviceError> for TransferError {
    fn from(e: DeviceError) -> Self {
        TransferError::Device(e)
    }
}

/// Error that can happen while loading `StreamingConfig`.
#[derive(Debug)]
pub enum ConfigError {
    CannotReadFile(std::io::Error),
    CannotParse(serde_json::Error),
    Invalid(&'static str),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::CannotReadFile(e) => write!(f, "cannot read settings file: {}", e),
            ConfigError::CannotParse(e) => write!(f, "cannot parse settings file: {}", e),
            ConfigError::Invalid(reason) => write!(f, "invalid settings: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::CannotReadFile(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::CannotParse(e)
    }
}

/// Error surfaced by the `StreamingContext`.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// A transfer failed in the given domain. The pipeline was aborted.
    Transfer { operation: &'static str, error: TransferError },
    /// The device rejected a compute batch. The pipeline was aborted.
    Device { operation: &'static str, error: DeviceError },
    /// A work item panicked while the loader built the frame. The
    /// pipeline was aborted.
    WorkItemPanicked { frame: u64, message: String },
    /// The pipeline was already aborted or shut down.
    Aborted,
}

impl Display for StreamError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Transfer { operation, error } => write!(f, "{} failed: {}", operation, error),
            StreamError::Device { operation, error } => write!(f, "{} failed: {}", operation, error),
            StreamError::WorkItemPanicked { frame, message } => {
                write!(f, "work item of frame {} panicked: {}", frame, message)
            }
            StreamError::Aborted => write!(f, "streaming pipeline is not running"),
        }
    }
}

impl std::error::Error for StreamError {}
