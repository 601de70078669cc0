//! Source files for disk transfers.

use crate::error::TransferError;
use log::trace;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An opened file that transfer requests read byte ranges from.
///
/// Length is captured on open so requests can be validated eagerly when
/// they are constructed, long before the read happens.
#[derive(Debug)]
pub struct StreamFile {
    path: PathBuf,
    len: u64,
    file: Mutex<File>,
}

impl StreamFile {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        trace!("Opened {:?} ({} bytes)", path, len);

        Ok(Arc::new(Self {
            path,
            len,
            file: Mutex::new(file),
        }))
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads exactly `dst.len()` bytes starting at `offset` with a
    /// blocking read.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<(), TransferError> {
        assert!(
            offset + dst.len() as u64 <= self.len,
            "read of {} bytes at offset {} is past the end of {:?} ({} bytes)",
            dst.len(),
            offset,
            self.path,
            self.len
        );

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(dst))
            .map_err(|e| TransferError::io(self.path.clone(), e))
    }
}
