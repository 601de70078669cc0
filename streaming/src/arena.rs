//! Bump allocated staging memory.

use bytes::{Bytes, BytesMut};

/// A fixed-budget bump allocator handing out chunks of one backing
/// allocation.
///
/// Chunks are independent `BytesMut` handles, so they can be frozen and
/// shared with a backend while the arena keeps allocating. `reset()`
/// starts over from an empty arena. When every chunk of the previous
/// round was already dropped the original allocation is reused,
/// otherwise a fresh one is made and the old memory lives on until its
/// last reader is done with it.
pub struct StagingArena {
    buf: BytesMut,
    capacity: usize,
    used: usize,
}

impl StagingArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            used: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Allocates a zeroed chunk of `len` bytes or returns `None` when the
    /// arena does not have enough space left.
    pub fn alloc(&mut self, len: usize) -> Option<BytesMut> {
        if len > self.remaining() {
            return None;
        }

        self.buf.resize(len, 0);
        self.used += len;
        Some(self.buf.split())
    }

    /// Copies `data` into the arena and returns a shareable handle to it.
    pub fn stage(&mut self, data: &[u8]) -> Option<Bytes> {
        let mut chunk = self.alloc(data.len())?;
        chunk.copy_from_slice(data);
        Some(chunk.freeze())
    }

    /// Forgets all allocations. Callers guarantee that no in-flight
    /// operation still writes into chunks of the previous round.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf.reserve(self.capacity);
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use crate::arena::StagingArena;

    #[test]
    fn allocates_until_full() {
        let mut arena = StagingArena::new(100);

        assert_eq!(arena.alloc(60).unwrap().len(), 60);
        assert_eq!(arena.remaining(), 40);
        assert!(arena.alloc(41).is_none());
        assert_eq!(arena.alloc(40).unwrap().len(), 40);
        assert_eq!(arena.remaining(), 0);
    }

    #[test]
    fn chunks_do_not_alias() {
        let mut arena = StagingArena::new(8);

        let first = arena.stage(&[1, 2, 3, 4]).unwrap();
        let second = arena.stage(&[5, 6, 7, 8]).unwrap();

        assert_eq!(&first[..], &[1, 2, 3, 4]);
        assert_eq!(&second[..], &[5, 6, 7, 8]);
    }

    #[test]
    fn reset_restores_capacity() {
        let mut arena = StagingArena::new(16);
        let chunk = arena.stage(&[7; 16]).unwrap();
        assert!(arena.alloc(1).is_none());

        arena.reset();

        assert!(arena.is_empty());
        assert_eq!(arena.alloc(16).unwrap().len(), 16);
        // the old chunk stays valid even though the arena moved on
        assert_eq!(&chunk[..], &[7; 16]);
    }

    #[test]
    fn allocations_are_zeroed_after_reuse() {
        let mut arena = StagingArena::new(4);
        drop(arena.stage(&[9, 9, 9, 9]).unwrap());

        arena.reset();

        assert_eq!(&arena.alloc(4).unwrap()[..], &[0, 0, 0, 0]);
    }
}
