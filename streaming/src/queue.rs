//! Load queue of work items and the arguments a work item is run with.

use crate::arena::StagingArena;
use crate::command::{CommandList, ComputeBatch};
use bytes::Bytes;
use log::warn;
use parking_lot::Mutex;

/// Loads one resource. Called exactly once, on the loader thread.
pub type WorkItem = Box<dyn FnOnce(&mut LoadTaskArgs<'_>) + Send + 'static>;

/// Everything a work item may record work into. References do not
/// outlive the call.
pub struct LoadTaskArgs<'a> {
    pub arena: &'a mut StagingArena,
    pub disk: &'a mut CommandList,
    pub memory: &'a mut CommandList,
    pub compute: &'a mut ComputeBatch,
    pub frame: u64,
}

impl LoadTaskArgs<'_> {
    /// Copies `data` into the frame's staging arena. When the arena is
    /// exhausted the data is copied to a standalone heap allocation.
    pub fn stage(&mut self, data: &[u8]) -> Bytes {
        match self.arena.stage(data) {
            Some(bytes) => bytes,
            None => {
                warn!(
                    "Frame {} staging arena exhausted ({} of {} bytes used), allocating {} bytes",
                    self.frame,
                    self.arena.used(),
                    self.arena.capacity(),
                    data.len()
                );
                Bytes::copy_from_slice(data)
            }
        }
    }
}

/// Work items waiting for the loader.
#[derive(Default)]
pub struct LoadQueue {
    items: Mutex<Vec<WorkItem>>,
}

impl LoadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: WorkItem) {
        self.items.lock().push(item);
    }

    /// Takes all queued items, leaving an empty queue behind.
    pub fn drain(&self) -> Vec<WorkItem> {
        std::mem::take(&mut *self.items.lock())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::arena::StagingArena;
    use crate::command::{CommandList, ComputeBatch};
    use crate::queue::{LoadQueue, LoadTaskArgs};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn run(items: Vec<crate::queue::WorkItem>, arena: &mut StagingArena) {
        let mut disk = CommandList::new();
        let mut memory = CommandList::new();
        let mut compute = ComputeBatch::new();
        let mut args = LoadTaskArgs {
            arena,
            disk: &mut disk,
            memory: &mut memory,
            compute: &mut compute,
            frame: 0,
        };
        for item in items {
            item(&mut args);
        }
    }

    #[test]
    fn drain_keeps_push_order() {
        let queue = LoadQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = log.clone();
            queue.push(Box::new(move |_: &mut LoadTaskArgs<'_>| log.lock().push(i)));
        }

        let items = queue.drain();
        assert!(queue.is_empty());
        run(items, &mut StagingArena::new(0));

        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn stage_falls_back_to_heap() {
        let queue = LoadQueue::new();
        let staged = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let staged = staged.clone();
            queue.push(Box::new(move |args: &mut LoadTaskArgs<'_>| staged.lock().push(args.stage(&[7; 12]))));
        }
        let mut arena = StagingArena::new(16);

        run(queue.drain(), &mut arena);

        assert_eq!(arena.used(), 12);
        assert!(staged.lock().iter().all(|b| b[..] == [7; 12]));
    }
}
