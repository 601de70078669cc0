//! Frame resource ring: per-frame staging arenas and the fences that
//! guard their reuse.

use crate::arena::StagingArena;
use crate::command::Domain;
use crate::error::StreamError;
use crate::timeline::Timeline;
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// State of one domain's fence in a frame slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FenceState {
    /// No work was submitted.
    Idle,
    /// Work was built but the executive has not submitted it yet.
    Pending,
    /// Work was submitted and completes with this timeline.
    Issued(Timeline),
}

struct FenceStates {
    domains: [FenceState; 3],
    aborted: bool,
}

/// Fences of one slot. Shared between the loader, which waits on them,
/// and the executive, which records them.
pub struct SlotFences {
    states: Mutex<FenceStates>,
    recorded: Condvar,
}

impl SlotFences {
    fn new() -> Self {
        Self {
            states: Mutex::new(FenceStates {
                domains: [FenceState::Idle; 3],
                aborted: false,
            }),
            recorded: Condvar::new(),
        }
    }

    pub fn state(&self, domain: Domain) -> FenceState {
        self.states.lock().domains[domain.index()]
    }

    /// Marks the domain pending if the frame has work in it, idle
    /// otherwise.
    pub fn mark(&self, domain: Domain, has_work: bool) {
        let mut states = self.states.lock();
        let state = &mut states.domains[domain.index()];
        assert_eq!(*state, FenceState::Idle, "{:?} fence marked before it was reset", domain);
        if has_work {
            *state = FenceState::Pending;
        }
    }

    /// Records the timeline the domain's submission completes with.
    pub fn record(&self, domain: Domain, timeline: Timeline) {
        let mut states = self.states.lock();
        states.domains[domain.index()] = FenceState::Issued(timeline);
        self.recorded.notify_all();
    }

    /// Blocks while the domain is pending. Returns the issued timeline, if
    /// any, or `None` if the ring was aborted.
    fn wait_recorded(&self, domain: Domain) -> Option<FenceState> {
        let mut states = self.states.lock();
        while states.domains[domain.index()] == FenceState::Pending && !states.aborted {
            self.recorded.wait(&mut states);
        }
        match states.aborted {
            true => None,
            false => Some(states.domains[domain.index()]),
        }
    }

    fn reset(&self, domain: Domain) {
        self.states.lock().domains[domain.index()] = FenceState::Idle;
    }

    /// Wakes everybody waiting on this slot. Pending fences stay
    /// pending forever.
    pub fn abort(&self) {
        self.states.lock().aborted = true;
        self.recorded.notify_all();
    }
}

pub struct FrameSlot {
    pub arena: StagingArena,
    pub fences: Arc<SlotFences>,
}

/// Fixed ring of frame slots, owned by the loader thread.
pub struct FrameRing {
    slots: Vec<FrameSlot>,
}

impl FrameRing {
    pub fn new(depth: usize, arena_size: usize) -> Self {
        assert!(depth > 0, "frame ring must have at least one slot");
        Self {
            slots: (0..depth)
                .map(|_| FrameSlot {
                    arena: StagingArena::new(arena_size),
                    fences: Arc::new(SlotFences::new()),
                })
                .collect(),
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Fences of all slots, for aborting.
    pub fn fences(&self) -> Vec<Arc<SlotFences>> {
        self.slots.iter().map(|s| s.fences.clone()).collect()
    }

    /// Returns the slot for `frame` after every fence of its previous use
    /// was waited on with `wait` and reset. The arena is reset too.
    pub fn acquire(
        &mut self,
        frame: u64,
        mut wait: impl FnMut(Domain, Timeline) -> Result<(), StreamError>,
    ) -> Result<&mut FrameSlot, StreamError> {
        let index = (frame % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[index];

        for domain in Domain::ALL.iter().copied() {
            match slot.fences.wait_recorded(domain) {
                None => return Err(StreamError::Aborted),
                Some(FenceState::Issued(timeline)) => {
                    trace!("Frame {} waits on {:?} fence {}", frame, domain, timeline);
                    wait(domain, timeline)?;
                }
                Some(_) => {}
            }
            slot.fences.reset(domain);
        }

        slot.arena.reset();
        Ok(slot)
    }
}
