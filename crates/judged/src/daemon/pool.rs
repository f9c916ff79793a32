//! Execution slot bookkeeping

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::types::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Free,
    Allocated,
    Initializing,
    Busy,
    TearingDown,
}

#[derive(Debug)]
struct Slots {
    states: Vec<SlotState>,
    peak_occupied: usize,
}

/// Fixed set of slots `1..=capacity` with atomic claim
#[derive(Debug)]
pub struct SlotPool {
    slots: Mutex<Slots>,
}

impl SlotPool {
    pub fn new(capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Slots {
                states: vec![SlotState::Free; capacity as usize],
                peak_occupied: 0,
            }),
        })
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> u32 {
        self.slots().states.len() as u32
    }

    pub fn ids(&self) -> impl Iterator<Item = SlotId> + use<> {
        (1..=self.capacity()).map(SlotId)
    }

    pub fn state(&self, slot: SlotId) -> Option<SlotState> {
        let index = (slot.0 as usize).checked_sub(1)?;
        self.slots().states.get(index).copied()
    }

    pub fn free_count(&self) -> usize {
        self.slots()
            .states
            .iter()
            .filter(|s| **s == SlotState::Free)
            .count()
    }

    pub fn occupied_count(&self) -> usize {
        self.capacity() as usize - self.free_count()
    }

    /// Highest number of simultaneously occupied slots so far
    pub fn peak_occupied(&self) -> usize {
        self.slots().peak_occupied
    }

    /// Claim the lowest free slot, marking it `Allocated`
    pub fn try_claim(self: &Arc<Self>) -> Option<SlotLease> {
        let mut slots = self.slots();
        let index = slots.states.iter().position(|s| *s == SlotState::Free)?;
        slots.states[index] = SlotState::Allocated;
        let occupied = slots
            .states
            .iter()
            .filter(|s| **s != SlotState::Free)
            .count();
        slots.peak_occupied = slots.peak_occupied.max(occupied);

        Some(SlotLease {
            pool: Arc::clone(self),
            slot: SlotId(index as u32 + 1),
            released: false,
        })
    }

    pub(crate) fn mark(&self, slot: SlotId, state: SlotState) {
        let mut slots = self.slots();
        if let Some(current) = (slot.0 as usize)
            .checked_sub(1)
            .and_then(|index| slots.states.get_mut(index))
        {
            *current = state;
        }
    }
}

/// Exclusive use of one slot; the slot becomes `Free` again exactly once
///
/// Dropping a lease without [`release`](Self::release) frees the slot too, so a
/// panicking task cannot leak it.
#[derive(Debug)]
pub struct SlotLease {
    pool: Arc<SlotPool>,
    slot: SlotId,
    released: bool,
}

impl SlotLease {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    pub fn set_state(&self, state: SlotState) {
        self.pool.mark(self.slot, state);
    }

    /// Return the slot to the pool
    pub fn release(mut self) {
        self.released = true;
        self.pool.mark(self.slot, SlotState::Free);
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(slot = %self.slot, "slot lease dropped without release, freeing slot");
            self.pool.mark(self.slot, SlotState::Free);
        }
    }
}
