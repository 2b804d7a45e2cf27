//! Frame-in-flight resource ring.
//!
//! Per-frame GPU resources (light-sample buffers, per-frame constants)
//! exist in a small fixed number of copies so iterations can overlap.
//! A slot may only be rewritten by the CPU once the submission that
//! last used it has finished; the ring enforces that by storing the
//! completion token with the slot and waiting on it at reacquisition.

use crate::error::Result;
use crate::gpu::queue::{CommandQueue, ExecutionIndex};

struct Slot<T> {
    value: T,
    pending: Option<ExecutionIndex>,
}

/// Bounded ring of typed per-frame resource slots.
pub struct FrameRing<T> {
    slots: Vec<Slot<T>>,
    next: usize,
}

impl<T> FrameRing<T> {
    /// Build a ring of `count` slots (at least one), creating each
    /// slot's resources with `init`.
    pub fn new(count: usize, mut init: impl FnMut(usize) -> Result<T>) -> Result<Self> {
        assert!(count >= 1, "a frame ring needs at least one slot");
        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            slots.push(Slot {
                value: init(index)?,
                pending: None,
            });
        }
        Ok(Self { slots, next: 0 })
    }

    /// Acquire the next slot, blocking until its previous use has
    /// finished on `queue`.
    pub fn acquire(&mut self, queue: &CommandQueue) -> FrameSlot<'_, T> {
        let index = self.next;
        self.next = (self.next + 1) % self.slots.len();
        let slot = &mut self.slots[index];
        if let Some(token) = slot.pending.take() {
            queue.wait_until_finished(token);
        }
        FrameSlot { slot, index }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// Exclusive access to one acquired ring slot.
pub struct FrameSlot<'a, T> {
    slot: &'a mut Slot<T>,
    index: usize,
}

impl<T> FrameSlot<'_, T> {
    pub fn value(&mut self) -> &mut T {
        &mut self.slot.value
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Record the token of the submission that consumed this slot.
    /// The slot will not be handed out again before it finishes.
    pub fn mark_submitted(self, token: ExecutionIndex) {
        self.slot.pending = Some(token);
    }
}
