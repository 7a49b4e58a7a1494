//! Fixed-size pool of frame-resource slots.
//!
//! A [`SlotPool`] owns `N` resources, each tagged with a [`SlotState`]. The
//! pool never grows; callers size it to their maximum in-flight depth.
//!
//! ```text
//!         mark_submitted          mark_acquired
//!   Free ───────────────▶ Submitted ───────────▶ Acquired
//!    ▲                        │                     │
//!    └──────── release ───────┴──────── release ────┘
//! ```
//!
//! The pool only tracks states. Waiting for the GPU before a slot is
//! released or torn down is the owner's job.

use tracing::trace;

use crate::error::{RenderError, RenderResult};

/// Lifecycle state of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Owned by the pool and ready for new work.
    Free,
    /// GPU work was issued but is not known to be complete.
    Submitted,
    /// The caller is reading or using the result.
    Acquired,
}

struct Slot<R> {
    state: SlotState,
    resource: R,
}

/// Fixed array of resources with per-slot state.
pub struct SlotPool<R> {
    slots: Vec<Slot<R>>,
}

impl<R> SlotPool<R> {
    /// Allocates `count` resources by calling `create` with each index.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidConfig`] for an empty pool and the first
    /// error returned by `create`. Resources created before the failure are
    /// dropped.
    pub fn new<F>(count: usize, mut create: F) -> RenderResult<Self>
    where
        F: FnMut(usize) -> RenderResult<R>,
    {
        if count == 0 {
            return Err(RenderError::InvalidConfig(
                "A slot pool needs at least one slot".to_string(),
            ));
        }

        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            slots.push(Slot {
                state: SlotState::Free,
                resource: create(index)?,
            });
        }
        Ok(Self { slots })
    }

    /// Number of slots, fixed at construction.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the first free slot in ascending index order.
    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.state == SlotState::Free)
    }

    pub fn state(&self, index: usize) -> RenderResult<SlotState> {
        Ok(self.slot(index)?.state)
    }

    pub fn is_free(&self, index: usize) -> RenderResult<bool> {
        Ok(self.state(index)? == SlotState::Free)
    }

    /// Number of slots currently in `state`.
    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    /// Iterates slot states in index order.
    pub fn states(&self) -> impl Iterator<Item = SlotState> + '_ {
        self.slots.iter().map(|slot| slot.state)
    }

    pub fn resource(&self, index: usize) -> RenderResult<&R> {
        Ok(&self.slot(index)?.resource)
    }

    pub fn resource_mut(&mut self, index: usize) -> RenderResult<&mut R> {
        Ok(&mut self.slot_mut(index)?.resource)
    }

    /// Iterates all resources regardless of state.
    pub fn resources_mut(&mut self) -> impl Iterator<Item = &mut R> + '_ {
        self.slots.iter_mut().map(|slot| &mut slot.resource)
    }

    /// `Free` → `Submitted`.
    pub fn mark_submitted(&mut self, index: usize) -> RenderResult<()> {
        self.transition(index, "submit", &[SlotState::Free], SlotState::Submitted)
    }

    /// `Submitted` → `Acquired`. Acquiring an acquired slot again is allowed.
    pub fn mark_acquired(&mut self, index: usize) -> RenderResult<()> {
        self.transition(
            index,
            "acquire",
            &[SlotState::Submitted, SlotState::Acquired],
            SlotState::Acquired,
        )
    }

    /// `Submitted` or `Acquired` → `Free`.
    pub fn release(&mut self, index: usize) -> RenderResult<()> {
        self.transition(
            index,
            "release",
            &[SlotState::Submitted, SlotState::Acquired],
            SlotState::Free,
        )
    }

    fn transition(
        &mut self,
        index: usize,
        operation: &'static str,
        allowed: &[SlotState],
        next: SlotState,
    ) -> RenderResult<()> {
        let slot = self.slot_mut(index)?;
        if !allowed.contains(&slot.state) {
            return Err(RenderError::UnexpectedState {
                index,
                actual: slot.state,
                operation,
            });
        }
        trace!("Slot {}: {:?} -> {:?}", index, slot.state, next);
        slot.state = next;
        Ok(())
    }

    fn slot(&self, index: usize) -> RenderResult<&Slot<R>> {
        let capacity = self.capacity();
        self.slots
            .get(index)
            .ok_or(RenderError::InvalidSlot { index, capacity })
    }

    fn slot_mut(&mut self, index: usize) -> RenderResult<&mut Slot<R>> {
        let capacity = self.capacity();
        self.slots
            .get_mut(index)
            .ok_or(RenderError::InvalidSlot { index, capacity })
    }
}

impl<R> std::fmt::Debug for SlotPool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("states", &self.states().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: usize) -> SlotPool<usize> {
        SlotPool::new(count, |index| Ok(index * 10)).unwrap()
    }

    #[test]
    fn test_new_pool_is_all_free() {
        let pool = pool(3);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.count(SlotState::Free), 3);
        assert_eq!(*pool.resource(2).unwrap(), 20);
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        let result = SlotPool::<u8>::new(0, |_| Ok(0));
        assert!(matches!(result, Err(RenderError::InvalidConfig(_))));
    }

    #[test]
    fn test_creation_failure_propagates() {
        let result = SlotPool::<u8>::new(3, |index| {
            if index == 1 {
                Err(RenderError::InvalidConfig("boom".to_string()))
            } else {
                Ok(0)
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_find_free_slot_scans_in_ascending_order() {
        let mut pool = pool(3);
        assert_eq!(pool.find_free_slot(), Some(0));

        pool.mark_submitted(0).unwrap();
        pool.mark_submitted(1).unwrap();
        assert_eq!(pool.find_free_slot(), Some(2));

        pool.release(0).unwrap();
        assert_eq!(pool.find_free_slot(), Some(0));

        pool.mark_submitted(0).unwrap();
        pool.mark_submitted(2).unwrap();
        assert_eq!(pool.find_free_slot(), None);
    }

    #[test]
    fn test_submit_requires_free_slot() {
        let mut pool = pool(2);
        pool.mark_submitted(0).unwrap();

        let err = pool.mark_submitted(0).unwrap_err();
        assert!(matches!(
            err,
            RenderError::UnexpectedState {
                index: 0,
                actual: SlotState::Submitted,
                operation: "submit",
            }
        ));

        pool.mark_acquired(0).unwrap();
        assert!(pool.mark_submitted(0).is_err());
    }

    #[test]
    fn test_acquire_and_release_reject_free_slots() {
        let mut pool = pool(2);
        assert!(pool.mark_acquired(1).is_err());
        assert!(pool.release(1).is_err());
    }

    #[test]
    fn test_reacquire_is_allowed() {
        let mut pool = pool(1);
        pool.mark_submitted(0).unwrap();
        pool.mark_acquired(0).unwrap();
        pool.mark_acquired(0).unwrap();
        assert_eq!(pool.state(0).unwrap(), SlotState::Acquired);
    }

    #[test]
    fn test_out_of_range_index() {
        let mut pool = pool(2);
        assert!(matches!(
            pool.state(2),
            Err(RenderError::InvalidSlot {
                index: 2,
                capacity: 2
            })
        ));
        assert!(pool.release(7).is_err());
    }
}
