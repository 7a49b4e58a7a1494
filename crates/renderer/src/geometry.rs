//! Per-slot cache validity for rarely changing geometry.
//!
//! Frame slots each keep their own copy of data such as the background quad,
//! since any slot may still be in use by the GPU when another one is
//! recorded. After the geometry changes, every slot must be rewritten once,
//! the next time it is drawn.
//!
//! [`GeometryCache`] tracks that with versions: a global geometry version is
//! bumped on every change and each slot remembers the version it was last
//! refreshed at. A slot is stale until it has caught up, whatever order the
//! slots are drawn in.

use crate::error::{RenderError, RenderResult};

/// Geometry version per slot.
#[derive(Clone, Debug)]
pub struct GeometryCache {
    version: u64,
    refreshed: Vec<Option<u64>>,
}

impl GeometryCache {
    /// Creates a cache for `slots` slots, all of them stale.
    pub fn new(slots: usize) -> Self {
        Self {
            version: 0,
            refreshed: vec![None; slots],
        }
    }

    /// Marks the geometry as changed, making every slot stale.
    pub fn invalidate(&mut self) {
        self.version += 1;
    }

    /// Returns true if `slot` has not been refreshed since the last change.
    ///
    /// Unknown slots are always stale.
    pub fn needs_refresh(&self, slot: usize) -> bool {
        !matches!(self.refreshed.get(slot), Some(Some(version)) if *version == self.version)
    }

    /// Records that `slot` now holds the current geometry.
    pub fn mark_refreshed(&mut self, slot: usize) -> RenderResult<()> {
        let capacity = self.refreshed.len();
        let entry = self
            .refreshed
            .get_mut(slot)
            .ok_or(RenderError::InvalidSlot {
                index: slot,
                capacity,
            })?;
        *entry = Some(self.version);
        Ok(())
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn slots(&self) -> usize {
        self.refreshed.len()
    }

    /// Number of slots that still need a refresh.
    pub fn stale_slots(&self) -> usize {
        (0..self.refreshed.len())
            .filter(|&slot| self.needs_refresh(slot))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_slots_are_stale() {
        let cache = GeometryCache::new(3);
        assert_eq!(cache.stale_slots(), 3);
        assert!(cache.needs_refresh(0));
    }

    #[test]
    fn test_each_slot_refreshes_once_per_change() {
        let mut cache = GeometryCache::new(3);
        for slot in 0..3 {
            cache.mark_refreshed(slot).unwrap();
        }
        assert_eq!(cache.stale_slots(), 0);

        cache.invalidate();
        assert_eq!(cache.stale_slots(), 3);
        cache.mark_refreshed(1).unwrap();
        assert!(!cache.needs_refresh(1));
        assert!(cache.needs_refresh(0));
        assert!(cache.needs_refresh(2));
    }

    #[test]
    fn test_out_of_order_draws_still_cover_every_slot() {
        let mut cache = GeometryCache::new(4);
        cache.invalidate();

        // Slot 2 is drawn twice before slot 3 gets its turn
        let mut refreshed = Vec::new();
        for slot in [2, 0, 2, 1, 3, 2] {
            if cache.needs_refresh(slot) {
                cache.mark_refreshed(slot).unwrap();
                refreshed.push(slot);
            }
        }
        assert_eq!(refreshed, vec![2, 0, 1, 3]);
    }

    #[test]
    fn test_change_during_refresh_restarts_coverage() {
        let mut cache = GeometryCache::new(2);
        cache.mark_refreshed(0).unwrap();
        cache.invalidate();
        cache.mark_refreshed(1).unwrap();
        assert!(cache.needs_refresh(0));
        assert!(!cache.needs_refresh(1));
    }

    #[test]
    fn test_unknown_slot() {
        let mut cache = GeometryCache::new(2);
        assert!(cache.needs_refresh(5));
        assert!(matches!(
            cache.mark_refreshed(5),
            Err(RenderError::InvalidSlot { index: 5, capacity: 2 })
        ));
    }
}
