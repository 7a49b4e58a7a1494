//! Scoped save/restore of the device bind state.
//!
//! ```
//! use frameslot_rhi::headless::HeadlessDevice;
//! use frameslot_rhi::{BindGuard, GpuDevice, Viewport};
//!
//! let device = HeadlessDevice::new();
//! device.set_viewport(Viewport::new(0, 0, 1280, 720));
//! {
//!     let _guard = BindGuard::new(&device);
//!     device.set_viewport(Viewport::new(0, 0, 64, 64));
//!     // ... record work against the temporary bindings ...
//! }
//! assert_eq!(device.bind_state().viewport, Viewport::new(0, 0, 1280, 720));
//! ```

use tracing::trace;

use crate::device::{BindState, GpuDevice};

/// Restores the framebuffer, viewport and texture bindings that were current
/// when the guard was created.
#[must_use = "bindings are restored when the guard is dropped"]
pub struct BindGuard<'a, D: GpuDevice + ?Sized> {
    device: &'a D,
    saved: BindState,
}

impl<'a, D: GpuDevice + ?Sized> BindGuard<'a, D> {
    /// Snapshots the current bind state of `device`.
    pub fn new(device: &'a D) -> Self {
        let saved = device.bind_state();
        trace!("Saved bind state {:?}", saved);
        Self { device, saved }
    }

    /// The bind state that will be restored.
    #[inline]
    pub fn saved(&self) -> &BindState {
        &self.saved
    }
}

impl<D: GpuDevice + ?Sized> Drop for BindGuard<'_, D> {
    fn drop(&mut self) {
        self.device.set_bind_state(&self.saved);
        trace!("Restored bind state {:?}", self.saved);
    }
}
