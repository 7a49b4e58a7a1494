//! Opaque resource handles.
//!
//! Devices hand out small `Copy` handles instead of references so that the
//! pools can store them in plain slot structs and a device can be shared
//! behind an `Arc`. A handle is only meaningful to the device that created it.

use std::fmt;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw backend identifier.
            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw backend identifier.
            #[inline]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $label, self.0)
            }
        }
    };
}

define_handle!(
    /// A 2D texture.
    TextureHandle,
    "Texture"
);
define_handle!(
    /// A render target with one color attachment.
    FramebufferHandle,
    "Framebuffer"
);
define_handle!(
    /// A linear buffer (vertex data or readback transfer buffer).
    BufferHandle,
    "Buffer"
);
define_handle!(
    /// GPU-to-CPU synchronization primitive.
    FenceHandle,
    "Fence"
);
define_handle!(
    /// GPU-to-GPU synchronization primitive.
    SemaphoreHandle,
    "Semaphore"
);
define_handle!(
    /// A command buffer that is recorded and submitted repeatedly.
    CommandBufferHandle,
    "CommandBuffer"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        let handle = FenceHandle::from_raw(42);
        assert_eq!(handle.raw(), 42);
        assert_eq!(handle, FenceHandle::from_raw(42));
    }

    #[test]
    fn test_debug_names_kind() {
        assert_eq!(format!("{:?}", TextureHandle::from_raw(7)), "Texture#7");
    }
}
